//! The native module: packages lowered kernels into a loadable artifact.
//!
//! `build` translates every kernel up front; actual code generation is
//! lazy. The first callable request JITs the whole module in-process;
//! `save_to_file` produces object, assembly, or textual-IR artifacts from
//! the same translated functions, each into a fresh backing module so
//! emission never disturbs the in-memory state.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use cranelift_codegen::control::ControlPlane;
use cranelift_codegen::ir::{self, InstBuilder, Signature, UserFuncName};
use cranelift_codegen::isa::TargetIsa;
use cranelift_codegen::settings::{self, Configurable};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{default_libcall_names, DataDescription, DataId, FuncId, Linkage, Module};
use cranelift_object::{ObjectBuilder, ObjectModule};
use parking_lot::Mutex;
use target_lexicon::Triple;

use kiln_ir::Tensor;

use crate::kernel::Kernel;
use crate::perf_map;
use crate::target::Target;
use crate::translate::{packed_signature, translate_kernel};

/// Symbol the runtime resolves to reach the module's entry kernel.
pub const MODULE_MAIN: &str = "kiln_module_main";
/// Static startup symbol, present only for `-system-lib` modules.
pub const MODULE_STARTUP: &str = "kiln_module_startup";
/// Data slot that receives a pointer to the module after JIT init.
pub const MODULE_CTX: &str = "kiln_module_ctx";

/// Entry-point ABI shared by every kernel; see `translate::packed_signature`.
pub type PackedCFn = unsafe extern "C" fn(*const *mut u8, i64) -> i64;

struct KernelFunc {
    name: String,
    func: ir::Function,
}

struct JitState {
    module: Option<JITModule>,
    symbols: HashMap<String, *const u8>,
}

// The code pages and symbol addresses are immutable once finalized; access
// is serialized by the owning mutex.
unsafe impl Send for JitState {}

impl Drop for JitState {
    fn drop(&mut self) {
        if let Some(module) = self.module.take() {
            unsafe { module.free_memory() };
        }
    }
}

struct Inner {
    target: Target,
    funcs: Vec<KernelFunc>,
    entry_func: String,
    jit: Mutex<Option<JitState>>,
}

/// A built native module. Cheap to clone; all clones share one lazily
/// initialized JIT.
#[derive(Clone)]
pub struct NativeModule {
    inner: Arc<Inner>,
}

/// A callable kernel entry point. Holding one keeps the JIT artifact alive.
#[derive(Clone)]
pub struct PackedFunc {
    name: String,
    entry: *const u8,
    _module: Arc<Inner>,
}

// The entry address points into pages owned by `_module`.
unsafe impl Send for PackedFunc {}
unsafe impl Sync for PackedFunc {}

impl PackedFunc {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry(&self) -> PackedCFn {
        unsafe { std::mem::transmute(self.entry) }
    }

    /// Invoke on tensors, inputs first, then output destinations.
    pub fn call_on_tensors(&self, tensors: &mut [&mut Tensor]) -> i64 {
        let ptrs: Vec<*mut u8> = tensors.iter_mut().map(|t| t.data_ptr()).collect();
        let f = self.entry();
        unsafe { f(ptrs.as_ptr(), ptrs.len() as i64) }
    }
}

impl std::fmt::Debug for PackedFunc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PackedFunc({})", self.name)
    }
}

/// Assemble lowered kernels into one native module. The first kernel's name
/// becomes the module's entry symbol.
pub fn build(kernels: &[Arc<Kernel>], target: &Target) -> Result<NativeModule> {
    if kernels.is_empty() {
        bail!("cannot build a native module from zero kernels");
    }
    let isa = host_isa(false)?;
    let call_conv = isa.default_call_conv();
    let funcs = kernels
        .iter()
        .enumerate()
        .map(|(i, k)| KernelFunc {
            name: k.name.clone(),
            func: translate_kernel(k, i as u32, call_conv),
        })
        .collect();
    log::debug!("built native module with {} kernels for target {}", kernels.len(), target);
    Ok(NativeModule {
        inner: Arc::new(Inner {
            target: target.clone(),
            funcs,
            entry_func: kernels[0].name.clone(),
            jit: Mutex::new(None),
        }),
    })
}

fn host_isa(pic: bool) -> Result<Arc<dyn TargetIsa>> {
    let mut flag_builder = settings::builder();
    flag_builder.set("opt_level", "speed")?;
    flag_builder.set("use_colocated_libcalls", "false")?;
    flag_builder.set("is_pic", if pic { "true" } else { "false" })?;
    let isa_builder = cranelift_native::builder()
        .map_err(|e| anyhow!("failed to create ISA builder: {}", e))?;
    Ok(isa_builder.finish(settings::Flags::new(flag_builder))?)
}

/// Everything `define_all` produced in one backing module.
struct Defined {
    /// (symbol, id, code size) for every defined function.
    funcs: Vec<(String, FuncId, u64)>,
    ctx_data: DataId,
}

impl NativeModule {
    pub fn entry_name(&self) -> &str {
        &self.inner.entry_func
    }

    pub fn target(&self) -> &Target {
        &self.inner.target
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.inner.funcs.iter().map(|kf| kf.name.as_str())
    }

    /// Whether the module carries the static startup symbol.
    pub fn is_system_module(&self) -> bool {
        self.inner.target.system_lib
    }

    /// Resolve a callable by kernel name. `kiln_module_main` aliases the
    /// entry symbol. The first call JITs the module; later calls reuse it.
    pub fn get_function(&self, name: &str) -> Result<Option<PackedFunc>> {
        let mut guard = self.inner.jit.lock();
        if guard.is_none() {
            *guard = Some(self.init_jit()?);
        }
        let state = guard.as_ref().unwrap();
        let resolved = if name == MODULE_MAIN { self.inner.entry_func.as_str() } else { name };
        Ok(state.symbols.get(resolved).map(|&entry| PackedFunc {
            name: resolved.to_string(),
            entry,
            _module: Arc::clone(&self.inner),
        }))
    }

    /// Parse a textual-IR file saved by `save_to_file`, recovering the
    /// target from the embedded `kiln_target` flag. The module is left in
    /// a pre-JIT state.
    pub fn load_ir(path: &Path) -> Result<NativeModule> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot open {}", path.display()))?;

        let mut target = None;
        let mut names = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("; kiln_target =") {
                target = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("; symbol =") {
                names.push(rest.trim().to_string());
            }
        }
        let target = match target {
            Some(raw) => Target::parse(&raw)?,
            None => Target::parse(&format!("native -target={}", Triple::host()))?,
        };

        let parsed = cranelift_reader::parse_functions(&text)
            .map_err(|e| anyhow!("failed to parse {}: {}", path.display(), e))?;
        if parsed.is_empty() {
            bail!("no functions in {}", path.display());
        }
        let funcs: Vec<KernelFunc> = parsed
            .into_iter()
            .enumerate()
            .map(|(i, func)| KernelFunc {
                name: names.get(i).cloned().unwrap_or_else(|| format!("fn{}", i)),
                func,
            })
            .collect();
        let entry_func = funcs[0].name.clone();
        Ok(NativeModule {
            inner: Arc::new(Inner { target, funcs, entry_func, jit: Mutex::new(None) }),
        })
    }

    /// Emit the module to disk. The format is the explicit argument if
    /// non-empty, otherwise the file extension. Unknown formats fail.
    pub fn save_to_file(&self, path: &Path, format: &str) -> Result<()> {
        let fmt = if format.is_empty() {
            path.extension().and_then(|e| e.to_str()).unwrap_or("")
        } else {
            format
        };
        match fmt {
            "o" | "obj" => {
                let bytes = self.build_object()?;
                std::fs::write(path, bytes)
                    .with_context(|| format!("cannot write {}", path.display()))?;
            }
            "s" | "asm" => {
                let text = self.asm_source()?;
                std::fs::write(path, text)
                    .with_context(|| format!("cannot write {}", path.display()))?;
            }
            "clif" => {
                std::fs::write(path, self.clif_source())
                    .with_context(|| format!("cannot write {}", path.display()))?;
            }
            other => bail!(
                "do not know how to save {} with format {:?}",
                path.display(),
                other
            ),
        }
        Ok(())
    }

    /// The textual or assembly form of the module.
    pub fn get_source(&self, format: &str) -> Result<String> {
        match format {
            "" | "clif" => Ok(self.clif_source()),
            "s" | "asm" => self.asm_source(),
            other => bail!("do not know how to get source with format {:?}", other),
        }
    }

    fn clif_source(&self) -> String {
        let mut out = format!("; kiln_target = {}\n", self.inner.target);
        for kf in &self.inner.funcs {
            out.push_str(&format!("\n; symbol = {}\n{}\n", kf.name, kf.func.display()));
        }
        out
    }

    fn asm_source(&self) -> Result<String> {
        let isa = host_isa(false)?;
        let mut out = String::new();
        for kf in &self.inner.funcs {
            let mut ctx = cranelift_codegen::Context::for_function(kf.func.clone());
            ctx.set_disasm(true);
            let vcode = {
                let compiled = ctx
                    .compile(isa.as_ref(), &mut ControlPlane::default())
                    .map_err(|e| anyhow!("cannot emit assembly for {}: {:?}", kf.name, e))?;
                compiled.vcode.clone().unwrap_or_default()
            };
            out.push_str(&format!("; {}\n{}\n", kf.name, vcode));
        }
        Ok(out)
    }

    fn build_object(&self) -> Result<Vec<u8>> {
        let isa = host_isa(true)?;
        let builder = ObjectBuilder::new(
            isa.clone(),
            self.inner.entry_func.clone(),
            default_libcall_names(),
        )?;
        let mut module = ObjectModule::new(builder);
        self.define_all(&mut module, isa.as_ref())?;
        let product = module.finish();
        Ok(product.emit()?)
    }

    fn init_jit(&self) -> Result<JitState> {
        let target = &self.inner.target;

        // the module must be runnable on this machine before we execute
        // anything from it
        if let Some(triple) = &target.triple {
            let triple: Triple = triple
                .parse()
                .map_err(|e| anyhow!("bad target triple {:?}: {}", triple, e))?;
            let host = Triple::host();
            if triple.architecture != host.architecture {
                bail!(
                    "cannot run module, architecture mismatch: module={} host={}",
                    triple,
                    host
                );
            }
        }

        let isa = host_isa(false)?;
        if isa.pointer_bytes() as usize != std::mem::size_of::<usize>() {
            bail!("data layout mismatch between module and execution engine");
        }

        let builder = JITBuilder::with_isa(isa.clone(), default_libcall_names());
        let mut module = JITModule::new(builder);
        let defined = self.define_all(&mut module, isa.as_ref())?;
        module
            .finalize_definitions()
            .context("failed to initialize execution engine")?;

        let mut symbols = HashMap::new();
        let mut addr_list: Vec<(String, u64)> = Vec::new();
        let mut section_ends: Vec<u64> = Vec::new();
        for (name, id, size) in &defined.funcs {
            let addr = module.get_finalized_function(*id);
            symbols.insert(name.clone(), addr);
            addr_list.push((name.clone(), addr as u64));
            section_ends.push(addr as u64 + size);
        }

        // install a pointer to the module state into the context slot
        let (ctx_ptr, ctx_size) = module.get_finalized_data(defined.ctx_data);
        debug_assert_eq!(ctx_size, 8);
        unsafe {
            *(ctx_ptr as *mut *const Inner) = Arc::as_ptr(&self.inner);
        }

        let records = perf_map::compute_symbol_sizes(&addr_list, &section_ends);
        let path = perf_map::write(&records)?;
        log::debug!("wrote profiler map to {}", path.display());

        Ok(JitState { module: Some(module), symbols })
    }

    /// Declare and define every function and data object in a fresh
    /// backing module: the kernels, the main dispatcher, the startup
    /// symbol for `-system-lib` targets, and the context slot.
    fn define_all<M: Module>(&self, module: &mut M, isa: &dyn TargetIsa) -> Result<Defined> {
        let call_conv = isa.default_call_conv();
        let mut ctx = module.make_context();
        let mut funcs = Vec::new();

        let mut kernel_ids = Vec::new();
        for kf in &self.inner.funcs {
            let id = module.declare_function(&kf.name, Linkage::Export, &kf.func.signature)?;
            kernel_ids.push(id);
        }

        for (kf, &id) in self.inner.funcs.iter().zip(&kernel_ids) {
            ctx.func = kf.func.clone();
            let size = compile_size(&mut ctx, isa, &kf.name)?;
            module.define_function(id, &mut ctx)?;
            module.clear_context(&mut ctx);
            funcs.push((kf.name.clone(), id, size));
        }

        // the well-known entry point dispatches to the first kernel
        let main_sig = packed_signature(call_conv);
        let main_id = module.declare_function(MODULE_MAIN, Linkage::Export, &main_sig)?;
        let next_index = self.inner.funcs.len() as u32;
        let mut main_func =
            ir::Function::with_name_signature(UserFuncName::user(0, next_index), main_sig);
        {
            let mut fb_ctx = FunctionBuilderContext::new();
            let mut b = FunctionBuilder::new(&mut main_func, &mut fb_ctx);
            let block = b.create_block();
            b.append_block_params_for_function_params(block);
            b.switch_to_block(block);
            b.seal_block(block);
            let args = b.block_params(block).to_vec();
            let callee = module.declare_func_in_func(kernel_ids[0], b.func);
            let call = b.ins().call(callee, &args);
            let ret = b.inst_results(call)[0];
            b.ins().return_(&[ret]);
            b.finalize();
        }
        ctx.func = main_func;
        let size = compile_size(&mut ctx, isa, MODULE_MAIN)?;
        module.define_function(main_id, &mut ctx)?;
        module.clear_context(&mut ctx);
        funcs.push((MODULE_MAIN.to_string(), main_id, size));

        if self.inner.target.system_lib {
            let sig = Signature::new(call_conv);
            let id = module.declare_function(MODULE_STARTUP, Linkage::Export, &sig)?;
            let mut func =
                ir::Function::with_name_signature(UserFuncName::user(0, next_index + 1), sig);
            {
                let mut fb_ctx = FunctionBuilderContext::new();
                let mut b = FunctionBuilder::new(&mut func, &mut fb_ctx);
                let block = b.create_block();
                b.switch_to_block(block);
                b.seal_block(block);
                b.ins().return_(&[]);
                b.finalize();
            }
            ctx.func = func;
            let size = compile_size(&mut ctx, isa, MODULE_STARTUP)?;
            module.define_function(id, &mut ctx)?;
            module.clear_context(&mut ctx);
            funcs.push((MODULE_STARTUP.to_string(), id, size));
        }

        let ctx_data = module.declare_data(MODULE_CTX, Linkage::Export, true, false)?;
        let mut data = DataDescription::new();
        data.define_zeroinit(8);
        module.define_data(ctx_data, &data)?;

        Ok(Defined { funcs, ctx_data })
    }
}

fn compile_size(
    ctx: &mut cranelift_codegen::Context,
    isa: &dyn TargetIsa,
    name: &str,
) -> Result<u64> {
    let compiled = ctx
        .compile(isa, &mut ControlPlane::default())
        .map_err(|e| anyhow!("compilation of {} failed: {:?}", name, e))?;
    Ok(compiled.buffer.data().len() as u64)
}
