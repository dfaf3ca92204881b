//! Kiln VM bytecode compiler.
//!
//! Lowers an optimized module to a `VMProgram`: per-function instruction
//! streams over virtual registers, a constant pool of literal and shape
//! tensors, and a packed-function table resolved out of one native
//! artifact built from every kernel the lowering produced.

mod const_pool;
mod context;
mod engine;
mod error;
mod func;

pub use context::CompilerContext;
pub use engine::{CompileEngine, KernelEngine, Lowered};
pub use error::{CompileError, ErrorKind, Result};
pub use func::FuncCompiler;

use std::collections::HashMap;

use kiln_ir::Module;
use kiln_native::Target;
use kiln_vm::VMProgram;

/// Compiler configuration. The target descriptor is a parameter of the
/// compilation; it reaches both the compile engine and the native build.
#[derive(Clone, Debug)]
pub struct CompilerConfig {
    pub target: Target,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self { target: Target::native() }
    }
}

/// Compile a module with the default kernel engine.
pub fn compile(module: Module, config: &CompilerConfig) -> Result<VMProgram> {
    let mut engine = KernelEngine::new();
    compile_with_engine(module, config, &mut engine)
}

/// Compile a module with a caller-provided compile engine.
pub fn compile_with_engine(
    mut module: Module,
    config: &CompilerConfig,
    engine: &mut dyn CompileEngine,
) -> Result<VMProgram> {
    kiln_passes::optimize(&mut module)?;

    let mut ctx = CompilerContext::new(module);
    ctx.populate_global_map();

    let pools = const_pool::layout(&ctx.module)?;
    ctx.const_map = pools.const_map;
    ctx.shape_map = pools.shape_map;
    let constants = ctx.layout_constants();

    // functions compile in module iteration order, which is also the
    // order their global indices were assigned in
    let defs: Vec<_> = ctx
        .module
        .functions()
        .map(|(gid, func)| (ctx.module.global(gid).name.clone(), func.clone()))
        .collect();
    let mut functions = Vec::with_capacity(defs.len());
    for (name, func) in &defs {
        log::debug!("compiling function {}", name);
        let compiler = FuncCompiler::new(&mut ctx, &mut *engine, &config.target);
        functions.push(compiler.compile(name, func)?);
    }

    // one native artifact holds every kernel; resolve the packed table
    // back out of it by name
    let mut packed_funcs = Vec::with_capacity(ctx.lowered_funcs.len());
    if !ctx.lowered_funcs.is_empty() {
        let artifact = kiln_native::build(&ctx.lowered_funcs, &config.target)
            .map_err(|e| CompileError::native(&e.to_string()))?;
        for kernel in &ctx.lowered_funcs {
            let func = artifact
                .get_function(&kernel.name)
                .map_err(|e| CompileError::native(&e.to_string()))?
                .ok_or_else(|| {
                    CompileError::missing(&format!(
                        "kernel {} absent from the native module",
                        kernel.name
                    ))
                })?;
            packed_funcs.push(func);
        }
    }

    let mut global_map = HashMap::new();
    for (&gid, &index) in &ctx.global_map {
        global_map.insert(ctx.module.global(gid).name.clone(), index);
    }

    let program = VMProgram { functions, constants, packed_funcs, global_map };
    program.dump();
    Ok(program)
}
