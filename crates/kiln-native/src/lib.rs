//! Kiln native codegen: packages lowered per-operator kernels into a
//! Cranelift-built artifact — JIT-executable in process, or emitted as an
//! object file, assembly, or textual IR.

pub mod kernel;
pub mod module;
pub mod perf_map;
pub mod registry;
pub mod target;
pub mod translate;

pub use kernel::{BinOp, Kernel, KernelBody, UnOp};
pub use module::{
    build, NativeModule, PackedCFn, PackedFunc, MODULE_CTX, MODULE_MAIN, MODULE_STARTUP,
};
pub use target::Target;
