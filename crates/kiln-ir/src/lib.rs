//! Kiln tensor IR: arena-allocated expression tree, types, and modules.

mod expr;
mod module;
mod tensor;
mod types;

pub use expr::{Expr, ExprId, Function, GlobalId, VarId};
pub use module::{GlobalInfo, Module, VarInfo};
pub use tensor::Tensor;
pub use types::{DType, FuncType, TensorType, Type};
