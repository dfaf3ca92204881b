//! The compile-engine seam.
//!
//! Primitive calls bridge the IR to native kernels. The engine is an
//! external service from the compiler's point of view: given a primitive
//! function and a target descriptor it returns a named, already-lowered
//! kernel object. The default engine pattern-matches single-operator
//! primitive bodies against a fixed table and derives static loop bounds
//! from the checked types.

use std::collections::HashMap;
use std::sync::Arc;

use kiln_ir::{Expr, ExprId, Module, Type};
use kiln_native::{BinOp, Kernel, KernelBody, Target, UnOp};

use crate::error::{CompileError, Result};

/// The result of lowering one primitive. Expected to hold exactly one
/// kernel; multi-target lowering is out of scope.
pub struct Lowered {
    pub kernels: Vec<Arc<Kernel>>,
}

/// External kernel-lowering service.
pub trait CompileEngine {
    /// Lower the primitive function literal at `callee` for `target`.
    fn lower(&mut self, module: &Module, callee: ExprId, target: &Target) -> Result<Lowered>;
}

/// The default engine. Lowerings are cached by operator, type signature,
/// and target, so equal primitives share one kernel.
#[derive(Default)]
pub struct KernelEngine {
    cache: HashMap<CacheKey, Arc<Kernel>>,
    counter: usize,
}

#[derive(PartialEq, Eq, Hash)]
struct CacheKey {
    op: String,
    sig: String,
    target: String,
}

impl KernelEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

fn binary_op(name: &str) -> Option<BinOp> {
    match name {
        "add" => Some(BinOp::Add),
        "subtract" => Some(BinOp::Sub),
        "multiply" => Some(BinOp::Mul),
        "divide" => Some(BinOp::Div),
        "maximum" => Some(BinOp::Max),
        _ => None,
    }
}

fn unary_op(name: &str) -> Option<UnOp> {
    match name {
        "negative" => Some(UnOp::Neg),
        "relu" => Some(UnOp::Relu),
        _ => None,
    }
}

impl CompileEngine for KernelEngine {
    fn lower(&mut self, module: &Module, callee: ExprId, target: &Target) -> Result<Lowered> {
        let Expr::Function(func) = module.expr(callee).clone() else {
            return Err(CompileError::internal("engine invoked on a non-function node"));
        };
        if !func.primitive {
            return Err(CompileError::kernel("cannot lower a non-primitive function"));
        }

        let Expr::Call { callee: op_expr, args } = module.expr(func.body).clone() else {
            return Err(CompileError::kernel("primitive body is not an operator call"));
        };
        let Expr::Op(op_name) = module.expr(op_expr).clone() else {
            return Err(CompileError::kernel("primitive callee is not an operator"));
        };
        let ret = func
            .ret_type
            .clone()
            .ok_or_else(|| CompileError::kernel("primitive function without a return type"))?;

        let (body, inputs, outputs) = if let Some(op) = binary_op(&op_name) {
            if args.len() != 2 {
                return Err(CompileError::kernel(&format!(
                    "operator {} expects 2 operands, got {}",
                    op_name,
                    args.len()
                )));
            }
            let tt = ret.as_tensor().ok_or_else(|| {
                CompileError::kernel(&format!("operator {} must return a tensor", op_name))
            })?;
            (KernelBody::Binary { op, len: tt.num_elements(), dtype: tt.dtype }, 2, 1)
        } else if let Some(op) = unary_op(&op_name) {
            if args.len() != 1 {
                return Err(CompileError::kernel(&format!(
                    "operator {} expects 1 operand, got {}",
                    op_name,
                    args.len()
                )));
            }
            let tt = ret.as_tensor().ok_or_else(|| {
                CompileError::kernel(&format!("operator {} must return a tensor", op_name))
            })?;
            (KernelBody::Unary { op, len: tt.num_elements(), dtype: tt.dtype }, 1, 1)
        } else if op_name == "split" {
            let Type::Tuple(fields) = &ret else {
                return Err(CompileError::kernel("split must return a tuple"));
            };
            let mut parts = Vec::with_capacity(fields.len());
            for field in fields {
                let tt = field
                    .as_tensor()
                    .ok_or_else(|| CompileError::kernel("split fields must be tensors"))?;
                parts.push(tt);
            }
            let first = *parts
                .first()
                .ok_or_else(|| CompileError::kernel("split must produce at least one part"))?;
            if parts.iter().any(|&tt| tt != first) {
                return Err(CompileError::kernel("split parts must share one type"));
            }
            let body = KernelBody::Split {
                parts: parts.len(),
                part_len: first.num_elements(),
                dtype: first.dtype,
            };
            (body, 1, parts.len())
        } else {
            return Err(CompileError::kernel(&format!("no lowering for operator {}", op_name)));
        };

        let key = CacheKey {
            op: op_name.clone(),
            sig: format!("{:?}", ret),
            target: target.to_string(),
        };
        if let Some(kernel) = self.cache.get(&key) {
            return Ok(Lowered { kernels: vec![kernel.clone()] });
        }

        let name = format!("fused_{}_{}", op_name, self.counter);
        self.counter += 1;
        log::debug!("lowering {} for target {}", name, target);
        let kernel = Arc::new(Kernel { name, inputs, outputs, body });
        self.cache.insert(key, kernel.clone());
        Ok(Lowered { kernels: vec![kernel] })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_ir::{DType, Function, Module};

    fn prim(m: &mut Module, op: &str, arity: usize, ret: Type) -> ExprId {
        let params: Vec<_> = (0..arity)
            .map(|i| m.add_var(&format!("p{}", i), Type::tensor(DType::Float32, vec![4])))
            .collect();
        let op = m.op(op);
        let args = params.iter().map(|&p| m.var_expr(p)).collect();
        let body = m.call(op, args);
        m.function(Function { params, body, ret_type: Some(ret), primitive: true })
    }

    #[test]
    fn equal_primitives_share_one_kernel() {
        let mut m = Module::new();
        let ty = Type::tensor(DType::Float32, vec![4]);
        let p1 = prim(&mut m, "add", 2, ty.clone());
        let p2 = prim(&mut m, "add", 2, ty);

        let mut engine = KernelEngine::new();
        let target = Target::native();
        let k1 = engine.lower(&m, p1, &target).unwrap();
        let k2 = engine.lower(&m, p2, &target).unwrap();
        assert_eq!(k1.kernels.len(), 1);
        assert_eq!(k1.kernels[0].name, k2.kernels[0].name);
        assert_eq!(k1.kernels[0].name, "fused_add_0");
    }

    #[test]
    fn split_derives_parts_from_the_return_tuple() {
        let mut m = Module::new();
        let part = Type::tensor(DType::Float32, vec![2]);
        let ret = Type::Tuple(vec![part.clone(), part]);
        let p = prim(&mut m, "split", 1, ret);

        let mut engine = KernelEngine::new();
        let lowered = engine.lower(&m, p, &Target::native()).unwrap();
        let kernel = &lowered.kernels[0];
        assert_eq!(kernel.outputs, 2);
        assert_eq!(
            kernel.body,
            KernelBody::Split { parts: 2, part_len: 2, dtype: DType::Float32 }
        );
    }

    #[test]
    fn unknown_operators_fail() {
        let mut m = Module::new();
        let ty = Type::tensor(DType::Float32, vec![4]);
        let p = prim(&mut m, "conv2d", 2, ty);
        let mut engine = KernelEngine::new();
        assert!(engine.lower(&m, p, &Target::native()).is_err());
    }
}
