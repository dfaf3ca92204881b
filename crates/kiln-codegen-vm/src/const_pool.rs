//! Constant pool layout.
//!
//! One pre-order walk from every live global, following global references
//! transitively. Literal constants and derived shape tensors share a
//! single dense index space, assigned in traversal order.

use std::collections::{HashMap, HashSet};

use kiln_ir::{Expr, ExprId, GlobalId, Module, Tensor, TensorType, Type};

use crate::error::{CompileError, Result};

pub struct ConstPools {
    pub const_map: HashMap<ExprId, usize>,
    pub shape_map: HashMap<TensorType, (usize, Tensor)>,
}

pub fn layout(module: &Module) -> Result<ConstPools> {
    let mut pool = ConstantPool {
        module,
        visited: HashSet::new(),
        const_map: HashMap::new(),
        shape_map: HashMap::new(),
        index: 0,
    };
    let globals: Vec<GlobalId> = module.functions().map(|(g, _)| g).collect();
    for g in globals {
        pool.visit_global(g)?;
    }
    Ok(ConstPools { const_map: pool.const_map, shape_map: pool.shape_map })
}

struct ConstantPool<'m> {
    module: &'m Module,
    visited: HashSet<GlobalId>,
    const_map: HashMap<ExprId, usize>,
    shape_map: HashMap<TensorType, (usize, Tensor)>,
    index: usize,
}

impl ConstantPool<'_> {
    fn visit_global(&mut self, g: GlobalId) -> Result<()> {
        if !self.visited.insert(g) {
            return Ok(());
        }
        if let Some(func) = self.module.func(g) {
            if !func.primitive {
                self.visit(func.body)?;
            }
        }
        Ok(())
    }

    fn visit(&mut self, id: ExprId) -> Result<()> {
        match self.module.expr(id).clone() {
            Expr::Var(_) | Expr::Constructor { .. } | Expr::Op(_) => Ok(()),
            Expr::Global(g) => self.visit_global(g),
            Expr::Constant(_) => {
                if !self.const_map.contains_key(&id) {
                    self.const_map.insert(id, self.index);
                    self.index += 1;
                }
                Ok(())
            }
            Expr::Tuple(fields) => {
                for f in fields {
                    self.visit(f)?;
                }
                Ok(())
            }
            Expr::TupleGetItem { tuple, .. } => self.visit(tuple),
            Expr::Let { value, body, .. } => {
                self.visit(value)?;
                self.visit(body)
            }
            Expr::If { cond, then_branch, else_branch } => {
                self.visit(cond)?;
                self.visit(then_branch)?;
                self.visit(else_branch)
            }
            // primitive bodies are opaque to the pool
            Expr::Function(f) => {
                if f.primitive {
                    Ok(())
                } else {
                    self.visit(f.body)
                }
            }
            Expr::Call { callee, args } => {
                for a in args {
                    self.visit(a)?;
                }
                match self.module.expr(callee).clone() {
                    Expr::Function(f) if f.primitive => self.register_call_shapes(id),
                    Expr::Function(f) => self.visit(f.body),
                    // a global or variable callee is covered by the outer
                    // per-global walk
                    _ => Ok(()),
                }
            }
            Expr::Match { .. } => Err(CompileError::unsupported("match", id)),
        }
    }

    /// A call to a primitive kernel allocates its outputs at runtime; the
    /// static extents of each produced tensor become shape tensors.
    fn register_call_shapes(&mut self, call: ExprId) -> Result<()> {
        let ret = self
            .module
            .checked_type(call)
            .ok_or_else(|| CompileError::missing_at("primitive call without checked type", call))?
            .clone();
        match ret {
            Type::Tensor(tt) => {
                self.add_shape(tt);
                Ok(())
            }
            Type::Tuple(fields) => {
                for field in fields {
                    let tt = field.as_tensor().ok_or_else(|| {
                        CompileError::unsupported("non-tensor field in primitive return", call)
                    })?;
                    self.add_shape(tt.clone());
                }
                Ok(())
            }
            Type::Func(_) => {
                Err(CompileError::unsupported("function-typed primitive return", call))
            }
        }
    }

    fn add_shape(&mut self, tt: TensorType) {
        if !self.shape_map.contains_key(&tt) {
            let shape = Tensor::shape_of(&tt.shape);
            self.shape_map.insert(tt, (self.index, shape));
            self.index += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_ir::{DType, Function};

    #[test]
    fn constants_and_shapes_share_one_index_space() {
        let mut m = Module::new();
        let ty = Type::tensor(DType::Float32, vec![4]);

        // prim(a) = relu(a), as the inliner leaves it: a literal callee
        let a = m.add_var("a", ty.clone());
        let op = m.op("relu");
        let ae = m.var_expr(a);
        let prim_body = m.call(op, vec![ae]);
        let prim = m.function(Function {
            params: vec![a],
            body: prim_body,
            ret_type: Some(ty.clone()),
            primitive: true,
        });

        // main(x) = let t = prim(c0) in t   with c0 a literal constant
        let x = m.add_var("x", ty.clone());
        let c0 = {
            let value = Tensor::from_f32s(vec![4], &[1.0, 2.0, 3.0, 4.0]);
            m.constant(value)
        };
        let t = m.add_var_untyped("t");
        let call = m.call_typed(prim, vec![c0], ty.clone());
        let te = m.var_expr(t);
        let body = m.let_(t, call, te);
        m.add_function("main", Function {
            params: vec![x],
            body,
            ret_type: Some(ty),
            primitive: false,
        });

        let pools = layout(&m).unwrap();
        // traversal order: the constant argument first, then the shape
        assert_eq!(pools.const_map.len(), 1);
        assert_eq!(pools.const_map[&c0], 0);
        assert_eq!(pools.shape_map.len(), 1);
        let (index, shape) = &pools.shape_map[&TensorType::new(DType::Float32, vec![4])];
        assert_eq!(*index, 1);
        assert_eq!(shape.as_i64s(), vec![4]);
    }

    #[test]
    fn duplicate_shapes_reuse_the_first_index() {
        let mut m = Module::new();
        let ty = Type::tensor(DType::Float32, vec![2]);
        let a = m.add_var("a", ty.clone());
        let b = m.add_var("b", ty.clone());
        let op = m.op("add");
        let ae = m.var_expr(a);
        let be = m.var_expr(b);
        let prim_body = m.call(op, vec![ae, be]);
        let prim = Function {
            params: vec![a, b],
            body: prim_body,
            ret_type: Some(ty.clone()),
            primitive: true,
        };

        let x = m.add_var("x", ty.clone());
        let y = m.add_var("y", ty.clone());
        let p1 = m.function(prim.clone());
        let xe = m.var_expr(x);
        let ye = m.var_expr(y);
        let first = m.call_typed(p1, vec![xe, ye], ty.clone());
        let p2 = m.function(prim);
        let t = m.add_var_untyped("t");
        let te = m.var_expr(t);
        let xe2 = m.var_expr(x);
        let second = m.call_typed(p2, vec![te, xe2], ty.clone());
        let u = m.add_var_untyped("u");
        let ue = m.var_expr(u);
        let inner = m.let_(u, second, ue);
        let body = m.let_(t, first, inner);
        m.add_function("main", Function {
            params: vec![x, y],
            body,
            ret_type: Some(ty),
            primitive: false,
        });

        let pools = layout(&m).unwrap();
        assert_eq!(pools.shape_map.len(), 1);
        assert_eq!(pools.const_map.len(), 0);
    }

    #[test]
    fn globals_are_followed_once() {
        let mut m = Module::new();
        let ty = Type::tensor(DType::Float32, vec![4]);
        // helper() = c0
        let c0 = {
            let value = Tensor::from_f32s(vec![4], &[0.5; 4]);
            m.constant(value)
        };
        let helper = m.add_function("helper", Function {
            params: vec![],
            body: c0,
            ret_type: Some(ty.clone()),
            primitive: false,
        });
        // main references helper twice through argument position
        let x = m.add_var("x", ty.clone());
        let h1 = m.global_expr(helper);
        let h2 = m.global_expr(helper);
        let call1 = m.call(h1, vec![]);
        let call2 = m.call(h2, vec![]);
        let body = m.tuple(vec![call1, call2]);
        m.add_function("main", Function {
            params: vec![x],
            body,
            ret_type: None,
            primitive: false,
        });

        let pools = layout(&m).unwrap();
        assert_eq!(pools.const_map.len(), 1);
        assert_eq!(pools.const_map[&c0], 0);
    }
}
