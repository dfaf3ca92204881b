//! A-normal-form conversion.
//!
//! After this pass every non-trivial subexpression of a non-primitive
//! function body is named by a `let`. Atoms are variables, globals,
//! constants, constructors, and primitive function literals. `if` branches
//! are normalized in their own scope so their bindings stay inside the
//! branch.

use kiln_ir::{Expr, ExprId, Function, Module, VarId};

use crate::error::{PassError, Result};

pub fn to_anf(module: &mut Module) -> Result<()> {
    let funcs: Vec<_> = module.functions().map(|(g, f)| (g, f.clone())).collect();
    for (gid, func) in funcs {
        if func.primitive {
            continue;
        }
        // A closure-form definition keeps its top-level literal in place;
        // only the inner body is normalized.
        let body = if let Expr::Function(inner) = module.expr(func.body).clone() {
            let inner_body = normalize(module, inner.body)?;
            module.function(Function { body: inner_body, ..inner })
        } else {
            normalize(module, func.body)?
        };
        module.define(gid, Function { body, ..func });
    }
    Ok(())
}

/// Normalize a subtree in a fresh binding scope.
fn normalize(m: &mut Module, id: ExprId) -> Result<ExprId> {
    let mut binds = Vec::new();
    let atom = atomize(m, id, &mut binds)?;
    Ok(wrap(m, binds, atom))
}

fn wrap(m: &mut Module, binds: Vec<(VarId, ExprId)>, body: ExprId) -> ExprId {
    let mut out = body;
    for (var, value) in binds.into_iter().rev() {
        out = m.let_(var, value, out);
    }
    out
}

fn is_atom(m: &Module, id: ExprId) -> bool {
    match m.expr(id) {
        Expr::Var(_) | Expr::Global(_) | Expr::Constant(_) | Expr::Constructor { .. } => true,
        Expr::Function(f) => f.primitive,
        _ => false,
    }
}

/// Rewrite `id` so its children are atomic, without naming `id` itself.
fn simplify(m: &mut Module, id: ExprId, binds: &mut Vec<(VarId, ExprId)>) -> Result<ExprId> {
    match m.expr(id).clone() {
        Expr::Var(_) | Expr::Global(_) | Expr::Constant(_) | Expr::Constructor { .. } => Ok(id),
        Expr::Function(f) if f.primitive => Ok(id),
        Expr::Function(f) => {
            let body = normalize(m, f.body)?;
            Ok(m.function(Function { body, ..f }))
        }
        Expr::Tuple(fields) => {
            let fields = fields
                .into_iter()
                .map(|f| atomize(m, f, binds))
                .collect::<Result<Vec<_>>>()?;
            Ok(m.tuple(fields))
        }
        Expr::TupleGetItem { tuple, index } => {
            let tuple = atomize(m, tuple, binds)?;
            Ok(m.tuple_get(tuple, index))
        }
        Expr::If { cond, then_branch, else_branch } => {
            let cond = atomize(m, cond, binds)?;
            let then_branch = normalize(m, then_branch)?;
            let else_branch = normalize(m, else_branch)?;
            Ok(m.if_(cond, then_branch, else_branch))
        }
        Expr::Call { callee, args } => {
            // Primitive literals, globals, constructors, and variables stay
            // in callee position; anything else is named like an argument.
            let callee = match m.expr(callee).clone() {
                Expr::Function(f) if f.primitive => callee,
                Expr::Global(_) | Expr::Var(_) | Expr::Constructor { .. } => callee,
                _ => atomize(m, callee, binds)?,
            };
            let args = args
                .into_iter()
                .map(|a| atomize(m, a, binds))
                .collect::<Result<Vec<_>>>()?;
            let call = m.call(callee, args);
            if let Some(ty) = m.checked_type(id).cloned() {
                m.set_checked_type(call, ty);
            }
            Ok(call)
        }
        Expr::Let { var, value, body } => {
            let value = simplify(m, value, binds)?;
            binds.push((var, value));
            simplify(m, body, binds)
        }
        Expr::Op(_) => Err(PassError::unsupported("op outside primitive body", id)),
        Expr::Match { .. } => Err(PassError::unsupported("match", id)),
    }
}

fn atomize(m: &mut Module, id: ExprId, binds: &mut Vec<(VarId, ExprId)>) -> Result<ExprId> {
    let simplified = simplify(m, id, binds)?;
    if is_atom(m, simplified) {
        return Ok(simplified);
    }
    let var = m.fresh_var("t");
    binds.push((var, simplified));
    Ok(m.var_expr(var))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_ir::{DType, Type};

    fn unary_func(m: &mut Module) -> (kiln_ir::VarId, Type) {
        let ty = Type::tensor(DType::Float32, vec![4]);
        (m.add_var("x", ty.clone()), ty)
    }

    #[test]
    fn nested_call_gets_named() {
        let mut m = Module::new();
        let (x, ty) = unary_func(&mut m);
        let f = m.add_global("f");
        let g = m.add_global("g");

        // h(x) = f(g(x))
        let gx = {
            let ge = m.global_expr(g);
            let xe = m.var_expr(x);
            m.call(ge, vec![xe])
        };
        let fe = m.global_expr(f);
        let body = m.call(fe, vec![gx]);
        m.add_function("h", Function {
            params: vec![x],
            body,
            ret_type: Some(ty),
            primitive: false,
        });

        to_anf(&mut m).unwrap();
        let rendered = m.render_module();
        assert_eq!(rendered, "def h (fn [x] (let t0 (call @g x) (let t1 (call @f t0) t1)))\n");
    }

    #[test]
    fn if_branches_keep_their_bindings() {
        let mut m = Module::new();
        let c = m.add_var("c", Type::tensor(DType::Bool, vec![]));
        let (x, _) = unary_func(&mut m);
        let f = m.add_global("f");

        // sel(c, x) = if c then f(x) else x
        let then_branch = {
            let fe = m.global_expr(f);
            let xe = m.var_expr(x);
            m.call(fe, vec![xe])
        };
        let else_branch = m.var_expr(x);
        let ce = m.var_expr(c);
        let body = m.if_(ce, then_branch, else_branch);
        m.add_function("sel", Function {
            params: vec![c, x],
            body,
            ret_type: None,
            primitive: false,
        });

        to_anf(&mut m).unwrap();
        let rendered = m.render_module();
        // the call stays inside the true branch, and the if itself is named
        assert_eq!(
            rendered,
            "def sel (fn [c x] (let t1 (if c (let t0 (call @f x) t0) x) t1))\n"
        );
    }

    #[test]
    fn anf_is_idempotent() {
        let mut m = Module::new();
        let (x, _) = unary_func(&mut m);
        let f = m.add_global("f");
        let g = m.add_global("g");
        let gx = {
            let ge = m.global_expr(g);
            let xe = m.var_expr(x);
            m.call(ge, vec![xe])
        };
        let fe = m.global_expr(f);
        let body = m.call(fe, vec![gx]);
        m.add_function("h", Function { params: vec![x], body, ret_type: None, primitive: false });

        to_anf(&mut m).unwrap();
        let once = m.render_module();
        to_anf(&mut m).unwrap();
        assert_eq!(once, m.render_module());
    }

    #[test]
    fn match_is_rejected() {
        let mut m = Module::new();
        let (x, _) = unary_func(&mut m);
        let xe = m.var_expr(x);
        let body = m.match_(xe);
        m.add_function("bad", Function { params: vec![x], body, ret_type: None, primitive: false });
        assert!(to_anf(&mut m).is_err());
    }
}
