//! Lambda lifting.
//!
//! Every non-primitive function literal in expression position becomes a
//! top-level definition in closure form: an outer function whose parameters
//! are the captured free variables and whose body is the inner function
//! carrying the original parameters. The literal site is replaced by a call
//! of the new global with the captures as arguments, which the bytecode
//! compiler lowers to `AllocClosure`.

use std::collections::HashSet;

use kiln_ir::{Expr, ExprId, Function, Module, VarId};

use crate::error::{PassError, Result};

pub fn lambda_lift(module: &mut Module) -> Result<()> {
    let mut counter = 0usize;
    let funcs: Vec<_> = module.functions().map(|(g, f)| (g, f.clone())).collect();
    for (gid, func) in funcs {
        if func.primitive {
            continue;
        }
        // An already-lifted closure keeps its top-level literal; only the
        // inner body is scanned.
        let body = if let Expr::Function(inner) = module.expr(func.body).clone() {
            let inner_body = lift_expr(module, inner.body, &mut counter)?;
            module.function(Function { body: inner_body, ..inner })
        } else {
            lift_expr(module, func.body, &mut counter)?
        };
        module.define(gid, Function { body, ..func });
    }
    Ok(())
}

fn lift_expr(m: &mut Module, id: ExprId, counter: &mut usize) -> Result<ExprId> {
    match m.expr(id).clone() {
        Expr::Var(_)
        | Expr::Global(_)
        | Expr::Constant(_)
        | Expr::Constructor { .. } => Ok(id),
        Expr::Function(f) if f.primitive => Ok(id),
        Expr::Function(f) => {
            // lift nested literals first, then this one
            let body = lift_expr(m, f.body, counter)?;
            let captures = free_vars(m, &f.params, body);
            let inner = m.function(Function {
                params: f.params.clone(),
                body,
                ret_type: f.ret_type.clone(),
                primitive: false,
            });
            let name = format!("lifted_{}", *counter);
            *counter += 1;
            log::debug!("lambda_lift: {} captures {} free vars", name, captures.len());
            let lifted = m.add_function(&name, Function {
                params: captures.clone(),
                body: inner,
                ret_type: None,
                primitive: false,
            });
            let callee = m.global_expr(lifted);
            let args = captures.iter().map(|&v| m.var_expr(v)).collect();
            Ok(m.call(callee, args))
        }
        Expr::Tuple(fields) => {
            let fields = fields
                .into_iter()
                .map(|f| lift_expr(m, f, counter))
                .collect::<Result<Vec<_>>>()?;
            Ok(m.tuple(fields))
        }
        Expr::TupleGetItem { tuple, index } => {
            let tuple = lift_expr(m, tuple, counter)?;
            Ok(m.tuple_get(tuple, index))
        }
        Expr::Let { var, value, body } => {
            let value = lift_expr(m, value, counter)?;
            let body = lift_expr(m, body, counter)?;
            Ok(m.let_(var, value, body))
        }
        Expr::If { cond, then_branch, else_branch } => {
            let cond = lift_expr(m, cond, counter)?;
            let then_branch = lift_expr(m, then_branch, counter)?;
            let else_branch = lift_expr(m, else_branch, counter)?;
            Ok(m.if_(cond, then_branch, else_branch))
        }
        Expr::Call { callee, args } => {
            let callee = match m.expr(callee).clone() {
                Expr::Function(f) if f.primitive => callee,
                Expr::Global(_) | Expr::Var(_) | Expr::Constructor { .. } => callee,
                _ => lift_expr(m, callee, counter)?,
            };
            let args = args
                .into_iter()
                .map(|a| lift_expr(m, a, counter))
                .collect::<Result<Vec<_>>>()?;
            let call = m.call(callee, args);
            if let Some(ty) = m.checked_type(id).cloned() {
                m.set_checked_type(call, ty);
            }
            Ok(call)
        }
        Expr::Op(_) => Err(PassError::unsupported("op outside primitive body", id)),
        Expr::Match { .. } => Err(PassError::unsupported("match", id)),
    }
}

/// Free variables of a literal, in first-use order.
fn free_vars(m: &Module, params: &[VarId], body: ExprId) -> Vec<VarId> {
    let mut bound: HashSet<VarId> = params.iter().copied().collect();
    let mut seen = HashSet::new();
    let mut free = Vec::new();
    collect_free(m, body, &mut bound, &mut seen, &mut free);
    free
}

fn collect_free(
    m: &Module,
    id: ExprId,
    bound: &mut HashSet<VarId>,
    seen: &mut HashSet<VarId>,
    free: &mut Vec<VarId>,
) {
    match m.expr(id) {
        Expr::Var(v) => {
            if !bound.contains(v) && seen.insert(*v) {
                free.push(*v);
            }
        }
        Expr::Global(_) | Expr::Constant(_) | Expr::Constructor { .. } | Expr::Op(_) => {}
        Expr::Function(f) => {
            if !f.primitive {
                // var ids are globally unique, so no scope restoration needed
                bound.extend(f.params.iter().copied());
                collect_free(m, f.body, bound, seen, free);
            }
        }
        Expr::Tuple(fields) => {
            for &f in fields {
                collect_free(m, f, bound, seen, free);
            }
        }
        Expr::TupleGetItem { tuple, .. } => collect_free(m, *tuple, bound, seen, free),
        Expr::Let { var, value, body } => {
            collect_free(m, *value, bound, seen, free);
            bound.insert(*var);
            collect_free(m, *body, bound, seen, free);
        }
        Expr::If { cond, then_branch, else_branch } => {
            collect_free(m, *cond, bound, seen, free);
            collect_free(m, *then_branch, bound, seen, free);
            collect_free(m, *else_branch, bound, seen, free);
        }
        Expr::Call { callee, args } => {
            collect_free(m, *callee, bound, seen, free);
            for &a in args {
                collect_free(m, a, bound, seen, free);
            }
        }
        Expr::Match { scrutinee } => collect_free(m, *scrutinee, bound, seen, free),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_ir::{DType, Type};

    #[test]
    fn local_function_is_lifted_to_closure_form() {
        let mut m = Module::new();
        let ty = Type::tensor(DType::Float32, vec![4]);
        let c = m.add_var("c", ty.clone());
        let x = m.add_var("x", ty.clone());
        let f = m.add_var_untyped("f");
        let g = m.add_global("g");

        // main(c) = let f = fn(x) { g(x, c) } in f(c)
        let lam_body = {
            let ge = m.global_expr(g);
            let xe = m.var_expr(x);
            let ce = m.var_expr(c);
            m.call(ge, vec![xe, ce])
        };
        let lam = m.function(Function {
            params: vec![x],
            body: lam_body,
            ret_type: None,
            primitive: false,
        });
        let fe = m.var_expr(f);
        let ce = m.var_expr(c);
        let apply = m.call(fe, vec![ce]);
        let body = m.let_(f, lam, apply);
        m.add_function("main", Function {
            params: vec![c],
            body,
            ret_type: None,
            primitive: false,
        });

        lambda_lift(&mut m).unwrap();

        let lifted = m.lookup_global("lifted_0").expect("lifted global");
        let def = m.func(lifted).expect("definition");
        // outer params are the captures, inner holds the original params
        assert_eq!(def.params, vec![c]);
        assert!(m.is_closure(def));
        match m.expr(def.body) {
            Expr::Function(inner) => assert_eq!(inner.params, vec![x]),
            other => panic!("expected inner function, got {}", other.kind_name()),
        }

        // the literal site became a capture-passing call of the new global
        let rendered = m.render_module();
        assert!(rendered.contains("(let f (call @lifted_0 c) (call f c))"), "{}", rendered);
    }

    #[test]
    fn lift_is_idempotent() {
        let mut m = Module::new();
        let ty = Type::tensor(DType::Float32, vec![4]);
        let c = m.add_var("c", ty.clone());
        let x = m.add_var("x", ty);
        let f = m.add_var_untyped("f");
        let lam_body = m.var_expr(c);
        let lam = m.function(Function {
            params: vec![x],
            body: lam_body,
            ret_type: None,
            primitive: false,
        });
        let fe = m.var_expr(f);
        let ce = m.var_expr(c);
        let apply = m.call(fe, vec![ce]);
        let body = m.let_(f, lam, apply);
        m.add_function("main", Function { params: vec![c], body, ret_type: None, primitive: false });

        lambda_lift(&mut m).unwrap();
        let once = m.render_module();
        lambda_lift(&mut m).unwrap();
        assert_eq!(once, m.render_module());
    }
}
