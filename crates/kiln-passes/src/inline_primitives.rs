//! Primitive-call inlining.
//!
//! Calls that reach a primitive function through a `let` binding or through
//! a global definition are rewritten to call the primitive literal
//! directly, which is the only callee form the primitive lowering path
//! accepts. Bindings of primitive literals are dropped and primitive
//! global definitions are removed from the module afterwards.

use std::collections::HashMap;

use kiln_ir::{Expr, ExprId, Function, Module, VarId};

use crate::error::{PassError, Result};

pub fn inline_primitives(module: &mut Module) -> Result<()> {
    let funcs: Vec<_> = module.functions().map(|(g, f)| (g, f.clone())).collect();

    for (gid, func) in &funcs {
        if func.primitive {
            continue;
        }
        let mut env = HashMap::new();
        let body = inline_expr(module, func.body, &mut env)?;
        module.define(*gid, Function { body, ..func.clone() });
    }

    for (gid, func) in &funcs {
        if func.primitive {
            log::debug!("inline_primitives: removing primitive global {}", module.global(*gid).name);
            module.remove_function(*gid);
        }
    }
    Ok(())
}

fn is_primitive_literal(m: &Module, id: ExprId) -> bool {
    matches!(m.expr(id), Expr::Function(f) if f.primitive)
}

fn inline_expr(
    m: &mut Module,
    id: ExprId,
    env: &mut HashMap<VarId, ExprId>,
) -> Result<ExprId> {
    match m.expr(id).clone() {
        Expr::Var(v) => Ok(env.get(&v).copied().unwrap_or(id)),
        Expr::Global(_) | Expr::Constant(_) | Expr::Constructor { .. } => Ok(id),
        Expr::Function(f) if f.primitive => Ok(id),
        Expr::Function(f) => {
            let body = inline_expr(m, f.body, env)?;
            Ok(m.function(Function { body, ..f }))
        }
        Expr::Tuple(fields) => {
            let fields = fields
                .into_iter()
                .map(|f| inline_expr(m, f, env))
                .collect::<Result<Vec<_>>>()?;
            Ok(m.tuple(fields))
        }
        Expr::TupleGetItem { tuple, index } => {
            let tuple = inline_expr(m, tuple, env)?;
            Ok(m.tuple_get(tuple, index))
        }
        Expr::If { cond, then_branch, else_branch } => {
            let cond = inline_expr(m, cond, env)?;
            let then_branch = inline_expr(m, then_branch, env)?;
            let else_branch = inline_expr(m, else_branch, env)?;
            Ok(m.if_(cond, then_branch, else_branch))
        }
        Expr::Let { var, value, body } => {
            if is_primitive_literal(m, value) {
                // record the binding and drop the let; uses are substituted
                env.insert(var, value);
                inline_expr(m, body, env)
            } else {
                let value = inline_expr(m, value, env)?;
                let body = inline_expr(m, body, env)?;
                Ok(m.let_(var, value, body))
            }
        }
        Expr::Call { callee, args } => {
            let callee = resolve_callee(m, callee, env)?;
            let args = args
                .into_iter()
                .map(|a| inline_expr(m, a, env))
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

fn resolve_callee(
    m: &mut Module,
    callee: ExprId,
    env: &mut HashMap<VarId, ExprId>,
) -> Result<ExprId> {
    match m.expr(callee).clone() {
        Expr::Var(v) => Ok(env.get(&v).copied().unwrap_or(callee)),
        Expr::Global(g) => match m.func(g) {
            // materialize the primitive definition at the call site
            Some(def) if def.primitive => {
                let def = def.clone();
                Ok(m.function(def))
            }
            _ => Ok(callee),
        },
        Expr::Function(f) if f.primitive => Ok(callee),
        _ => inline_expr(m, callee, env),
    }
}
