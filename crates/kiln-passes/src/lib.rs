//! IR rewrites run before bytecode lowering.

mod anf;
mod error;
mod inline_primitives;
mod lambda_lift;

pub use anf::to_anf;
pub use error::{ErrorKind, PassError, Result};
pub use inline_primitives::inline_primitives;
pub use lambda_lift::lambda_lift;

use kiln_ir::Module;

/// The canonical pre-lowering sequence: A-normal form, primitive inlining,
/// lambda lifting, then primitive inlining again to clean up after the
/// lift. Idempotent once the full sequence has run.
///
/// On error the module must be discarded; partial rewrites are not rolled
/// back.
pub fn optimize(module: &mut Module) -> Result<()> {
    to_anf(module)?;
    inline_primitives(module)?;
    lambda_lift(module)?;
    inline_primitives(module)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_ir::{DType, Expr, Function, Type};

    #[test]
    fn full_sequence_is_idempotent() {
        let mut m = Module::new();
        let ty = Type::tensor(DType::Float32, vec![4]);
        let a = m.add_var("a", ty.clone());
        let b = m.add_var("b", ty.clone());
        let op = m.op("add");
        let ae = m.var_expr(a);
        let be = m.var_expr(b);
        let prim_body = m.call(op, vec![ae, be]);
        let prim = m.add_function("prim_add", Function {
            params: vec![a, b],
            body: prim_body,
            ret_type: Some(ty.clone()),
            primitive: true,
        });

        let x = m.add_var("x", ty.clone());
        let y = m.add_var("y", ty.clone());
        let callee = m.global_expr(prim);
        let xe = m.var_expr(x);
        let ye = m.var_expr(y);
        let inner = m.call_typed(callee, vec![xe, ye], ty.clone());
        let callee2 = m.global_expr(prim);
        let xe2 = m.var_expr(x);
        let body = m.call_typed(callee2, vec![inner, xe2], ty.clone());
        m.add_function("main", Function {
            params: vec![x, y],
            body,
            ret_type: Some(ty),
            primitive: false,
        });

        optimize(&mut m).unwrap();
        let once = m.render_module();
        optimize(&mut m).unwrap();
        assert_eq!(once, m.render_module());

        // primitive globals are gone, calls go through literals
        assert_eq!(m.functions().count(), 1);
        let (_, main) = m.functions().next().unwrap();
        let mut cursor = main.body;
        while let Expr::Let { value, body, .. } = m.expr(cursor) {
            if let Expr::Call { callee, .. } = m.expr(*value) {
                assert!(matches!(m.expr(*callee), Expr::Function(f) if f.primitive));
            }
            cursor = *body;
        }
    }
}
