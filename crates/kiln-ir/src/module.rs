//! Module: the expression arena plus the global function table.

use std::collections::HashMap;
use std::sync::Arc;

use crate::expr::{Expr, ExprId, Function, GlobalId, VarId};
use crate::tensor::Tensor;
use crate::types::Type;

/// Per-variable metadata. Pass-introduced temporaries carry no type.
#[derive(Clone, Debug)]
pub struct VarInfo {
    pub name: String,
    pub ty: Option<Type>,
}

/// Per-global metadata. A removed global keeps its slot so that ids held
/// elsewhere stay valid; it is skipped by iteration.
#[derive(Clone, Debug)]
pub struct GlobalInfo {
    pub name: String,
    pub func: Option<Function>,
    pub removed: bool,
}

struct ExprNode {
    kind: Expr,
    ty: Option<Type>,
}

/// A module: hash-consed vars and globals, an expression arena, and a
/// mapping from global to function definition, iterated in insertion order.
#[derive(Default)]
pub struct Module {
    nodes: Vec<ExprNode>,
    vars: Vec<VarInfo>,
    globals: Vec<GlobalInfo>,
    global_names: HashMap<String, GlobalId>,
    temp_counter: u32,
}

impl Module {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            vars: Vec::new(),
            globals: Vec::new(),
            global_names: HashMap::new(),
            temp_counter: 0,
        }
    }

    // === Variables ===

    pub fn add_var(&mut self, name: &str, ty: Type) -> VarId {
        let id = VarId(self.vars.len() as u32);
        self.vars.push(VarInfo { name: name.to_string(), ty: Some(ty) });
        id
    }

    pub fn add_var_untyped(&mut self, name: &str) -> VarId {
        let id = VarId(self.vars.len() as u32);
        self.vars.push(VarInfo { name: name.to_string(), ty: None });
        id
    }

    /// A fresh temporary, used by the normalization passes.
    pub fn fresh_var(&mut self, hint: &str) -> VarId {
        let name = format!("{}{}", hint, self.temp_counter);
        self.temp_counter += 1;
        self.add_var_untyped(&name)
    }

    pub fn var(&self, id: VarId) -> &VarInfo {
        &self.vars[id.index()]
    }

    pub fn var_count(&self) -> usize {
        self.vars.len()
    }

    // === Globals ===

    /// Register a global symbol with no definition yet.
    pub fn add_global(&mut self, name: &str) -> GlobalId {
        if let Some(&id) = self.global_names.get(name) {
            return id;
        }
        let id = GlobalId(self.globals.len() as u32);
        self.globals.push(GlobalInfo {
            name: name.to_string(),
            func: None,
            removed: false,
        });
        self.global_names.insert(name.to_string(), id);
        id
    }

    /// Register and define a global function.
    pub fn add_function(&mut self, name: &str, func: Function) -> GlobalId {
        let id = self.add_global(name);
        self.globals[id.index()].func = Some(func);
        self.globals[id.index()].removed = false;
        id
    }

    pub fn define(&mut self, id: GlobalId, func: Function) {
        self.globals[id.index()].func = Some(func);
        self.globals[id.index()].removed = false;
    }

    /// Tombstone a definition. The id stays valid but the global no longer
    /// appears in iteration.
    pub fn remove_function(&mut self, id: GlobalId) {
        self.globals[id.index()].removed = true;
    }

    pub fn global(&self, id: GlobalId) -> &GlobalInfo {
        &self.globals[id.index()]
    }

    pub fn lookup_global(&self, name: &str) -> Option<GlobalId> {
        self.global_names.get(name).copied()
    }

    /// The definition of a global, if any.
    pub fn func(&self, id: GlobalId) -> Option<&Function> {
        let info = &self.globals[id.index()];
        if info.removed {
            None
        } else {
            info.func.as_ref()
        }
    }

    /// Live definitions in insertion order. This order is the module
    /// iteration order used for global and constant index assignment.
    pub fn functions(&self) -> impl Iterator<Item = (GlobalId, &Function)> {
        self.globals.iter().enumerate().filter_map(|(i, info)| {
            if info.removed {
                return None;
            }
            info.func.as_ref().map(|f| (GlobalId(i as u32), f))
        })
    }

    /// A top-level function is a closure iff its body is itself a function.
    /// This is the shape lambda lifting produces: outer parameters are the
    /// captured values, inner parameters the runtime arguments.
    pub fn is_closure(&self, func: &Function) -> bool {
        matches!(self.expr(func.body), Expr::Function(_))
    }

    // === Expression arena ===

    fn push(&mut self, kind: Expr) -> ExprId {
        let id = ExprId(self.nodes.len() as u32);
        self.nodes.push(ExprNode { kind, ty: None });
        id
    }

    pub fn expr(&self, id: ExprId) -> &Expr {
        &self.nodes[id.index()].kind
    }

    pub fn expr_count(&self) -> usize {
        self.nodes.len()
    }

    /// The cached checked type of a node, if the builder recorded one.
    pub fn checked_type(&self, id: ExprId) -> Option<&Type> {
        self.nodes[id.index()].ty.as_ref()
    }

    pub fn set_checked_type(&mut self, id: ExprId, ty: Type) {
        self.nodes[id.index()].ty = Some(ty);
    }

    // === Builders ===

    pub fn var_expr(&mut self, var: VarId) -> ExprId {
        self.push(Expr::Var(var))
    }

    pub fn global_expr(&mut self, global: GlobalId) -> ExprId {
        self.push(Expr::Global(global))
    }

    pub fn constant(&mut self, value: Tensor) -> ExprId {
        self.constant_shared(Arc::new(value))
    }

    pub fn constant_shared(&mut self, value: Arc<Tensor>) -> ExprId {
        self.push(Expr::Constant(value))
    }

    pub fn tuple(&mut self, fields: Vec<ExprId>) -> ExprId {
        self.push(Expr::Tuple(fields))
    }

    pub fn tuple_get(&mut self, tuple: ExprId, index: usize) -> ExprId {
        self.push(Expr::TupleGetItem { tuple, index })
    }

    pub fn let_(&mut self, var: VarId, value: ExprId, body: ExprId) -> ExprId {
        self.push(Expr::Let { var, value, body })
    }

    pub fn if_(&mut self, cond: ExprId, then_branch: ExprId, else_branch: ExprId) -> ExprId {
        self.push(Expr::If { cond, then_branch, else_branch })
    }

    pub fn call(&mut self, callee: ExprId, args: Vec<ExprId>) -> ExprId {
        self.push(Expr::Call { callee, args })
    }

    /// A call with its checked return type, as the type-checker would leave it.
    pub fn call_typed(&mut self, callee: ExprId, args: Vec<ExprId>, ret: Type) -> ExprId {
        let id = self.push(Expr::Call { callee, args });
        self.set_checked_type(id, ret);
        id
    }

    pub fn function(&mut self, func: Function) -> ExprId {
        self.push(Expr::Function(func))
    }

    pub fn constructor(&mut self, tag: usize) -> ExprId {
        self.push(Expr::Constructor { tag })
    }

    pub fn op(&mut self, name: &str) -> ExprId {
        self.push(Expr::Op(name.to_string()))
    }

    pub fn match_(&mut self, scrutinee: ExprId) -> ExprId {
        self.push(Expr::Match { scrutinee })
    }

    // === Rendering ===

    /// Stable textual form of an expression, independent of node ids.
    pub fn render(&self, id: ExprId) -> String {
        match self.expr(id) {
            Expr::Var(v) => self.var(*v).name.clone(),
            Expr::Global(g) => format!("@{}", self.global(*g).name),
            Expr::Constant(t) => {
                let dims: Vec<String> = t.shape().iter().map(|d| d.to_string()).collect();
                format!("const<{}x({})>", t.dtype(), dims.join(","))
            }
            Expr::Tuple(fields) => {
                let fs: Vec<String> = fields.iter().map(|&f| self.render(f)).collect();
                format!("(tuple {})", fs.join(" "))
            }
            Expr::TupleGetItem { tuple, index } => {
                format!("(get {} {})", self.render(*tuple), index)
            }
            Expr::Let { var, value, body } => format!(
                "(let {} {} {})",
                self.var(*var).name,
                self.render(*value),
                self.render(*body)
            ),
            Expr::If { cond, then_branch, else_branch } => format!(
                "(if {} {} {})",
                self.render(*cond),
                self.render(*then_branch),
                self.render(*else_branch)
            ),
            Expr::Call { callee, args } => {
                let mut parts = vec![self.render(*callee)];
                parts.extend(args.iter().map(|&a| self.render(a)));
                format!("(call {})", parts.join(" "))
            }
            Expr::Function(f) => self.render_function(f),
            Expr::Constructor { tag } => format!("(ctor {})", tag),
            Expr::Op(name) => format!("op:{}", name),
            Expr::Match { scrutinee } => format!("(match {})", self.render(*scrutinee)),
        }
    }

    pub fn render_function(&self, f: &Function) -> String {
        let params: Vec<String> = f.params.iter().map(|&p| self.var(p).name.clone()).collect();
        let head = if f.primitive { "prim-fn" } else { "fn" };
        format!("({} [{}] {})", head, params.join(" "), self.render(f.body))
    }

    /// Stable textual form of every live definition, in module order.
    pub fn render_module(&self) -> String {
        let mut out = String::new();
        for (gid, func) in self.functions() {
            out.push_str(&format!("def {} {}\n", self.global(gid).name, self.render_function(func)));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DType;

    #[test]
    fn global_iteration_order_is_insertion_order() {
        let mut m = Module::new();
        let x = m.add_var("x", Type::tensor(DType::Float32, vec![4]));
        let body = m.var_expr(x);
        let f = Function { params: vec![x], body, ret_type: None, primitive: false };
        m.add_function("b", f.clone());
        m.add_function("a", f.clone());
        m.add_function("c", f);

        let names: Vec<_> = m.functions().map(|(g, _)| m.global(g).name.clone()).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }

    #[test]
    fn removed_globals_keep_ids_stable() {
        let mut m = Module::new();
        let x = m.add_var("x", Type::tensor(DType::Float32, vec![4]));
        let body = m.var_expr(x);
        let f = Function { params: vec![x], body, ret_type: None, primitive: false };
        let a = m.add_function("a", f.clone());
        let b = m.add_function("b", f);
        m.remove_function(a);

        assert!(m.func(a).is_none());
        assert!(m.func(b).is_some());
        assert_eq!(m.functions().count(), 1);
        assert_eq!(m.global(b).name, "b");
    }

    #[test]
    fn closure_shape_detection() {
        let mut m = Module::new();
        let c = m.add_var("c", Type::tensor(DType::Float32, vec![1]));
        let x = m.add_var("x", Type::tensor(DType::Float32, vec![1]));
        let inner_body = m.var_expr(x);
        let inner = m.function(Function {
            params: vec![x],
            body: inner_body,
            ret_type: None,
            primitive: false,
        });
        let outer = Function { params: vec![c], body: inner, ret_type: None, primitive: false };
        assert!(m.is_closure(&outer));

        let flat_body = m.var_expr(c);
        let flat = Function { params: vec![c], body: flat_body, ret_type: None, primitive: false };
        assert!(!m.is_closure(&flat));
    }
}
