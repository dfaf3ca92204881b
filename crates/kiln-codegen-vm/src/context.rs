//! Compiler context - per-compilation shared state.
//!
//! An explicit value threaded through one compilation, never a process
//! global. Discarded wholesale on any error.

use std::collections::HashMap;
use std::sync::Arc;

use kiln_ir::{Expr, ExprId, GlobalId, Module, Tensor, TensorType};
use kiln_native::Kernel;

pub struct CompilerContext {
    pub module: Module,
    /// Global var to dense function index, in module iteration order.
    pub global_map: HashMap<GlobalId, usize>,
    /// Constant node to constant-pool index.
    pub const_map: HashMap<ExprId, usize>,
    /// Tensor type to (constant-pool index, synthesized shape tensor).
    /// Shares the index space of `const_map`.
    pub shape_map: HashMap<TensorType, (usize, Tensor)>,
    /// Lowered kernels in first-observation order.
    pub lowered_funcs: Vec<Arc<Kernel>>,
    /// Kernel name to packed index, deduplicating lowerings.
    pub seen_funcs: HashMap<String, usize>,
}

impl CompilerContext {
    pub fn new(module: Module) -> Self {
        Self {
            module,
            global_map: HashMap::new(),
            const_map: HashMap::new(),
            shape_map: HashMap::new(),
            lowered_funcs: Vec::new(),
            seen_funcs: HashMap::new(),
        }
    }

    pub fn populate_global_map(&mut self) {
        for (index, (gid, _)) in self.module.functions().enumerate() {
            self.global_map.insert(gid, index);
        }
    }

    /// Register a lowered kernel, reusing the index of a previously seen
    /// one. Returns the packed index.
    pub fn add_lowered(&mut self, kernel: Arc<Kernel>) -> usize {
        if let Some(&index) = self.seen_funcs.get(&kernel.name) {
            return index;
        }
        let index = self.lowered_funcs.len();
        self.seen_funcs.insert(kernel.name.clone(), index);
        self.lowered_funcs.push(kernel);
        index
    }

    pub fn constant_count(&self) -> usize {
        self.const_map.len() + self.shape_map.len()
    }

    /// Materialize the constant array: literal tensors and shape tensors
    /// placed at their assigned indices.
    pub fn layout_constants(&self) -> Vec<Tensor> {
        let mut slots: Vec<Option<Tensor>> = vec![None; self.constant_count()];
        for (&expr, &index) in &self.const_map {
            if let Expr::Constant(value) = self.module.expr(expr) {
                slots[index] = Some((**value).clone());
            }
        }
        for (index, shape) in self.shape_map.values() {
            slots[*index] = Some(shape.clone());
        }
        slots
            .into_iter()
            .map(|s| s.expect("constant and shape indices partition the pool"))
            .collect()
    }
}
