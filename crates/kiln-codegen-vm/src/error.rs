//! Compiler errors.
//!
//! Every error is fatal to the current compilation; the partial context is
//! discarded by the caller. Errors carry the offending node where one can
//! be named.

use kiln_ir::ExprId;

#[derive(Debug)]
pub struct CompileError {
    pub kind: ErrorKind,
    pub expr: Option<ExprId>,
}

#[derive(Debug)]
pub enum ErrorKind {
    /// A node the compiler cannot lower (`match`, globals in register
    /// position, unlifted local functions, nested tuples at kernel
    /// boundaries).
    UnsupportedNode(String),
    /// A variable, global, constant, or shape without a table entry.
    MissingBinding(String),
    /// A call whose callee is not a primitive literal, global,
    /// constructor, or variable.
    UnsupportedCallee(String),
    /// The compile engine produced an unusable lowering.
    KernelLoweringError(String),
    /// Failure inside the native codegen seam.
    Native(String),
    Internal(String),
}

impl CompileError {
    pub fn unsupported(what: &str, expr: ExprId) -> Self {
        Self { kind: ErrorKind::UnsupportedNode(what.to_string()), expr: Some(expr) }
    }

    pub fn missing(what: &str) -> Self {
        Self { kind: ErrorKind::MissingBinding(what.to_string()), expr: None }
    }

    pub fn missing_at(what: &str, expr: ExprId) -> Self {
        Self { kind: ErrorKind::MissingBinding(what.to_string()), expr: Some(expr) }
    }

    pub fn callee(kind_name: &str, expr: ExprId) -> Self {
        Self { kind: ErrorKind::UnsupportedCallee(kind_name.to_string()), expr: Some(expr) }
    }

    pub fn kernel(msg: &str) -> Self {
        Self { kind: ErrorKind::KernelLoweringError(msg.to_string()), expr: None }
    }

    pub fn native(msg: &str) -> Self {
        Self { kind: ErrorKind::Native(msg.to_string()), expr: None }
    }

    pub fn internal(msg: &str) -> Self {
        Self { kind: ErrorKind::Internal(msg.to_string()), expr: None }
    }
}

impl From<kiln_passes::PassError> for CompileError {
    fn from(e: kiln_passes::PassError) -> Self {
        let kind = match e.kind {
            kiln_passes::ErrorKind::UnsupportedNode(what) => ErrorKind::UnsupportedNode(what),
            kiln_passes::ErrorKind::Internal(msg) => ErrorKind::Internal(msg),
        };
        Self { kind, expr: e.expr }
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ErrorKind::UnsupportedNode(what) => write!(f, "unsupported node: {}", what)?,
            ErrorKind::MissingBinding(what) => write!(f, "missing binding: {}", what)?,
            ErrorKind::UnsupportedCallee(kind) => write!(f, "unsupported callee: {}", kind)?,
            ErrorKind::KernelLoweringError(msg) => write!(f, "kernel lowering failed: {}", msg)?,
            ErrorKind::Native(msg) => write!(f, "native codegen failed: {}", msg)?,
            ErrorKind::Internal(msg) => write!(f, "internal error: {}", msg)?,
        }
        if let Some(id) = self.expr {
            write!(f, " at {}", id)?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileError {}

pub type Result<T> = std::result::Result<T, CompileError>;
