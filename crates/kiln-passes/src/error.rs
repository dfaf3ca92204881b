//! Pass errors.

use kiln_ir::ExprId;

#[derive(Debug)]
pub struct PassError {
    pub kind: ErrorKind,
    /// The offending node, when one can be named.
    pub expr: Option<ExprId>,
}

#[derive(Debug)]
pub enum ErrorKind {
    UnsupportedNode(String),
    Internal(String),
}

impl PassError {
    pub fn unsupported(what: &str, expr: ExprId) -> Self {
        Self { kind: ErrorKind::UnsupportedNode(what.to_string()), expr: Some(expr) }
    }

    pub fn internal(msg: &str) -> Self {
        Self { kind: ErrorKind::Internal(msg.to_string()), expr: None }
    }
}

impl std::fmt::Display for PassError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ErrorKind::UnsupportedNode(what) => write!(f, "unsupported node: {}", what)?,
            ErrorKind::Internal(msg) => write!(f, "internal error: {}", msg)?,
        }
        if let Some(id) = self.expr {
            write!(f, " at {}", id)?;
        }
        Ok(())
    }
}

impl std::error::Error for PassError {}

pub type Result<T> = std::result::Result<T, PassError>;
