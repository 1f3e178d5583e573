//! The Python-subset teaching language executed by the backend.
//!
//! Split the usual way: [`token`] turns source into a token stream with
//! INDENT/DEDENT handling, [`parser`] builds the AST in [`ast`]. Every node
//! carries its exact source range; the instrumentation and debugging layers
//! depend on those being right.

pub mod ast;
pub mod parser;
pub mod token;

pub use ast::{Expr, ExprKind, Module, NodeId, Stmt, StmtKind, Target};
pub use parser::parse_module;

/// A syntax error with the position of the first offending token.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message} (line {lineno})")]
pub struct SyntaxError {
    pub message: String,
    pub lineno: u32,
    pub col_offset: u32,
}

impl SyntaxError {
    pub fn new(message: impl Into<String>, lineno: u32, col_offset: u32) -> Self {
        Self {
            message: message.into(),
            lineno,
            col_offset,
        }
    }
}
