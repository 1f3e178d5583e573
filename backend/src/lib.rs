//! The backend process: runs user programs under controller command.
//!
//! The controller talks to this crate over the `transport` wire protocol.
//! [`machine`] owns the command loop and dispatch, [`executor`] runs user
//! source through the embedded Python-subset interpreter in [`lang`] and
//! [`eval`], [`instrument`] rewrites source so the stepping runner in
//! [`tracer`] can pause between statements and expressions.

pub mod eval;
pub mod executor;
pub mod files;
pub mod heap;
pub mod inline;
pub mod instrument;
pub mod lang;
pub mod machine;
pub mod tracer;

pub use machine::Backend;

/// Pseudo-filename for shell input, mirrored in tracebacks.
pub const REPL_PSEUDO_FILENAME: &str = "<stdin>";

/// Marker functions spliced into instrumented source. The interpreter routes
/// calls to these names to the active trace hook instead of the normal call
/// machinery.
pub const BEFORE_STATEMENT_MARKER: &str = "__wb_before_stmt";
pub const AFTER_STATEMENT_MARKER: &str = "__wb_after_stmt";
pub const BEFORE_EXPRESSION_MARKER: &str = "__wb_before_expr";
pub const AFTER_EXPRESSION_MARKER: &str = "__wb_after_expr";

/// Name the REPL convenience variable `_` is rewritten to.
pub const LAST_VALUE_BUILTIN: &str = "__wb_last_value";

pub fn is_marker_name(name: &str) -> bool {
    matches!(
        name,
        BEFORE_STATEMENT_MARKER
            | AFTER_STATEMENT_MARKER
            | BEFORE_EXPRESSION_MARKER
            | AFTER_EXPRESSION_MARKER
    )
}

/// Names hidden from exported variable listings.
pub fn is_hidden_name(name: &str) -> bool {
    name.starts_with("__")
}
