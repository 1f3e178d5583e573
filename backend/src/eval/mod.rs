//! Tree-walking interpreter for the teaching language.
//!
//! [`value`] is the runtime value model, [`interp`] the evaluator. The
//! evaluator reports progress through a [`interp::TraceHook`] and performs
//! program I/O through a [`interp::ProgramIo`]; both are supplied by the
//! execution engine, so the same evaluator serves the plain runner and the
//! stepping runner.

pub mod interp;
pub mod value;

pub use interp::{ExecState, Frame, Interp, NoopHook, ProgramIo, TraceEvent, TraceHook};
pub use value::{RunError, RunErrorKind, Value};
