//! Running user source: the plain runner and the stepping runner.
//!
//! Both paths parse, optionally instrument, execute through the interpreter
//! and convert every abnormal end into structured data. Nothing raised by
//! user code may escape into machine code.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;

use crossbeam_channel::Receiver;
use transport::events::{BackendEvent, MessageFromBackend};
use transport::types::{
    Breakpoints, FrameInfo, PauseEvent, TracebackItem, UserExceptionInfo, ValueInfo,
};
use transport::ConnectionWriter;

use crate::eval::{
    interp::TraceHook, ExecState, Interp, NoopHook, RunError, RunErrorKind, Value,
};
use crate::heap::{Heap, MAX_REPR_LENGTH};
use crate::instrument::{
    instrument_source, offset_of, rewrite_last_value_refs, LastValueRewrite, NodeTable,
};
use crate::lang::{parse_module, Module, StmtKind, SyntaxError};
use crate::machine::{Incoming, SessionState, WireIo};
use crate::tracer::{Granularity, StepTracer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerKind {
    Plain,
    Step(Granularity),
}

/// What a completed execution contributes to the toplevel response.
#[derive(Debug, Default)]
pub struct ExecOutcome {
    pub user_exception: Option<UserExceptionInfo>,
    pub value_info: Option<ValueInfo>,
    pub system_exit: bool,
}

/// Connection-side services execution needs: where output goes, where
/// commands come from, and the shared interrupt flag.
pub struct ExecEnv<'a> {
    pub writer: &'a ConnectionWriter,
    pub commands: &'a Receiver<Incoming>,
    pub interrupt: &'a Arc<AtomicBool>,
    pub heap: &'a Rc<RefCell<Heap>>,
    pub io_symbols: &'a Arc<AtomicU64>,
}

/// Runs a whole script (`Run`, `Debug`, `FastDebug`).
pub fn run_file(
    env: &ExecEnv<'_>,
    session: &mut SessionState,
    source: &str,
    filename: &str,
    runner: RunnerKind,
    breakpoints: Breakpoints,
) -> ExecOutcome {
    let module = match parse_module(source) {
        Ok(module) => module,
        Err(e) => return syntax_outcome(&e, source, filename),
    };
    execute(
        env, session, source, &module, None, filename, runner, breakpoints,
    )
}

/// Runs shell input (`execute_source`), with interactive-shell semantics:
/// a single bare expression is evaluated, a trailing bare expression after
/// other statements is evaluated separately from them, anything else is
/// plain execution. Only the final bare expression's value is surfaced.
pub fn run_shell_source(
    env: &ExecEnv<'_>,
    session: &mut SessionState,
    source: &str,
    filename: &str,
    runner: RunnerKind,
    breakpoints: Breakpoints,
) -> ExecOutcome {
    let parsed = match parse_module(source) {
        Ok(module) => module,
        Err(e) => return syntax_outcome(&e, source, filename),
    };

    // conservative `_` substitution: only when the program itself never
    // assigns that name
    let (source, module) = match rewrite_last_value_refs(source, &parsed) {
        LastValueRewrite::Unchanged => (source.to_owned(), parsed),
        LastValueRewrite::Rewritten(rewritten) => match parse_module(&rewritten) {
            Ok(module) => (rewritten, module),
            Err(e) => {
                tracing::warn!(error = %e, "last-value rewrite produced unparsable source");
                (source.to_owned(), parsed)
            }
        },
        LastValueRewrite::Ambiguous { warning } => {
            let _ = env.writer.send_message(&MessageFromBackend::Event(
                BackendEvent::stderr(format!("Warning: {warning}\n")),
            ));
            (source.to_owned(), parsed)
        }
    };

    let last_is_expr = matches!(
        module.body.last().map(|s| &s.kind),
        Some(StmtKind::Expr(_))
    );

    if !last_is_expr {
        // exec
        return execute(
            env,
            session,
            &source,
            &module,
            None,
            filename,
            runner,
            breakpoints,
        );
    }

    if module.body.len() == 1 {
        // eval: no statement part at all
        return execute(
            env,
            session,
            "",
            &Module { body: Vec::new() },
            Some((source.as_str(), &module)),
            filename,
            runner,
            breakpoints,
        );
    }

    // exec+eval: everything up to the trailing expression runs as one unit,
    // the expression is evaluated separately so its value can be reported
    let split = module.body.last().expect("nonempty body").range;
    let exec_source = source[..offset_of(&source, split.lineno, split.col_offset)].to_owned();
    let exec_module = match parse_module(&exec_source) {
        Ok(m) => m,
        Err(e) => {
            // splitting never changes the statements before the split point
            tracing::warn!(error = %e, "statement part failed to reparse");
            return syntax_outcome(&e, &exec_source, filename);
        }
    };
    execute(
        env,
        session,
        &exec_source,
        &exec_module,
        Some((source.as_str(), &module)),
        filename,
        runner,
        breakpoints,
    )
}

/// The common execution core. `trailing` carries the shell's trailing bare
/// expression (with the source it was parsed from); it always runs
/// uninstrumented.
#[allow(clippy::too_many_arguments)]
fn execute(
    env: &ExecEnv<'_>,
    session: &mut SessionState,
    exec_source: &str,
    exec_module: &Module,
    trailing: Option<(&str, &Module)>,
    filename: &str,
    runner: RunnerKind,
    breakpoints: Breakpoints,
) -> ExecOutcome {
    // instrumentation is best effort: any failure degrades to running the
    // original source
    let (run_module, nodes) = match runner {
        RunnerKind::Step(Granularity::Expression) if !exec_module.body.is_empty() => {
            let instrumented = instrument_source(exec_source, exec_module);
            match parse_module(&instrumented.source) {
                Ok(module) => (Some(module), instrumented.nodes),
                Err(e) => {
                    tracing::warn!(error = %e, "instrumented source failed to parse; running uninstrumented");
                    (None, NodeTable::default())
                }
            }
        }
        // line granularity steps on the interpreter's own line events and
        // needs no rewriting
        _ => (None, NodeTable::default()),
    };

    let mut hook: Box<dyn TraceHook> = match runner {
        RunnerKind::Plain => Box::new(NoopHook),
        RunnerKind::Step(granularity) => Box::new(StepTracer::new(
            granularity,
            nodes,
            filename.to_owned(),
            exec_source.to_owned(),
            breakpoints,
            env.writer.clone(),
            env.commands.clone(),
            Rc::clone(env.heap),
            Arc::clone(env.interrupt),
            Arc::clone(env.io_symbols),
        )),
    };

    let mut io = WireIo::new(
        env.writer.clone(),
        env.commands.clone(),
        Arc::clone(env.interrupt),
        Arc::clone(env.io_symbols),
        Rc::clone(env.heap),
    );

    let globals = std::mem::take(&mut session.globals);
    let mut interp = Interp::new(
        filename,
        globals,
        hook.as_mut(),
        &mut io,
        Arc::clone(env.interrupt),
        session.last_value.clone().unwrap_or(Value::None),
    );

    let body = run_module.as_ref().unwrap_or(exec_module);
    let exec_result = interp.exec_module(&body.body);

    let mut outcome = ExecOutcome::default();
    match exec_result {
        Ok(()) => {
            if let Some((trailing_source, trailing_module)) = trailing {
                let expr = match &trailing_module.body.last().expect("trailing stmt").kind {
                    StmtKind::Expr(expr) => expr,
                    _ => unreachable!("caller checked the trailing statement"),
                };
                match interp.eval_expression(expr) {
                    Ok(value) => {
                        let info = env.heap.borrow_mut().export_value(&value, MAX_REPR_LENGTH);
                        if !matches!(value, Value::None) {
                            session.last_value = Some(value);
                        }
                        outcome.value_info = Some(info);
                    }
                    Err(err) => {
                        fill_error_outcome(
                            &mut outcome,
                            &err,
                            trailing_source,
                            filename,
                            &interp.state,
                            env,
                        );
                    }
                }
            }
        }
        Err(err) => {
            fill_error_outcome(&mut outcome, &err, exec_source, filename, &interp.state, env);
        }
    }

    session.globals = interp.into_globals();
    outcome
}

fn fill_error_outcome(
    outcome: &mut ExecOutcome,
    err: &RunError,
    source: &str,
    filename: &str,
    state: &ExecState,
    env: &ExecEnv<'_>,
) {
    match err.kind {
        RunErrorKind::SystemExit(_) => {
            outcome.system_exit = true;
        }
        _ => {
            outcome.user_exception =
                Some(build_user_exception(err, source, filename, state, env));
        }
    }
}

fn syntax_outcome(err: &SyntaxError, source: &str, filename: &str) -> ExecOutcome {
    let line_text = source
        .split('\n')
        .nth(err.lineno.saturating_sub(1) as usize)
        .map(str::to_owned);

    let mut items = vec![TracebackItem {
        text: format!("  File \"{filename}\", line {}\n", err.lineno),
        frame_id: None,
        filename: Some(filename.to_owned()),
        lineno: Some(err.lineno),
    }];
    if let Some(text) = &line_text {
        if !text.trim().is_empty() {
            items.push(TracebackItem {
                text: format!("    {}\n", text.trim_end()),
                frame_id: None,
                filename: None,
                lineno: None,
            });
        }
    }
    items.push(TracebackItem {
        text: format!("SyntaxError: {}\n", err.message),
        frame_id: None,
        filename: None,
        lineno: None,
    });

    ExecOutcome {
        user_exception: Some(UserExceptionInfo {
            type_name: "SyntaxError".to_owned(),
            message: err.message.clone(),
            stack: Vec::new(),
            items,
            filename: Some(filename.to_owned()),
            lineno: Some(err.lineno),
            col_offset: Some(err.col_offset),
            line: line_text,
        }),
        value_info: None,
        system_exit: false,
    }
}

fn build_user_exception(
    err: &RunError,
    source: &str,
    filename: &str,
    state: &ExecState,
    env: &ExecEnv<'_>,
) -> UserExceptionInfo {
    let module_lineno = state.frames.first().map(|f| f.lineno).unwrap_or(1);
    let failure_lineno = err.range.map(|r| r.lineno).or_else(|| {
        // innermost recorded frame, or the module line
        err.traceback.first().map(|(_, l)| *l)
    });

    let mut items = vec![TracebackItem {
        text: "Traceback (most recent call last):\n".to_owned(),
        frame_id: None,
        filename: None,
        lineno: None,
    }];

    // outermost first: module entry, then the unwound frames reversed
    let mut entries: Vec<(String, u32)> = vec![("<module>".to_owned(), module_lineno)];
    entries.extend(err.traceback.iter().rev().cloned());
    for (code_name, lineno) in &entries {
        items.push(TracebackItem {
            text: format!("  File \"{filename}\", line {lineno}, in {code_name}\n"),
            frame_id: None,
            filename: Some(filename.to_owned()),
            lineno: Some(*lineno),
        });
        if let Some(text) = source.split('\n').nth(lineno.saturating_sub(1) as usize) {
            if !text.trim().is_empty() {
                items.push(TracebackItem {
                    text: format!("    {}\n", text.trim()),
                    frame_id: None,
                    filename: None,
                    lineno: None,
                });
            }
        }
    }

    let summary = if err.message.is_empty() {
        format!("{}\n", err.type_name())
    } else {
        format!("{}: {}\n", err.type_name(), err.message)
    };
    items.push(TracebackItem {
        text: summary,
        frame_id: None,
        filename: None,
        lineno: None,
    });

    let line = failure_lineno
        .and_then(|l| source.split('\n').nth(l.saturating_sub(1) as usize))
        .map(str::to_owned);

    UserExceptionInfo {
        type_name: err.type_name().to_owned(),
        message: err.message.clone(),
        stack: export_module_stack(state, source, filename, env, err),
        items,
        filename: Some(filename.to_owned()),
        lineno: failure_lineno,
        col_offset: err.range.map(|r| r.col_offset),
        line,
    }
}

fn export_module_stack(
    state: &ExecState,
    source: &str,
    filename: &str,
    env: &ExecEnv<'_>,
    err: &RunError,
) -> Vec<FrameInfo> {
    let Some(module_frame) = state.frames.first() else {
        return Vec::new();
    };
    let mut heap = env.heap.borrow_mut();
    vec![FrameInfo {
        id: module_frame.id,
        filename: filename.to_owned(),
        module_name: "__main__".to_owned(),
        code_name: "<module>".to_owned(),
        source: Some(source.to_owned()),
        lineno: module_frame.lineno,
        firstlineno: Some(1),
        in_library: false,
        locals: None,
        globals: heap.export_variables(&state.globals),
        freevars: Vec::new(),
        event: PauseEvent::Line,
        focus: err.range,
        current_statement: err.range,
        current_root_expression: None,
        current_evaluations: Vec::new(),
    }]
}
