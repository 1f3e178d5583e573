//! The stepping runner's trace hook.
//!
//! Receives progress events from the interpreter, keeps a bounded history of
//! pause snapshots, and blocks execution while talking to the controller:
//! report the current state, wait for the next debugger command, decide
//! whether that command has completed at each following event. Replaying a
//! cached snapshot (`step_back`) never re-executes user code.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use transport::commands::{CommandToBackend, DebuggerCommand, StepAction};
use transport::events::{BackendEvent, MessageFromBackend};
use transport::responses::{DebuggerResponse, ToplevelResponse};
use transport::types::{Breakpoints, FrameInfo, PauseEvent};
use transport::ConnectionWriter;

use crate::eval::{ExecState, RunError, TraceEvent, TraceHook};
use crate::heap::Heap;
use crate::inline::{self, InlineContext};
use crate::instrument::NodeTable;
use crate::machine::Incoming;

/// Upper bound on cached pause snapshots; past it the oldest state falls off
/// and `step_back` cannot reach it anymore.
const MAX_SAVED_STATES: usize = 1000;

const COMMAND_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    /// Pause per statement line, source left unrewritten.
    Line,
    /// Pause at statement and expression boundaries via spliced markers.
    Expression,
}

impl Granularity {
    pub fn tracer_class(self) -> &'static str {
        match self {
            Granularity::Line => "LineTracer",
            Granularity::Expression => "ExpressionTracer",
        }
    }
}

struct SavedState {
    stack: Vec<FrameInfo>,
    in_client_log: bool,
}

pub struct StepTracer {
    granularity: Granularity,
    nodes: NodeTable,
    filename: String,
    source: String,
    writer: ConnectionWriter,
    commands: Receiver<Incoming>,
    heap: Rc<RefCell<Heap>>,
    interrupt: Arc<AtomicBool>,
    io_symbols: Arc<AtomicU64>,
    current_command: DebuggerCommand,
    saved_states: VecDeque<SavedState>,
    current_index: usize,
}

impl StepTracer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        granularity: Granularity,
        nodes: NodeTable,
        filename: String,
        source: String,
        breakpoints: Breakpoints,
        writer: ConnectionWriter,
        commands: Receiver<Incoming>,
        heap: Rc<RefCell<Heap>>,
        interrupt: Arc<AtomicBool>,
        io_symbols: Arc<AtomicU64>,
    ) -> Self {
        // with breakpoints set the user wants to run to the first of them;
        // without, stepping starts at the first statement
        let initial = if breakpoints.is_empty() {
            StepAction::StepInto
        } else {
            StepAction::Resume
        };
        let mut current_command = DebuggerCommand::new(initial);
        current_command.breakpoints = breakpoints;

        Self {
            granularity,
            nodes,
            filename,
            source,
            writer,
            commands,
            heap,
            interrupt,
            io_symbols,
            current_command,
            saved_states: VecDeque::new(),
            current_index: 0,
        }
    }

    fn update_frame(&self, state: &mut ExecState, event: PauseEvent, node: crate::lang::NodeId) {
        let Some(info) = self.nodes.get(node) else {
            tracing::warn!(node, "marker for unknown node");
            return;
        };
        let range = info.range;
        let frame = state.frames.last_mut().expect("frame stack never empty");
        frame.event = event;
        frame.focus = Some(range);
        frame.lineno = range.lineno;

        match event {
            PauseEvent::BeforeStatement => {
                frame.current_statement = Some(range);
                frame.current_root_expression = None;
                frame.current_evaluations.clear();
            }
            PauseEvent::AfterStatement => {}
            PauseEvent::BeforeExpression => {
                let is_root = match frame.current_root_expression {
                    Some(root) => !root.contains_smaller_or_equal(&range),
                    None => true,
                };
                if is_root {
                    frame.current_root_expression = Some(range);
                    frame.current_evaluations.clear();
                }
            }
            PauseEvent::AfterExpression => {}
            _ => {}
        }
    }

    fn save_state(&mut self, state: &ExecState) {
        let stack = self.export_stack(state);
        if self.saved_states.len() >= MAX_SAVED_STATES {
            self.saved_states.pop_front();
            self.current_index = self.current_index.saturating_sub(1);
        }
        self.saved_states.push_back(SavedState {
            stack,
            in_client_log: false,
        });
    }

    fn export_stack(&self, state: &ExecState) -> Vec<FrameInfo> {
        let mut heap = self.heap.borrow_mut();
        let globals = heap.export_variables(&state.globals);
        state
            .frames
            .iter()
            .map(|frame| FrameInfo {
                id: frame.id,
                filename: self.filename.clone(),
                module_name: "__main__".to_owned(),
                code_name: frame.code_name.clone(),
                source: if frame.code_name == "<module>" {
                    Some(self.source.clone())
                } else {
                    None
                },
                lineno: frame.lineno,
                firstlineno: Some(frame.firstlineno),
                in_library: false,
                locals: frame.locals.as_ref().map(|l| heap.export_variables(l)),
                globals: globals.clone(),
                freevars: Vec::new(),
                event: frame.event,
                focus: frame.focus,
                current_statement: frame.current_statement,
                current_root_expression: frame.current_root_expression,
                current_evaluations: frame
                    .current_evaluations
                    .iter()
                    .map(|(range, value)| {
                        (
                            *range,
                            heap.export_value(value, crate::heap::MAX_VARIABLE_REPR_LENGTH),
                        )
                    })
                    .collect(),
            })
            .collect()
    }

    fn respond_to_commands(&mut self, state: &mut ExecState) -> Result<(), RunError> {
        while self.current_index < self.saved_states.len() {
            if self.command_completed(state) {
                self.saved_states[self.current_index].in_client_log = true;
                self.report_state(self.current_index)?;
                self.current_command = self.fetch_next_command(state)?;
            }

            if self.current_command.name == StepAction::StepBack {
                match self.granularity {
                    Granularity::Line => {
                        // no history at line granularity; decline instead of
                        // corrupting state
                        let _ = self.writer.send_message(&MessageFromBackend::Event(
                            BackendEvent::stderr(
                                "step_back is not supported by this debug mode\n",
                            ),
                        ));
                        self.report_state(self.current_index)?;
                        self.current_command = self.fetch_next_command(state)?;
                    }
                    Granularity::Expression => {
                        if self.current_index > 0 {
                            // this state drops out of the client's undo log
                            self.saved_states[self.current_index].in_client_log = false;
                            self.current_index -= 1;
                        }
                    }
                }
            } else {
                self.current_index += 1;
            }
        }
        Ok(())
    }

    fn command_completed(&self, state: &ExecState) -> bool {
        let saved = &self.saved_states[self.current_index];
        let Some(frame) = saved.stack.last() else {
            return true;
        };
        let cmd = &self.current_command;

        match cmd.name {
            StepAction::StepInto => match self.granularity {
                Granularity::Line => true,
                Granularity::Expression => frame.event != PauseEvent::AfterStatement,
            },
            StepAction::StepOver => self.step_over_completed(frame, state),
            StepAction::StepOut => self.step_out_completed(frame, state),
            StepAction::Resume => self.at_breakpoint(frame, &cmd.breakpoints),
            StepAction::RunToCursor => self.at_breakpoint(frame, &cmd.effective_breakpoints()),
            StepAction::StepBack => {
                saved.in_client_log || self.current_index == 0
            }
        }
    }

    fn step_over_completed(&self, frame: &FrameInfo, state: &ExecState) -> bool {
        let cmd = &self.current_command;
        if self.at_breakpoint(frame, &cmd.breakpoints) {
            return true;
        }
        let Some(cmd_frame_id) = cmd.frame_id else {
            return true;
        };

        if frame.id != cmd_frame_id {
            return !frame_is_alive(state, cmd_frame_id);
        }

        if self.granularity == Granularity::Line {
            return true;
        }

        match (cmd.state, cmd.focus, frame.focus) {
            (Some(cmd_state), Some(cmd_focus), Some(focus)) if cmd_state.is_before() => {
                // completed once the focus escapes the commanded node
                !cmd_focus.contains_smaller_or_equal(&focus)
            }
            (Some(cmd_state), Some(cmd_focus), Some(focus)) => {
                focus != cmd_focus
                    || frame.event.is_before()
                    || cmd_state.is_expression() && frame.event.is_statement()
                    || cmd_state.is_statement() && frame.event.is_expression()
            }
            _ => true,
        }
    }

    fn step_out_completed(&self, frame: &FrameInfo, state: &ExecState) -> bool {
        let cmd = &self.current_command;
        if self.granularity == Granularity::Expression {
            if self.current_index == 0 || frame.event == PauseEvent::AfterStatement {
                return false;
            }
        }
        if self.at_breakpoint(frame, &cmd.breakpoints) {
            return true;
        }
        let Some(cmd_frame_id) = cmd.frame_id else {
            return true;
        };
        if !frame_is_alive(state, cmd_frame_id) {
            return true;
        }
        // same frame, but focus has widened to an ancestor of the commanded
        // node: we are past the spot the command was issued at
        frame.id == cmd_frame_id
            && match (frame.focus, cmd.focus) {
                (Some(focus), Some(cmd_focus)) => focus.contains_smaller(&cmd_focus),
                _ => false,
            }
    }

    fn at_breakpoint(&self, frame: &FrameInfo, breakpoints: &Breakpoints) -> bool {
        let Some(lines) = breakpoints.get(&self.filename) else {
            return false;
        };

        match self.granularity {
            Granularity::Line => lines.contains(&frame.lineno),
            Granularity::Expression => {
                let Some(focus) = frame.focus else {
                    return false;
                };
                if !frame.event.is_before() || !lines.contains(&focus.lineno) {
                    return false;
                }
                // only the first event on a breakpoint line pauses, unless
                // the line is genuinely re-entered
                let cmd = &self.current_command;
                match cmd.focus {
                    None => true,
                    Some(cmd_focus) => {
                        cmd_focus.lineno != focus.lineno
                            || (cmd_focus == focus && cmd.state == Some(frame.event))
                            || cmd.frame_id != Some(frame.id)
                    }
                }
            }
        }
    }

    fn report_state(&mut self, index: usize) -> Result<(), RunError> {
        let in_present = index == self.saved_states.len() - 1;
        let response = DebuggerResponse {
            stack: self.saved_states[index].stack.clone(),
            in_present,
            io_symbol_count: Some(self.io_symbols.load(Ordering::SeqCst)),
            exception_info: None,
            tracer_class: self.granularity.tracer_class().to_owned(),
            command_id: None,
        };
        self.writer
            .send_message(&MessageFromBackend::Debugger(response))
            .map_err(connection_error)
    }

    /// True while the debugger is replaying a cached snapshot.
    pub fn is_in_past(&self) -> bool {
        self.current_index + 1 < self.saved_states.len()
    }

    fn fetch_next_command(&mut self, state: &mut ExecState) -> Result<DebuggerCommand, RunError> {
        loop {
            if self.interrupt.swap(false, Ordering::SeqCst) {
                return Err(RunError::interrupt());
            }
            let incoming = match self.commands.recv_timeout(COMMAND_POLL) {
                Ok(incoming) => incoming,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(RunError::new("ConnectionError", "command stream closed"))
                }
            };
            match incoming {
                Incoming::Command(CommandToBackend::Debugger(cmd)) => return Ok(cmd),
                Incoming::Command(CommandToBackend::Inline(cmd)) => {
                    let stack = self
                        .saved_states
                        .get(self.current_index)
                        .map(|s| s.stack.clone());
                    let mut heap = self.heap.borrow_mut();
                    let mut ctx = InlineContext {
                        heap: &mut heap,
                        globals: Some(&state.globals),
                        stack: stack.as_deref(),
                        writer: &self.writer,
                    };
                    let response = inline::handle(&cmd, &mut ctx);
                    drop(heap);
                    self.writer
                        .send_message(&MessageFromBackend::Inline(response))
                        .map_err(connection_error)?;
                }
                Incoming::Command(CommandToBackend::Toplevel(cmd)) => {
                    tracing::warn!(name = %cmd.name, "toplevel command while debugging");
                    let mut response = ToplevelResponse::for_command(cmd.name.clone(), cmd.id);
                    response.error = Some("Backend is in a debug session".to_owned());
                    self.writer
                        .send_message(&MessageFromBackend::Toplevel(response))
                        .map_err(connection_error)?;
                }
                Incoming::Command(CommandToBackend::Eof) => {
                    return Err(RunError::system_exit(0));
                }
                Incoming::Command(other) => {
                    tracing::warn!(?other, "unexpected command while paused");
                }
                Incoming::Lost(e) => {
                    return Err(RunError::new("ConnectionError", e.to_string()));
                }
            }
        }
    }
}

fn frame_is_alive(state: &ExecState, frame_id: u64) -> bool {
    state.frames.iter().any(|f| f.id == frame_id)
}

fn connection_error(e: transport::ConnectionError) -> RunError {
    RunError::new("ConnectionError", e.to_string())
}

impl TraceHook for StepTracer {
    fn on_event(&mut self, state: &mut ExecState, event: TraceEvent) -> Result<(), RunError> {
        match (self.granularity, event) {
            (Granularity::Line, TraceEvent::Line { range }) => {
                {
                    let frame = state.frames.last_mut().expect("frame stack never empty");
                    frame.event = PauseEvent::Line;
                    frame.focus = Some(range);
                    frame.current_statement = Some(range);
                    frame.lineno = range.lineno;
                }
                self.save_state(state);
                self.respond_to_commands(state)
            }
            (Granularity::Expression, TraceEvent::BeforeStmt { node }) => {
                self.update_frame(state, PauseEvent::BeforeStatement, node);
                self.save_state(state);
                self.respond_to_commands(state)
            }
            (Granularity::Expression, TraceEvent::AfterStmt { node }) => {
                self.update_frame(state, PauseEvent::AfterStatement, node);
                self.save_state(state);
                self.respond_to_commands(state)
            }
            (Granularity::Expression, TraceEvent::BeforeExpr { node }) => {
                self.update_frame(state, PauseEvent::BeforeExpression, node);
                self.save_state(state);
                self.respond_to_commands(state)
            }
            (Granularity::Expression, TraceEvent::AfterExpr { node, value }) => {
                self.update_frame(state, PauseEvent::AfterExpression, node);
                if let Some(info) = self.nodes.get(node) {
                    let frame = state.frames.last_mut().expect("frame stack never empty");
                    frame.current_evaluations.push((info.range, value));
                }
                self.save_state(state);
                self.respond_to_commands(state)
            }
            _ => Ok(()),
        }
    }
}
