//! The backend main loop.
//!
//! One thread reads and decodes commands; immediate commands (interrupt,
//! kill) are executed right there in the reader so they can preempt a busy
//! main loop. Everything else goes through a queue drained by the single
//! dispatch loop, which owns all session state. The dispatch loop blocks
//! only while waiting for the next command (with a short timeout for idle
//! work) or while user code is actually running.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use transport::commands::{
    CommandToBackend, ImmediateCommand, InputSubmission, ToplevelCommand,
};
use transport::events::{BackendEvent, MessageFromBackend};
use transport::responses::ToplevelResponse;
use transport::{
    Connection, ConnectionError, ConnectionReader, ConnectionWriter, Decoded, MessageStream,
    ALL_EXPLAINED_EXIT_CODE, CLEAN_EXIT_CODE, PROCESS_ACK,
};

use crate::eval::{ProgramIo, RunError, Value};
use crate::executor::{self, ExecEnv, RunnerKind};
use crate::heap::Heap;
use crate::inline::{self, InlineContext};
use crate::tracer::Granularity;
use crate::REPL_PSEUDO_FILENAME;

const IDLE_POLL: Duration = Duration::from_millis(100);

/// A user-facing mistake: reported on the program's stderr stream, never
/// fatal to the backend.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct UserError {
    pub message: String,
}

impl UserError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// What the command reader forwards to the dispatch loop.
#[derive(Debug)]
pub enum Incoming {
    Command(CommandToBackend),
    Lost(ConnectionError),
}

/// Session state that survives between commands of one backend process.
pub struct SessionState {
    pub globals: BTreeMap<String, Value>,
    pub last_value: Option<Value>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            globals: BTreeMap::new(),
            last_value: None,
        }
    }
}

enum HandlerError {
    User(UserError),
    Internal(String),
}

impl From<UserError> for HandlerError {
    fn from(e: UserError) -> Self {
        HandlerError::User(e)
    }
}

pub struct Backend {
    writer: ConnectionWriter,
    commands: Receiver<Incoming>,
    interrupt: Arc<AtomicBool>,
    immediate_lock: Arc<Mutex<()>>,
    heap: Rc<RefCell<Heap>>,
    io_symbols: Arc<AtomicU64>,
    session: SessionState,
}

impl Backend {
    /// Takes over a connection: spawns the command reader and returns the
    /// machine ready to [`Backend::run`].
    pub fn new(connection: Connection, interrupt: Arc<AtomicBool>) -> Self {
        let (reader, writer) = connection.split();
        let immediate_lock = Arc::new(Mutex::new(()));
        let (tx, rx) = crossbeam_channel::unbounded();
        spawn_command_reader(reader, tx, Arc::clone(&interrupt), Arc::clone(&immediate_lock));

        Self {
            writer,
            commands: rx,
            interrupt,
            immediate_lock,
            heap: Rc::new(RefCell::new(Heap::new())),
            io_symbols: Arc::new(AtomicU64::new(0)),
            session: SessionState::default(),
        }
    }

    /// Runs until the controller disconnects or asks for termination.
    /// Returns the process exit code.
    pub fn run(mut self) -> i32 {
        if self.writer.write(format!("{PROCESS_ACK}\n").as_bytes()).is_err() {
            return CLEAN_EXIT_CODE;
        }
        if let Err(e) = self.send(MessageFromBackend::Toplevel(self.ready_message())) {
            tracing::info!(error = %e, "controller gone before ready message");
            return CLEAN_EXIT_CODE;
        }

        loop {
            match self.commands.recv_timeout(IDLE_POLL) {
                Ok(Incoming::Command(cmd)) => {
                    if let Some(code) = self.dispatch(cmd) {
                        return code;
                    }
                }
                Ok(Incoming::Lost(e)) => {
                    tracing::info!(error = %e, "connection lost");
                    return CLEAN_EXIT_CODE;
                }
                Err(RecvTimeoutError::Timeout) => {
                    // idle tick: a stop request with nothing running must
                    // still land the frontend back at the prompt
                    if self.interrupt.swap(false, Ordering::SeqCst) {
                        let _ = self.send(MessageFromBackend::Toplevel(ToplevelResponse::default()));
                    }
                    if self.writer.check_for_error().is_err() {
                        return CLEAN_EXIT_CODE;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return CLEAN_EXIT_CODE;
                }
            }
        }
    }

    /// Handles one queued command. `Some(code)` means the process is done.
    fn dispatch(&mut self, cmd: CommandToBackend) -> Option<i32> {
        match cmd {
            CommandToBackend::Toplevel(cmd) => {
                // a stale interrupt must not kill the command it was meant
                // to precede
                self.interrupt.store(false, Ordering::SeqCst);
                self.heap.borrow_mut().clear();
                self.io_symbols.store(0, Ordering::SeqCst);
                self.handle_toplevel_command(cmd)
            }
            CommandToBackend::Inline(cmd) => {
                let response = {
                    let mut heap = self.heap.borrow_mut();
                    let mut ctx = InlineContext {
                        heap: &mut heap,
                        globals: Some(&self.session.globals),
                        stack: None,
                        writer: &self.writer,
                    };
                    inline::handle(&cmd, &mut ctx)
                };
                if self.send(MessageFromBackend::Inline(response)).is_err() {
                    return Some(CLEAN_EXIT_CODE);
                }
                None
            }
            CommandToBackend::Input(InputSubmission { .. }) => {
                tracing::warn!("input submission arrived with no program waiting for input");
                None
            }
            CommandToBackend::Debugger(_) => {
                tracing::warn!("debugger command arrived outside a debug session");
                None
            }
            CommandToBackend::Eof => Some(CLEAN_EXIT_CODE),
            CommandToBackend::Immediate { .. } => {
                // intercepted by the reader thread; only reachable if the
                // queue was fed by something else
                tracing::warn!("immediate command reached the dispatch queue");
                None
            }
        }
    }

    fn handle_toplevel_command(&mut self, cmd: ToplevelCommand) -> Option<i32> {
        // a panic in handler code is our "unexpected exception": it must not
        // take the process down without the distinguished exit status
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.toplevel_handler(&cmd)
        }))
        .unwrap_or_else(|panic| Err(HandlerError::Internal(panic_message(&panic))));
        let response = match result {
            Ok(mut response) => {
                response.command_name = Some(cmd.name.clone());
                response.command_id = cmd.id;
                response
            }
            Err(HandlerError::User(e)) => {
                // user mistakes surface on the program's stderr and leave
                // the backend alive
                let _ = self.send(MessageFromBackend::Event(BackendEvent::stderr(format!(
                    "{}\n",
                    e.message
                ))));
                ToplevelResponse::for_command(cmd.name.clone(), cmd.id)
            }
            Err(HandlerError::Internal(detail)) => {
                tracing::error!(command = %cmd.name, detail = %detail, "internal error in handler");
                let _ = self.send(MessageFromBackend::Event(BackendEvent::stderr(
                    "PROBLEM IN BACK-END: see the backend log for details\n".to_owned(),
                )));
                return Some(ALL_EXPLAINED_EXIT_CODE);
            }
        };

        if self.send_toplevel(response).is_err() {
            return Some(CLEAN_EXIT_CODE);
        }
        None
    }

    fn toplevel_handler(&mut self, cmd: &ToplevelCommand) -> Result<ToplevelResponse, HandlerError> {
        match cmd.name.as_str() {
            "cd" => self.cmd_cd(cmd),
            "Run" | "run" => self.cmd_run(cmd, RunnerKind::Plain),
            "Debug" | "debug" => self.cmd_run(cmd, RunnerKind::Step(Granularity::Expression)),
            "FastDebug" => self.cmd_run(cmd, RunnerKind::Step(Granularity::Line)),
            "execute_source" => self.cmd_execute_source(cmd),
            "Reset" => self.cmd_reset(cmd),
            "get_environment_info" => Ok(self.ready_message()),
            other => {
                let message = format!("Unknown command: {other}");
                let _ = self.send(MessageFromBackend::Event(BackendEvent::stderr(format!(
                    "{message}\n"
                ))));
                let mut response = ToplevelResponse::default();
                response.error = Some(message);
                Ok(response)
            }
        }
    }

    fn cmd_cd(&mut self, cmd: &ToplevelCommand) -> Result<ToplevelResponse, HandlerError> {
        match cmd.args.as_slice() {
            [path] => {
                std::env::set_current_dir(path)
                    .map_err(|_| UserError::new(format!("No such folder: {path}")))?;
                Ok(ToplevelResponse::default())
            }
            _ => Err(UserError::new("cd takes one parameter").into()),
        }
    }

    fn cmd_run(
        &mut self,
        cmd: &ToplevelCommand,
        runner: RunnerKind,
    ) -> Result<ToplevelResponse, HandlerError> {
        let Some(filename) = cmd.args.first() else {
            return Err(
                UserError::new(format!("Command '{}' takes at least one argument", cmd.name))
                    .into(),
            );
        };
        let source = std::fs::read_to_string(filename)
            .map_err(|e| UserError::new(format!("Can't read '{filename}': {e}")))?;

        let env = ExecEnv {
            writer: &self.writer,
            commands: &self.commands,
            interrupt: &self.interrupt,
            heap: &self.heap,
            io_symbols: &self.io_symbols,
        };
        let outcome = executor::run_file(
            &env,
            &mut self.session,
            &source,
            filename,
            runner,
            cmd.breakpoints.clone(),
        );

        let mut response = ToplevelResponse::default();
        response.user_exception = outcome.user_exception;
        response.system_exit = outcome.system_exit.then_some(true);
        response
            .extra
            .insert("filename".to_owned(), serde_json::json!(filename));
        Ok(response)
    }

    fn cmd_execute_source(&mut self, cmd: &ToplevelCommand) -> Result<ToplevelResponse, HandlerError> {
        let Some(raw_source) = cmd.source.as_deref() else {
            return Err(UserError::new("execute_source needs source").into());
        };

        // trailing question marks are a help-lookup convention; strip and
        // count them
        let ws_stripped = raw_source.trim();
        let source = ws_stripped.trim_end_matches('?');
        let num_stripped = ws_stripped.len() - source.len();
        let source = format!("{source}\n");

        let runner = if cmd.debug_mode.unwrap_or(false) {
            RunnerKind::Step(Granularity::Expression)
        } else {
            RunnerKind::Plain
        };

        let env = ExecEnv {
            writer: &self.writer,
            commands: &self.commands,
            interrupt: &self.interrupt,
            heap: &self.heap,
            io_symbols: &self.io_symbols,
        };
        let outcome = executor::run_shell_source(
            &env,
            &mut self.session,
            &source,
            REPL_PSEUDO_FILENAME,
            runner,
            cmd.breakpoints.clone(),
        );

        let mut response = ToplevelResponse::default();
        response.user_exception = outcome.user_exception;
        response.value_info = outcome.value_info;
        response.system_exit = outcome.system_exit.then_some(true);
        response.num_stripped_question_marks = Some(num_stripped);
        Ok(response)
    }

    fn cmd_reset(&mut self, cmd: &ToplevelCommand) -> Result<ToplevelResponse, HandlerError> {
        if !cmd.args.is_empty() {
            return Err(UserError::new("Command 'Reset' doesn't take arguments").into());
        }
        // Reset always happens in a fresh process; just re-announce
        let mut response = ToplevelResponse::default();
        response.welcome_text = self.ready_message().welcome_text;
        response.executable = current_exe_string();
        Ok(response)
    }

    fn ready_message(&self) -> ToplevelResponse {
        let mut response = ToplevelResponse::default();
        response.welcome_text = Some(format!(
            "WireBug backend {}",
            env!("CARGO_PKG_VERSION")
        ));
        response.interpreter_version = Some(env!("CARGO_PKG_VERSION").to_owned());
        response.executable = current_exe_string();
        response.main_dir = current_exe_string()
            .as_deref()
            .and_then(|exe| std::path::Path::new(exe).parent())
            .map(|p| p.display().to_string());
        response.path = Some(Vec::new());
        response.builtin_modules = Some(Vec::new());
        // this process keeps wall-clock time against the Unix epoch; for
        // backends where the baseline is ambiguous the field stays None
        response.epoch_year = Some(1970);
        response
    }

    fn send(&self, msg: MessageFromBackend) -> Result<(), ConnectionError> {
        let _guard = self.immediate_lock.lock().unwrap();
        self.writer.send_message(&msg)
    }

    /// Toplevel responses always carry the cwd and the current globals.
    fn send_toplevel(&mut self, mut response: ToplevelResponse) -> Result<(), ConnectionError> {
        if response.cwd.is_none() {
            response.cwd = std::env::current_dir()
                .ok()
                .map(|p| p.display().to_string());
        }
        if response.globals.is_none() {
            response.globals = Some(self.heap.borrow_mut().export_variables(&self.session.globals));
        }
        self.send(MessageFromBackend::Toplevel(response))
    }
}

fn current_exe_string() -> Option<String> {
    std::env::current_exe().ok().map(|p| p.display().to_string())
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// The command reader thread.
///
/// Immediate commands are executed here, synchronously, under a lock shared
/// with the dispatch loop's writes: an interrupt or kill must not race a
/// half-written response line.
fn spawn_command_reader(
    reader: ConnectionReader,
    tx: Sender<Incoming>,
    interrupt: Arc<AtomicBool>,
    immediate_lock: Arc<Mutex<()>>,
) {
    std::thread::Builder::new()
        .name("command-reader".to_owned())
        .spawn(move || {
            let mut stream = MessageStream::<CommandToBackend>::new(reader);
            loop {
                let Some(item) = stream.next(IDLE_POLL) else {
                    continue;
                };
                match item {
                    Decoded::Message(CommandToBackend::Immediate { name }) => {
                        let _guard = immediate_lock.lock().unwrap();
                        match name {
                            ImmediateCommand::Interrupt => {
                                tracing::debug!("interrupt requested");
                                interrupt.store(true, Ordering::SeqCst);
                            }
                            ImmediateCommand::Kill => {
                                tracing::info!("kill requested");
                                std::process::exit(CLEAN_EXIT_CODE);
                            }
                        }
                    }
                    Decoded::Message(cmd) => {
                        if tx.send(Incoming::Command(cmd)).is_err() {
                            return;
                        }
                    }
                    Decoded::Stray(line) => {
                        tracing::warn!(line = %line, "ignoring non-protocol input");
                    }
                    Decoded::Malformed { line, error } => {
                        // never guess at a malformed message; log and skip
                        tracing::error!(line = %line, error = %error, "malformed command line");
                    }
                    Decoded::ConnectionLost(e) => {
                        let _ = tx.send(Incoming::Lost(e));
                        return;
                    }
                }
            }
        })
        .expect("spawning command reader thread");
}

/// Program I/O over the wire: output becomes `ProgramOutput` events inline
/// with execution, stdin reads block on an `InputRequest`/`InputSubmission`
/// round trip.
pub struct WireIo {
    writer: ConnectionWriter,
    commands: Receiver<Incoming>,
    interrupt: Arc<AtomicBool>,
    symbols: Arc<AtomicU64>,
    heap: Rc<RefCell<Heap>>,
}

impl WireIo {
    pub fn new(
        writer: ConnectionWriter,
        commands: Receiver<Incoming>,
        interrupt: Arc<AtomicBool>,
        symbols: Arc<AtomicU64>,
        heap: Rc<RefCell<Heap>>,
    ) -> Self {
        Self {
            writer,
            commands,
            interrupt,
            symbols,
            heap,
        }
    }

    fn emit(&mut self, event: BackendEvent, len: usize) -> Result<(), RunError> {
        self.symbols.fetch_add(len as u64, Ordering::SeqCst);
        self.writer
            .send_message(&MessageFromBackend::Event(event))
            .map_err(|e| RunError::new("ConnectionError", e.to_string()))
    }
}

impl ProgramIo for WireIo {
    fn write_stdout(&mut self, data: &str) -> Result<(), RunError> {
        if data.is_empty() {
            return Ok(());
        }
        self.emit(BackendEvent::stdout(data), data.chars().count())
    }

    fn write_stderr(&mut self, data: &str) -> Result<(), RunError> {
        if data.is_empty() {
            return Ok(());
        }
        self.emit(BackendEvent::stderr(data), data.chars().count())
    }

    fn read_line(&mut self) -> Result<String, RunError> {
        self.writer
            .send_message(&MessageFromBackend::Event(BackendEvent::InputRequest {
                method: "readline".to_owned(),
                limit: None,
            }))
            .map_err(|e| RunError::new("ConnectionError", e.to_string()))?;

        loop {
            if self.interrupt.swap(false, Ordering::SeqCst) {
                return Err(RunError::interrupt());
            }
            let incoming = match self.commands.recv_timeout(IDLE_POLL) {
                Ok(incoming) => incoming,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(RunError::new("ConnectionError", "command stream closed"))
                }
            };
            match incoming {
                Incoming::Command(CommandToBackend::Input(InputSubmission { data })) => {
                    self.symbols
                        .fetch_add(data.chars().count() as u64, Ordering::SeqCst);
                    return Ok(data.strip_suffix('\n').unwrap_or(&data).to_owned());
                }
                Incoming::Command(CommandToBackend::Inline(cmd)) => {
                    let response = {
                        let mut heap = self.heap.borrow_mut();
                        let mut ctx = InlineContext {
                            heap: &mut heap,
                            globals: None,
                            stack: None,
                            writer: &self.writer,
                        };
                        inline::handle(&cmd, &mut ctx)
                    };
                    self.writer
                        .send_message(&MessageFromBackend::Inline(response))
                        .map_err(|e| RunError::new("ConnectionError", e.to_string()))?;
                }
                Incoming::Command(CommandToBackend::Eof) => {
                    return Err(RunError::new("EOFError", "EOF when reading a line"));
                }
                Incoming::Command(other) => {
                    tracing::warn!(?other, "unexpected command while waiting for input");
                }
                Incoming::Lost(e) => {
                    return Err(RunError::new("ConnectionError", e.to_string()));
                }
            }
        }
    }
}
