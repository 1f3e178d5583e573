//! The backend proxy.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use eyre::WrapErr;
use server::{BackendProcess, ExitStatusKind, LaunchOptions};
use transport::commands::{CommandToBackend, ImmediateCommand, InputSubmission};
use transport::events::{BackendEvent, MessageFromBackend, StreamName};
use transport::responses::ToplevelResponse;
use transport::{spawn_message_reader, ConnectionWriter, Decoded};

use crate::state::{Event, RunnerState};

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The backend process of the current generation is gone. Raised once;
    /// afterwards the proxy reports itself disconnected.
    #[error("backend terminated ({status:?})")]
    BackendTerminated { status: Option<ExitStatusKind> },
    #[error("no backend process is running")]
    NotRunning,
}

struct Generation {
    process: Box<dyn BackendProcess>,
    writer: ConnectionWriter,
    incoming: Receiver<Decoded<MessageFromBackend>>,
    // dropping the sender stops the reader thread on restart
    shutdown: Option<oneshot::Sender<()>>,
}

struct Inner {
    options: LaunchOptions,
    generation_counter: u64,
    generation: Option<Generation>,
    pending: VecDeque<MessageFromBackend>,
    state: RunnerState,
    next_command_id: u64,
    reported_loss: bool,
}

/// Owns the backend process lifecycle and the message pump.
///
/// Cheap to clone; all clones share one backend.
#[derive(Clone)]
pub struct BackendProxy {
    inner: Arc<Mutex<Inner>>,
    events_tx: Sender<Event>,
    events_rx: Receiver<Event>,
}

impl BackendProxy {
    /// Spawns the first backend generation and consumes its handshake.
    #[tracing::instrument(skip(options), fields(kind = options.kind_name()))]
    pub fn launch(options: LaunchOptions) -> eyre::Result<Self> {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let proxy = Self {
            inner: Arc::new(Mutex::new(Inner {
                options,
                generation_counter: 0,
                generation: None,
                pending: VecDeque::new(),
                state: RunnerState::Starting,
                next_command_id: 0,
                reported_loss: false,
            })),
            events_tx,
            events_rx,
        };
        proxy.inner.lock().unwrap().start_generation()?;
        Ok(proxy)
    }

    /// Channel of state-change notifications for interested listeners.
    pub fn events(&self) -> Receiver<Event> {
        self.events_rx.clone()
    }

    pub fn state(&self) -> RunnerState {
        self.inner.lock().unwrap().state.clone()
    }

    // ---- capabilities ----------------------------------------------------

    /// Violating a capability predicate is a programmer error, not a
    /// runtime condition: check before issuing the command.
    pub fn can_debug(&self) -> bool {
        true
    }

    pub fn can_run_in_terminal(&self) -> bool {
        matches!(self.inner.lock().unwrap().options, LaunchOptions::Local { .. })
    }

    pub fn supports_remote_files(&self) -> bool {
        matches!(self.inner.lock().unwrap().options, LaunchOptions::Ssh { .. })
    }

    // ---- commands --------------------------------------------------------

    /// Queues a command for the backend. Backend-restarting commands
    /// (uppercase toplevel names) first replace the process; undelivered
    /// messages of the old generation are discarded.
    pub fn send_command(&self, mut cmd: CommandToBackend) -> eyre::Result<()> {
        let mut inner = self.inner.lock().unwrap();

        // sanity check, mirroring the frontend contract: toplevel commands
        // only at the prompt (unless they restart the process), debugger
        // commands only while paused
        match &cmd {
            CommandToBackend::Toplevel(c)
                if !inner.state.is_waiting_toplevel() && !c.restarts_backend() =>
            {
                tracing::warn!(name = %c.name, state = ?inner.state, "toplevel command in wrong state; ignoring");
                return Ok(());
            }
            CommandToBackend::Debugger(_) if !inner.state.is_waiting_debugger() => {
                tracing::warn!(state = ?inner.state, "debugger command in wrong state; ignoring");
                return Ok(());
            }
            _ => {}
        }

        if let CommandToBackend::Toplevel(c) = &cmd {
            if c.restarts_backend() {
                inner.restart()?;
            }
        }

        // assign correlation ids where the caller did not
        match &mut cmd {
            CommandToBackend::Toplevel(c) if c.id.is_none() => {
                c.id = Some(inner.fresh_command_id());
            }
            CommandToBackend::Inline(c) if c.id.is_none() => {
                c.id = Some(inner.fresh_command_id());
            }
            _ => {}
        }

        let Some(generation) = inner.generation.as_ref() else {
            eyre::bail!(ProxyError::NotRunning);
        };
        generation
            .writer
            .send_message(&cmd)
            .wrap_err("writing command to backend")?;

        match &cmd {
            CommandToBackend::Toplevel(_) | CommandToBackend::Debugger(_) => {
                inner.set_state(RunnerState::Running, &self.events_tx);
            }
            _ => {}
        }
        Ok(())
    }

    pub fn send_program_input(&self, data: impl Into<String>) -> eyre::Result<()> {
        self.send_command(CommandToBackend::Input(InputSubmission { data: data.into() }))
    }

    /// Interrupts whatever the backend is doing, out of band. Local
    /// backends get an OS signal (it preempts a backend stuck not reading
    /// its queue); remote ones get the immediate wire command, which the
    /// backend's reader thread honors even while the main loop is busy.
    pub fn interrupt(&self) -> eyre::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let Some(generation) = inner.generation.as_mut() else {
            eyre::bail!(ProxyError::NotRunning);
        };
        match generation.process.kind_name() {
            "local" => generation.process.interrupt(),
            _ => generation
                .writer
                .send_message(&CommandToBackend::Immediate {
                    name: ImmediateCommand::Interrupt,
                })
                .wrap_err("sending interrupt command"),
        }
    }

    /// Kills the current process and brings up a fresh one.
    pub fn restart_backend(&self) -> eyre::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.restart()?;
        inner.set_state(RunnerState::Starting, &self.events_tx);
        Ok(())
    }

    /// Shuts the backend down for good.
    pub fn destroy(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.drop_generation();
        inner.set_state(
            RunnerState::Disconnected { status: None },
            &self.events_tx,
        );
    }

    // ---- the message pump ------------------------------------------------

    /// Returns the next decoded message, waiting at most `timeout`.
    ///
    /// `Ok(None)` means nothing arrived; a dead backend is reported as
    /// [`ProxyError::BackendTerminated`] exactly once, after which the
    /// proxy is disconnected and keeps returning `Ok(None)`.
    pub fn fetch_next_message(
        &self,
        timeout: Duration,
    ) -> Result<Option<MessageFromBackend>, ProxyError> {
        let deadline = Instant::now() + timeout;
        loop {
            // take what is already queued first
            let (incoming, my_generation) = {
                let mut inner = self.inner.lock().unwrap();
                if let Some(msg) = inner.pending.pop_front() {
                    let msg = inner.coalesce_output(msg);
                    inner.apply_state_effects(&msg, &self.events_tx);
                    return Ok(Some(msg));
                }
                match inner.generation.as_ref() {
                    Some(generation) => {
                        (generation.incoming.clone(), inner.generation_counter)
                    }
                    None => return Ok(None),
                }
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            let received = incoming.recv_timeout(remaining);

            let mut inner = self.inner.lock().unwrap();
            if inner.generation_counter != my_generation {
                // restarted while we waited; whatever arrived belonged to
                // the old process
                return Ok(None);
            }

            match received {
                Ok(Decoded::Message(msg)) => {
                    inner.pending.push_back(msg);
                    inner.drain_ready();
                    continue; // delivered from pending on the next pass
                }
                Ok(Decoded::Stray(line)) => {
                    // raw output from the backend's pipe that was not a
                    // protocol message: show it rather than lose it
                    inner
                        .pending
                        .push_back(MessageFromBackend::Event(BackendEvent::stdout(format!(
                            "{line}\n"
                        ))));
                    continue;
                }
                Ok(Decoded::Malformed { line, error }) => {
                    tracing::error!(line = %line, error = %error, "skipping malformed message from backend");
                    continue;
                }
                Ok(Decoded::ConnectionLost(_)) | Err(RecvTimeoutError::Disconnected) => {
                    return inner.report_termination(&self.events_tx);
                }
                Err(RecvTimeoutError::Timeout) => {
                    // bounded by the poll timeout: a dead process must be
                    // noticed even when it never wrote a final message
                    if let Some(generation) = inner.generation.as_mut() {
                        if let Ok(Some(_)) = generation.process.try_wait() {
                            return inner.report_termination(&self.events_tx);
                        }
                    }
                    return Ok(None);
                }
            }
        }
    }
}

impl Inner {
    fn fresh_command_id(&mut self) -> u64 {
        self.next_command_id += 1;
        self.next_command_id
    }

    fn set_state(&mut self, state: RunnerState, events: &Sender<Event>) {
        if self.state != state {
            tracing::debug!(from = ?self.state, to = ?state, "runner state changed");
            self.state = state.clone();
            let _ = events.send(Event::StateChanged(state));
        }
    }

    fn apply_state_effects(&mut self, msg: &MessageFromBackend, events: &Sender<Event>) {
        match msg {
            MessageFromBackend::Toplevel(ToplevelResponse { .. }) => {
                self.set_state(RunnerState::WaitingToplevel, events);
            }
            MessageFromBackend::Debugger(_) => {
                self.set_state(RunnerState::WaitingDebugger, events);
            }
            MessageFromBackend::Event(BackendEvent::InputRequest { .. }) => {
                self.set_state(RunnerState::AwaitingInput, events);
            }
            _ => {}
        }
    }

    /// Pulls everything already decoded into the pending queue without
    /// blocking.
    fn drain_ready(&mut self) {
        let Some(generation) = self.generation.as_ref() else {
            return;
        };
        let incoming = generation.incoming.clone();
        while let Ok(item) = incoming.try_recv() {
            match item {
                Decoded::Message(msg) => self.pending.push_back(msg),
                Decoded::Stray(line) => self
                    .pending
                    .push_back(MessageFromBackend::Event(BackendEvent::stdout(format!(
                        "{line}\n"
                    )))),
                Decoded::Malformed { line, error } => {
                    tracing::error!(line = %line, error = %error, "skipping malformed message from backend");
                }
                Decoded::ConnectionLost(_) => {
                    // the next fetch will see the disconnected channel
                }
            }
        }
    }

    /// Merges runs of same-stream output events into one message to keep
    /// pressure off the (polling) consumer.
    fn coalesce_output(&mut self, msg: MessageFromBackend) -> MessageFromBackend {
        let MessageFromBackend::Event(BackendEvent::ProgramOutput {
            stream_name,
            mut data,
        }) = msg
        else {
            return msg;
        };

        while let Some(MessageFromBackend::Event(BackendEvent::ProgramOutput {
            stream_name: next_stream,
            ..
        })) = self.pending.front()
        {
            if *next_stream != stream_name {
                break;
            }
            let Some(MessageFromBackend::Event(BackendEvent::ProgramOutput {
                data: next_data,
                ..
            })) = self.pending.pop_front()
            else {
                unreachable!("peeked a program output event");
            };
            data.push_str(&next_data);
        }

        MessageFromBackend::Event(BackendEvent::ProgramOutput { stream_name, data })
    }

    fn report_termination(
        &mut self,
        events: &Sender<Event>,
    ) -> Result<Option<MessageFromBackend>, ProxyError> {
        let status = self
            .generation
            .as_mut()
            .and_then(|g| g.process.try_wait().ok().flatten());
        self.drop_generation();
        self.set_state(RunnerState::Disconnected { status }, events);

        if self.reported_loss {
            return Ok(None);
        }
        self.reported_loss = true;
        let message = match status {
            Some(ExitStatusKind::AllExplained) => {
                "Backend terminated after an already-reported error. Use Stop/Restart to reconnect."
                    .to_owned()
            }
            Some(ExitStatusKind::Crashed(code)) => format!(
                "Connection lost (backend exited with code {code}). Use Stop/Restart to reconnect."
            ),
            _ => "Connection lost. Use Stop/Restart to reconnect.".to_owned(),
        };
        let _ = events.send(Event::ConnectionLost {
            message: message.clone(),
        });
        Err(ProxyError::BackendTerminated { status })
    }

    fn restart(&mut self) -> eyre::Result<()> {
        self.drop_generation();
        self.pending.clear();
        self.reported_loss = false;
        self.start_generation()
    }

    fn drop_generation(&mut self) {
        if let Some(mut generation) = self.generation.take() {
            if let Some(shutdown) = generation.shutdown.take() {
                let _ = shutdown.send(());
            }
            // the serial port / pipe pair must actually be free before a
            // successor may claim it
            if let Err(e) = generation.process.kill_and_wait() {
                tracing::warn!(error = %e, "could not reap old backend");
            }
        }
        self.pending.clear();
    }

    fn start_generation(&mut self) -> eyre::Result<()> {
        self.generation_counter += 1;
        let launched = server::launch(&self.options).wrap_err("launching backend")?;

        let (reader, writer) = launched.connection.split();
        let (tx, rx) = crossbeam_channel::unbounded();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        spawn_message_reader(reader, tx.clone(), shutdown_rx);

        if let Some(stderr) = launched.stderr {
            spawn_stderr_listener(stderr, tx);
        }

        self.generation = Some(Generation {
            process: launched.process,
            writer,
            incoming: rx,
            shutdown: Some(shutdown_tx),
        });
        self.state = RunnerState::Starting;
        Ok(())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.drop_generation();
    }
}

/// Backend stderr is not part of the protocol; it carries diagnostics worth
/// showing, so forward it line by line as error output.
fn spawn_stderr_listener(
    stderr: Box<dyn std::io::Read + Send>,
    tx: Sender<Decoded<MessageFromBackend>>,
) {
    std::thread::Builder::new()
        .name("backend-stderr".to_owned())
        .spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                let event = MessageFromBackend::Event(BackendEvent::ProgramOutput {
                    stream_name: StreamName::Stderr,
                    data: format!("{line}\n"),
                });
                if tx.send(Decoded::Message(event)).is_err() {
                    break;
                }
            }
        })
        .expect("spawning stderr listener thread");
}
