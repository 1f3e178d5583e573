//! Controller-visible run state of a backend.

use server::ExitStatusKind;

/// Where the backend is, as far as the controller can tell from the message
/// stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerState {
    /// Process spawned, ready message not seen yet.
    Starting,
    /// Idle at the prompt; toplevel and inline commands welcome.
    WaitingToplevel,
    /// A toplevel command is executing.
    Running,
    /// Paused at a debug event, waiting for a debugger command.
    WaitingDebugger,
    /// The running program is blocked reading stdin.
    AwaitingInput,
    /// This backend generation is gone; restart to continue.
    Disconnected { status: Option<ExitStatusKind> },
}

impl RunnerState {
    pub fn is_waiting_toplevel(&self) -> bool {
        matches!(self, RunnerState::WaitingToplevel)
    }

    pub fn is_waiting_debugger(&self) -> bool {
        matches!(self, RunnerState::WaitingDebugger)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, RunnerState::Running | RunnerState::AwaitingInput)
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, RunnerState::Disconnected { .. })
    }
}

/// Broadcast to subscribers whenever the state changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    StateChanged(RunnerState),
    /// Emitted once per generation when the connection is lost, with the
    /// user-facing diagnostic.
    ConnectionLost { message: String },
}
