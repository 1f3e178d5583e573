//! Messages flowing from the backend to the controller.

use serde::{Deserialize, Serialize};

use crate::responses::{DebuggerResponse, InlineResponse, ToplevelResponse};
use crate::types::CommandId;

/// Everything the controller can receive, tagged by message kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageFromBackend {
    Toplevel(ToplevelResponse),
    Inline(InlineResponse),
    Debugger(DebuggerResponse),
    Event(BackendEvent),
}

impl MessageFromBackend {
    pub fn command_id(&self) -> Option<CommandId> {
        match self {
            MessageFromBackend::Toplevel(r) => r.command_id,
            MessageFromBackend::Inline(r) => r.command_id,
            MessageFromBackend::Debugger(r) => r.command_id,
            MessageFromBackend::Event(BackendEvent::InlineProgress { command_id, .. }) => {
                Some(*command_id)
            }
            MessageFromBackend::Event(_) => None,
        }
    }
}

/// Unsolicited notifications: program output, stdin requests, transfer
/// progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum BackendEvent {
    ProgramOutput {
        stream_name: StreamName,
        data: String,
    },
    /// The running program is blocked reading stdin; only an
    /// `InputSubmission` (or an interrupt) unblocks it.
    InputRequest {
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<i64>,
    },
    InlineProgress {
        command_id: CommandId,
        value: u64,
        maximum: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
}

impl BackendEvent {
    pub fn stdout(data: impl Into<String>) -> Self {
        BackendEvent::ProgramOutput {
            stream_name: StreamName::Stdout,
            data: data.into(),
        }
    }

    pub fn stderr(data: impl Into<String>) -> Self {
        BackendEvent::ProgramOutput {
            stream_name: StreamName::Stderr,
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamName {
    Stdout,
    Stderr,
}
