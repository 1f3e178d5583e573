//! Commands the controller sends to the backend process.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{Breakpoints, CommandId, FrameId, ObjectId, TextRange, TransferItem};

/// Everything the backend can receive, tagged by message kind.
///
/// Fields are optional wherever an older peer may not send them; receivers
/// fall back to defaults instead of failing. Truly open-ended metadata goes
/// into the flattened `extra` mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandToBackend {
    Toplevel(ToplevelCommand),
    Inline(InlineCommand),
    Debugger(DebuggerCommand),
    /// Data for the program's stdin. Fire-and-forget: produces no response of
    /// its own.
    Input(InputSubmission),
    /// End of the command stream; the backend shuts down cleanly.
    Eof,
    /// Handled out-of-band by the command reader itself, never queued.
    Immediate { name: ImmediateCommand },
}

impl CommandToBackend {
    /// The correlation id, for the command kinds that carry one.
    pub fn id(&self) -> Option<CommandId> {
        match self {
            CommandToBackend::Toplevel(cmd) => cmd.id,
            CommandToBackend::Inline(cmd) => cmd.id,
            _ => None,
        }
    }
}

/// A command operating at the "not currently debugging" level: run a script,
/// evaluate shell input, change directory, reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToplevelCommand {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CommandId>,
    /// Shell input for `execute_source`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub breakpoints: Breakpoints,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_mode: Option<bool>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ToplevelCommand {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            id: None,
            source: None,
            breakpoints: Breakpoints::new(),
            debug_mode: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_id(mut self, id: CommandId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Uppercase-initial commands restart the backend process on the
    /// controller side before being delivered.
    pub fn restarts_backend(&self) -> bool {
        self.name.chars().next().is_some_and(|c| c.is_uppercase())
    }
}

/// An auxiliary query that does not change the toplevel run state. Usable
/// both between commands and while paused in the debugger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlineCommand {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CommandId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<ObjectId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<FrameId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_hidden: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<TransferItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl InlineCommand {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
            object_id: None,
            frame_id: None,
            path: None,
            paths: Vec::new(),
            include_hidden: None,
            items: Vec::new(),
            content: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_id(mut self, id: CommandId) -> Self {
        self.id = Some(id);
        self
    }
}

/// How the paused program should advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    StepInto,
    StepOver,
    StepOut,
    Resume,
    RunToCursor,
    /// Replay the previous pause snapshot. Only honored by backends that
    /// cache pause history; others answer with a capability error.
    StepBack,
}

/// Advances a paused debug session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebuggerCommand {
    pub name: StepAction,
    /// Pause event the command was issued at, echoed back by the front-end.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<crate::types::PauseEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus: Option<TextRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<FrameId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub breakpoints: Breakpoints,
    /// `(path, line)` target for [`StepAction::RunToCursor`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_position: Option<(String, u32)>,
}

impl DebuggerCommand {
    pub fn new(name: StepAction) -> Self {
        Self {
            name,
            state: None,
            focus: None,
            frame_id: None,
            breakpoints: Breakpoints::new(),
            cursor_position: None,
        }
    }

    /// Breakpoints with the run-to-cursor target folded in.
    pub fn effective_breakpoints(&self) -> Breakpoints {
        let mut result = self.breakpoints.clone();
        if let Some((path, line)) = &self.cursor_position {
            result.entry(path.clone()).or_default().insert(*line);
        }
        result
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSubmission {
    pub data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImmediateCommand {
    /// Deliver a keyboard interrupt into whatever is currently running.
    Interrupt,
    /// Terminate the backend process right away.
    Kill,
}
