//! Responses in reply to [`crate::commands`] from the backend process.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{
    CommandId, DirEntryInfo, ExceptionSummary, FrameInfo, UserExceptionInfo, ValueInfo,
};

/// Reply to a [`crate::commands::ToplevelCommand`]. Also sent unsolicited
/// once at startup ("ready message") with the environment introspection
/// fields filled in.
///
/// All fields except `cwd` are best-effort; consumers must tolerate their
/// absence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToplevelResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<CommandId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_exception: Option<UserExceptionInfo>,
    /// Value of the final bare expression, in `eval` and `exec+eval` modes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_info: Option<ValueInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub globals: Option<BTreeMap<String, ValueInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub welcome_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builtin_modules: Option<Vec<String>>,
    /// Real-time-clock baseline of the executing device; `None` means it
    /// could not be determined and must not be guessed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch_year: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_stripped_question_marks: Option<usize>,
    /// Clean `SystemExit` from user code: the controller restarts the
    /// backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_exit: Option<bool>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ToplevelResponse {
    pub fn for_command(name: impl Into<String>, id: Option<CommandId>) -> Self {
        Self {
            command_name: Some(name.into()),
            command_id: id,
            ..Self::default()
        }
    }
}

/// Reply to an [`crate::commands::InlineCommand`]. The payload depends on
/// the command name; the declared fields cover the built-in queries and
/// `extra` carries anything backend-specific.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlineResponse {
    pub command_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<CommandId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub globals: Option<BTreeMap<String, ValueInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_info: Option<ObjectInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dirs_children_info: Option<BTreeMap<String, Option<BTreeMap<String, DirEntryInfo>>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl InlineResponse {
    pub fn for_command(name: impl Into<String>, id: Option<CommandId>) -> Self {
        Self {
            command_name: name.into(),
            command_id: id,
            error: None,
            globals: None,
            object_info: None,
            dirs_children_info: None,
            content: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Detail for one heap object, resolved by id from a previous export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub id: crate::types::ObjectId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elements: Option<Vec<ValueInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<(ValueInfo, ValueInfo)>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<BTreeMap<String, ValueInfo>>,
}

/// Pause notification from the stepping runner: the backend is suspended and
/// waits for the next [`crate::commands::DebuggerCommand`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebuggerResponse {
    pub stack: Vec<FrameInfo>,
    /// False when replaying a cached snapshot after `step_back`.
    pub in_present: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub io_symbol_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_info: Option<ExceptionSummary>,
    pub tracer_class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<CommandId>,
}
