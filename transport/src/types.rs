//! Types shared between [`crate::commands`], [`crate::responses`] and
//! [`crate::events`].

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

pub type CommandId = u64;
pub type FrameId = u64;
pub type ObjectId = u64;

/// Breakpoints as the debugger commands carry them: source path to the set of
/// 1-based line numbers.
pub type Breakpoints = BTreeMap<String, BTreeSet<u32>>;

/// A half-open span of source text.
///
/// Lines are 1-based, columns 0-based, and the start never comes after the
/// end. Used both for selecting code in an editor and for correlating
/// instrumented markers back to their source location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TextRange {
    pub lineno: u32,
    pub col_offset: u32,
    pub end_lineno: u32,
    pub end_col_offset: u32,
}

impl TextRange {
    pub fn new(lineno: u32, col_offset: u32, end_lineno: u32, end_col_offset: u32) -> Self {
        debug_assert!((lineno, col_offset) <= (end_lineno, end_col_offset));
        Self {
            lineno,
            col_offset,
            end_lineno,
            end_col_offset,
        }
    }

    fn start(&self) -> (u32, u32) {
        (self.lineno, self.col_offset)
    }

    fn end(&self) -> (u32, u32) {
        (self.end_lineno, self.end_col_offset)
    }

    /// True when `other` lies strictly inside `self`: contained, and smaller
    /// on at least one side. A range never strictly contains itself.
    pub fn contains_smaller(&self, other: &TextRange) -> bool {
        self.start() < other.start() && self.end() > other.end()
            || self.start() == other.start() && self.end() > other.end()
            || self.start() < other.start() && self.end() == other.end()
    }

    /// Non-strict variant of [`TextRange::contains_smaller`].
    pub fn contains_smaller_or_equal(&self, other: &TextRange) -> bool {
        self.contains_smaller(other) || self == other
    }

    pub fn contains_position(&self, lineno: u32, col_offset: u32) -> bool {
        self.start() <= (lineno, col_offset) && (lineno, col_offset) < self.end()
    }
}

/// An exported value: an opaque identity plus a truncated textual
/// representation. The live object stays in the backend's heap table for the
/// lifetime of the session so the id can be resolved later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueInfo {
    pub id: ObjectId,
    pub repr: String,
}

/// What kind of execution point a paused frame is sitting at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseEvent {
    BeforeStatement,
    AfterStatement,
    BeforeExpression,
    AfterExpression,
    Call,
    Line,
    Return,
}

impl PauseEvent {
    pub fn is_before(self) -> bool {
        matches!(self, PauseEvent::BeforeStatement | PauseEvent::BeforeExpression)
    }

    pub fn is_statement(self) -> bool {
        matches!(self, PauseEvent::BeforeStatement | PauseEvent::AfterStatement)
    }

    pub fn is_expression(self) -> bool {
        matches!(self, PauseEvent::BeforeExpression | PauseEvent::AfterExpression)
    }
}

/// One frame of the exported stack in a debugger pause message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameInfo {
    pub id: FrameId,
    pub filename: String,
    pub module_name: String,
    pub code_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub lineno: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firstlineno: Option<u32>,
    pub in_library: bool,
    /// `None` when the frame's locals are its globals (module level).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locals: Option<BTreeMap<String, ValueInfo>>,
    pub globals: BTreeMap<String, ValueInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub freevars: Vec<String>,
    pub event: PauseEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus: Option<TextRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_statement: Option<TextRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_root_expression: Option<TextRange>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub current_evaluations: Vec<(TextRange, ValueInfo)>,
}

/// One line of a normalized traceback, with enough origin info for the
/// front-end to make it clickable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracebackItem {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<FrameId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lineno: Option<u32>,
}

/// Structured description of an exception raised by user code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserExceptionInfo {
    pub type_name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stack: Vec<FrameInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<TracebackItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lineno: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub col_offset: Option<u32>,
    /// Source line at the failure point, when it could be recovered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<String>,
}

/// Exception summary attached to debugger pause messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExceptionSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lines_with_frame_info: Vec<TracebackItem>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub affected_frame_ids: BTreeSet<FrameId>,
}

/// Metadata about one item of an `upload`/`download` transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferItem {
    pub source_path: String,
    pub target_path: String,
    pub kind: TransferKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    File,
    Dir,
}

/// Directory-listing entry as reported by `get_dirs_children_info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirEntryInfo {
    /// `None` for directories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_epoch: Option<f64>,
    pub hidden: bool,
}
