//! Line framing for the wire protocol.
//!
//! A serialized message is `\x02<part_count> <payload>` where the payload is
//! the compact JSON encoding of the message, split into parts of at most
//! [`MAX_PART_LENGTH`] bytes joined by `\n`. Splitting keeps individual
//! physical lines below the default window size of conservative SSH channel
//! implementations; compact JSON contains no raw newlines, so reassembly is
//! plain concatenation.
//!
//! Decoding is a strict parse of the tagged record. Nothing read from the
//! wire is ever evaluated or interpreted beyond JSON.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::MESSAGE_MARKER;

/// Maximum byte length of one physical line of a serialized message.
pub const MAX_PART_LENGTH: usize = 65536;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("line does not start with the message marker")]
    MissingMarker,
    #[error("malformed part count prefix: {0:?}")]
    BadPartCount(String),
    #[error("message has {expected} parts, found {found}")]
    WrongPartCount { expected: usize, found: usize },
    #[error("malformed message payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serializes `msg` into one logical line (no trailing newline). The result
/// may contain internal `\n` part separators; writers terminate it with a
/// final `\n`.
pub fn serialize_message<T: Serialize>(msg: &T) -> Result<String, ProtocolError> {
    serialize_message_with_limit(msg, MAX_PART_LENGTH)
}

fn serialize_message_with_limit<T: Serialize>(
    msg: &T,
    max_part_length: usize,
) -> Result<String, ProtocolError> {
    let payload = serde_json::to_string(msg)?;
    debug_assert!(!payload.contains('\n'));

    // split on char boundaries so multi-byte text never straddles parts
    let mut parts: Vec<&str> = Vec::new();
    let mut rest = payload.as_str();
    while rest.len() > max_part_length {
        let mut split = max_part_length;
        while !rest.is_char_boundary(split) {
            split -= 1;
        }
        let (head, tail) = rest.split_at(split);
        parts.push(head);
        rest = tail;
    }
    parts.push(rest);

    let mut result = String::with_capacity(payload.len() + 8);
    result.push(MESSAGE_MARKER);
    result.push_str(&parts.len().to_string());
    result.push(' ');
    result.push_str(&parts.join("\n"));
    Ok(result)
}

/// Parses one reassembled logical line produced by [`serialize_message`].
pub fn parse_message<T: DeserializeOwned>(line: &str) -> Result<T, ProtocolError> {
    let payload = strip_framing(line)?;
    Ok(serde_json::from_str(&payload)?)
}

/// Number of physical lines the message starting with `first_line` spans.
pub fn part_count(first_line: &str) -> Result<usize, ProtocolError> {
    let rest = first_line
        .strip_prefix(MESSAGE_MARKER)
        .ok_or(ProtocolError::MissingMarker)?;
    let digits = rest
        .split(' ')
        .next()
        .ok_or_else(|| ProtocolError::BadPartCount(first_line.to_owned()))?;
    digits
        .parse()
        .map_err(|_| ProtocolError::BadPartCount(first_line.to_owned()))
}

fn strip_framing(line: &str) -> Result<String, ProtocolError> {
    let expected = part_count(line)?;
    let rest = &line[1..];
    let payload_start = rest
        .find(' ')
        .ok_or_else(|| ProtocolError::BadPartCount(line.to_owned()))?;
    let payload = &rest[payload_start + 1..];

    let found = payload.matches('\n').count() + 1;
    if found != expected {
        return Err(ProtocolError::WrongPartCount { expected, found });
    }
    Ok(payload.replace('\n', ""))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::commands::{
        CommandToBackend, DebuggerCommand, ImmediateCommand, InputSubmission, StepAction,
        ToplevelCommand,
    };
    use crate::events::{BackendEvent, MessageFromBackend, StreamName};
    use crate::responses::{DebuggerResponse, InlineResponse, ToplevelResponse};
    use crate::types::{FrameInfo, PauseEvent, TextRange, UserExceptionInfo, ValueInfo};

    fn roundtrip_command(cmd: CommandToBackend) {
        let line = serialize_message(&cmd).expect("serializing");
        assert!(!line.ends_with('\n'));
        let parsed: CommandToBackend = parse_message(&line).expect("parsing");
        assert_eq!(parsed, cmd);
    }

    fn roundtrip_message(msg: MessageFromBackend) {
        let line = serialize_message(&msg).expect("serializing");
        let parsed: MessageFromBackend = parse_message(&line).expect("parsing");
        assert_eq!(parsed, msg);
    }

    #[test]
    fn roundtrip_toplevel_command_with_extras() {
        let mut cmd = ToplevelCommand::new("Run")
            .with_args(["script.py", "--flag"])
            .with_id(3);
        cmd.extra
            .insert("local_cwd".into(), serde_json::json!("/home/user"));
        cmd.extra
            .insert("nested".into(), serde_json::json!({"a": [1, 2, 3]}));
        roundtrip_command(CommandToBackend::Toplevel(cmd));
    }

    #[test]
    fn roundtrip_debugger_command() {
        let mut cmd = DebuggerCommand::new(StepAction::StepOver);
        cmd.state = Some(PauseEvent::BeforeStatement);
        cmd.focus = Some(TextRange::new(2, 0, 2, 9));
        cmd.frame_id = Some(17);
        cmd.breakpoints
            .entry("main.py".into())
            .or_default()
            .insert(4);
        roundtrip_command(CommandToBackend::Debugger(cmd));
    }

    #[test]
    fn roundtrip_fire_and_forget_commands() {
        roundtrip_command(CommandToBackend::Input(InputSubmission {
            data: "hello\n".into(),
        }));
        roundtrip_command(CommandToBackend::Eof);
        roundtrip_command(CommandToBackend::Immediate {
            name: ImmediateCommand::Interrupt,
        });
    }

    #[test]
    fn roundtrip_toplevel_response() {
        let mut resp = ToplevelResponse::for_command("Run", Some(3));
        resp.cwd = Some("/tmp".into());
        resp.user_exception = Some(UserExceptionInfo {
            type_name: "ZeroDivisionError".into(),
            message: "division by zero".into(),
            stack: Vec::new(),
            items: Vec::new(),
            filename: Some("main.py".into()),
            lineno: Some(2),
            col_offset: Some(4),
            line: Some("x = 1 / 0".into()),
        });
        let mut globals = BTreeMap::new();
        globals.insert(
            "x".to_owned(),
            ValueInfo {
                id: 12,
                repr: "42".into(),
            },
        );
        resp.globals = Some(globals);
        roundtrip_message(MessageFromBackend::Toplevel(resp));
    }

    #[test]
    fn roundtrip_debugger_response() {
        let frame = FrameInfo {
            id: 1,
            filename: "main.py".into(),
            module_name: "__main__".into(),
            code_name: "<module>".into(),
            source: Some("x = 1\n".into()),
            lineno: 1,
            firstlineno: Some(1),
            in_library: false,
            locals: None,
            globals: BTreeMap::new(),
            freevars: Vec::new(),
            event: PauseEvent::BeforeStatement,
            focus: Some(TextRange::new(1, 0, 1, 5)),
            current_statement: Some(TextRange::new(1, 0, 1, 5)),
            current_root_expression: None,
            current_evaluations: Vec::new(),
        };
        roundtrip_message(MessageFromBackend::Debugger(DebuggerResponse {
            stack: vec![frame],
            in_present: true,
            io_symbol_count: Some(0),
            exception_info: None,
            tracer_class: "StepTracer".into(),
            command_id: None,
        }));
    }

    #[test]
    fn roundtrip_events_and_inline() {
        roundtrip_message(MessageFromBackend::Event(BackendEvent::ProgramOutput {
            stream_name: StreamName::Stdout,
            data: "hi\n".into(),
        }));
        roundtrip_message(MessageFromBackend::Event(BackendEvent::InputRequest {
            method: "readline".into(),
            limit: None,
        }));
        roundtrip_message(MessageFromBackend::Inline(
            InlineResponse::for_command("get_globals", Some(8)).with_error("nope"),
        ));
    }

    #[test]
    fn long_messages_split_into_parts() {
        let data = "x".repeat(100);
        let msg = MessageFromBackend::Event(BackendEvent::stdout(data));
        let line = serialize_message_with_limit(&msg, 32).expect("serializing");

        let expected_parts = part_count(&line).expect("part count");
        assert!(expected_parts > 1);
        assert_eq!(line.matches('\n').count() + 1, expected_parts);

        let parsed: MessageFromBackend = parse_message(&line).expect("parsing");
        assert_eq!(parsed, msg);
    }

    #[test]
    fn garbage_is_rejected_not_misparsed() {
        assert!(matches!(
            parse_message::<CommandToBackend>("print('hi')"),
            Err(ProtocolError::MissingMarker)
        ));
        assert!(matches!(
            parse_message::<CommandToBackend>("\u{2}x {}"),
            Err(ProtocolError::BadPartCount(_))
        ));
        assert!(matches!(
            parse_message::<CommandToBackend>("\u{2}1 {\"kind\":\"no_such_kind\"}"),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            parse_message::<CommandToBackend>("\u{2}2 {}"),
            Err(ProtocolError::WrongPartCount {
                expected: 2,
                found: 1
            })
        ));
    }
}
