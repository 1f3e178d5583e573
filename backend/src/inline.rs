//! Inline command handling.
//!
//! Inline queries are answerable both from the idle main loop and from a
//! debugger pause, so the handler takes whatever context the call site has:
//! the heap is always there, globals and a paused stack only sometimes.

use std::collections::BTreeMap;

use transport::commands::InlineCommand;
use transport::responses::{InlineResponse, ObjectInfo};
use transport::types::FrameInfo;
use transport::ConnectionWriter;

use crate::eval::Value;
use crate::files;
use crate::heap::{Heap, MAX_REPR_LENGTH, MAX_VARIABLE_REPR_LENGTH};
use crate::machine::UserError;

pub struct InlineContext<'a> {
    pub heap: &'a mut Heap,
    pub globals: Option<&'a BTreeMap<String, Value>>,
    pub stack: Option<&'a [FrameInfo]>,
    pub writer: &'a ConnectionWriter,
}

pub fn handle(cmd: &InlineCommand, ctx: &mut InlineContext<'_>) -> InlineResponse {
    let response = InlineResponse::for_command(cmd.name.clone(), cmd.id);
    match dispatch(cmd, response.clone(), ctx) {
        Ok(response) => response,
        Err(user_error) => response.with_error(user_error.message),
    }
}

fn dispatch(
    cmd: &InlineCommand,
    mut response: InlineResponse,
    ctx: &mut InlineContext<'_>,
) -> Result<InlineResponse, UserError> {
    match cmd.name.as_str() {
        "get_globals" => {
            match ctx.globals {
                Some(globals) => response.globals = Some(ctx.heap.export_variables(globals)),
                None => response.error = Some("globals not available".to_owned()),
            }
            Ok(response)
        }
        "get_object_info" => {
            let id = cmd
                .object_id
                .ok_or_else(|| UserError::new("get_object_info needs object_id"))?;
            response.object_info = Some(object_info(ctx.heap, id));
            Ok(response)
        }
        "get_frame_info" => {
            let frame_id = cmd
                .frame_id
                .ok_or_else(|| UserError::new("get_frame_info needs frame_id"))?;
            let frame = ctx
                .stack
                .and_then(|stack| stack.iter().find(|f| f.id == frame_id));
            match frame {
                Some(frame) => {
                    response.extra.insert(
                        "frame".to_owned(),
                        serde_json::to_value(frame).unwrap_or(serde_json::Value::Null),
                    );
                }
                None => response.error = Some("Frame not found".to_owned()),
            }
            Ok(response)
        }
        "get_dirs_children_info" => {
            let include_hidden = cmd.include_hidden.unwrap_or(false);
            response.dirs_children_info =
                Some(files::get_dirs_children_info(&cmd.paths, include_hidden));
            Ok(response)
        }
        "read_file" => {
            let path = required_path(cmd)?;
            response.content = Some(files::read_file(path)?);
            Ok(response)
        }
        "write_file" => {
            let path = required_path(cmd)?;
            let content = cmd
                .content
                .as_deref()
                .ok_or_else(|| UserError::new("write_file needs content"))?;
            files::write_file(path, content)?;
            Ok(response)
        }
        "delete" => {
            files::delete(&cmd.paths)?;
            Ok(response)
        }
        "mkdir" => {
            let path = required_path(cmd)?;
            files::mkdir(path)?;
            Ok(response)
        }
        "upload" | "download" => {
            files::transfer(&cmd.items, cmd.id, ctx.writer)?;
            Ok(response)
        }
        other => Ok(response.with_error(format!("Unknown command: {other}"))),
    }
}

fn required_path(cmd: &InlineCommand) -> Result<&str, UserError> {
    cmd.path
        .as_deref()
        .ok_or_else(|| UserError::new(format!("{} needs a path", cmd.name)))
}

fn object_info(heap: &mut Heap, id: transport::types::ObjectId) -> ObjectInfo {
    let Some(value) = heap.get(id).cloned() else {
        return ObjectInfo {
            id,
            error: Some("object info not available".to_owned()),
            repr: None,
            type_name: None,
            elements: None,
            entries: None,
            attributes: None,
        };
    };

    let mut info = ObjectInfo {
        id,
        error: None,
        repr: Some({
            let exported = heap.export_value(&value, MAX_REPR_LENGTH);
            exported.repr
        }),
        type_name: Some(value.type_name().to_owned()),
        elements: None,
        entries: None,
        attributes: None,
    };

    match &value {
        Value::List(items) => {
            info.elements = Some(
                items
                    .borrow()
                    .iter()
                    .map(|v| heap.export_value(v, MAX_VARIABLE_REPR_LENGTH))
                    .collect(),
            );
        }
        Value::Tuple(items) => {
            info.elements = Some(
                items
                    .iter()
                    .map(|v| heap.export_value(v, MAX_VARIABLE_REPR_LENGTH))
                    .collect(),
            );
        }
        Value::Dict(pairs) => {
            info.entries = Some(
                pairs
                    .borrow()
                    .iter()
                    .map(|(k, v)| {
                        (
                            heap.export_value(k, MAX_VARIABLE_REPR_LENGTH),
                            heap.export_value(v, MAX_VARIABLE_REPR_LENGTH),
                        )
                    })
                    .collect(),
            );
        }
        _ => {}
    }
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use transport::Connection;

    fn test_writer() -> (ConnectionWriter, Connection) {
        let (ours, theirs) = Connection::loopback_pair().unwrap();
        (ours.writer, theirs)
    }

    #[test]
    fn get_globals_exports_current_values() {
        let (writer, _peer) = test_writer();
        let mut heap = Heap::new();
        let mut globals = BTreeMap::new();
        globals.insert("x".to_owned(), Value::Int(42));

        let cmd = InlineCommand::new("get_globals").with_id(7);
        let mut ctx = InlineContext {
            heap: &mut heap,
            globals: Some(&globals),
            stack: None,
            writer: &writer,
        };
        let response = handle(&cmd, &mut ctx);

        assert_eq!(response.command_id, Some(7));
        let exported = response.globals.expect("globals");
        assert_eq!(exported["x"].repr, "42");
    }

    #[test]
    fn object_info_resolves_exported_lists() {
        let (writer, _peer) = test_writer();
        let mut heap = Heap::new();
        let list = Value::list(vec![Value::Int(1), Value::str("two")]);
        let exported = heap.export_value(&list, MAX_REPR_LENGTH);

        let mut cmd = InlineCommand::new("get_object_info");
        cmd.object_id = Some(exported.id);
        let mut ctx = InlineContext {
            heap: &mut heap,
            globals: None,
            stack: None,
            writer: &writer,
        };
        let response = handle(&cmd, &mut ctx);

        let info = response.object_info.expect("object info");
        assert_eq!(info.type_name.as_deref(), Some("list"));
        let elements = info.elements.expect("elements");
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[1].repr, "'two'");
    }

    #[test]
    fn unknown_object_id_is_an_error_payload_not_a_failure() {
        let (writer, _peer) = test_writer();
        let mut heap = Heap::new();
        let mut cmd = InlineCommand::new("get_object_info");
        cmd.object_id = Some(999_999);
        let mut ctx = InlineContext {
            heap: &mut heap,
            globals: None,
            stack: None,
            writer: &writer,
        };
        let response = handle(&cmd, &mut ctx);
        assert!(response.object_info.unwrap().error.is_some());
    }

    #[test]
    fn unknown_command_reports_an_error_response() {
        let (writer, _peer) = test_writer();
        let mut heap = Heap::new();
        let cmd = InlineCommand::new("no_such_query");
        let mut ctx = InlineContext {
            heap: &mut heap,
            globals: None,
            stack: None,
            writer: &writer,
        };
        let response = handle(&cmd, &mut ctx);
        assert!(response.error.unwrap().contains("Unknown command"));
    }
}
