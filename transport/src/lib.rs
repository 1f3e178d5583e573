//! Wire protocol and byte transport shared by the controller and the backend
//! process.
//!
//! Messages travel as single logical lines over a byte stream (child process
//! pipes locally, an exec channel over SSH). [`codec`] defines the framing,
//! [`commands`]/[`responses`]/[`events`] the message model, [`connection`] the
//! byte-level channel and [`reader`] the background thread that turns bytes
//! back into messages.

pub mod codec;
pub mod commands;
pub mod connection;
pub mod events;
pub mod reader;
pub mod responses;
pub mod types;

pub use codec::ProtocolError;
pub use commands::CommandToBackend;
pub use connection::{Connection, ConnectionError, ConnectionReader, ConnectionWriter};
pub use events::{BackendEvent, MessageFromBackend};
pub use reader::{spawn_message_reader, Decoded, MessageStream};

/// First byte of every serialized protocol message. Ordinary program output
/// never starts with it, which lets the receiving side tell the two apart.
pub const MESSAGE_MARKER: char = '\u{0002}';

/// Fixed acknowledgment line the backend prints right after startup, before
/// any protocol message.
pub const PROCESS_ACK: &str = "OK";

/// Exit code for a termination the controller asked for (EOF or kill).
pub const CLEAN_EXIT_CODE: i32 = 17;

/// Exit code meaning "a fatal internal error happened, but it was already
/// reported on stderr" - the controller should not pile a second generic
/// diagnostic on top.
pub const ALL_EXPLAINED_EXIT_CODE: i32 = 193;
