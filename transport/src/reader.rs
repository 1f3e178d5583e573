//! Decoding connection bytes back into messages.
//!
//! [`MessageStream`] is the synchronous decoder: one item per call, with a
//! poll timeout. [`spawn_message_reader`] runs it on a background thread and
//! feeds a channel drained by the single consumer on the other side (the
//! controller's pump). The backend drives a `MessageStream` from its own
//! command-reader thread instead, because immediate commands must be executed
//! in the reader context rather than queued.
//!
//! Lines that are not protocol messages are passed through as
//! [`Decoded::Stray`] - output written to the raw pipe by the peer's
//! grandchildren must not be lost, and a message marker glued to the end of
//! such output must still be recognized.

use std::collections::VecDeque;
use std::thread;
use std::time::Duration;

use crossbeam_channel::Sender;
use serde::de::DeserializeOwned;

use crate::codec;
use crate::connection::{ConnectionError, ConnectionReader};
use crate::MESSAGE_MARKER;

const PART_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum Decoded<T> {
    Message(T),
    /// A complete line that was not a protocol message, without its
    /// terminator.
    Stray(String),
    /// A marker line that failed to parse. The connection survives; the
    /// malformed message is skipped, never half-interpreted.
    Malformed { line: String, error: String },
    /// The stream died. Always the last item produced.
    ConnectionLost(ConnectionError),
}

/// Pull-based message decoder over a [`ConnectionReader`].
pub struct MessageStream<T> {
    reader: ConnectionReader,
    pending: VecDeque<Decoded<T>>,
    dead: bool,
}

impl<T: DeserializeOwned> MessageStream<T> {
    pub fn new(reader: ConnectionReader) -> Self {
        Self {
            reader,
            pending: VecDeque::new(),
            dead: false,
        }
    }

    /// Returns the next decoded item, or `None` if nothing complete arrived
    /// within `timeout`. After a [`Decoded::ConnectionLost`] every further
    /// call returns `None`.
    pub fn next(&mut self, timeout: Duration) -> Option<Decoded<T>> {
        if let Some(item) = self.pending.pop_front() {
            return Some(item);
        }
        if self.dead {
            return None;
        }

        match self.reader.read_line(timeout) {
            Ok(Some(line)) => {
                match self.decode_line(line) {
                    Ok(()) => {}
                    Err(err) => {
                        self.dead = true;
                        self.pending.push_back(Decoded::ConnectionLost(err));
                    }
                }
                self.pending.pop_front()
            }
            Ok(None) => None,
            Err(err) => {
                self.dead = true;
                Some(Decoded::ConnectionLost(err))
            }
        }
    }

    pub fn check_for_error(&self) -> Result<(), ConnectionError> {
        self.reader.check_for_error()
    }

    fn decode_line(&mut self, line: String) -> Result<(), ConnectionError> {
        if line.starts_with(MESSAGE_MARKER) {
            let item = self.decode_marker_line(line)?;
            self.pending.push_back(item);
            return Ok(());
        }

        match line.find(MESSAGE_MARKER) {
            None => self.pending.push_back(Decoded::Stray(line)),
            Some(pos) => {
                // output with a message glued to its tail: forward the
                // prefix, decode the suffix
                let prefix = line[..pos].to_owned();
                let message_part = line[pos..].to_owned();
                self.pending.push_back(Decoded::Stray(prefix));
                let item = self.decode_marker_line(message_part)?;
                self.pending.push_back(item);
            }
        }
        Ok(())
    }

    fn decode_marker_line(&mut self, first_line: String) -> Result<Decoded<T>, ConnectionError> {
        let parts = match codec::part_count(&first_line) {
            Ok(n) => n,
            Err(e) => {
                return Ok(Decoded::Malformed {
                    line: first_line,
                    error: e.to_string(),
                })
            }
        };

        let mut assembled = first_line;
        for _ in 1..parts {
            match self.reader.read_line(PART_TIMEOUT)? {
                Some(next) => {
                    assembled.push('\n');
                    assembled.push_str(&next);
                }
                None => {
                    return Ok(Decoded::Malformed {
                        error: format!("timed out waiting for continuation ({parts} parts)"),
                        line: assembled,
                    })
                }
            }
        }

        match codec::parse_message(&assembled) {
            Ok(msg) => Ok(Decoded::Message(msg)),
            Err(e) => Ok(Decoded::Malformed {
                line: assembled,
                error: e.to_string(),
            }),
        }
    }
}

/// Runs a [`MessageStream`] on a background thread until the connection dies
/// or a message arrives on `shutdown`.
pub fn spawn_message_reader<T>(
    reader: ConnectionReader,
    out: Sender<Decoded<T>>,
    shutdown: oneshot::Receiver<()>,
) -> thread::JoinHandle<()>
where
    T: DeserializeOwned + Send + 'static,
{
    const POLL_TIMEOUT: Duration = Duration::from_millis(100);

    thread::Builder::new()
        .name("message-reader".to_owned())
        .spawn(move || {
            let mut stream = MessageStream::new(reader);
            loop {
                match shutdown.try_recv() {
                    Ok(()) => return,
                    Err(oneshot::TryRecvError::Empty) => {}
                    Err(oneshot::TryRecvError::Disconnected) => return,
                }

                let Some(item) = stream.next(POLL_TIMEOUT) else {
                    continue;
                };
                let lost = matches!(item, Decoded::ConnectionLost(_));
                if out.send(item).is_err() || lost {
                    return;
                }
            }
        })
        .expect("spawning message reader thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::serialize_message;
    use crate::connection::Connection;
    use crate::events::{BackendEvent, MessageFromBackend};

    fn start(
        conn: Connection,
    ) -> (
        crossbeam_channel::Receiver<Decoded<MessageFromBackend>>,
        oneshot::Sender<()>,
        crate::connection::ConnectionWriter,
    ) {
        let (reader, writer) = conn.split();
        let (tx, rx) = crossbeam_channel::unbounded();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        spawn_message_reader(reader, tx, shutdown_rx);
        (rx, shutdown_tx, writer)
    }

    fn recv(
        rx: &crossbeam_channel::Receiver<Decoded<MessageFromBackend>>,
    ) -> Decoded<MessageFromBackend> {
        rx.recv_timeout(Duration::from_secs(5)).expect("decoded item")
    }

    #[test]
    fn decodes_a_message_line() {
        let (ours, theirs) = Connection::loopback_pair().unwrap();
        let (rx, _shutdown, _w) = start(ours);

        let msg = MessageFromBackend::Event(BackendEvent::stdout("hi\n"));
        let line = serialize_message(&msg).unwrap() + "\n";
        theirs.writer.write(line.as_bytes()).unwrap();

        match recv(&rx) {
            Decoded::Message(got) => assert_eq!(got, msg),
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[test]
    fn stray_output_is_passed_through() {
        let (ours, theirs) = Connection::loopback_pair().unwrap();
        let (rx, _shutdown, _w) = start(ours);

        theirs.writer.write(b"plain output\n").unwrap();
        match recv(&rx) {
            Decoded::Stray(line) => assert_eq!(line, "plain output"),
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[test]
    fn marker_glued_to_output_is_split() {
        let (ours, theirs) = Connection::loopback_pair().unwrap();
        let (rx, _shutdown, _w) = start(ours);

        let msg = MessageFromBackend::Event(BackendEvent::stderr("oops"));
        let line = format!("no newline{}\n", serialize_message(&msg).unwrap());
        theirs.writer.write(line.as_bytes()).unwrap();

        match recv(&rx) {
            Decoded::Stray(prefix) => assert_eq!(prefix, "no newline"),
            other => panic!("unexpected item: {other:?}"),
        }
        match recv(&rx) {
            Decoded::Message(got) => assert_eq!(got, msg),
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[test]
    fn malformed_marker_line_is_skipped_not_fatal() {
        let (ours, theirs) = Connection::loopback_pair().unwrap();
        let (rx, _shutdown, _w) = start(ours);

        theirs.writer.write("\u{2}1 not json\n".as_bytes()).unwrap();
        assert!(matches!(recv(&rx), Decoded::Malformed { .. }));

        // the connection still works afterwards
        let msg = MessageFromBackend::Event(BackendEvent::stdout("still here"));
        let line = serialize_message(&msg).unwrap() + "\n";
        theirs.writer.write(line.as_bytes()).unwrap();
        assert!(matches!(recv(&rx), Decoded::Message(_)));
    }

    #[test]
    fn multi_part_messages_are_reassembled() {
        let (ours, theirs) = Connection::loopback_pair().unwrap();
        let (reader, _w) = ours.split();
        let mut stream = MessageStream::<MessageFromBackend>::new(reader);

        // hand-framed two-part message, delivered in separate writes
        let msg = MessageFromBackend::Event(BackendEvent::stdout("abcdef"));
        let json = serde_json::to_string(&msg).unwrap();
        let (head, tail) = json.split_at(json.len() / 2);
        theirs
            .writer
            .write(format!("\u{2}2 {head}\n").as_bytes())
            .unwrap();
        theirs.writer.write(format!("{tail}\n").as_bytes()).unwrap();

        match stream.next(Duration::from_secs(5)).expect("item") {
            Decoded::Message(got) => assert_eq!(got, msg),
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[test]
    fn connection_loss_is_reported_once() {
        let (ours, theirs) = Connection::loopback_pair().unwrap();
        let (rx, _shutdown, _w) = start(ours);

        drop(theirs);
        match recv(&rx) {
            Decoded::ConnectionLost(_) => {}
            other => panic!("unexpected item: {other:?}"),
        }
        // channel closes after the loss marker
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_err());
    }

    #[test]
    fn shutdown_stops_the_reader() {
        let (ours, _theirs) = Connection::loopback_pair().unwrap();
        let (reader, _writer) = ours.split();
        let (tx, rx) = crossbeam_channel::unbounded::<Decoded<MessageFromBackend>>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = spawn_message_reader(reader, tx, shutdown_rx);

        shutdown_tx.send(()).unwrap();
        handle.join().expect("reader thread");
        assert!(rx.try_recv().is_err());
    }
}
