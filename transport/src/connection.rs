//! Byte-level channel to the peer process.
//!
//! A [`Connection`] wraps one readable and one writable byte stream (child
//! process pipes, or the stdio of an `ssh` client). A background thread
//! drains the readable side into a channel as soon as bytes arrive, so the
//! consuming side gets buffered reads with timeouts, pushback (`unread`) and
//! prompt failure detection without ever blocking on the OS pipe itself.

use std::io::{Read, Write};
use std::process::{Child, ChildStdin, ChildStdout};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    /// The peer closed its end of the stream.
    #[error("connection closed: {0}")]
    Closed(String),
    #[error("connection i/o error: {0}")]
    Io(String),
}

type SharedStatus = Arc<Mutex<Option<ConnectionError>>>;

pub struct Connection {
    pub reader: ConnectionReader,
    pub writer: ConnectionWriter,
}

impl Connection {
    pub fn new(input: Box<dyn Read + Send>, output: Box<dyn Write + Send>) -> Self {
        let status: SharedStatus = Arc::new(Mutex::new(None));
        let (tx, rx) = crossbeam_channel::unbounded();

        let pump_status = Arc::clone(&status);
        thread::Builder::new()
            .name("connection-bytes".to_owned())
            .spawn(move || pump_bytes(input, tx, pump_status))
            .expect("spawning connection reader thread");

        Self {
            reader: ConnectionReader {
                incoming: rx,
                buffer: BytesMut::new(),
                status: Arc::clone(&status),
            },
            writer: ConnectionWriter {
                inner: Arc::new(Mutex::new(output)),
                status,
            },
        }
    }

    /// Connection over the stdio pipes of a spawned backend process. The
    /// child must have been created with piped stdin and stdout.
    pub fn from_child(child: &mut Child) -> Option<Self> {
        let stdin: ChildStdin = child.stdin.take()?;
        let stdout: ChildStdout = child.stdout.take()?;
        Some(Self::new(Box::new(stdout), Box::new(stdin)))
    }

    /// Two connections talking to each other through in-process pipes.
    /// Used by tests and by in-process backends.
    pub fn loopback_pair() -> std::io::Result<(Connection, Connection)> {
        let (a_read, b_write) = std::io::pipe()?;
        let (b_read, a_write) = std::io::pipe()?;
        Ok((
            Connection::new(Box::new(a_read), Box::new(a_write)),
            Connection::new(Box::new(b_read), Box::new(b_write)),
        ))
    }

    pub fn split(self) -> (ConnectionReader, ConnectionWriter) {
        (self.reader, self.writer)
    }
}

fn pump_bytes(mut input: Box<dyn Read + Send>, tx: Sender<Vec<u8>>, status: SharedStatus) {
    let mut chunk = [0u8; 4096];
    loop {
        match input.read(&mut chunk) {
            Ok(0) => {
                tracing::debug!("peer closed the stream");
                set_status(&status, ConnectionError::Closed("end of stream".to_owned()));
                break;
            }
            Ok(n) => {
                if tx.send(chunk[..n].to_vec()).is_err() {
                    // consumer is gone, nothing left to do
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!(error = %e, "stream read failed");
                set_status(&status, ConnectionError::Io(e.to_string()));
                break;
            }
        }
    }
}

fn set_status(status: &SharedStatus, error: ConnectionError) {
    let mut guard = status.lock().unwrap();
    if guard.is_none() {
        *guard = Some(error);
    }
}

/// Reading half. Not `Clone`: exactly one consumer reads from a connection.
pub struct ConnectionReader {
    incoming: Receiver<Vec<u8>>,
    buffer: BytesMut,
    status: SharedStatus,
}

impl ConnectionReader {
    /// Raises when the underlying stream has died. Buffered data is still
    /// readable after this returns an error.
    pub fn check_for_error(&self) -> Result<(), ConnectionError> {
        match &*self.status.lock().unwrap() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Reads exactly `size` bytes, or returns an empty vec if they do not
    /// arrive within `timeout`. A timeout is not an error; a dead stream is.
    pub fn soft_read(&mut self, size: usize, timeout: Duration) -> Result<Vec<u8>, ConnectionError> {
        let deadline = Instant::now() + timeout;
        self.absorb_pending();
        while self.buffer.len() < size {
            if !self.wait_for_more(deadline)? {
                return Ok(Vec::new());
            }
        }
        Ok(self.take(size))
    }

    /// Reads until one of `patterns` has been seen, returning everything up
    /// to and including the earliest match. On timeout returns whatever has
    /// been buffered so far (possibly empty).
    pub fn soft_read_until(
        &mut self,
        patterns: &[&[u8]],
        timeout: Duration,
    ) -> Result<Vec<u8>, ConnectionError> {
        let deadline = Instant::now() + timeout;
        self.absorb_pending();
        loop {
            if let Some(end) = earliest_match_end(&self.buffer, patterns) {
                return Ok(self.take(end));
            }
            if !self.wait_for_more(deadline)? {
                return Ok(self.take(self.buffer.len()));
            }
        }
    }

    /// Reads one `\n`-terminated line, without the terminator (a trailing
    /// `\r` is stripped as well). `None` means the line was not complete
    /// within `timeout`; partial data stays buffered.
    pub fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, ConnectionError> {
        let deadline = Instant::now() + timeout;
        self.absorb_pending();
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let mut line = self.take(pos + 1);
                line.pop(); // the \n
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }
            if !self.wait_for_more(deadline)? {
                return Ok(None);
            }
        }
    }

    /// Pushes bytes back to the front of the buffer, to be re-read by the
    /// next read call. Needed when echo detection over-reads.
    pub fn unread(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut fresh = BytesMut::with_capacity(data.len() + self.buffer.len());
        fresh.extend_from_slice(data);
        fresh.extend_from_slice(&self.buffer);
        self.buffer = fresh;
    }

    /// True when neither the buffer nor the incoming channel holds data.
    pub fn incoming_is_empty(&mut self) -> bool {
        self.absorb_pending();
        self.buffer.is_empty()
    }

    fn take(&mut self, size: usize) -> Vec<u8> {
        let data = self.buffer[..size].to_vec();
        self.buffer.advance(size);
        data
    }

    fn absorb_pending(&mut self) {
        while let Ok(chunk) = self.incoming.try_recv() {
            self.buffer.extend_from_slice(&chunk);
        }
    }

    /// Blocks until more bytes arrive or `deadline` passes. `Ok(false)`
    /// means timeout. Errors only when more data is needed and the stream
    /// has died.
    fn wait_for_more(&mut self, deadline: Instant) -> Result<bool, ConnectionError> {
        self.check_for_error()?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.incoming.recv_timeout(remaining) {
            Ok(chunk) => {
                self.buffer.extend_from_slice(&chunk);
                Ok(true)
            }
            Err(RecvTimeoutError::Timeout) => Ok(false),
            Err(RecvTimeoutError::Disconnected) => {
                self.check_for_error()?;
                Err(ConnectionError::Closed("reader thread gone".to_owned()))
            }
        }
    }
}

fn earliest_match_end(buffer: &[u8], patterns: &[&[u8]]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for pattern in patterns {
        if pattern.is_empty() {
            continue;
        }
        if let Some(pos) = find_subsequence(buffer, pattern) {
            let end = pos + pattern.len();
            best = Some(best.map_or(end, |b| b.min(end)));
        }
    }
    best
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Writing half. Cloneable so the dispatch loop and side channels can share
/// it; writes are serialized through a mutex so a message line is never
/// interleaved with another.
#[derive(Clone)]
pub struct ConnectionWriter {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
    status: SharedStatus,
}

impl ConnectionWriter {
    /// Blocking write of the whole buffer, flushed. Returns the number of
    /// bytes written.
    pub fn write(&self, data: &[u8]) -> Result<usize, ConnectionError> {
        self.check_for_error()?;
        let mut guard = self.inner.lock().unwrap();
        let result = guard.write_all(data).and_then(|()| guard.flush());
        match result {
            Ok(()) => Ok(data.len()),
            Err(e) => {
                let err = ConnectionError::Io(e.to_string());
                set_status(&self.status, err.clone());
                Err(err)
            }
        }
    }

    /// Serializes `msg` and writes it as one line under the writer lock.
    pub fn send_message<T: serde::Serialize>(&self, msg: &T) -> Result<(), ConnectionError> {
        let line = crate::codec::serialize_message(msg)
            .map_err(|e| ConnectionError::Io(e.to_string()))?;
        let mut bytes = line.into_bytes();
        bytes.push(b'\n');
        self.write(&bytes).map(drop)
    }

    pub fn check_for_error(&self) -> Result<(), ConnectionError> {
        match &*self.status.lock().unwrap() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(50);
    const LONG: Duration = Duration::from_secs(5);

    #[test]
    fn soft_read_returns_empty_on_timeout() {
        let (a, _b) = Connection::loopback_pair().unwrap();
        let (mut reader, _writer) = a.split();
        let data = reader.soft_read(4, SHORT).expect("reading");
        assert!(data.is_empty());
    }

    #[test]
    fn soft_read_waits_for_full_size() {
        let (a, b) = Connection::loopback_pair().unwrap();
        let (mut reader, _aw) = a.split();
        b.writer.write(b"abcdef").expect("writing");
        assert_eq!(reader.soft_read(4, LONG).expect("reading"), b"abcd");
        assert_eq!(reader.soft_read(2, LONG).expect("reading"), b"ef");
    }

    #[test]
    fn soft_read_until_stops_at_earliest_pattern() {
        let (a, b) = Connection::loopback_pair().unwrap();
        let (mut reader, _aw) = a.split();
        b.writer.write(b">>> rest").expect("writing");
        let data = reader
            .soft_read_until(&[b">>> ", b"=== "], LONG)
            .expect("reading");
        assert_eq!(data, b">>> ");
        // remainder stays buffered
        let tail = reader.soft_read_until(&[b"st"], LONG).expect("reading");
        assert_eq!(tail, b"rest");
    }

    #[test]
    fn unread_bytes_come_back_first() {
        let (a, b) = Connection::loopback_pair().unwrap();
        let (mut reader, _aw) = a.split();
        b.writer.write(b"world").expect("writing");
        assert_eq!(reader.soft_read(5, LONG).expect("reading"), b"world");
        reader.unread(b"hello ");
        b.writer.write(b"!").expect("writing");
        assert_eq!(reader.soft_read(7, LONG).expect("reading"), b"hello !");
    }

    #[test]
    fn read_line_strips_terminators_and_keeps_partials() {
        let (a, b) = Connection::loopback_pair().unwrap();
        let (mut reader, _aw) = a.split();
        b.writer.write(b"one\r\ntwo\npart").expect("writing");
        assert_eq!(reader.read_line(LONG).expect("reading").as_deref(), Some("one"));
        assert_eq!(reader.read_line(LONG).expect("reading").as_deref(), Some("two"));
        assert_eq!(reader.read_line(SHORT).expect("reading"), None);
        b.writer.write(b"ial\n").expect("writing");
        assert_eq!(
            reader.read_line(LONG).expect("reading").as_deref(),
            Some("partial")
        );
    }

    #[test]
    fn dead_peer_is_detected_not_hung() {
        let (a, b) = Connection::loopback_pair().unwrap();
        let (mut reader, _aw) = a.split();
        drop(b); // peer goes away

        // detection is prompt but asynchronous; poll briefly
        let deadline = Instant::now() + LONG;
        loop {
            match reader.soft_read(1, SHORT) {
                Err(ConnectionError::Closed(_)) => break,
                Ok(data) if data.is_empty() && Instant::now() < deadline => continue,
                other => panic!("expected Closed error, got {other:?}"),
            }
        }
        assert!(reader.check_for_error().is_err());
    }

    #[test]
    fn buffered_data_survives_peer_death() {
        let (a, b) = Connection::loopback_pair().unwrap();
        let (mut reader, _aw) = a.split();
        b.writer.write(b"leftover").expect("writing");
        drop(b);
        // even though the peer is gone, the bytes it sent must be readable
        let deadline = Instant::now() + LONG;
        while reader.check_for_error().is_ok() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(reader.soft_read(8, LONG).expect("reading"), b"leftover");
    }

    #[test]
    fn writes_to_dead_peer_fail() {
        let (gone_reader, output) = std::io::pipe().unwrap();
        drop(gone_reader);
        let (input, _input_writer) = std::io::pipe().unwrap();
        let conn = Connection::new(Box::new(input), Box::new(output));

        let result = conn.writer.write(b"ping\n");
        assert!(
            matches!(result, Err(ConnectionError::Io(_))),
            "expected broken pipe, got {result:?}"
        );
        // the failure sticks: later writes fail fast via the status slot
        assert!(conn.writer.check_for_error().is_err());
    }
}
