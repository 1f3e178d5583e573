//! Proxy behavior against scripted fake backends.
//!
//! A fake backend is a small shell pipeline that prints the ack, replays
//! canned protocol lines from a file, and then idles on `cat` until it is
//! killed. This exercises the pump, state tracking, coalescing, restart and
//! loss detection without needing the real backend binary.

#![cfg(unix)]

use std::time::{Duration, Instant};

use debugger::{BackendProxy, ProxyError, RunnerState};
use server::LaunchOptions;
use transport::codec::serialize_message;
use transport::commands::{CommandToBackend, DebuggerCommand, StepAction, ToplevelCommand};
use transport::events::{BackendEvent, MessageFromBackend, StreamName};
use transport::responses::ToplevelResponse;

const POLL: Duration = Duration::from_millis(100);
const TIMEOUT: Duration = Duration::from_secs(10);

#[ctor::ctor]
fn init_test_logger() {
    let _ = color_eyre::install();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn ready_line() -> String {
    let mut ready = ToplevelResponse::default();
    ready.cwd = Some("/tmp".to_owned());
    ready.welcome_text = Some("fake backend".to_owned());
    serialize_message(&MessageFromBackend::Toplevel(ready)).unwrap()
}

fn output_line(stream: StreamName, data: &str) -> String {
    serialize_message(&MessageFromBackend::Event(BackendEvent::ProgramOutput {
        stream_name: stream,
        data: data.to_owned(),
    }))
    .unwrap()
}

/// Backend that prints the ack, replays `lines`, then stays alive.
fn scripted_backend(dir: &std::path::Path, lines: &[String]) -> LaunchOptions {
    let script_file = dir.join("replay.txt");
    std::fs::write(&script_file, lines.join("\n") + "\n").unwrap();
    LaunchOptions::Local {
        executable: "/bin/sh".into(),
        args: vec![
            "-c".to_owned(),
            format!("echo OK; cat {}; cat", script_file.display()),
        ],
        cwd: None,
        env: Default::default(),
    }
}

fn fetch_message(proxy: &BackendProxy) -> MessageFromBackend {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        match proxy.fetch_next_message(POLL) {
            Ok(Some(msg)) => return msg,
            Ok(None) => assert!(Instant::now() < deadline, "timed out waiting for a message"),
            Err(e) => panic!("unexpected proxy error: {e}"),
        }
    }
}

#[test]
fn ready_message_moves_the_proxy_to_the_prompt() {
    let dir = tempfile::tempdir().unwrap();
    let proxy = BackendProxy::launch(scripted_backend(dir.path(), &[ready_line()])).unwrap();
    assert_eq!(proxy.state(), RunnerState::Starting);

    match fetch_message(&proxy) {
        MessageFromBackend::Toplevel(r) => assert_eq!(r.cwd.as_deref(), Some("/tmp")),
        other => panic!("expected the ready message, got {other:?}"),
    }
    assert_eq!(proxy.state(), RunnerState::WaitingToplevel);

    proxy.destroy();
}

#[test]
fn consecutive_same_stream_output_is_coalesced() {
    let dir = tempfile::tempdir().unwrap();
    let lines = vec![
        ready_line(),
        output_line(StreamName::Stdout, "a"),
        output_line(StreamName::Stdout, "b"),
        output_line(StreamName::Stdout, "c\n"),
        output_line(StreamName::Stderr, "boom\n"),
    ];
    let proxy = BackendProxy::launch(scripted_backend(dir.path(), &lines)).unwrap();

    let _ready = fetch_message(&proxy);

    // give the replay time to be decoded in full so the run can coalesce
    std::thread::sleep(Duration::from_millis(300));

    match fetch_message(&proxy) {
        MessageFromBackend::Event(BackendEvent::ProgramOutput { stream_name, data }) => {
            assert!(matches!(stream_name, StreamName::Stdout));
            assert_eq!(data, "abc\n");
        }
        other => panic!("expected merged stdout, got {other:?}"),
    }
    match fetch_message(&proxy) {
        MessageFromBackend::Event(BackendEvent::ProgramOutput { stream_name, data }) => {
            assert!(matches!(stream_name, StreamName::Stderr));
            assert_eq!(data, "boom\n");
        }
        other => panic!("expected stderr, got {other:?}"),
    }

    proxy.destroy();
}

#[test]
fn raw_output_lines_are_not_lost() {
    let dir = tempfile::tempdir().unwrap();
    let lines = vec![ready_line(), "stray print from a grandchild".to_owned()];
    let proxy = BackendProxy::launch(scripted_backend(dir.path(), &lines)).unwrap();

    let _ready = fetch_message(&proxy);
    match fetch_message(&proxy) {
        MessageFromBackend::Event(BackendEvent::ProgramOutput { data, .. }) => {
            assert_eq!(data, "stray print from a grandchild\n");
        }
        other => panic!("expected passthrough output, got {other:?}"),
    }

    proxy.destroy();
}

#[test]
fn dead_backend_is_reported_once_then_disconnected() {
    let dir = tempfile::tempdir().unwrap();
    // prints ack and exits with an unexpected code
    let script_file = dir.path().join("unused.txt");
    std::fs::write(&script_file, "").unwrap();
    let options = LaunchOptions::Local {
        executable: "/bin/sh".into(),
        args: vec!["-c".to_owned(), "echo OK; exit 9".to_owned()],
        cwd: None,
        env: Default::default(),
    };
    let proxy = BackendProxy::launch(options).unwrap();

    // within a bounded number of polls the loss must surface as an error
    let deadline = Instant::now() + TIMEOUT;
    let error = loop {
        match proxy.fetch_next_message(POLL) {
            Err(e) => break e,
            Ok(_) => assert!(Instant::now() < deadline, "loss never surfaced"),
        }
    };
    match error {
        ProxyError::BackendTerminated { status } => {
            assert_eq!(status, Some(server::ExitStatusKind::Crashed(9)));
        }
        other => panic!("unexpected error {other}"),
    }

    assert!(proxy.state().is_disconnected());
    // reported exactly once; afterwards the proxy just reports nothing new
    assert!(matches!(proxy.fetch_next_message(POLL), Ok(None)));
}

#[test]
fn restarting_command_replaces_the_process_and_discards_old_messages() {
    let dir = tempfile::tempdir().unwrap();
    let lines = vec![
        ready_line(),
        output_line(StreamName::Stdout, "stale output that must not leak\n"),
    ];
    let options = scripted_backend(dir.path(), &lines);
    let proxy = BackendProxy::launch(options).unwrap();
    let _ready = fetch_message(&proxy);

    // uppercase initial => restart semantics
    proxy
        .send_command(CommandToBackend::Toplevel(
            ToplevelCommand::new("Run").with_args(["whatever.py"]),
        ))
        .unwrap();

    // the first message from the new generation is its ready message, not
    // the stale output the old process still had queued
    match fetch_message(&proxy) {
        MessageFromBackend::Toplevel(r) => {
            assert_eq!(r.welcome_text.as_deref(), Some("fake backend"));
        }
        other => panic!("expected the new generation's ready message, got {other:?}"),
    }

    proxy.destroy();
}

#[test]
fn commands_get_correlation_ids_assigned() {
    let dir = tempfile::tempdir().unwrap();
    let proxy = BackendProxy::launch(scripted_backend(dir.path(), &[ready_line()])).unwrap();
    let _ready = fetch_message(&proxy);

    // the proxy numbers unnumbered commands itself; the write succeeding is
    // all we can observe against a scripted backend
    proxy
        .send_command(CommandToBackend::Toplevel(
            ToplevelCommand::new("execute_source").with_source("1 + 1\n"),
        ))
        .unwrap();

    proxy.destroy();
}

#[test]
fn debugger_commands_outside_a_pause_are_rejected_softly() {
    let dir = tempfile::tempdir().unwrap();
    let proxy = BackendProxy::launch(scripted_backend(dir.path(), &[ready_line()])).unwrap();
    let _ready = fetch_message(&proxy);

    // wrong state: ignored with a warning, not sent, not an error
    proxy
        .send_command(CommandToBackend::Debugger(DebuggerCommand::new(
            StepAction::StepInto,
        )))
        .unwrap();
    assert_eq!(proxy.state(), RunnerState::WaitingToplevel);

    proxy.destroy();
}

#[test]
fn capabilities_differ_per_backend_kind() {
    let dir = tempfile::tempdir().unwrap();
    let proxy = BackendProxy::launch(scripted_backend(dir.path(), &[ready_line()])).unwrap();

    assert!(proxy.can_debug());
    assert!(proxy.can_run_in_terminal());
    assert!(!proxy.supports_remote_files());

    proxy.destroy();
}
