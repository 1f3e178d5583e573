//! End-to-end: the real backend binary, spawned and driven through the
//! controller-side proxy.

#![cfg(unix)]

use std::time::{Duration, Instant};

use debugger::{BackendProxy, RunnerState};
use server::{ExitStatusKind, LaunchOptions};
use transport::commands::{CommandToBackend, ToplevelCommand};
use transport::events::{BackendEvent, MessageFromBackend, StreamName};

const POLL: Duration = Duration::from_millis(100);
const TIMEOUT: Duration = Duration::from_secs(20);

#[ctor::ctor]
fn init_test_logger() {
    let _ = color_eyre::install();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn backend_options() -> LaunchOptions {
    LaunchOptions::Local {
        executable: env!("CARGO_BIN_EXE_wirebug-backend").into(),
        args: Vec::new(),
        cwd: None,
        env: Default::default(),
    }
}

fn fetch(proxy: &BackendProxy) -> MessageFromBackend {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        match proxy.fetch_next_message(POLL) {
            Ok(Some(msg)) => return msg,
            Ok(None) => assert!(Instant::now() < deadline, "timed out waiting for a message"),
            Err(e) => panic!("connection lost unexpectedly: {e}"),
        }
    }
}

fn wait_for_toplevel(proxy: &BackendProxy) -> transport::responses::ToplevelResponse {
    loop {
        if let MessageFromBackend::Toplevel(r) = fetch(proxy) {
            return r;
        }
    }
}

#[test]
fn spawned_backend_handshakes_and_reports_environment() {
    let proxy = BackendProxy::launch(backend_options()).expect("launching backend");
    let ready = wait_for_toplevel(&proxy);

    assert!(ready.cwd.is_some(), "cwd is mandatory in the ready message");
    assert!(ready.interpreter_version.is_some());
    assert_eq!(proxy.state(), RunnerState::WaitingToplevel);

    proxy.destroy();
}

#[test]
fn run_round_trip_over_real_pipes() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("hello.py");
    std::fs::write(&script, "print(\"hi\")\n").unwrap();

    let proxy = BackendProxy::launch(backend_options()).expect("launching backend");
    let _ready = wait_for_toplevel(&proxy);

    proxy
        .send_command(CommandToBackend::Toplevel(
            ToplevelCommand::new("Run").with_args([script.to_str().unwrap()]),
        ))
        .unwrap();

    // Run restarts the backend: new generation, fresh ready message first
    let _new_ready = wait_for_toplevel(&proxy);

    let mut output = String::new();
    let response = loop {
        match fetch(&proxy) {
            MessageFromBackend::Event(BackendEvent::ProgramOutput {
                stream_name: StreamName::Stdout,
                data,
            }) => output.push_str(&data),
            MessageFromBackend::Toplevel(r) => break r,
            _ => {}
        }
    };

    assert_eq!(output, "hi\n");
    assert!(response.user_exception.is_none());

    proxy.destroy();
}

#[test]
fn signal_interrupt_reaches_the_interpreter() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("spin.py");
    std::fs::write(&script, "while True: pass\n").unwrap();

    let proxy = BackendProxy::launch(backend_options()).expect("launching backend");
    let _ready = wait_for_toplevel(&proxy);

    proxy
        .send_command(CommandToBackend::Toplevel(
            ToplevelCommand::new("Run").with_args([script.to_str().unwrap()]),
        ))
        .unwrap();
    let _new_ready = wait_for_toplevel(&proxy);

    std::thread::sleep(Duration::from_millis(300));
    proxy.interrupt().expect("delivering interrupt");

    let response = wait_for_toplevel(&proxy);
    assert_eq!(
        response.user_exception.expect("an exception").type_name,
        "KeyboardInterrupt"
    );

    proxy.destroy();
}

#[test]
fn dying_backend_surfaces_as_connection_lost_not_a_hang() {
    let proxy = BackendProxy::launch(backend_options()).expect("launching backend");
    let _ready = wait_for_toplevel(&proxy);

    // make the process exit without the proxy's involvement; the immediate
    // kill never produces a response, so the only signal is the dead pipe
    proxy
        .send_command(CommandToBackend::Immediate {
            name: transport::commands::ImmediateCommand::Kill,
        })
        .unwrap();

    let deadline = Instant::now() + TIMEOUT;
    loop {
        match proxy.fetch_next_message(POLL) {
            Err(debugger::ProxyError::BackendTerminated { status }) => {
                assert_eq!(status, Some(ExitStatusKind::RequestedExit));
                break;
            }
            Ok(_) => assert!(Instant::now() < deadline, "loss never surfaced"),
            Err(e) => panic!("unexpected error {e}"),
        }
    }
    assert!(proxy.state().is_disconnected());
}

#[test]
fn restart_after_disconnect_brings_a_fresh_backend() {
    let proxy = BackendProxy::launch(backend_options()).expect("launching backend");
    let _ready = wait_for_toplevel(&proxy);

    proxy
        .send_command(CommandToBackend::Immediate {
            name: transport::commands::ImmediateCommand::Kill,
        })
        .unwrap();
    let deadline = Instant::now() + TIMEOUT;
    loop {
        match proxy.fetch_next_message(POLL) {
            Err(_) => break,
            Ok(_) => assert!(Instant::now() < deadline, "loss never surfaced"),
        }
    }

    proxy.restart_backend().expect("restarting");
    let ready = wait_for_toplevel(&proxy);
    assert!(ready.cwd.is_some());
    assert_eq!(proxy.state(), RunnerState::WaitingToplevel);

    proxy.destroy();
}
