//! Protocol-level scenarios against an in-process backend machine, driven
//! through a loopback connection exactly the way a controller would.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use backend::Backend;
use transport::commands::{
    CommandToBackend, DebuggerCommand, ImmediateCommand, InlineCommand, InputSubmission,
    StepAction, ToplevelCommand,
};
use transport::events::{BackendEvent, MessageFromBackend, StreamName};
use transport::responses::{DebuggerResponse, ToplevelResponse};
use transport::{Connection, ConnectionWriter, Decoded, MessageStream, CLEAN_EXIT_CODE, PROCESS_ACK};

const TIMEOUT: Duration = Duration::from_secs(10);

struct Frontend {
    writer: ConnectionWriter,
    stream: MessageStream<MessageFromBackend>,
    handle: Option<thread::JoinHandle<i32>>,
}

impl Frontend {
    fn start() -> Self {
        let (backend_conn, frontend_conn) = Connection::loopback_pair().unwrap();
        let interrupt = Arc::new(AtomicBool::new(false));
        let handle = thread::spawn(move || Backend::new(backend_conn, interrupt).run());

        let (reader, writer) = frontend_conn.split();
        let stream = MessageStream::new(reader);

        let mut frontend = Self {
            writer,
            stream,
            handle: Some(handle),
        };

        // fixed ack line first, then the ready message
        match frontend.next_raw() {
            Decoded::Stray(line) => assert_eq!(line, PROCESS_ACK),
            other => panic!("expected ack line, got {other:?}"),
        }
        let ready = frontend.expect_toplevel();
        assert!(ready.cwd.is_some());
        assert!(ready.welcome_text.is_some());

        frontend
    }

    fn send(&self, cmd: CommandToBackend) {
        self.writer.send_message(&cmd).expect("sending command");
    }

    fn next_raw(&mut self) -> Decoded<MessageFromBackend> {
        let deadline = std::time::Instant::now() + TIMEOUT;
        loop {
            if let Some(item) = self.stream.next(Duration::from_millis(100)) {
                return item;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "timed out waiting for a message"
            );
        }
    }

    fn next_message(&mut self) -> MessageFromBackend {
        match self.next_raw() {
            Decoded::Message(msg) => msg,
            other => panic!("expected a message, got {other:?}"),
        }
    }

    fn expect_toplevel(&mut self) -> ToplevelResponse {
        match self.next_message() {
            MessageFromBackend::Toplevel(r) => r,
            other => panic!("expected toplevel response, got {other:?}"),
        }
    }

    fn expect_debugger(&mut self) -> DebuggerResponse {
        match self.next_message() {
            MessageFromBackend::Debugger(r) => r,
            other => panic!("expected debugger response, got {other:?}"),
        }
    }

    fn expect_output(&mut self) -> (StreamName, String) {
        match self.next_message() {
            MessageFromBackend::Event(BackendEvent::ProgramOutput { stream_name, data }) => {
                (stream_name, data)
            }
            other => panic!("expected program output, got {other:?}"),
        }
    }

    fn execute_source(&self, source: &str, id: u64) {
        self.send(CommandToBackend::Toplevel(
            ToplevelCommand::new("execute_source")
                .with_source(source)
                .with_id(id),
        ));
    }

    fn finish(mut self) -> i32 {
        self.send(CommandToBackend::Eof);
        self.handle.take().unwrap().join().expect("backend thread")
    }
}

#[test]
fn run_produces_output_then_clean_response_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("script.py");
    std::fs::write(&script, "print(\"hi\")\n").unwrap();

    let mut frontend = Frontend::start();
    frontend.send(CommandToBackend::Toplevel(
        ToplevelCommand::new("Run")
            .with_args([script.to_str().unwrap()])
            .with_id(1),
    ));

    let (stream, data) = frontend.expect_output();
    assert!(matches!(stream, StreamName::Stdout));
    assert_eq!(data, "hi\n");

    let response = frontend.expect_toplevel();
    assert_eq!(response.command_name.as_deref(), Some("Run"));
    assert_eq!(response.command_id, Some(1));
    assert!(response.error.is_none());
    assert!(response.user_exception.is_none());

    assert_eq!(frontend.finish(), CLEAN_EXIT_CODE);
}

#[test]
fn responses_correlate_in_command_order() {
    let mut frontend = Frontend::start();
    frontend.execute_source("a = 1\n", 1);
    frontend.execute_source("b = 2\n", 2);
    frontend.execute_source("c = 3\n", 3);

    let ids: Vec<_> = (0..3)
        .map(|_| frontend.expect_toplevel().command_id)
        .collect();
    assert_eq!(ids, vec![Some(1), Some(2), Some(3)]);

    frontend.finish();
}

#[test]
fn syntax_error_is_structured_with_position() {
    let mut frontend = Frontend::start();
    frontend.execute_source("def f(:\n", 1);

    let response = frontend.expect_toplevel();
    let exc = response.user_exception.expect("a user exception");
    assert_eq!(exc.type_name, "SyntaxError");
    assert_eq!(exc.lineno, Some(1));
    assert!(exc.items.last().unwrap().text.starts_with("SyntaxError:"));

    frontend.finish();
}

#[test]
fn interrupt_stops_an_infinite_loop_and_backend_survives() {
    let mut frontend = Frontend::start();
    frontend.execute_source("while True: pass\n", 1);

    // let it spin before interrupting
    thread::sleep(Duration::from_millis(100));
    frontend.send(CommandToBackend::Immediate {
        name: ImmediateCommand::Interrupt,
    });

    let response = frontend.expect_toplevel();
    assert_eq!(response.command_id, Some(1));
    assert_eq!(
        response.user_exception.expect("an exception").type_name,
        "KeyboardInterrupt"
    );

    // back at toplevel: the next command is served normally
    frontend.execute_source("1 + 1\n", 2);
    let response = frontend.expect_toplevel();
    assert_eq!(response.value_info.expect("a value").repr, "2");

    frontend.finish();
}

#[test]
fn unknown_command_is_an_error_not_a_crash() {
    let mut frontend = Frontend::start();
    frontend.send(CommandToBackend::Toplevel(
        ToplevelCommand::new("Frobnicate").with_id(1),
    ));

    let (stream, data) = frontend.expect_output();
    assert!(matches!(stream, StreamName::Stderr));
    assert!(data.contains("Unknown command"));
    let response = frontend.expect_toplevel();
    assert!(response.error.unwrap().contains("Unknown command"));

    // still alive
    frontend.execute_source("x = 1\n", 2);
    assert_eq!(frontend.expect_toplevel().command_id, Some(2));

    frontend.finish();
}

#[test]
fn user_error_prints_to_stderr_and_yields_clean_response() {
    let mut frontend = Frontend::start();
    frontend.send(CommandToBackend::Toplevel(
        ToplevelCommand::new("cd")
            .with_args(["/definitely/not/here"])
            .with_id(1),
    ));

    let (stream, data) = frontend.expect_output();
    assert!(matches!(stream, StreamName::Stderr));
    assert!(data.contains("No such folder"));

    let response = frontend.expect_toplevel();
    assert_eq!(response.command_id, Some(1));
    assert!(response.error.is_none());

    frontend.finish();
}

#[test]
fn stdin_round_trip_through_input_request() {
    let mut frontend = Frontend::start();
    frontend.execute_source("name = input()\nprint('hello ' + name)\n", 1);

    match frontend.next_message() {
        MessageFromBackend::Event(BackendEvent::InputRequest { method, .. }) => {
            assert_eq!(method, "readline");
        }
        other => panic!("expected input request, got {other:?}"),
    }

    frontend.send(CommandToBackend::Input(InputSubmission {
        data: "world\n".to_owned(),
    }));

    let (_, data) = frontend.expect_output();
    assert_eq!(data, "hello world\n");
    assert!(frontend.expect_toplevel().user_exception.is_none());

    frontend.finish();
}

#[test]
fn shell_value_reporting_follows_exec_eval_rules() {
    let mut frontend = Frontend::start();

    // single bare expression: evaluated
    frontend.execute_source("1 + 2\n", 1);
    assert_eq!(frontend.expect_toplevel().value_info.unwrap().repr, "3");

    // statements followed by a bare expression: only the trailing value
    frontend.execute_source("x = 5\nx * 2\n", 2);
    assert_eq!(frontend.expect_toplevel().value_info.unwrap().repr, "10");

    // plain statements: no value
    frontend.execute_source("y = 1\n", 3);
    assert!(frontend.expect_toplevel().value_info.is_none());

    // `_` means the last computed value
    frontend.execute_source("_ * 10\n", 4);
    assert_eq!(frontend.expect_toplevel().value_info.unwrap().repr, "100");

    frontend.finish();
}

#[test]
fn globals_are_attached_to_toplevel_responses() {
    let mut frontend = Frontend::start();
    frontend.execute_source("answer = 42\n", 1);

    let response = frontend.expect_toplevel();
    let globals = response.globals.expect("globals");
    assert_eq!(globals["answer"].repr, "42");

    // and an inline query sees the same state
    frontend.send(CommandToBackend::Inline(
        InlineCommand::new("get_globals").with_id(2),
    ));
    match frontend.next_message() {
        MessageFromBackend::Inline(r) => {
            assert_eq!(r.command_id, Some(2));
            assert_eq!(r.globals.unwrap()["answer"].repr, "42");
        }
        other => panic!("expected inline response, got {other:?}"),
    }

    frontend.finish();
}

#[test]
fn debug_session_steps_pauses_and_completes() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("steps.py");
    std::fs::write(&script, "x = 1\ny = x + 1\nprint(y)\n").unwrap();

    let mut frontend = Frontend::start();
    frontend.send(CommandToBackend::Toplevel(
        ToplevelCommand::new("Debug")
            .with_args([script.to_str().unwrap()])
            .with_id(1),
    ));

    // first pause: before the first statement
    let pause = frontend.expect_debugger();
    assert!(pause.in_present);
    let top = pause.stack.last().unwrap();
    assert_eq!(top.code_name, "<module>");
    let focus = top.focus.expect("a focus range");
    assert_eq!(focus.lineno, 1);

    // step until the program finishes, collecting output and pause counts
    let mut pauses = 1;
    let mut output = String::new();
    'session: loop {
        frontend.send(CommandToBackend::Debugger(DebuggerCommand::new(
            StepAction::StepInto,
        )));
        loop {
            match frontend.next_message() {
                MessageFromBackend::Debugger(_) => {
                    pauses += 1;
                    assert!(pauses < 500, "debugger never finished");
                    break;
                }
                MessageFromBackend::Event(BackendEvent::ProgramOutput { data, .. }) => {
                    output.push_str(&data);
                }
                MessageFromBackend::Toplevel(response) => {
                    assert_eq!(response.command_id, Some(1));
                    assert!(response.user_exception.is_none());
                    break 'session;
                }
                other => panic!("unexpected message {other:?}"),
            }
        }
    }
    assert_eq!(output, "2\n");
    assert!(pauses > 3, "expected several pause points, saw {pauses}");

    frontend.finish();
}

#[test]
fn step_back_replays_an_earlier_state() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("back.py");
    std::fs::write(&script, "x = 1\ny = 2\nz = 3\n").unwrap();

    let mut frontend = Frontend::start();
    frontend.send(CommandToBackend::Toplevel(
        ToplevelCommand::new("Debug")
            .with_args([script.to_str().unwrap()])
            .with_id(1),
    ));

    let _first = frontend.expect_debugger();
    frontend.send(CommandToBackend::Debugger(DebuggerCommand::new(
        StepAction::StepInto,
    )));
    let _second = frontend.expect_debugger();
    frontend.send(CommandToBackend::Debugger(DebuggerCommand::new(
        StepAction::StepInto,
    )));
    let _third = frontend.expect_debugger();

    frontend.send(CommandToBackend::Debugger(DebuggerCommand::new(
        StepAction::StepBack,
    )));
    let replay = frontend.expect_debugger();
    assert!(!replay.in_present, "step_back must replay a cached state");

    // resume to completion
    frontend.send(CommandToBackend::Debugger(DebuggerCommand::new(
        StepAction::Resume,
    )));
    let response = frontend.expect_toplevel();
    assert!(response.user_exception.is_none());

    frontend.finish();
}

#[test]
fn resume_runs_to_breakpoint() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("bp.py");
    let path = script.to_str().unwrap().to_owned();
    std::fs::write(&script, "x = 1\ny = 2\nz = 3\n").unwrap();

    let mut frontend = Frontend::start();
    let mut cmd = ToplevelCommand::new("Debug")
        .with_args([path.as_str()])
        .with_id(1);
    cmd.breakpoints.entry(path.clone()).or_default().insert(3);
    frontend.send(CommandToBackend::Toplevel(cmd));

    // with breakpoints set, the first pause is already at the breakpoint
    let pause = frontend.expect_debugger();
    let top = pause.stack.last().unwrap();
    assert_eq!(top.focus.unwrap().lineno, 3);

    let mut resume = DebuggerCommand::new(StepAction::Resume);
    resume.breakpoints.entry(path).or_default().insert(3);
    resume.state = Some(top.event);
    resume.focus = top.focus;
    resume.frame_id = Some(top.id);
    frontend.send(CommandToBackend::Debugger(resume));

    let response = frontend.expect_toplevel();
    assert!(response.user_exception.is_none());

    frontend.finish();
}

#[test]
fn runtime_error_reports_classified_exception() {
    let mut frontend = Frontend::start();
    frontend.execute_source("def f():\n    return 1 / 0\nf()\n", 1);

    let response = frontend.expect_toplevel();
    let exc = response.user_exception.expect("an exception");
    assert_eq!(exc.type_name, "ZeroDivisionError");
    assert!(exc.items[0].text.contains("Traceback"));
    assert!(exc
        .items
        .iter()
        .any(|item| item.text.contains("in f")));
    assert!(exc.items.last().unwrap().text.contains("ZeroDivisionError"));

    frontend.finish();
}

#[test]
fn eof_ends_the_backend_cleanly() {
    let frontend = Frontend::start();
    assert_eq!(frontend.finish(), CLEAN_EXIT_CODE);
}

#[test]
fn dropped_controller_ends_the_backend_cleanly() {
    let (backend_conn, frontend_conn) = Connection::loopback_pair().unwrap();
    let interrupt = Arc::new(AtomicBool::new(false));
    let handle = thread::spawn(move || Backend::new(backend_conn, interrupt).run());

    // consume the handshake, then vanish
    let (mut reader, _writer) = frontend_conn.split();
    let _ = reader.read_line(TIMEOUT).unwrap();
    drop(reader);
    drop(_writer);

    assert_eq!(handle.join().expect("backend thread"), CLEAN_EXIT_CODE);
}
