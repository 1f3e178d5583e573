//! Backend spawned directly on this machine.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::{Child, Command};

use eyre::WrapErr;
use transport::Connection;

use crate::{
    classify_exit, kill_and_reap, read_ack, spawn_with_pipes, BackendProcess, ExitStatusKind,
    LaunchedBackend,
};

pub struct LocalProcess {
    child: Child,
    exited: Option<ExitStatusKind>,
}

pub fn launch(
    executable: &Path,
    args: &[String],
    cwd: Option<&Path>,
    env: &BTreeMap<String, String>,
) -> eyre::Result<LaunchedBackend> {
    tracing::debug!(executable = %executable.display(), "starting local backend");

    let mut command = Command::new(executable);
    command.args(args);
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }
    for (key, value) in env {
        command.env(key, value);
    }

    let mut child = spawn_with_pipes(&mut command)?;
    let mut connection =
        Connection::from_child(&mut child).expect("stdio was requested as piped");
    read_ack(&mut connection, &mut child)?;
    tracing::debug!(pid = child.id(), "local backend ready");

    let stderr: Option<Box<dyn std::io::Read + Send>> = child
        .stderr
        .take()
        .map(|s| Box::new(s) as Box<dyn std::io::Read + Send>);

    Ok(LaunchedBackend {
        connection,
        stderr,
        process: Box::new(LocalProcess {
            child,
            exited: None,
        }),
    })
}

impl BackendProcess for LocalProcess {
    #[cfg(unix)]
    fn interrupt(&mut self) -> eyre::Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let pid = Pid::from_raw(self.child.id() as i32);
        kill(pid, Signal::SIGINT).wrap_err("delivering SIGINT to backend")
    }

    #[cfg(not(unix))]
    fn interrupt(&mut self) -> eyre::Result<()> {
        eyre::bail!("signal-based interrupt is unavailable on this platform");
    }

    fn try_wait(&mut self) -> eyre::Result<Option<ExitStatusKind>> {
        if let Some(kind) = self.exited {
            return Ok(Some(kind));
        }
        match self.child.try_wait().wrap_err("polling backend process")? {
            Some(status) => {
                let kind = classify_exit(status);
                self.exited = Some(kind);
                Ok(Some(kind))
            }
            None => Ok(None),
        }
    }

    fn kill_and_wait(&mut self) -> eyre::Result<ExitStatusKind> {
        if let Some(kind) = self.exited {
            return Ok(kind);
        }
        let kind = kill_and_reap(&mut self.child)?;
        self.exited = Some(kind);
        Ok(kind)
    }

    fn kind_name(&self) -> &'static str {
        "local"
    }
}

impl Drop for LocalProcess {
    fn drop(&mut self) {
        if self.exited.is_none() {
            tracing::debug!("terminating backend process");
            match self.kill_and_wait() {
                Ok(_) => tracing::debug!("backend terminated"),
                Err(e) => tracing::warn!(error = %e, "could not terminate backend process"),
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::io::IsTerminal;

    use tracing_subscriber::EnvFilter;

    use super::*;
    use crate::LaunchOptions;

    fn init_test_logger() {
        let _ = color_eyre::install();
        if std::io::stderr().is_terminal() {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::from_default_env())
                .try_init();
        } else {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::from_default_env())
                .json()
                .try_init();
        }
    }

    fn shell_backend(script: &str) -> LaunchOptions {
        LaunchOptions::Local {
            executable: "/bin/sh".into(),
            args: vec!["-c".to_owned(), script.to_owned()],
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    #[test]
    fn handshake_succeeds_for_a_well_behaved_process() {
        init_test_logger();
        let launched = crate::launch(&shell_backend("echo OK; cat")).expect("launching");
        let mut process = launched.process;
        assert!(process.try_wait().unwrap().is_none());
        assert!(matches!(
            process.kill_and_wait().unwrap(),
            ExitStatusKind::Signalled
        ));
    }

    #[test]
    fn wrong_first_line_fails_the_launch() {
        init_test_logger();
        let err = crate::launch(&shell_backend("echo NOPE; cat")).unwrap_err();
        assert!(err.to_string().contains("unexpected first line"));
    }

    #[test]
    fn silent_process_fails_the_launch_within_the_timeout() {
        init_test_logger();
        // the process exits immediately without the ack; the launch must
        // error out rather than hang
        let err = crate::launch(&shell_backend("exit 3")).unwrap_err();
        assert!(!err.to_string().is_empty());
    }

    #[test]
    fn requested_exit_code_is_classified() {
        init_test_logger();
        let launched = crate::launch(&shell_backend("echo OK; exit 17")).expect("launching");
        let mut process = launched.process;

        let mut status = None;
        for _ in 0..100 {
            status = process.try_wait().unwrap();
            if status.is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert_eq!(status, Some(ExitStatusKind::RequestedExit));
    }

    #[test]
    fn crash_codes_are_preserved() {
        init_test_logger();
        let launched = crate::launch(&shell_backend("echo OK; exit 5")).expect("launching");
        let mut process = launched.process;

        let mut status = None;
        for _ in 0..100 {
            status = process.try_wait().unwrap();
            if status.is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert_eq!(status, Some(ExitStatusKind::Crashed(5)));
    }

    #[test]
    fn kill_and_wait_is_idempotent() {
        init_test_logger();
        let launched = crate::launch(&shell_backend("echo OK; cat")).expect("launching");
        let mut process = launched.process;
        let first = process.kill_and_wait().unwrap();
        let second = process.kill_and_wait().unwrap();
        assert_eq!(first, second);
    }
}
