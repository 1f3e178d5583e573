//! Backend process lifecycle.
//!
//! Spawns the backend (directly, or wrapped in an `ssh` client for remote
//! hosts), performs the startup handshake, and owns the dirty parts of
//! process control: delivering interrupts and making sure a killed process
//! has actually exited before its resources are reused.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use eyre::{OptionExt, WrapErr};
use transport::{Connection, ALL_EXPLAINED_EXIT_CODE, CLEAN_EXIT_CODE, PROCESS_ACK};

pub mod local;
pub mod ssh;

/// How long to wait for the startup acknowledgment line.
const ACK_TIMEOUT: Duration = Duration::from_secs(10);
/// Grace period between killing a process and giving up on its exit.
const EXIT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub enum LaunchOptions {
    Local {
        executable: PathBuf,
        args: Vec<String>,
        cwd: Option<PathBuf>,
        env: BTreeMap<String, String>,
    },
    Ssh {
        host: String,
        user: Option<String>,
        port: Option<u16>,
        /// Command line to start the backend on the remote side.
        remote_command: String,
    },
}

impl LaunchOptions {
    pub fn kind_name(&self) -> &'static str {
        match self {
            LaunchOptions::Local { .. } => "local",
            LaunchOptions::Ssh { .. } => "ssh",
        }
    }
}

/// How a finished backend process is to be interpreted by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatusKind {
    /// The controller asked for this exit; nothing to report.
    RequestedExit,
    /// Fatal internal error already reported to the user on stderr; do not
    /// pile a second diagnostic on top.
    AllExplained,
    /// Unexpected exit; surface "connection lost" with the code.
    Crashed(i32),
    /// Killed by a signal.
    Signalled,
}

pub fn classify_exit(status: std::process::ExitStatus) -> ExitStatusKind {
    match status.code() {
        Some(CLEAN_EXIT_CODE) => ExitStatusKind::RequestedExit,
        Some(ALL_EXPLAINED_EXIT_CODE) => ExitStatusKind::AllExplained,
        Some(code) => ExitStatusKind::Crashed(code),
        None => ExitStatusKind::Signalled,
    }
}

/// A live backend process plus the consumed handshake.
pub struct LaunchedBackend {
    pub connection: Connection,
    /// The process's stderr; the controller forwards it as error output.
    pub stderr: Option<Box<dyn Read + Send>>,
    pub process: Box<dyn BackendProcess>,
}

impl std::fmt::Debug for LaunchedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchedBackend")
            .field("process", &self.process.kind_name())
            .finish_non_exhaustive()
    }
}

pub trait BackendProcess: Send {
    /// Delivers a keyboard interrupt without going through the command
    /// queue.
    fn interrupt(&mut self) -> eyre::Result<()>;

    /// `Ok(None)` while still running.
    fn try_wait(&mut self) -> eyre::Result<Option<ExitStatusKind>>;

    /// Kills the process and blocks until the OS has reaped it (bounded by
    /// a grace period) - only then may shared resources be reused.
    fn kill_and_wait(&mut self) -> eyre::Result<ExitStatusKind>;

    fn kind_name(&self) -> &'static str;
}

pub fn launch(options: &LaunchOptions) -> eyre::Result<LaunchedBackend> {
    match options {
        LaunchOptions::Local {
            executable,
            args,
            cwd,
            env,
        } => local::launch(executable, args, cwd.as_deref(), env),
        LaunchOptions::Ssh {
            host,
            user,
            port,
            remote_command,
        } => ssh::launch(host, user.as_deref(), *port, remote_command),
    }
}

fn spawn_with_pipes(command: &mut Command) -> eyre::Result<Child> {
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .wrap_err_with(|| format!("spawning backend process: {command:?}"))
}

/// Consumes the fixed acknowledgment line. Anything else on the first line
/// means the process did not come up as a backend.
fn read_ack(connection: &mut Connection, child: &mut Child) -> eyre::Result<()> {
    let line = connection
        .reader
        .read_line(ACK_TIMEOUT)
        .wrap_err("reading startup acknowledgment")
        .and_then(|line| line.ok_or_eyre("backend printed nothing before the timeout"));

    match line {
        Ok(line) if line == PROCESS_ACK => Ok(()),
        Ok(line) => {
            let _ = child.kill();
            let _ = child.wait();
            eyre::bail!("unexpected first line from backend: {line:?}");
        }
        Err(e) => {
            let _ = child.kill();
            let _ = child.wait();
            Err(e)
        }
    }
}

/// Kill, then poll for the real exit within the grace period.
fn kill_and_reap(child: &mut Child) -> eyre::Result<ExitStatusKind> {
    if let Ok(Some(status)) = child.try_wait() {
        return Ok(classify_exit(status));
    }
    child.kill().wrap_err("killing backend process")?;

    let attempts = (EXIT_GRACE.as_millis() / 50) as usize;
    let result = retry::retry(
        retry::delay::Fixed::from_millis(50).take(attempts),
        || match child.try_wait() {
            Ok(Some(status)) => Ok(status),
            Ok(None) => Err("still running"),
            Err(_) => Err("wait failed"),
        },
    );

    match result {
        Ok(status) => Ok(classify_exit(status)),
        Err(_) => {
            // SIGKILL cannot be refused; make the reaping unconditional
            let status = child.wait().wrap_err("waiting for killed backend")?;
            Ok(classify_exit(status))
        }
    }
}
