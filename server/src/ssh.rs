//! Backend reached through the system `ssh` client.
//!
//! The remote command line echoes its own pid as the very first line so the
//! controller can target it with a kill signal later; the regular ack line
//! follows. Killing the local `ssh` process does not reliably kill the
//! remote backend, so interrupt and kill both go through a second short
//! `ssh` invocation against the recorded pid.

use std::process::{Child, Command, Stdio};

use eyre::{OptionExt, WrapErr};
use transport::Connection;

use crate::{
    kill_and_reap, read_ack, spawn_with_pipes, BackendProcess, ExitStatusKind, LaunchedBackend,
    ACK_TIMEOUT,
};

pub struct SshProcess {
    child: Child,
    target: SshTarget,
    remote_pid: u32,
    exited: Option<ExitStatusKind>,
}

#[derive(Clone)]
struct SshTarget {
    host: String,
    user: Option<String>,
    port: Option<u16>,
}

impl SshTarget {
    fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o").arg("BatchMode=yes");
        if let Some(port) = self.port {
            cmd.arg("-p").arg(port.to_string());
        }
        cmd.arg(self.destination());
        cmd
    }
}

pub fn launch(
    host: &str,
    user: Option<&str>,
    port: Option<u16>,
    remote_command: &str,
) -> eyre::Result<LaunchedBackend> {
    let target = SshTarget {
        host: host.to_owned(),
        user: user.map(str::to_owned),
        port,
    };
    tracing::debug!(destination = %target.destination(), "starting ssh backend");

    let mut command = target.command();
    // `echo $$` prints the pid that `exec` then reuses for the backend
    command
        .arg("--")
        .arg("sh")
        .arg("-c")
        .arg(format!("echo $$; exec {remote_command}"));

    let mut child = spawn_with_pipes(&mut command)?;
    let mut connection =
        Connection::from_child(&mut child).expect("stdio was requested as piped");

    let pid_line = connection
        .reader
        .read_line(ACK_TIMEOUT)
        .wrap_err("reading remote pid")?
        .ok_or_eyre("remote side printed nothing before the timeout")?;
    let remote_pid: u32 = pid_line.trim().parse().map_err(|_| {
        let _ = child.kill();
        let _ = child.wait();
        eyre::eyre!("expected the remote pid as the first line, got {pid_line:?}")
    })?;

    read_ack(&mut connection, &mut child)?;
    tracing::debug!(remote_pid, "ssh backend ready");

    let stderr: Option<Box<dyn std::io::Read + Send>> = child
        .stderr
        .take()
        .map(|s| Box::new(s) as Box<dyn std::io::Read + Send>);

    Ok(LaunchedBackend {
        connection,
        stderr,
        process: Box::new(SshProcess {
            child,
            target,
            remote_pid,
            exited: None,
        }),
    })
}

impl SshProcess {
    fn signal_remote(&self, signal: &str) -> eyre::Result<()> {
        let status = self
            .target
            .command()
            .arg("--")
            .arg("kill")
            .arg(format!("-{signal}"))
            .arg(self.remote_pid.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .wrap_err("running remote kill")?;
        if !status.success() {
            eyre::bail!("remote kill -{signal} {} failed", self.remote_pid);
        }
        Ok(())
    }
}

impl BackendProcess for SshProcess {
    fn interrupt(&mut self) -> eyre::Result<()> {
        self.signal_remote("INT")
    }

    fn try_wait(&mut self) -> eyre::Result<Option<ExitStatusKind>> {
        if let Some(kind) = self.exited {
            return Ok(Some(kind));
        }
        match self.child.try_wait().wrap_err("polling ssh client")? {
            Some(status) => {
                // the ssh client forwards the remote exit code
                let kind = crate::classify_exit(status);
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
        if let Err(e) = self.signal_remote("TERM") {
            tracing::warn!(error = %e, "remote termination failed; relying on local kill");
        }
        let kind = kill_and_reap(&mut self.child)?;
        self.exited = Some(kind);
        Ok(kind)
    }

    fn kind_name(&self) -> &'static str {
        "ssh"
    }
}

impl Drop for SshProcess {
    fn drop(&mut self) {
        if self.exited.is_none() {
            if let Err(e) = self.kill_and_wait() {
                tracing::warn!(error = %e, "could not terminate ssh backend");
            }
        }
    }
}
