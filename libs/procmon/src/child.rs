//! Child process wrapper: output fan-out to tracing, signals, exit watch.
use std::{ffi::OsStr, process::ExitStatus, time::Duration};

use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::watch,
};
use tracing::{debug, error, info, warn};

use crate::ProcError;

/// Level child output lines are logged at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// log lines at debug
    Debug,
    /// log lines at info
    Info,
    /// log lines at warn
    Warn,
}

/// Builder for a supervised child.
#[derive(Debug)]
pub struct ChildBuilder {
    program: String,
    args: Vec<String>,
    prefix: String,
    stdout_level: LogLevel,
    stderr_level: LogLevel,
}

impl ChildBuilder {
    /// start building a child for `program`
    pub fn new(program: impl Into<String>) -> Self {
        let program = program.into();
        Self {
            prefix: program.clone(),
            program,
            args: Vec::new(),
            stdout_level: LogLevel::Debug,
            stderr_level: LogLevel::Warn,
        }
    }

    /// append an argument
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_string_lossy().into_owned());
        self
    }

    /// append arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_string_lossy().into_owned());
        }
        self
    }

    /// prefix attached to every logged output line
    pub fn log_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// level for stdout lines
    pub fn stdout_level(mut self, level: LogLevel) -> Self {
        self.stdout_level = level;
        self
    }

    /// level for stderr lines
    pub fn stderr_level(mut self, level: LogLevel) -> Self {
        self.stderr_level = level;
        self
    }

    /// Spawn the child. Its stdout/stderr are pumped into tracing line by
    /// line; the returned handle can signal the child and watch for exit.
    pub fn spawn(self) -> Result<ChildProcess, ProcError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let pid = child.id().ok_or_else(|| ProcError::Gone(self.program.clone()))? as i32;
        info!(program = %self.program, pid, "spawned");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(
                stdout,
                self.prefix.clone(),
                self.stdout_level,
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(
                stderr,
                self.prefix.clone(),
                self.stderr_level,
            ));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let program = self.program.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    debug!(%program, %status, "child exited");
                    let _ = exit_tx.send(Some(status));
                }
                Err(err) => {
                    error!(%program, ?err, "wait failed");
                    let _ = exit_tx.send(None);
                }
            }
        });

        Ok(ChildProcess {
            name: self.program,
            pid,
            exit: exit_rx,
        })
    }
}

async fn pump_lines<R>(reader: R, prefix: String, level: LogLevel)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match level {
            LogLevel::Debug => debug!(target: "procmon::child", "{prefix}: {line}"),
            LogLevel::Info => info!(target: "procmon::child", "{prefix}: {line}"),
            LogLevel::Warn => warn!(target: "procmon::child", "{prefix}: {line}"),
        }
    }
}

/// Handle on a spawned child.
#[derive(Debug, Clone)]
pub struct ChildProcess {
    name: String,
    pid: i32,
    exit: watch::Receiver<Option<ExitStatus>>,
}

impl ChildProcess {
    /// the child's pid
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// the program name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send a signal (SIGHUP for reload, SIGTERM to stop, ...).
    pub fn signal(&self, sig: Signal) -> Result<(), ProcError> {
        kill(Pid::from_raw(self.pid), sig)?;
        Ok(())
    }

    /// has the child exited?
    pub fn exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Watch channel that flips to `Some(status)` on exit.
    pub fn wait_chan(&self) -> watch::Receiver<Option<ExitStatus>> {
        self.exit.clone()
    }

    /// Wait for the child to exit.
    pub async fn wait(&mut self) -> Option<ExitStatus> {
        if let Some(status) = *self.exit.borrow() {
            return Some(status);
        }
        // the sender dropping also ends the wait
        let _ = self.exit.changed().await;
        *self.exit.borrow()
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL.
    pub async fn shutdown(&mut self, grace: Duration) {
        if self.exited() {
            return;
        }
        if let Err(err) = self.signal(Signal::SIGTERM) {
            debug!(name = %self.name, ?err, "sigterm failed");
        }
        if tokio::time::timeout(grace, self.wait()).await.is_err() {
            warn!(name = %self.name, "did not stop in {grace:?}, killing");
            let _ = self.signal(Signal::SIGKILL);
            let _ = self.wait().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn child_exit_is_observed() {
        let mut child = ChildBuilder::new("/bin/sh")
            .args(["-c", "exit 3"])
            .spawn()
            .unwrap();
        let status = child.wait().await.expect("exit status seen");
        assert_eq!(status.code(), Some(3));
        assert!(child.exited());
    }

    #[tokio::test]
    async fn shutdown_terminates_a_sleeper() {
        let mut child = ChildBuilder::new("/bin/sh")
            .args(["-c", "sleep 30"])
            .spawn()
            .unwrap();
        child.shutdown(Duration::from_secs(2)).await;
        assert!(child.exited());
    }

    #[tokio::test]
    async fn wait_chan_can_be_watched_independently() {
        let child = ChildBuilder::new("/bin/sh")
            .args(["-c", "exit 0"])
            .spawn()
            .unwrap();
        let mut chan = child.wait_chan();
        chan.wait_for(Option::is_some).await.unwrap();
    }
}
