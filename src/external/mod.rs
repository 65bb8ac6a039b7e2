//! External program invocation.
//!
//! Display metadata, the capture device listing and the encoder are all
//! separate OS programs. They are described by an [`ExternalCommand`] so the
//! program and its leading arguments can be swapped (different ffmpeg build,
//! wrapper script) without touching the callers.

use std::ffi::OsString;
use std::io;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;

/// Upper bound for report-style queries (display metadata, device listing).
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub struct ExternalCommand {
    program: OsString,
    args: Vec<OsString>,
    timeout: Duration,
}

impl ExternalCommand {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: QUERY_TIMEOUT,
        }
    }

    /// Append leading arguments placed before the caller's own.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Time limit for [`run_combined`](Self::run_combined) and
    /// [`run_stdout`](Self::run_stdout). Does not apply to [`command`](Self::command).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &OsString {
        &self.program
    }

    /// A fresh command with the program and leading arguments applied.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    /// Runs the program to completion with `extra` appended and returns
    /// stdout followed by stderr as one lossy UTF-8 string. The exit status is
    /// ignored: tools like `ffmpeg -list_devices` report through stderr and
    /// exit non-zero even on success.
    pub async fn run_combined(&self, extra: &[&str]) -> io::Result<String> {
        let output = self.output(extra).await?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }

    /// Like [`run_combined`](Self::run_combined) but returns stdout only, for
    /// tools whose stdout is a structured document.
    pub async fn run_stdout(&self, extra: &[&str]) -> io::Result<String> {
        let output = self.output(extra).await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn output(&self, extra: &[&str]) -> io::Result<Output> {
        let output = self
            .command()
            .args(extra)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        // On expiry the child is dropped, and with it killed.
        tokio::time::timeout(self.timeout, output)
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no result after {:?}", self.timeout),
                )
            })?
    }
}
