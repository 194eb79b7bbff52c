use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, Notify};

use crate::error::Result;


const DRAIN_GRACE: Duration = Duration::from_secs(1);

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("valid regex"));


pub fn strip_ansi(line: &str) -> String {
    ANSI_ESCAPE.replace_all(line, "").into_owned()
}


#[derive(Clone, Debug)]
pub struct ProcessCommand {
    program: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl ProcessCommand {
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args: vec![],
            env: vec![],
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn command_line(&self) -> String {
        let mut line = self.program.to_string_lossy().into_owned();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}


/// A child process whose output is forwarded line by line and which can be
/// asked to stop from another task.
///
/// Stopping is best effort: only the direct child receives the signal, so
/// anything it spawned may keep running for a while.
#[derive(Debug, Default)]
pub struct Process {
    kill: Notify,
}

impl Process {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Signal the child. A request made before the child is spawned is kept
    /// and applied as soon as it starts.
    pub fn kill(&self) {
        self.kill.notify_one();
    }

    /// Runs `command` to completion and returns its exit code. Output lines,
    /// stripped of color codes, go to `lines` in the order each stream
    /// produced them. A signal-terminated child reports `128 + signal`.
    pub async fn run(
        self: Arc<Self>,
        command: &ProcessCommand,
        lines: mpsc::UnboundedSender<String>,
    ) -> Result<i32> {
        let mut child = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child.stdout.take().map(|out| {
            tokio::spawn(forward_lines(out, lines.clone()))
        });
        let stderr = child.stderr.take().map(|err| {
            tokio::spawn(forward_lines(err, lines.clone()))
        });
        drop(lines);

        let status = loop {
            tokio::select! {
                status = child.wait() => break status?,
                _ = self.kill.notified() => {
                    if let Err(err) = child.start_kill() {
                        tracing::debug!(error = %err, "Could not signal process");
                    }
                }
            }
        };

        // Background descendants may hold the pipes open past the exit.
        for mut reader in [stdout, stderr].into_iter().flatten() {
            if tokio::time::timeout(DRAIN_GRACE, &mut reader).await.is_err() {
                tracing::debug!("Process output still open after exit, detaching");
                reader.abort();
            }
        }

        Ok(exit_code(status))
    }
}


async fn forward_lines<R>(reader: R, lines: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                if lines.send(strip_ansi(line)).is_err() {
                    break;
                }
            }
            Err(err) => {
                tracing::debug!(error = %err, "Process output stream closed");
                break;
            }
        }
    }
}


#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_codes_are_removed() {
        assert_eq!(strip_ansi("\x1b[32mINFO\x1b[0m done"), "INFO done");
        assert_eq!(strip_ansi("\x1b[1;31mERROR\x1b[39m"), "ERROR");
        assert_eq!(strip_ansi("plain"), "plain");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn collects_both_streams_and_exit_code() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let command = ProcessCommand::new("/bin/sh")
            .args(["-c", "echo out; printf '\\033[33mwarn\\033[0m\\n' >&2; exit 3"]);
        let code = Process::new().run(&command, tx).await.unwrap();
        assert_eq!(code, 3);

        let mut lines = vec![];
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        lines.sort();
        assert_eq!(lines, vec!["out".to_string(), "warn".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_before_spawn_is_applied() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let process = Process::new();
        process.kill();
        let command = ProcessCommand::new("/bin/sh").args(["-c", "sleep 30"]);
        let code = process.run(&command, tx).await.unwrap();
        assert_eq!(code, 128 + 9);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_is_not_held_up_by_background_children() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let command = ProcessCommand::new("/bin/sh").args(["-c", "sleep 6 & echo done; exit 0"]);
        let code = tokio::time::timeout(Duration::from_secs(3), Process::new().run(&command, tx))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(rx.recv().await.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let command = ProcessCommand::new("/nonexistent/engine");
        assert!(Process::new().run(&command, tx).await.is_err());
    }
}
