//! Child process lifecycle: locate, spawn, pump output, cancel, reap.

use crate::error::SupervisorError;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// One line of child output with the line terminator removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: Stream,
    pub text: String,
}

/// How the OS reported the exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    /// `None` when the process was terminated without an exit code.
    pub code: Option<i32>,
    pub crashed: bool,
}

/// First candidate that exists as a file.
pub fn resolve_executable(candidates: &[PathBuf]) -> Result<PathBuf, SupervisorError> {
    candidates
        .iter()
        .find(|p| p.is_file())
        .cloned()
        .ok_or_else(|| SupervisorError::NotFound {
            tried: candidates.to_vec(),
        })
}

#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    start_timeout: Duration,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self {
            start_timeout: DEFAULT_START_TIMEOUT,
        }
    }
}

impl ProcessSupervisor {
    pub fn with_start_timeout(start_timeout: Duration) -> Self {
        Self { start_timeout }
    }

    /// Spawn `path` and start pumping its stdout and stderr into the returned channel.
    ///
    /// The channel closes once both streams reach EOF. If the spawn does not complete
    /// within the start timeout the call fails, and a late child is killed and reaped
    /// in the background.
    pub async fn start(
        &self,
        path: &Path,
        args: &[String],
        working_dir: &Path,
    ) -> Result<(ProcessHandle, mpsc::UnboundedReceiver<OutputLine>), SupervisorError> {
        let mut cmd = Command::new(path);
        cmd.args(args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        self.start_with(path, move || cmd.spawn()).await
    }

    /// Like [`start`](Self::start), with the blocking spawn step supplied by the caller.
    /// `spawn` runs on the blocking pool inside this runtime's context.
    pub async fn start_with<F>(
        &self,
        path: &Path,
        spawn: F,
    ) -> Result<(ProcessHandle, mpsc::UnboundedReceiver<OutputLine>), SupervisorError>
    where
        F: FnOnce() -> std::io::Result<Child> + Send + 'static,
    {
        // The child has to be registered with this runtime's process driver.
        let rt = tokio::runtime::Handle::current();
        let mut spawn = tokio::task::spawn_blocking(move || {
            let _guard = rt.enter();
            spawn()
        });

        let spawned = match tokio::time::timeout(self.start_timeout, &mut spawn).await {
            Ok(joined) => joined.map_err(|e| std::io::Error::other(e.to_string()))?,
            Err(_) => {
                tracing::warn!(path = %path.display(), "process start timed out");
                tokio::spawn(async move {
                    if let Ok(Ok(mut late)) = spawn.await {
                        tracing::debug!(pid = ?late.id(), "killing late child");
                        let _ = late.kill().await;
                    }
                });
                return Err(SupervisorError::StartTimeout(self.start_timeout));
            }
        };

        let mut child = spawned.map_err(|source| SupervisorError::StartFailed {
            path: path.to_path_buf(),
            source,
        })?;

        let Some(pid) = child.id() else {
            return Err(SupervisorError::StartFailed {
                path: path.to_path_buf(),
                source: std::io::Error::other("process exited before it was observed running"),
            });
        };

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(out) = child.stdout.take() {
            tokio::spawn(pump_lines(out, Stream::Stdout, tx.clone()));
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(pump_lines(err, Stream::Stderr, tx));
        }

        tracing::info!(pid, path = %path.display(), "process started");
        Ok((ProcessHandle { child, pid }, rx))
    }
}

async fn pump_lines<R>(reader: R, stream: Stream, tx: mpsc::UnboundedSender<OutputLine>)
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
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                let text = String::from_utf8_lossy(&buf).into_owned();
                if tx.send(OutputLine { stream, text }).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(?stream, "output read failed: {e}");
                break;
            }
        }
    }
}

/// A spawned child. Owned by exactly one run; the process is killed if the handle
/// is dropped before it has been reaped.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: u32,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Send a kill signal if the process is still running. Returns whether a signal
    /// was sent; repeated calls and calls after exit do nothing.
    pub fn request_cancel(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => match self.child.start_kill() {
                Ok(()) => {
                    tracing::info!(pid = self.pid, "kill signal sent");
                    true
                }
                Err(e) => {
                    tracing::debug!(pid = self.pid, "kill failed: {e}");
                    false
                }
            },
            _ => false,
        }
    }

    /// Wait for the process to exit. Cancel safe.
    pub async fn wait(&mut self) -> std::io::Result<ExitReport> {
        let status = self.child.wait().await?;
        Ok(ExitReport {
            code: status.code(),
            crashed: status.code().is_none(),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn script(dir: &Path, body: &str) -> Vec<String> {
        let path = dir.join("run.sh");
        std::fs::write(&path, body).unwrap();
        vec![path.display().to_string()]
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<OutputLine>) -> Vec<OutputLine> {
        let mut out = Vec::new();
        while let Some(line) = rx.recv().await {
            out.push(line);
        }
        out
    }

    #[test]
    fn resolves_first_existing_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("solver");
        std::fs::write(&present, b"").unwrap();
        let candidates = vec![dir.path().join("missing"), present.clone(), dir.path().into()];
        assert_eq!(resolve_executable(&candidates).unwrap(), present);
    }

    #[test]
    fn directories_do_not_count_as_executables() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_executable(&[dir.path().to_path_buf()]).unwrap_err();
        assert!(matches!(err, SupervisorError::NotFound { ref tried } if tried.len() == 1));
    }

    #[tokio::test]
    async fn pumps_both_streams_and_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let args = script(
            dir.path(),
            "echo '[LOAD:OK:1:2:3:4]'\nprintf 'warn\\r\\n' >&2\nprintf 'tail'\nexit 3\n",
        );
        let (mut handle, rx) = ProcessSupervisor::default()
            .start(Path::new("/bin/sh"), &args, dir.path())
            .await
            .unwrap();
        assert!(handle.pid() > 0);

        let report = handle.wait().await.unwrap();
        assert_eq!(
            report,
            ExitReport {
                code: Some(3),
                crashed: false
            }
        );

        let lines = collect(rx).await;
        let stdout: Vec<_> = lines
            .iter()
            .filter(|l| l.stream == Stream::Stdout)
            .map(|l| l.text.as_str())
            .collect();
        assert_eq!(stdout, ["[LOAD:OK:1:2:3:4]", "tail"]);
        assert!(lines.contains(&OutputLine {
            stream: Stream::Stderr,
            text: "warn".into()
        }));
    }

    #[tokio::test]
    async fn cancel_kills_once_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let args = script(dir.path(), "exec sleep 30\n");
        let (mut handle, _rx) = ProcessSupervisor::default()
            .start(Path::new("/bin/sh"), &args, dir.path())
            .await
            .unwrap();

        assert!(handle.request_cancel());
        let report = handle.wait().await.unwrap();
        assert!(report.crashed);
        assert_eq!(report.code, None);
        assert!(!handle.request_cancel());
    }

    fn is_alive(pid: u32) -> bool {
        std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn slow_spawn_times_out_and_late_child_is_reaped() {
        let late_pid = std::sync::Arc::new(std::sync::Mutex::new(None));
        let seen = late_pid.clone();
        let err = ProcessSupervisor::with_start_timeout(Duration::from_millis(50))
            .start_with(Path::new("/bin/sh"), move || {
                std::thread::sleep(Duration::from_millis(300));
                let child = Command::new("/bin/sh")
                    .args(["-c", "exec sleep 30"])
                    .kill_on_drop(true)
                    .spawn()?;
                *seen.lock().unwrap() = child.id();
                Ok(child)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::StartTimeout(d) if d == Duration::from_millis(50)));

        let mut pid = None;
        for _ in 0..100 {
            pid = *late_pid.lock().unwrap();
            if pid.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let pid = pid.expect("late child was spawned");

        let mut gone = false;
        for _ in 0..250 {
            if !is_alive(pid) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(gone, "late child {pid} still exists");
    }

    #[tokio::test]
    async fn missing_binary_fails_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProcessSupervisor::default()
            .start(&dir.path().join("nope"), &[], dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::StartFailed { .. }));
    }
}
