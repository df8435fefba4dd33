//! Channel to a long-running `fast-import` child process.
//!
//! One channel owns at most one child. Spawning is lazy: the repository
//! calls [`FastImportChannel::spawn`] on the first write after construction
//! or after a graceful [`FastImportChannel::close`]. The child's stdout and
//! stderr are merged and appended to the repository's progress log, which
//! is how `progress` commands end up recorded on disk.
//!
//! Two write modes exist: [`FastImportChannel::write`] echoes the bytes
//! into an optional diagnostic tee, [`FastImportChannel::write_raw`]
//! bypasses it. Blob payloads go through the raw mode so binary data never
//! lands in the tee.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::errors::ChannelError;

/// How long a closing child may take to drain and exit on its own.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(30);

/// Grace period after a kill before giving up on the child entirely.
const KILL_WAIT: Duration = Duration::from_millis(200);

#[derive(Debug)]
enum ChannelState {
    NotRunning,
    Running { child: Child, stdin: ChildStdin },
    /// Dry-run passthrough: the protocol is generated but every byte is
    /// discarded.
    DryRun,
}

/// Owns the child process, its stdin writer and its lifecycle.
#[derive(Debug)]
pub struct FastImportChannel {
    repository: String,
    git_executable: String,
    workdir: PathBuf,
    /// Marks file name relative to `workdir`; import and export point at
    /// the same file so the child reloads what it last checkpointed.
    marks_file: String,
    /// Progress log path receiving the child's merged stdout/stderr.
    log_file: PathBuf,
    dry_run: bool,
    tee: Option<fs::File>,
    state: ChannelState,
    process_has_started: bool,
}

impl FastImportChannel {
    pub fn new(
        repository: impl Into<String>,
        git_executable: impl Into<String>,
        workdir: impl Into<PathBuf>,
        marks_file: impl Into<String>,
        log_file: impl Into<PathBuf>,
        dry_run: bool,
    ) -> Self {
        Self {
            repository: repository.into(),
            git_executable: git_executable.into(),
            workdir: workdir.into(),
            marks_file: marks_file.into(),
            log_file: log_file.into(),
            dry_run,
            tee: None,
            state: ChannelState::NotRunning,
            process_has_started: false,
        }
    }

    /// Install a diagnostic tee receiving every logged-mode write.
    pub fn set_tee(&mut self, file: fs::File) {
        self.tee = Some(file);
    }

    /// Whether a child (or the dry-run passthrough) is accepting writes.
    /// A child that exited on its own is detected here and demoted to
    /// not-running, which makes the next spawn attempt fail loudly.
    pub fn is_running(&mut self) -> bool {
        let alive = match &mut self.state {
            ChannelState::NotRunning => return false,
            ChannelState::DryRun => return true,
            ChannelState::Running { child, .. } => matches!(child.try_wait(), Ok(None)),
        };
        if !alive {
            self.state = ChannelState::NotRunning;
        }
        alive
    }

    /// Start the child. Refuses to restart a child that crashed: a channel
    /// that was started once and lost its child without a graceful close
    /// would otherwise loop on the crash.
    pub fn spawn(&mut self) -> Result<(), ChannelError> {
        if self.is_running() {
            return Ok(());
        }
        if self.process_has_started {
            return Err(ChannelError::AlreadyCrashed {
                repository: self.repository.clone(),
            });
        }
        self.process_has_started = true;

        if self.dry_run {
            debug!(repository = %self.repository, "dry run, using discarding passthrough");
            self.state = ChannelState::DryRun;
            return Ok(());
        }

        let spawn_err = |source| ChannelError::SpawnFailed {
            repository: self.repository.clone(),
            binary: self.git_executable.clone(),
            source,
        };
        let log = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
            .map_err(spawn_err)?;
        let log_stderr = log.try_clone().map_err(spawn_err)?;

        let mut child = Command::new(&self.git_executable)
            .arg("fast-import")
            .arg(format!("--import-marks={}", self.marks_file))
            .arg(format!("--export-marks={}", self.marks_file))
            .arg("--force")
            .current_dir(&self.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_stderr))
            .spawn()
            .map_err(spawn_err)?;

        let stdin = child.stdin.take().ok_or_else(|| ChannelError::Died {
            repository: self.repository.clone(),
            detail: "stdin was not captured".into(),
        })?;

        info!(
            repository = %self.repository,
            pid = child.id(),
            "spawned fast-import child"
        );
        self.state = ChannelState::Running { child, stdin };
        Ok(())
    }

    /// Logged-mode write: the bytes reach the child and the tee.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
        if let Some(tee) = &mut self.tee {
            let _ = tee.write_all(bytes);
        }
        self.write_raw(bytes)
    }

    /// Raw write bypassing the tee; used for blob payloads.
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
        match &mut self.state {
            ChannelState::NotRunning => Err(ChannelError::Died {
                repository: self.repository.clone(),
                detail: "channel is not running".into(),
            }),
            ChannelState::DryRun => Ok(()),
            ChannelState::Running { stdin, .. } => {
                stdin.write_all(bytes).map_err(|e| ChannelError::Died {
                    repository: self.repository.clone(),
                    detail: e.to_string(),
                })
            }
        }
    }

    /// Block until everything written so far reached the child's pipe.
    pub fn flush(&mut self) -> Result<(), ChannelError> {
        match &mut self.state {
            ChannelState::Running { stdin, .. } => {
                stdin.flush().map_err(|e| ChannelError::Died {
                    repository: self.repository.clone(),
                    detail: e.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Graceful shutdown: checkpoint, close the write side, wait for the
    /// child to drain and exit; escalate to a kill if it will not.
    ///
    /// Closing re-arms the channel: a later write may spawn a fresh child.
    pub fn close(&mut self) {
        match std::mem::replace(&mut self.state, ChannelState::NotRunning) {
            ChannelState::Running {
                mut child,
                mut stdin,
            } => {
                let _ = stdin.write_all(b"checkpoint\n");
                let _ = stdin.flush();
                drop(stdin);

                if !wait_with_timeout(&mut child, SHUTDOWN_WAIT) {
                    warn!(repository = %self.repository, "fast-import did not exit, killing it");
                    let _ = child.kill();
                    if !wait_with_timeout(&mut child, KILL_WAIT) {
                        warn!(repository = %self.repository, "fast-import did not die");
                    }
                } else {
                    debug!(repository = %self.repository, "fast-import closed");
                }
            }
            ChannelState::DryRun | ChannelState::NotRunning => {}
        }
        self.process_has_started = false;
    }
}

impl Drop for FastImportChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Err(_) => return true,
            Ok(None) => {
                if Instant::now() >= deadline {
                    return false;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dry_channel() -> FastImportChannel {
        FastImportChannel::new("repo", "git", "/nonexistent", "marks-repo", "log-repo", true)
    }

    #[test]
    fn test_dry_run_accepts_writes() {
        let mut ch = dry_channel();
        assert!(!ch.is_running());
        ch.spawn().unwrap();
        assert!(ch.is_running());
        ch.write(b"commit refs/heads/master\n").unwrap();
        ch.write_raw(b"blob payload").unwrap();
        ch.flush().unwrap();
    }

    #[test]
    fn test_write_without_spawn_fails() {
        let mut ch = dry_channel();
        assert!(matches!(
            ch.write(b"x"),
            Err(ChannelError::Died { .. })
        ));
    }

    #[test]
    fn test_close_rearms_spawn() {
        let mut ch = dry_channel();
        ch.spawn().unwrap();
        ch.close();
        assert!(!ch.is_running());
        // graceful close allows a respawn
        ch.spawn().unwrap();
        assert!(ch.is_running());
    }

    #[test]
    fn test_tee_receives_logged_writes_only() {
        let dir = tempfile::tempdir().unwrap();
        let tee_path = dir.path().join("tee");
        let mut ch = dry_channel();
        ch.set_tee(fs::File::create(&tee_path).unwrap());
        ch.spawn().unwrap();

        ch.write(b"reset refs/heads/master\n").unwrap();
        ch.write_raw(b"BINARY").unwrap();

        let teed = fs::read(&tee_path).unwrap();
        assert_eq!(teed, b"reset refs/heads/master\n");
    }

    #[test]
    fn test_crashed_child_refuses_respawn() {
        // Simulate the crash by marking the channel started and forcing the
        // not-running state without a graceful close.
        let mut ch = dry_channel();
        ch.spawn().unwrap();
        ch.process_has_started = true;
        ch.state = ChannelState::NotRunning;
        assert!(matches!(
            ch.spawn(),
            Err(ChannelError::AlreadyCrashed { .. })
        ));
    }
}
