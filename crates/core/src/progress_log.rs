//! Replay and truncation of the append-only progress log.
//!
//! The log is authored by the fast-import child: the importer echoes every
//! `progress` command to its stdout, and the channel appends the child's
//! merged stdout/stderr to this file. The engine itself only reads the log
//! on resume, truncates it past a cutoff, and manages the `.old` backup
//! used to roll back after a failed run.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::errors::LogError;

fn progress_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^progress SVN r(\d+) branch (.*) = :(\d+)$").expect("valid regex")
    })
}

/// One `progress SVN r<rev> branch <ref> = :<mark>` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub revision: u64,
    pub branch: String,
    pub mark: u32,
}

/// Result of replaying a log against a cutoff and a marks high-water mark.
#[derive(Debug)]
pub struct Replay {
    /// Records before the cutoff whose marks the child acknowledged.
    pub entries: Vec<LogEntry>,
    /// The caller's cutoff, rewound if an unacknowledged mark was found.
    pub cutoff: u64,
    /// Byte offset at which the log must be truncated, if at all.
    pub truncate_offset: Option<u64>,
    /// Highest revision among the accepted records.
    pub last_revision: u64,
}

/// Handle on a repository's progress log file.
#[derive(Debug, Clone)]
pub struct ProgressLog {
    path: PathBuf,
}

impl ProgressLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn backup_path(&self) -> PathBuf {
        let mut os = self.path.clone().into_os_string();
        os.push(".old");
        PathBuf::from(os)
    }

    /// Parse the log in order, stopping at the first record at or past
    /// `cutoff` or the first record whose mark the marks file never
    /// acknowledged (the child was killed mid-commit; the cutoff rewinds to
    /// that revision).
    ///
    /// Lines that are not progress records — importer chatter, reload
    /// markers — are skipped. Trailing `#` comments are stripped before
    /// matching. Non-monotonic revision numbers are accepted with a warning.
    pub fn replay(
        &self,
        cutoff: u64,
        high_water: u32,
        repository: &str,
    ) -> Result<Replay, LogError> {
        let file = fs::File::open(&self.path)?;
        let mut reader = BufReader::new(file);

        let mut entries = Vec::new();
        let mut last_revision: u64 = 0;
        let mut offset: u64 = 0;
        let mut lineno: u64 = 0;
        let mut buf = Vec::new();

        loop {
            let line_start = offset;
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf)?;
            if n == 0 {
                break;
            }
            offset += n as u64;
            lineno += 1;

            let text = String::from_utf8_lossy(&buf);
            let mut text = text.as_ref();
            if let Some(hash) = text.find('#') {
                text = &text[..hash];
            }
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            let Some(caps) = progress_re().captures(text) else {
                continue;
            };

            let revision: u64 = caps[1].parse().map_err(|_| LogError::Corrupt {
                path: self.path.clone(),
                line: lineno,
                detail: "revision number out of range".into(),
            })?;
            let mark: u32 = caps[3].parse().map_err(|_| LogError::Corrupt {
                path: self.path.clone(),
                line: lineno,
                detail: "mark out of range".into(),
            })?;

            if revision >= cutoff {
                return Ok(Replay {
                    entries,
                    cutoff,
                    truncate_offset: Some(line_start),
                    last_revision,
                });
            }
            if revision < last_revision {
                warn!(
                    repository,
                    previous = last_revision,
                    got = revision,
                    "revision numbers are not monotonic"
                );
            }
            if mark > high_water {
                warn!(
                    repository,
                    revision, mark, high_water,
                    "unknown commit mark found: rewinding -- did you hit Ctrl-C?"
                );
                return Ok(Replay {
                    entries,
                    cutoff: revision,
                    truncate_offset: Some(line_start),
                    last_revision,
                });
            }

            last_revision = revision;
            entries.push(LogEntry {
                revision,
                branch: caps[2].to_string(),
                mark,
            });
        }

        Ok(Replay {
            entries,
            cutoff,
            truncate_offset: None,
            last_revision,
        })
    }

    /// Cut the log at `offset`, keeping a `.old` copy so a failed run can
    /// be rolled back with [`ProgressLog::restore`].
    pub fn truncate(&self, offset: u64) -> Result<(), LogError> {
        let backup = self.backup_path();
        let _ = fs::remove_file(&backup);
        fs::copy(&self.path, &backup)?;

        debug!(path = %self.path.display(), offset, "truncating progress log");
        let file = fs::OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(offset)?;
        Ok(())
    }

    /// Drop the `.old` backup after a run completed successfully.
    pub fn discard_backup(&self) {
        let _ = fs::remove_file(self.backup_path());
    }

    /// Put the backup back in place after a failed run.
    pub fn restore(&self) -> Result<(), LogError> {
        let backup = self.backup_path();
        if !backup.exists() {
            return Ok(());
        }
        let _ = fs::remove_file(&self.path);
        fs::rename(&backup, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with(content: &str) -> (tempfile::TempDir, ProgressLog) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log-repo");
        fs::write(&path, content).unwrap();
        (dir, ProgressLog::new(path))
    }

    #[test]
    fn test_replay_parses_records_and_comments() {
        let (_dir, log) = log_with(
            "progress SVN r1 branch refs/heads/master = :1\n\
             importer chatter that is ignored\n\
             progress SVN r2 branch refs/heads/topic = :2 # from branch refs/heads/master at r1\n",
        );
        let replay = log.replay(u64::MAX, 10, "repo").unwrap();
        assert_eq!(
            replay.entries,
            vec![
                LogEntry {
                    revision: 1,
                    branch: "refs/heads/master".into(),
                    mark: 1
                },
                LogEntry {
                    revision: 2,
                    branch: "refs/heads/topic".into(),
                    mark: 2
                },
            ]
        );
        assert_eq!(replay.last_revision, 2);
        assert!(replay.truncate_offset.is_none());
    }

    #[test]
    fn test_replay_stops_at_cutoff() {
        let (_dir, log) = log_with(
            "progress SVN r1 branch refs/heads/master = :1\n\
             progress SVN r5 branch refs/heads/master = :2\n",
        );
        let replay = log.replay(5, 10, "repo").unwrap();
        assert_eq!(replay.entries.len(), 1);
        assert_eq!(replay.cutoff, 5);
        // truncation begins at the first beyond-cutoff line
        assert_eq!(
            replay.truncate_offset,
            Some("progress SVN r1 branch refs/heads/master = :1\n".len() as u64)
        );
    }

    #[test]
    fn test_replay_rewinds_on_unacknowledged_mark() {
        let (_dir, log) = log_with(
            "progress SVN r40 branch refs/heads/master = :15\n\
             progress SVN r42 branch refs/heads/master = :17\n",
        );
        let replay = log.replay(u64::MAX, 15, "repo").unwrap();
        assert_eq!(replay.entries.len(), 1);
        assert_eq!(replay.cutoff, 42);
        assert!(replay.truncate_offset.is_some());
    }

    #[test]
    fn test_replay_accepts_non_monotonic_revisions() {
        let (_dir, log) = log_with(
            "progress SVN r7 branch refs/heads/a = :1\n\
             progress SVN r3 branch refs/heads/b = :2\n",
        );
        let replay = log.replay(u64::MAX, 10, "repo").unwrap();
        assert_eq!(replay.entries.len(), 2);
        assert_eq!(replay.last_revision, 3);
    }

    #[test]
    fn test_truncate_backs_up_and_restore_rolls_back() {
        let original = "progress SVN r1 branch refs/heads/master = :1\n\
                        progress SVN r2 branch refs/heads/master = :2\n";
        let (_dir, log) = log_with(original);
        let first_len = "progress SVN r1 branch refs/heads/master = :1\n".len() as u64;

        log.truncate(first_len).unwrap();
        assert_eq!(
            fs::read_to_string(log.path()).unwrap().len() as u64,
            first_len
        );

        log.restore().unwrap();
        assert_eq!(fs::read_to_string(log.path()).unwrap(), original);
    }

    #[test]
    fn test_discard_backup_removes_stale_copy() {
        let (_dir, log) = log_with("progress SVN r1 branch refs/heads/master = :1\n");
        log.truncate(0).unwrap();
        log.discard_backup();
        // nothing left to restore, the truncated log stays
        log.restore().unwrap();
        assert_eq!(fs::read_to_string(log.path()).unwrap(), "");
    }
}
