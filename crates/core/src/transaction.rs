//! One pending commit against a repository branch.
//!
//! A transaction stages file modifications, deletions and merge parents in
//! memory, then emits a single contiguous `commit` block on
//! [`Transaction::commit`]. Blob payloads are the exception: they stream to
//! the channel immediately through the [`BlobWriter`] handed out by
//! [`Transaction::add_file`], so large file contents are never buffered.
//!
//! Dropping a transaction without committing abandons it; the
//! outstanding-transaction slot is released on every exit path, and the
//! blob half of the mark space is reclaimed once no transaction is pending.

use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::channel::FastImportChannel;
use crate::errors::RepositoryError;
use crate::marks::NOTES_MARK;
use crate::repository::{format_metadata_message, MarkFrom, RepoInner};

/// Commit message marker of a known conversion-tool artifact whose extra
/// merge parents must be collapsed to the newest one.
const CVS2SVN_MARKER: &str = "This commit was manufactured by cvs2svn";

/// Hard importer limit on commit parents, first parent included.
const MAX_PARENTS: usize = 16;

/// A single staged commit. Created by `Repository::new_transaction`.
pub struct Transaction {
    inner: Arc<Mutex<RepoInner>>,
    channel: Arc<Mutex<FastImportChannel>>,
    repository: String,
    prefix: String,
    branch: String,
    svnprefix: String,
    revision: u64,
    dry_run: bool,
    author: String,
    datetime: u64,
    log: String,
    merges: Vec<u32>,
    deleted_files: Vec<String>,
    modified_files: Vec<u8>,
}

impl Transaction {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        inner: Arc<Mutex<RepoInner>>,
        channel: Arc<Mutex<FastImportChannel>>,
        repository: String,
        prefix: String,
        branch: String,
        svnprefix: String,
        revision: u64,
        dry_run: bool,
    ) -> Self {
        Self {
            inner,
            channel,
            repository,
            prefix,
            branch,
            svnprefix,
            revision,
            dry_run,
            author: String::new(),
            datetime: 0,
            log: String::new(),
            merges: Vec::new(),
            deleted_files: Vec::new(),
            modified_files: Vec::new(),
        }
    }

    pub fn set_author(&mut self, author: impl Into<String>) {
        self.author = author.into();
    }

    pub fn set_date_time(&mut self, datetime: u64) {
        self.datetime = datetime;
    }

    pub fn set_log(&mut self, log: impl Into<String>) {
        self.log = log.into();
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Record that this commit copies content from `branch_from` as of
    /// `revision`: the source's mark becomes a merge parent. Self-merges
    /// and unresolvable sources are warnings, not errors.
    pub fn note_copy_from_branch(&mut self, branch_from: &str, revision: u64) {
        debug_assert!(branch_from.starts_with("refs/"));
        if self.branch == branch_from {
            warn!(
                repository = %self.repository,
                branch = %self.branch,
                "cannot merge inside a branch"
            );
            return;
        }

        let resolved = self.inner.lock().unwrap().mark_from(branch_from, revision);
        match resolved {
            MarkFrom::UnknownBranch => {
                warn!(
                    repository = %self.repository,
                    branch = %self.branch,
                    from = branch_from,
                    "copying from a branch that doesn't exist, continuing, \
                     assuming the files exist"
                );
            }
            MarkFrom::NotFound => {
                warn!(
                    repository = %self.repository,
                    from = branch_from,
                    revision,
                    "unknown revision, continuing, assuming the files exist"
                );
            }
            MarkFrom::Mark { mark, .. } => {
                if self.merges.contains(&mark) {
                    debug!(repository = %self.repository, mark, "merge point already recorded");
                } else {
                    debug!(
                        repository = %self.repository,
                        from = branch_from,
                        revision,
                        mark,
                        "adding merge point"
                    );
                    self.merges.push(mark);
                }
            }
        }
    }

    /// Stage the deletion of `path`. The empty path means "delete
    /// everything".
    pub fn delete_file(&mut self, path: &str) {
        let mut full = format!("{}{}", self.prefix, path);
        if full.ends_with('/') {
            full.pop();
        }
        self.deleted_files.push(full);
    }

    /// Stage a modification of `path` with the given octal `mode` and a
    /// payload of exactly `length` bytes, returning the writer the payload
    /// must be streamed into before any other channel use.
    pub fn add_file(
        &mut self,
        path: &str,
        mode: u32,
        length: u64,
    ) -> Result<BlobWriter<'_>, RepositoryError> {
        let mark = {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            let mark = inner.allocator.next_blob_mark()?;
            if !self.dry_run {
                inner.ensure_running()?;
            }
            mark
        };

        self.modified_files.extend_from_slice(
            format!("M {:o} :{} {}{}\n", mode, mark, self.prefix, path).as_bytes(),
        );

        if self.dry_run {
            return Ok(BlobWriter {
                channel: None,
                remaining: length,
            });
        }

        let mut channel = self.channel.lock().unwrap();
        channel.write_raw(format!("blob\nmark :{}\ndata {}\n", mark, length).as_bytes())?;
        Ok(BlobWriter {
            channel: Some(channel),
            remaining: length,
        })
    }

    /// Emit the staged commit and block until the channel drained.
    pub fn commit(mut self) -> Result<(), RepositoryError> {
        let out = {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            inner.ensure_running()?;

            let mark = inner.allocator.next_commit_mark()?;

            let mut message = std::mem::take(&mut self.log);
            if !message.ends_with('\n') {
                message.push('\n');
            }
            if inner.config.add_metadata {
                message.push('\n');
                message.push_str(&format_metadata_message(&self.svnprefix, self.revision, None));
            }

            let br = inner.branches.entry(self.branch.clone()).or_default();
            let parent_mark = match br.last_mark() {
                Some(m) if br.is_created() && m != 0 => m,
                _ => {
                    if inner.incremental {
                        warn!(
                            repository = %self.repository,
                            branch = %self.branch,
                            revision = self.revision,
                            "branch doesn't exist at this revision -- did you \
                             resume from the wrong revision?"
                        );
                    }
                    br.set_created(self.revision);
                    0
                }
            };
            br.record(self.revision, mark);

            let mut out = Vec::with_capacity(message.len() + self.modified_files.len() + 512);
            out.extend_from_slice(
                format!(
                    "commit {}\nmark :{}\ncommitter {} {} +0000\ndata {}\n",
                    self.branch,
                    mark,
                    self.author,
                    self.datetime,
                    message.len()
                )
                .as_bytes(),
            );
            out.extend_from_slice(message.as_bytes());
            out.push(b'\n');

            // merge parents
            let mut desc = String::new();
            if message.contains(CVS2SVN_MARKER) && self.merges.len() > 1 {
                self.merges.sort_unstable();
                let top = *self.merges.last().expect("merges is non-empty");
                debug!(
                    repository = %self.repository,
                    mark = top,
                    "discarding all but the highest merge point of a \
                     cvs2svn-manufactured commit"
                );
                out.extend_from_slice(format!("merge :{}\n", top).as_bytes());
            } else {
                let mut parents = usize::from(parent_mark != 0);
                for &merge in &self.merges {
                    if merge == parent_mark {
                        debug!(
                            repository = %self.repository,
                            mark = merge,
                            "skipping merge marker matching the parent"
                        );
                        continue;
                    }
                    parents += 1;
                    if parents > MAX_PARENTS {
                        warn!(repository = %self.repository, branch = %self.branch, "too many merge parents");
                        break;
                    }
                    desc.push_str(&format!(" :{}", merge));
                    out.extend_from_slice(format!("merge :{}\n", merge).as_bytes());
                }
            }

            // file operations
            if self.deleted_files.iter().any(|p| p.is_empty()) {
                out.extend_from_slice(b"deleteall\n");
            } else {
                for path in &self.deleted_files {
                    out.extend_from_slice(format!("D {}\n", path).as_bytes());
                }
            }
            out.extend_from_slice(&self.modified_files);

            let merge_comment = if desc.is_empty() {
                String::new()
            } else {
                format!(" # merge from{}", desc)
            };
            out.extend_from_slice(
                format!(
                    "\nprogress SVN r{} branch {} = :{}{}\n\n",
                    self.revision, self.branch, mark, merge_comment
                )
                .as_bytes(),
            );
            out
        };

        self.channel.lock().unwrap().write(&out)?;
        debug!(
            repository = %self.repository,
            branch = %self.branch,
            revision = self.revision,
            deletions = self.deleted_files.len(),
            "commit written"
        );

        let add_notes = self.inner.lock().unwrap().config.add_metadata_notes;
        if add_notes {
            let note = format_metadata_message(&self.svnprefix, self.revision, None);
            self.commit_note(&note, false)?;
        }

        self.channel.lock().unwrap().flush()?;
        Ok(())
    }

    /// Attach a note to the branch's current tip on `refs/notes/commits`,
    /// either replacing or appending to the branch's accumulated note text.
    pub fn commit_note(&mut self, note_text: &str, append: bool) -> Result<(), RepositoryError> {
        self.write_note(note_text, append, None)
    }

    fn write_note(
        &mut self,
        note_text: &str,
        append: bool,
        commit: Option<&str>,
    ) -> Result<(), RepositoryError> {
        debug_assert!(self.branch.starts_with("refs/"));
        let commit_ref = commit.unwrap_or(&self.branch);

        let mut text = note_text.to_string();
        let mut message = format!("Adding Git note for current {}\n", commit_ref);
        if append && commit.is_none() {
            let existing = self
                .inner
                .lock()
                .unwrap()
                .branches
                .get(&self.branch)
                .and_then(|b| b.note().map(String::from));
            if let Some(existing) = existing.filter(|n| !n.is_empty()) {
                text = format!("{}{}", existing, note_text);
                message = format!("Appending Git note for current {}\n", commit_ref);
            }
        }

        let mut out = Vec::new();
        out.extend_from_slice(
            format!(
                "commit refs/notes/commits\nmark :{}\ncommitter {} {} +0000\ndata {}\n",
                NOTES_MARK,
                self.author,
                self.datetime,
                message.len()
            )
            .as_bytes(),
        );
        out.extend_from_slice(message.as_bytes());
        out.push(b'\n');
        out.extend_from_slice(format!("N inline {}\ndata {}\n", commit_ref, text.len()).as_bytes());
        out.extend_from_slice(text.as_bytes());
        out.push(b'\n');

        self.channel.lock().unwrap().write(&out)?;

        if commit.is_none() {
            self.inner.lock().unwrap().set_branch_note(&self.branch, text);
        }
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.forget_transaction();
        }
    }
}

// ---------------------------------------------------------------------------
// Blob payload writer
// ---------------------------------------------------------------------------

/// Streams exactly the declared number of payload bytes into the channel.
/// Holds the channel exclusively, so no other write can interleave with the
/// payload. In dry-run mode the bytes are counted and discarded.
pub struct BlobWriter<'a> {
    channel: Option<MutexGuard<'a, FastImportChannel>>,
    remaining: u64,
}

impl BlobWriter<'_> {
    /// Bytes the caller still has to produce.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Verify the payload is complete and release the channel.
    pub fn finish(mut self) -> std::io::Result<()> {
        if self.remaining != 0 {
            let missing = self.remaining;
            self.remaining = 0;
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!("blob payload short by {} bytes", missing),
            ));
        }
        Ok(())
    }
}

impl Write for BlobWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if buf.len() as u64 > self.remaining {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "blob payload exceeds declared length",
            ));
        }
        if let Some(channel) = &mut self.channel {
            channel
                .write_raw(buf)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::BrokenPipe, e.to_string()))?;
        }
        self.remaining -= buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Some(channel) = &mut self.channel {
            channel
                .flush()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::BrokenPipe, e.to_string()))?;
        }
        Ok(())
    }
}

impl Drop for BlobWriter<'_> {
    fn drop(&mut self) {
        if self.remaining != 0 {
            warn!(
                remaining = self.remaining,
                "blob payload shorter than its declared length"
            );
        }
    }
}
