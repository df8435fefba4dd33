//! Top-level coordinator for one target repository.
//!
//! A [`Repository`] owns its branch histories, its mark allocator, its
//! importer channel and the on-disk marks/log files. It hands out
//! [`Transaction`]s for individual commits, buffers branch create/delete
//! commands until the driver flushes a revision, and knows how to rebuild
//! all of this state from disk when a run resumes.
//!
//! The handle is cheap to clone: several transactions on one repository may
//! be outstanding at once (a single SVN revision can touch several
//! branches), and each carries its own handle.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, info, instrument, warn};

use crate::branch::Branch;
use crate::channel::FastImportChannel;
use crate::config::ExportConfig;
use crate::errors::{MarksError, RepositoryError};
use crate::marks::{self, MarkAllocator, NOTES_MARK};
use crate::process_cache::ProcessCache;
use crate::progress_log::ProgressLog;
use crate::rules::RepositoryRule;
use crate::transaction::Transaction;

/// Sentinel a deletion resets its ref to.
pub(crate) const NULL_SHA: &str = "0000000000000000000000000000000000000000";

fn sanitized(name: &str) -> String {
    name.replace('/', "_")
}

/// `marks-<name>` with path separators flattened.
pub(crate) fn marks_file_name(name: &str) -> String {
    format!("marks-{}", sanitized(name))
}

/// `log-<name>` with path separators flattened.
pub(crate) fn log_file_name(name: &str) -> String {
    format!("log-{}", sanitized(name))
}

/// The SVN metadata line appended to commit messages and notes.
pub(crate) fn format_metadata_message(svnprefix: &str, revision: u64, tag: Option<&str>) -> String {
    let mut msg = format!("svn path={}; revision={}", svnprefix, revision);
    if let Some(tag) = tag {
        msg.push_str("; tag=");
        msg.push_str(tag);
    }
    msg.push('\n');
    msg
}

/// Result of resolving a branch + revision to a mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MarkFrom {
    /// The branch was never created or has no records at all.
    UnknownBranch,
    /// The branch exists but has no usable mark at that revision (not yet
    /// reached, or deleted there).
    NotFound,
    /// A usable mark, together with the revision it was recorded at.
    Mark { mark: u32, at_revision: u64 },
}

/// An annotated tag queued for `finalize_tags`.
#[derive(Debug, Clone)]
struct AnnotatedTag {
    supporting_ref: String,
    svnprefix: String,
    revision: u64,
    author: String,
    datetime: u64,
    log: String,
}

struct SubmoduleParent {
    repo: Weak<Mutex<RepoInner>>,
    #[allow(dead_code)] // consumed once gitlink updates are implemented
    path: String,
}

pub(crate) struct RepoInner {
    pub(crate) name: String,
    pub(crate) prefix: String,
    pub(crate) config: Arc<ExportConfig>,
    cache: Arc<ProcessCache>,
    pub(crate) channel: Arc<Mutex<FastImportChannel>>,
    progress_log: ProgressLog,
    marks_path: PathBuf,
    pub(crate) branches: BTreeMap<String, Branch>,
    annotated_tags: BTreeMap<String, AnnotatedTag>,
    deleted_branches: BTreeMap<String, Vec<u8>>,
    reset_branches: BTreeMap<String, Vec<u8>>,
    pub(crate) allocator: MarkAllocator,
    commit_count: u64,
    outstanding_transactions: u32,
    pub(crate) incremental: bool,
    submodule_parent: Option<SubmoduleParent>,
}

/// Cloneable handle on one target repository.
#[derive(Clone)]
pub struct Repository {
    name: Arc<str>,
    config: Arc<ExportConfig>,
    inner: Arc<Mutex<RepoInner>>,
}

impl Repository {
    /// Create the coordinator for `rule`, initializing the on-disk bare
    /// repository and an empty marks file when they do not exist yet
    /// (skipped entirely in dry-run mode).
    #[instrument(skip_all, fields(repository = %rule.name))]
    pub fn new(
        rule: &RepositoryRule,
        config: Arc<ExportConfig>,
        cache: Arc<ProcessCache>,
        incremental: bool,
    ) -> Result<Self, RepositoryError> {
        let name = rule.name.clone();
        let workdir = config.data_dir.join(&name);
        let marks_name = marks_file_name(&name);
        let marks_path = workdir.join(&marks_name);
        let log_path = config.data_dir.join(log_file_name(&name));

        let mut branches = BTreeMap::new();
        for rule_branch in &rule.branches {
            branches.insert(rule_branch.git_ref_name(), Branch::declared());
        }
        // the default branch exists from the start
        branches.insert("refs/heads/master".to_string(), Branch::created_at(1));

        let mut channel = FastImportChannel::new(
            name.clone(),
            config.git_executable.clone(),
            workdir.clone(),
            marks_name,
            log_path.clone(),
            config.dry_run,
        );
        if config.log_fast_import {
            fs::create_dir_all(&config.data_dir)?;
            let tee_path = config.data_dir.join(format!("{}.fi", log_file_name(&name)));
            let tee = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&tee_path)?;
            channel.set_tee(tee);
        }

        if !config.dry_run && !workdir.exists() {
            info!("creating new repository");
            fs::create_dir_all(&workdir)?;
            let status = Command::new(&config.git_executable)
                .arg("--bare")
                .arg("init")
                .current_dir(&workdir)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .map_err(|e| RepositoryError::InitFailed {
                    repository: name.clone(),
                    detail: e.to_string(),
                })?;
            if !status.success() {
                return Err(RepositoryError::InitFailed {
                    repository: name.clone(),
                    detail: format!(
                        "'{} --bare init' exited with {}",
                        config.git_executable, status
                    ),
                });
            }
            // the child is always started with --import-marks
            fs::write(&marks_path, b"")?;
        }

        let inner = RepoInner {
            name: name.clone(),
            prefix: rule.prefix.clone(),
            config: config.clone(),
            cache,
            channel: Arc::new(Mutex::new(channel)),
            progress_log: ProgressLog::new(log_path),
            marks_path,
            branches,
            annotated_tags: BTreeMap::new(),
            deleted_branches: BTreeMap::new(),
            reset_branches: BTreeMap::new(),
            allocator: MarkAllocator::new(name.as_str()),
            commit_count: 0,
            outstanding_transactions: 0,
            incremental,
            submodule_parent: None,
        };

        Ok(Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register the repository that embeds this one as a submodule. The
    /// back-reference is weak and must not form a cycle.
    pub fn set_submodule_parent(&self, parent: &Repository, path: impl Into<String>) {
        self.inner.lock().unwrap().submodule_parent = Some(SubmoduleParent {
            repo: Arc::downgrade(&parent.inner),
            path: path.into(),
        });
    }

    // -----------------------------------------------------------------------
    // Incremental resume
    // -----------------------------------------------------------------------

    /// Rebuild branch state from the progress log and the marks file,
    /// truncating the log where the previous run was interrupted. Returns
    /// the first revision the driver must replay; `cutoff` is rewound when
    /// an unacknowledged mark proves the child died mid-commit.
    ///
    /// Disk and metadata work only; the child is not started.
    #[instrument(skip(self), fields(repository = %self.name))]
    pub fn setup_incremental(&self, cutoff: &mut u64) -> Result<u64, RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;

        if !inner.progress_log.exists() {
            return Ok(1);
        }

        let high_water = match marks::last_valid_mark(&inner.marks_path) {
            Ok(mark) => mark,
            Err(MarksError::Corrupt { path, line }) => {
                warn!(
                    path = %path.display(),
                    line,
                    "marks file corrupt, rewinding to the beginning"
                );
                0
            }
            Err(e) => return Err(e.into()),
        };

        let replay = inner.progress_log.replay(*cutoff, high_water, &inner.name)?;
        for entry in &replay.entries {
            inner.allocator.record_high_water(entry.mark);
            let br = inner.branches.entry(entry.branch.clone()).or_default();
            // a zero tail mark means the branch was deleted; the next
            // record re-creates it
            if !br.is_created() || entry.mark == 0 || br.last_mark().map_or(true, |m| m == 0) {
                br.set_created(entry.revision);
            }
            br.record(entry.revision, entry.mark);
        }
        debug!(
            entries = replay.entries.len(),
            high_water, "rebuilt branch state from progress log"
        );

        if let Some(offset) = replay.truncate_offset {
            *cutoff = replay.cutoff;
            debug!(cutoff, "truncating history");
            inner.progress_log.truncate(offset)?;
            return Ok(*cutoff);
        }

        let next = replay.last_revision + 1;
        if next == *cutoff {
            // a stale backup would confuse a later restore
            inner.progress_log.discard_backup();
        }
        Ok(next)
    }

    /// Roll the progress log back to its pre-run state after a failed run.
    pub fn restore_log(&self) -> Result<(), RepositoryError> {
        self.inner.lock().unwrap().progress_log.restore()?;
        Ok(())
    }

    /// Drop the truncation backup after the run completed successfully.
    pub fn discard_log_backup(&self) {
        self.inner.lock().unwrap().progress_log.discard_backup();
    }

    // -----------------------------------------------------------------------
    // Branch operations
    // -----------------------------------------------------------------------

    /// Create `branch` at `revision` from `branch_from` as of
    /// `branch_from_rev`. Fails when the source branch is unknown; a source
    /// with no exported commits produces an empty branch and a warning.
    #[instrument(skip(self), fields(repository = %self.name))]
    pub fn create_branch(
        &self,
        branch: &str,
        revision: u64,
        branch_from: &str,
        branch_from_rev: u64,
    ) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        debug_assert!(branch.starts_with("refs/"));
        debug_assert!(branch_from.starts_with("refs/"));

        let mut desc = format!("from branch {}", branch_from);
        let (mark, reset_to) = match inner.mark_from(branch_from, branch_from_rev) {
            MarkFrom::UnknownBranch => {
                return Err(RepositoryError::UnknownSourceBranch {
                    source_branch: branch_from.to_string(),
                    target: branch.to_string(),
                    repository: inner.name.clone(),
                });
            }
            MarkFrom::NotFound => {
                warn!(
                    branch,
                    "branching but no exported commits exist in repository, \
                     creating an empty branch"
                );
                desc.push_str(", deleted/unknown");
                (0, branch_from.to_string())
            }
            MarkFrom::Mark { mark, at_revision } => {
                desc.push_str(&format!(" at r{}", branch_from_rev));
                if at_revision != branch_from_rev {
                    desc.push_str(&format!(" => r{}", at_revision));
                }
                (mark, format!(":{}", mark))
            }
        };

        debug!(branch, from = branch_from, rev = branch_from_rev, %desc, "creating branch");

        // a new branch starts out with the source branch's note text
        let note = inner
            .branches
            .get(branch_from)
            .and_then(|b| b.note().map(String::from));
        inner
            .branches
            .entry(branch.to_string())
            .or_default()
            .set_note(note);

        inner.reset_branch(branch, revision, mark, &reset_to, &desc);
        Ok(())
    }

    /// Delete `branch` at `revision`. Deleting `refs/heads/master` is
    /// silently a no-op.
    #[instrument(skip(self), fields(repository = %self.name))]
    pub fn delete_branch(&self, branch: &str, revision: u64) -> Result<(), RepositoryError> {
        debug_assert!(branch.starts_with("refs/"));
        if branch == "refs/heads/master" {
            return Ok(());
        }
        let mut inner = self.inner.lock().unwrap();
        inner.reset_branch(branch, revision, 0, NULL_SHA, "delete");
        Ok(())
    }

    /// Flush the buffered branch deletions and resets for the current
    /// revision, deletions first. No-op when nothing is pending.
    pub fn commit(&self) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        if inner.deleted_branches.is_empty() && inner.reset_branches.is_empty() {
            return Ok(());
        }
        inner.ensure_running()?;
        {
            let mut channel = inner.channel.lock().unwrap();
            for cmd in inner.deleted_branches.values() {
                channel.write(cmd)?;
            }
            for cmd in inner.reset_branches.values() {
                channel.write(cmd)?;
            }
        }
        inner.deleted_branches.clear();
        inner.reset_branches.clear();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Open a transaction for one commit on `branch`.
    pub fn new_transaction(
        &self,
        branch: &str,
        svnprefix: &str,
        revision: u64,
    ) -> Result<Transaction, RepositoryError> {
        debug_assert!(branch.starts_with("refs/"));
        let (channel, prefix) = {
            let mut inner = self.inner.lock().unwrap();
            let inner = &mut *inner;

            if !inner.branches.contains_key(branch) {
                debug!(repository = %inner.name, branch, "creating branch");
            }

            inner.commit_count += 1;
            if inner.commit_count % inner.config.commit_interval == 0 {
                inner.ensure_running()?;
                inner.channel.lock().unwrap().write(b"checkpoint\n")?;
                debug!(repository = %inner.name, "checkpoint");
            }
            inner.outstanding_transactions += 1;
            (inner.channel.clone(), inner.prefix.clone())
        };

        Ok(Transaction::new(
            self.inner.clone(),
            channel,
            self.name.to_string(),
            prefix,
            branch.to_string(),
            svnprefix.to_string(),
            revision,
            self.config.dry_run,
        ))
    }

    // -----------------------------------------------------------------------
    // Annotated tags
    // -----------------------------------------------------------------------

    /// Record (or overwrite) an annotated tag to be flushed by
    /// [`Repository::finalize_tags`].
    pub fn create_annotated_tag(
        &self,
        ref_name: &str,
        svnprefix: &str,
        revision: u64,
        author: &str,
        datetime: u64,
        log: &str,
    ) {
        debug_assert!(ref_name.starts_with("refs/"));
        let tag_name = ref_name
            .strip_prefix("refs/tags/")
            .unwrap_or(ref_name)
            .to_string();

        let mut inner = self.inner.lock().unwrap();
        if inner.annotated_tags.contains_key(&tag_name) {
            debug!(repository = %inner.name, tag = %tag_name, "re-creating annotated tag");
        } else {
            debug!(repository = %inner.name, tag = %tag_name, supporting_ref = ref_name, "creating annotated tag");
        }
        inner.annotated_tags.insert(
            tag_name,
            AnnotatedTag {
                supporting_ref: ref_name.to_string(),
                svnprefix: svnprefix.to_string(),
                revision,
                author: author.to_string(),
                datetime,
                log: log.to_string(),
            },
        );
    }

    /// Emit a `tag` block for every recorded annotated tag, with an
    /// optional metadata note on the supporting ref's tip.
    #[instrument(skip(self), fields(repository = %self.name))]
    pub fn finalize_tags(&self) -> Result<(), RepositoryError> {
        let tags: Vec<(String, AnnotatedTag)> = {
            let inner = self.inner.lock().unwrap();
            if inner.annotated_tags.is_empty() {
                return Ok(());
            }
            inner
                .annotated_tags
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        debug!(count = tags.len(), "finalizing annotated tags");
        self.inner.lock().unwrap().ensure_running()?;

        for (tag_name, tag) in &tags {
            debug_assert!(tag.supporting_ref.starts_with("refs/"));
            let mut message = tag.log.clone();
            if !message.ends_with('\n') {
                message.push('\n');
            }
            if self.config.add_metadata {
                message.push('\n');
                message.push_str(&format_metadata_message(
                    &tag.svnprefix,
                    tag.revision,
                    Some(tag_name),
                ));
            }

            let mut block = Vec::new();
            block.extend_from_slice(
                format!(
                    "progress Creating annotated tag {} from ref {}\n",
                    tag_name, tag.supporting_ref
                )
                .as_bytes(),
            );
            block.extend_from_slice(
                format!(
                    "tag {}\nfrom {}\ntagger {} {} +0000\ndata {}\n",
                    tag_name,
                    tag.supporting_ref,
                    tag.author,
                    tag.datetime,
                    message.len()
                )
                .as_bytes(),
            );

            {
                let inner = self.inner.lock().unwrap();
                let mut channel = inner.channel.lock().unwrap();
                channel.write(&block)?;
                channel.write(message.as_bytes())?;
                channel.write(b"\n")?;
                channel.flush()?;
            }

            // There is no easy way to attach a note to the tag itself with
            // fast-import, so the note lands on the supporting ref's tip.
            if self.config.add_metadata_notes {
                let mut txn =
                    self.new_transaction(&tag.supporting_ref, &tag.svnprefix, tag.revision)?;
                txn.set_author(&tag.author);
                txn.set_date_time(tag.datetime);
                txn.commit_note(
                    &format_metadata_message(&tag.svnprefix, tag.revision, Some(tag_name)),
                    true,
                )?;
                drop(txn);
                let inner = self.inner.lock().unwrap();
                inner.channel.lock().unwrap().flush()?;
            }

            debug!(tag = %tag_name, "annotated tag written");
        }

        let inner = self.inner.lock().unwrap();
        inner.channel.lock().unwrap().flush()?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Branch notes
    // -----------------------------------------------------------------------

    pub fn branch_exists(&self, branch: &str) -> bool {
        self.inner.lock().unwrap().branches.contains_key(branch)
    }

    pub fn branch_note(&self, branch: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .branches
            .get(branch)
            .and_then(|b| b.note().map(String::from))
    }

    pub fn set_branch_note(&self, branch: &str, note: impl Into<String>) {
        self.inner.lock().unwrap().set_branch_note(branch, note.into());
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Gracefully close the importer channel (checkpoint, close stdin,
    /// wait) and deregister from the process cache.
    pub fn close(&self) {
        let inner = self.inner.lock().unwrap();
        inner.cache.remove(&inner.name);
        inner.channel.lock().unwrap().close();
    }
}

impl RepoInner {
    /// Make sure the channel is live and most-recently-used, reloading
    /// branch tips after a (re)spawn.
    pub(crate) fn ensure_running(&mut self) -> Result<(), RepositoryError> {
        self.cache.touch(&self.name, &self.channel);
        let needs_reload = {
            let mut channel = self.channel.lock().unwrap();
            if channel.is_running() {
                false
            } else {
                channel.spawn()?;
                true
            }
        };
        if needs_reload {
            self.reload_branches()?;
        }
        Ok(())
    }

    /// Re-establish every branch tip in a fresh child from the marks it
    /// imported.
    fn reload_branches(&mut self) -> Result<(), RepositoryError> {
        let mut out = Vec::new();
        let mut reset_notes = false;
        for (name, br) in &self.branches {
            debug_assert!(name.starts_with("refs/"));
            let mark = match br.last_mark() {
                Some(mark) if mark != 0 => mark,
                _ => continue,
            };
            reset_notes = true;
            out.extend_from_slice(
                format!(
                    "reset {}\nfrom :{}\n\nprogress Branch {} reloaded\n",
                    name, mark, name
                )
                .as_bytes(),
            );
        }
        if reset_notes && self.config.add_metadata_notes {
            out.extend_from_slice(
                format!("reset refs/notes/commits\nfrom :{}\n", NOTES_MARK).as_bytes(),
            );
        }
        if !out.is_empty() {
            self.channel.lock().unwrap().write(&out)?;
        }
        Ok(())
    }

    /// Resolve `branch_from` at `revision` to a mark.
    pub(crate) fn mark_from(&self, branch_from: &str, revision: u64) -> MarkFrom {
        debug_assert!(branch_from.starts_with("refs/"));
        let Some(br) = self.branches.get(branch_from) else {
            return MarkFrom::UnknownBranch;
        };
        if !br.is_created() || !br.has_commits() {
            return MarkFrom::UnknownBranch;
        }
        match br.find_mark(revision) {
            None => MarkFrom::NotFound,
            Some((_, 0)) => MarkFrom::NotFound,
            Some((at_revision, mark)) => MarkFrom::Mark { mark, at_revision },
        }
    }

    /// Buffer a reset of `branch` to `reset_to`, backing up a live tip
    /// first. Deletions and other resets are buffered separately so that a
    /// create in the same revision supersedes a pending delete of the same
    /// branch; the reverse order flushes both.
    fn reset_branch(
        &mut self,
        branch: &str,
        revision: u64,
        mark: u32,
        reset_to: &str,
        comment: &str,
    ) {
        self.notify_submodule_parent(branch);
        debug_assert!(branch.starts_with("refs/"));

        let br = self.branches.entry(branch.to_string()).or_default();
        let mut cmd = Vec::new();
        if br.is_created()
            && br.created() != revision
            && br.last_mark().map_or(false, |m| m != 0)
        {
            let backup_branch = if comment == "delete" && branch.starts_with("refs/heads/") {
                format!("refs/tags/backups/{}@{}", &branch[11..], revision)
            } else {
                format!("refs/backups/r{}{}", revision, &branch[4..])
            };
            debug!(
                repository = %self.name,
                branch,
                backup = %backup_branch,
                "backing up branch"
            );
            cmd.extend_from_slice(
                format!("reset {}\nfrom {}\n\n", backup_branch, branch).as_bytes(),
            );
        }

        br.set_created(revision);
        br.record(revision, mark);

        cmd.extend_from_slice(
            format!(
                "reset {}\nfrom {}\n\nprogress SVN r{} branch {} = :{} # {}\n\n",
                branch, reset_to, revision, branch, mark, comment
            )
            .as_bytes(),
        );

        if comment == "delete" {
            self.deleted_branches
                .entry(branch.to_string())
                .or_default()
                .extend_from_slice(&cmd);
        } else {
            if self.deleted_branches.remove(branch).is_some() {
                debug!(
                    repository = %self.name,
                    branch, revision,
                    "create supersedes pending delete in the same revision"
                );
            }
            self.reset_branches
                .entry(branch.to_string())
                .or_default()
                .extend_from_slice(&cmd);
        }
    }

    fn notify_submodule_parent(&self, branch: &str) {
        if let Some(parent) = &self.submodule_parent {
            if let Some(parent_inner) = parent.repo.upgrade() {
                // cycles are forbidden: the parent never points back here
                parent_inner
                    .lock()
                    .unwrap()
                    .submodule_changed(&self.name, branch);
            }
        }
    }

    /// Hook invoked when a submodule repository resets a branch. A gitlink
    /// update in this repository could be produced here.
    fn submodule_changed(&mut self, submodule: &str, branch: &str) {
        debug!(
            repository = %self.name,
            submodule, branch,
            "submodule branch changed"
        );
    }

    /// Release one outstanding-transaction slot; the blob half of the mark
    /// space is reclaimed once no transaction is pending.
    pub(crate) fn forget_transaction(&mut self) {
        self.outstanding_transactions -= 1;
        if self.outstanding_transactions == 0 {
            self.allocator.release_blob_marks();
        }
    }

    pub(crate) fn set_branch_note(&mut self, branch: &str, note: String) {
        if let Some(br) = self.branches.get_mut(branch) {
            br.set_note(Some(note));
        }
    }
}

impl Drop for RepoInner {
    fn drop(&mut self) {
        debug_assert_eq!(self.outstanding_transactions, 0);
        self.cache.remove(&self.name);
        if let Ok(mut channel) = self.channel.lock() {
            channel.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::BranchRule;

    fn dry_repo(dir: &std::path::Path) -> Repository {
        let config = Arc::new(ExportConfig {
            dry_run: true,
            log_fast_import: true,
            data_dir: dir.to_path_buf(),
            ..Default::default()
        });
        let cache = Arc::new(ProcessCache::default());
        let mut rule = RepositoryRule::named("project");
        rule.branches.push(BranchRule::head("trunk"));
        Repository::new(&rule, config, cache, false).unwrap()
    }

    fn tee_contents(dir: &std::path::Path) -> String {
        std::fs::read_to_string(dir.join("log-project.fi")).unwrap_or_default()
    }

    #[test]
    fn test_file_name_sanitization() {
        assert_eq!(marks_file_name("a/b"), "marks-a_b");
        assert_eq!(log_file_name("a/b"), "log-a_b");
    }

    #[test]
    fn test_metadata_message_format() {
        assert_eq!(
            format_metadata_message("/trunk", 42, None),
            "svn path=/trunk; revision=42\n"
        );
        assert_eq!(
            format_metadata_message("/tags/v1", 43, Some("v1")),
            "svn path=/tags/v1; revision=43; tag=v1\n"
        );
    }

    #[test]
    fn test_create_branch_unknown_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dry_repo(dir.path());
        let err = repo
            .create_branch("refs/heads/topic", 2, "refs/heads/nowhere", 1)
            .unwrap_err();
        assert!(matches!(err, RepositoryError::UnknownSourceBranch { .. }));
    }

    #[test]
    fn test_create_branch_emits_reset_from_mark() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dry_repo(dir.path());

        // master gets a commit at r1 (mark 1)
        let mut txn = repo.new_transaction("refs/heads/master", "/trunk", 1).unwrap();
        txn.set_author("An Author <author@example.com>");
        txn.set_date_time(1_700_000_000);
        txn.set_log("initial");
        txn.commit().unwrap();

        repo.create_branch("refs/heads/topic", 2, "refs/heads/master", 1)
            .unwrap();
        repo.commit().unwrap();

        let out = tee_contents(dir.path());
        assert!(out.contains(
            "reset refs/heads/topic\nfrom :1\n\n\
             progress SVN r2 branch refs/heads/topic = :1 \
             # from branch refs/heads/master at r1\n\n"
        ));
    }

    #[test]
    fn test_delete_master_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dry_repo(dir.path());
        repo.delete_branch("refs/heads/master", 3).unwrap();
        repo.commit().unwrap();
        assert_eq!(tee_contents(dir.path()), "");
    }

    #[test]
    fn test_delete_then_create_keeps_only_the_create() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dry_repo(dir.path());

        let mut txn = repo.new_transaction("refs/heads/master", "/trunk", 1).unwrap();
        txn.set_author("An Author <author@example.com>");
        txn.set_log("initial");
        txn.commit().unwrap();
        repo.create_branch("refs/heads/old", 2, "refs/heads/master", 1)
            .unwrap();
        repo.commit().unwrap();

        let before = tee_contents(dir.path()).len();
        repo.delete_branch("refs/heads/old", 5).unwrap();
        repo.create_branch("refs/heads/old", 5, "refs/heads/master", 1)
            .unwrap();
        repo.commit().unwrap();

        let out = &tee_contents(dir.path())[before..];
        assert!(!out.contains(NULL_SHA), "delete should have been superseded");
        assert_eq!(out.matches("reset refs/heads/old\n").count(), 1);
    }

    #[test]
    fn test_create_then_delete_flushes_both() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dry_repo(dir.path());

        let mut txn = repo.new_transaction("refs/heads/master", "/trunk", 1).unwrap();
        txn.set_author("An Author <author@example.com>");
        txn.set_log("initial");
        txn.commit().unwrap();

        let before = tee_contents(dir.path()).len();
        repo.create_branch("refs/heads/old", 5, "refs/heads/master", 1)
            .unwrap();
        repo.delete_branch("refs/heads/old", 5).unwrap();
        repo.commit().unwrap();

        let out = &tee_contents(dir.path())[before..];
        assert_eq!(out.matches("reset refs/heads/old\n").count(), 2);
        assert!(out.contains(NULL_SHA));
    }

    #[test]
    fn test_deleted_branch_gets_tag_backup_ref() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dry_repo(dir.path());

        let mut txn = repo.new_transaction("refs/heads/master", "/trunk", 1).unwrap();
        txn.set_author("An Author <author@example.com>");
        txn.set_log("initial");
        txn.commit().unwrap();
        repo.create_branch("refs/heads/dying", 2, "refs/heads/master", 1)
            .unwrap();
        repo.commit().unwrap();

        repo.delete_branch("refs/heads/dying", 7).unwrap();
        repo.commit().unwrap();

        let out = tee_contents(dir.path());
        assert!(out.contains("reset refs/tags/backups/dying@7\nfrom refs/heads/dying\n"));
    }

    #[test]
    fn test_reset_backup_uses_refs_backups_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dry_repo(dir.path());

        let mut txn = repo.new_transaction("refs/heads/master", "/trunk", 1).unwrap();
        txn.set_author("An Author <author@example.com>");
        txn.set_log("initial");
        txn.commit().unwrap();

        // re-rooting master at r4 backs the old tip up first
        repo.create_branch("refs/heads/master", 4, "refs/heads/master", 1)
            .unwrap();
        repo.commit().unwrap();

        let out = tee_contents(dir.path());
        assert!(out.contains("reset refs/backups/r4/heads/master\nfrom refs/heads/master\n"));
    }

    #[test]
    fn test_branch_note_inheritance() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dry_repo(dir.path());

        let mut txn = repo.new_transaction("refs/heads/master", "/trunk", 1).unwrap();
        txn.set_author("An Author <author@example.com>");
        txn.set_log("initial");
        txn.commit().unwrap();

        repo.set_branch_note("refs/heads/master", "note text");
        repo.create_branch("refs/heads/topic", 2, "refs/heads/master", 1)
            .unwrap();
        assert_eq!(repo.branch_note("refs/heads/topic").as_deref(), Some("note text"));
    }

    #[test]
    fn test_submodule_parent_is_notified_on_reset() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(ExportConfig {
            dry_run: true,
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        });
        let cache = Arc::new(ProcessCache::default());
        let parent = Repository::new(
            &RepositoryRule::named("parent"),
            config.clone(),
            cache.clone(),
            false,
        )
        .unwrap();
        let child =
            Repository::new(&RepositoryRule::named("parent/child"), config, cache, false).unwrap();
        child.set_submodule_parent(&parent, "child");

        let mut txn = child.new_transaction("refs/heads/master", "/child", 1).unwrap();
        txn.set_author("An Author <author@example.com>");
        txn.set_log("initial");
        txn.commit().unwrap();

        // the reset reaches the parent hook without deadlocking
        child
            .create_branch("refs/heads/topic", 2, "refs/heads/master", 1)
            .unwrap();
        child.delete_branch("refs/heads/topic", 3).unwrap();
        child.commit().unwrap();
    }

    #[test]
    fn test_setup_incremental_without_log_starts_at_one() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dry_repo(dir.path());
        let mut cutoff = u64::MAX;
        assert_eq!(repo.setup_incremental(&mut cutoff).unwrap(), 1);
        assert_eq!(cutoff, u64::MAX);
    }

    #[test]
    fn test_setup_incremental_rewinds_on_missing_mark() {
        let dir = tempfile::tempdir().unwrap();

        // marks file acknowledges up to 15, log claims a commit with 17
        let workdir = dir.path().join("project");
        std::fs::create_dir_all(&workdir).unwrap();
        let mut marks = String::new();
        for mark in 1..=15 {
            marks.push_str(&format!(":{} {:040x}\n", mark, mark));
        }
        std::fs::write(workdir.join("marks-project"), marks).unwrap();
        std::fs::write(
            dir.path().join("log-project"),
            "progress SVN r40 branch refs/heads/master = :15\n\
             progress SVN r42 branch refs/heads/master = :17\n",
        )
        .unwrap();

        let repo = dry_repo(dir.path());
        let mut cutoff = u64::MAX;
        let first = repo.setup_incremental(&mut cutoff).unwrap();
        assert_eq!(first, 42);
        assert_eq!(cutoff, 42);

        // the log was truncated at the offending line and backed up
        let log = std::fs::read_to_string(dir.path().join("log-project")).unwrap();
        assert_eq!(log, "progress SVN r40 branch refs/heads/master = :15\n");
        assert!(dir.path().join("log-project.old").exists());
    }

    #[test]
    fn test_setup_incremental_resumes_past_complete_log() {
        let dir = tempfile::tempdir().unwrap();

        let workdir = dir.path().join("project");
        std::fs::create_dir_all(&workdir).unwrap();
        std::fs::write(
            workdir.join("marks-project"),
            format!(":1 {:040x}\n:2 {:040x}\n", 1, 2),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("log-project"),
            "progress SVN r3 branch refs/heads/master = :1\n\
             progress SVN r5 branch refs/heads/branches/one = :2\n",
        )
        .unwrap();

        let repo = dry_repo(dir.path());
        let mut cutoff = u64::MAX;
        assert_eq!(repo.setup_incremental(&mut cutoff).unwrap(), 6);

        // branch state was rebuilt from the log
        assert!(repo.branch_exists("refs/heads/branches/one"));
        let mut txn = repo.new_transaction("refs/heads/master", "/trunk", 6).unwrap();
        txn.note_copy_from_branch("refs/heads/branches/one", 5);
        drop(txn);
    }
}
