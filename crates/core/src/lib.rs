//! SvnGitExport core library.
//!
//! This crate is the per-target-repository export engine of an SVN-to-git
//! conversion: it maintains each target repository's branch state, allocates
//! commit and blob marks, serializes transactions to a long-running
//! `fast-import` child process, and guarantees resumability across runs via
//! an on-disk marks file and a progress log.
//!
//! The SVN-side revision walker, the ruleset parser and the CLI live
//! outside this crate; the engine consumes a stream of revisions with
//! per-path operations and the `(repository, branch)` pairs the ruleset
//! resolved them to.

pub mod branch;
pub mod channel;
pub mod config;
pub mod errors;
pub mod marks;
pub mod process_cache;
pub mod progress_log;
pub mod repository;
pub mod rules;
pub mod transaction;

// Re-exports for convenience.
pub use config::ExportConfig;
pub use errors::ExportError;
pub use process_cache::ProcessCache;
pub use repository::Repository;
pub use rules::{BranchRule, RepositoryRule};
pub use transaction::{BlobWriter, Transaction};
