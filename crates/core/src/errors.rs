//! Error types for the export engine.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`ExportError`] enum unifies them all for callers that want a
//! single error type.
//!
//! The split between errors and warnings follows one rule: conditions that
//! would corrupt a target repository (unknown source branch, mark-space
//! exhaustion, a dead importer child) are `Err` values; everything the run
//! can survive (non-monotonic revisions, missing copy-from sources, merge
//! parent overflow) is logged with `tracing::warn!` and the run continues.

use std::path::PathBuf;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire export engine.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Marks(#[from] MarksError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue {
        field: String,
        detail: String,
    },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Marks file errors
// ---------------------------------------------------------------------------

/// Errors from the export-marks file written by the fast-import child.
#[derive(Debug, Error)]
pub enum MarksError {
    /// A line that is not `:<mark> <sha>` appeared before any gap.
    #[error("marks file '{path}' corrupt at line {line}")]
    Corrupt {
        path: PathBuf,
        line: u64,
    },

    /// Generic I/O wrapper.
    #[error("marks file I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Progress log errors
// ---------------------------------------------------------------------------

/// Errors from the append-only progress log.
#[derive(Debug, Error)]
pub enum LogError {
    /// A progress line matched the expected shape but carried values that
    /// do not fit the mark or revision domain.
    #[error("progress log '{path}' corrupt at line {line}: {detail}")]
    Corrupt {
        path: PathBuf,
        line: u64,
        detail: String,
    },

    /// Generic I/O wrapper.
    #[error("progress log I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Channel errors
// ---------------------------------------------------------------------------

/// Errors from the fast-import child process channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The child could not be spawned.
    #[error("failed to spawn '{binary} fast-import' for repository '{repository}': {source}")]
    SpawnFailed {
        repository: String,
        binary: String,
        source: std::io::Error,
    },

    /// The child was started once already and went away without a graceful
    /// close; respawning would loop on the crash.
    #[error("fast-import for repository '{repository}' has been started once and crashed")]
    AlreadyCrashed {
        repository: String,
    },

    /// A write failed or the child exited prematurely.
    #[error("fast-import child for repository '{repository}' died: {detail}")]
    Died {
        repository: String,
        detail: String,
    },
}

// ---------------------------------------------------------------------------
// Repository errors
// ---------------------------------------------------------------------------

/// Errors from repository-level coordination.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// A branch creation named a source branch the repository never saw.
    #[error(
        "{target} in repository {repository} is branching from branch {source_branch} \
         but the latter doesn't exist"
    )]
    UnknownSourceBranch {
        source_branch: String,
        target: String,
        repository: String,
    },

    /// The upward commit-mark counter and the downward blob-mark counter met.
    #[error("mark space exhausted in repository '{repository}'")]
    MarkSpaceExhausted {
        repository: String,
    },

    /// Initializing the on-disk target repository failed.
    #[error("failed to initialize repository '{repository}': {detail}")]
    InitFailed {
        repository: String,
        detail: String,
    },

    /// Underlying marks file error.
    #[error(transparent)]
    Marks(#[from] MarksError),

    /// Underlying progress log error.
    #[error(transparent)]
    Log(#[from] LogError),

    /// Underlying channel error.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Generic I/O wrapper.
    #[error("repository I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = RepositoryError::UnknownSourceBranch {
            source_branch: "refs/heads/trunk".into(),
            target: "refs/heads/topic".into(),
            repository: "project".into(),
        };
        assert_eq!(
            err.to_string(),
            "refs/heads/topic in repository project is branching from branch \
             refs/heads/trunk but the latter doesn't exist"
        );

        let err = MarksError::Corrupt {
            path: PathBuf::from("marks-project"),
            line: 3,
        };
        assert!(err.to_string().contains("line 3"));

        let err = ChannelError::AlreadyCrashed {
            repository: "project".into(),
        };
        assert!(err.to_string().contains("crashed"));
    }

    #[test]
    fn test_export_error_from_subsystem() {
        let marks_err = MarksError::Corrupt {
            path: PathBuf::from("marks-x"),
            line: 1,
        };
        let export_err: ExportError = marks_err.into();
        assert!(matches!(export_err, ExportError::Marks(_)));

        let repo_err = RepositoryError::MarkSpaceExhausted {
            repository: "x".into(),
        };
        let export_err: ExportError = repo_err.into();
        assert!(matches!(export_err, ExportError::Repository(_)));
    }
}
