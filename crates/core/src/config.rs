//! TOML-based configuration for the export engine.
//!
//! Everything here has a sensible default, so an empty TOML document (or
//! [`ExportConfig::default()`]) yields a working configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;

/// Engine-wide configuration shared by every target repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Generate the full protocol but never spawn importer children or touch
    /// target repositories on disk.
    #[serde(default)]
    pub dry_run: bool,

    /// Emit an explicit `checkpoint` every N transactions (default 10000).
    #[serde(default = "default_commit_interval")]
    pub commit_interval: u64,

    /// Append an `svn path=...; revision=...` line to every commit message.
    #[serde(default)]
    pub add_metadata: bool,

    /// Emit a metadata note for each commit and each annotated-tag
    /// supporting tip.
    #[serde(default)]
    pub add_metadata_notes: bool,

    /// Name of the version-control binary whose `fast-import` subcommand
    /// consumes the stream.
    #[serde(default = "default_git_executable")]
    pub git_executable: String,

    /// Directory under which target repositories and their log files live.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Upper bound on simultaneously live importer children across all
    /// target repositories.
    #[serde(default = "default_max_live_processes")]
    pub max_live_processes: usize,

    /// Tee every logged-mode channel write into a `<log>.fi` file next to
    /// the progress log. Blob payloads are excluded.
    #[serde(default)]
    pub log_fast_import: bool,
}

fn default_commit_interval() -> u64 {
    10_000
}
fn default_git_executable() -> String {
    "git".into()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_max_live_processes() -> usize {
    100
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            commit_interval: default_commit_interval(),
            add_metadata: false,
            add_metadata_notes: false,
            git_executable: default_git_executable(),
            data_dir: default_data_dir(),
            max_live_processes: default_max_live_processes(),
            log_fast_import: false,
        }
    }
}

impl ExportConfig {
    /// Load the configuration from a TOML file and validate it.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading export configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;

        debug!(?config, "configuration loaded");
        Ok(config)
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.commit_interval == 0 {
            return Err(ConfigError::InvalidValue {
                field: "commit_interval".into(),
                detail: "must be at least 1".into(),
            });
        }
        if self.max_live_processes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_live_processes".into(),
                detail: "must be at least 1".into(),
            });
        }
        if self.git_executable.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "git_executable".into(),
                detail: "must not be empty".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ExportConfig::default();
        assert!(!config.dry_run);
        assert_eq!(config.commit_interval, 10_000);
        assert_eq!(config.git_executable, "git");
        assert_eq!(config.max_live_processes, 100);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.toml");
        std::fs::write(
            &path,
            r#"
dry_run = true
commit_interval = 500
add_metadata = true
git_executable = "git2"
"#,
        )
        .unwrap();

        let config = ExportConfig::load(&path).unwrap();
        assert!(config.dry_run);
        assert_eq!(config.commit_interval, 500);
        assert!(config.add_metadata);
        assert!(!config.add_metadata_notes);
        assert_eq!(config.git_executable, "git2");
    }

    #[test]
    fn test_load_missing_file() {
        let result = ExportConfig::load("/nonexistent/export.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = ExportConfig {
            commit_interval: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
