//! Rule types handed to the engine by the ruleset layer.
//!
//! Parsing the ruleset file and matching SVN paths against it (the
//! longest-prefix trie) happen outside this crate; a repository only needs
//! to know its own name, its declared branches, and its optional submodule
//! parent.

use serde::{Deserialize, Serialize};

/// A branch declared for a target repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchRule {
    /// Unqualified branch name (e.g. `trunk`, `1.2-release`).
    pub name: String,

    /// Ref namespace the branch lives under.
    #[serde(default = "default_ref_qualifier")]
    pub ref_qualifier: String,
}

fn default_ref_qualifier() -> String {
    "refs/heads".into()
}

impl BranchRule {
    /// A branch under `refs/heads/`.
    pub fn head(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ref_qualifier: default_ref_qualifier(),
        }
    }

    /// A tag ref under `refs/tags/`.
    pub fn tag(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ref_qualifier: "refs/tags".into(),
        }
    }

    /// The fully qualified ref name, always starting with `refs/`.
    pub fn git_ref_name(&self) -> String {
        let qualifier = self.ref_qualifier.trim_end_matches('/');
        format!("{}/{}", qualifier, self.name)
    }
}

/// One target repository declared by the ruleset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryRule {
    /// Repository name; doubles as its directory under the data dir.
    pub name: String,

    /// Branches the ruleset declares up front. Branches may also appear
    /// later through commits or explicit creates.
    #[serde(default)]
    pub branches: Vec<BranchRule>,

    /// Prefix prepended to every exported path. Reserved; current rulesets
    /// leave it empty.
    #[serde(default)]
    pub prefix: String,

    /// Name of the repository that embeds this one as a submodule.
    #[serde(default)]
    pub submodule_in_repo: Option<String>,

    /// Path of the gitlink inside the parent repository.
    #[serde(default)]
    pub submodule_path: Option<String>,
}

impl RepositoryRule {
    /// A rule with just a name, no declared branches.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            branches: Vec::new(),
            prefix: String::new(),
            submodule_in_repo: None,
            submodule_path: None,
        }
    }
}
