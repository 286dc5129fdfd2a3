//! Server configuration.
//!
//! Loaded once at startup from a TOML file. Repository build and deploy
//! secrets are plain strings here; how they got into the file (and whether
//! they were encrypted at rest) is the operator's concern, not the
//! engine's.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Errors from loading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file '{path}': {source}", path = .path.display())]
    Read {
        /// Path that was attempted.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("failed to parse config file '{path}': {source}", path = .path.display())]
    Parse {
        /// Path that was attempted.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: toml::de::Error,
    },

    /// The same repository appears twice.
    #[error("repository {owner}/{name} is configured more than once")]
    DuplicateRepo {
        /// Repository owner.
        owner: String,
        /// Repository name.
        name: String,
    },
}

/// Top-level server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Directory holding workspaces, logs, sentinels and the build store.
    pub data_dir: PathBuf,

    /// GitHub commit-status reporting; statuses are skipped when absent.
    #[serde(default)]
    pub github: Option<GithubConfig>,

    /// Repositories this server builds.
    #[serde(default)]
    pub repos: Vec<RepoConfig>,
}

/// Commit-status reporting configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GithubConfig {
    /// Bearer token used for the statuses API.
    pub token: String,

    /// The `context` attached to posted statuses.
    #[serde(default = "default_status_context")]
    pub status_context: String,

    /// Base URL of this server's UI; when set, statuses link to
    /// `<base>/builds/<id>`.
    #[serde(default)]
    pub target_url_base: Option<String>,
}

fn default_status_context() -> String {
    "ci/kiln".to_string()
}

/// Per-repository build configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepoConfig {
    /// Repository owner (user or organization).
    pub owner: String,

    /// Repository name.
    pub name: String,

    /// Branch whose builds deploy and seed the workspace cache.
    #[serde(default = "default_branch")]
    pub default_branch: String,

    /// Environment variables for build and deploy commands.
    #[serde(default)]
    pub env_vars: HashMap<String, String>,

    /// Build command argv.
    pub build_command: Vec<String>,

    /// Secrets merged into the build command's environment.
    #[serde(default)]
    pub build_secrets: HashMap<String, String>,

    /// Deploy command argv; empty disables deploys.
    #[serde(default)]
    pub deploy_command: Vec<String>,

    /// Secrets merged into the deploy command's environment.
    #[serde(default)]
    pub deploy_secrets: HashMap<String, String>,
}

fn default_branch() -> String {
    "main".to_string()
}

impl RepoConfig {
    /// The full ref of the default branch, e.g. `refs/heads/main`.
    #[must_use]
    pub fn default_branch_ref(&self) -> String {
        format!("refs/heads/{}", self.default_branch)
    }
}

impl Config {
    /// Load and validate the configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read or parsed, or
    /// when a repository is configured twice.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for repo in &self.repos {
            if !seen.insert((repo.owner.as_str(), repo.name.as_str())) {
                return Err(ConfigError::DuplicateRepo {
                    owner: repo.owner.clone(),
                    name: repo.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Configuration for a repository, if it is configured.
    #[must_use]
    pub fn repo(&self, owner: &str, name: &str) -> Option<&RepoConfig> {
        self.repos
            .iter()
            .find(|repo| repo.owner == owner && repo.name == name)
    }
}
