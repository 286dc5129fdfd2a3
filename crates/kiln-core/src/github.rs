//! GitHub commit-status reporting.
//!
//! The dispatcher posts a `pending` status when a builder starts and a
//! terminal status when the build finishes. Token acquisition is the
//! operator's problem (the config carries a ready bearer token); this
//! module only speaks the statuses endpoint.

use std::time::Duration;

use serde_json::json;
use thiserror::Error;

use crate::store::db::BuildResult;

const GITHUB_API_VERSION: &str = "2022-11-28";

/// Commit states accepted by the statuses API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    /// A build is queued or running.
    Pending,
    /// The build succeeded.
    Success,
    /// A user command failed (also used for canceled and timed-out builds).
    Failure,
    /// The CI itself failed.
    Error,
}

impl CommitState {
    /// Wire form of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Error => "error",
        }
    }
}

impl From<BuildResult> for CommitState {
    fn from(result: BuildResult) -> Self {
        match result {
            BuildResult::Success => Self::Success,
            BuildResult::Failure | BuildResult::Canceled | BuildResult::Timeout => Self::Failure,
            BuildResult::Error => Self::Error,
        }
    }
}

/// Errors from posting a commit status.
#[derive(Debug, Error)]
pub enum StatusError {
    /// The request could not be built or sent.
    #[error("commit status request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The API answered with something other than 201.
    #[error("unexpected status code {status} from commit status API: {message}")]
    Api {
        /// HTTP status code received.
        status: u16,
        /// Response body, as far as it could be read.
        message: String,
    },
}

/// The commit-status collaborator the dispatcher posts through.
pub trait CommitStatusSink {
    /// Post one commit status.
    ///
    /// # Errors
    ///
    /// Returns [`StatusError`] when the status could not be posted. The
    /// dispatcher logs and moves on; statuses are never retried.
    #[allow(clippy::too_many_arguments)]
    fn create_commit_status(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
        state: CommitState,
        description: &str,
        target_url: &str,
        context: &str,
    ) -> Result<(), StatusError>;
}

/// [`CommitStatusSink`] against the GitHub REST API.
#[derive(Debug)]
pub struct GitHubStatusClient {
    http: reqwest::blocking::Client,
    token: String,
    api_base_url: String,
}

impl GitHubStatusClient {
    /// Create a client against `api.github.com`.
    ///
    /// # Errors
    ///
    /// Returns [`StatusError::Transport`] when the HTTP client cannot be
    /// built.
    pub fn new(token: impl Into<String>) -> Result<Self, StatusError> {
        Self::with_api_base_url(token, "https://api.github.com")
    }

    /// Create a client against an explicit API base URL (GitHub Enterprise,
    /// tests).
    ///
    /// # Errors
    ///
    /// Returns [`StatusError::Transport`] when the HTTP client cannot be
    /// built.
    pub fn with_api_base_url(
        token: impl Into<String>,
        api_base_url: impl Into<String>,
    ) -> Result<Self, StatusError> {
        let http = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            token: token.into(),
            api_base_url: api_base_url.into(),
        })
    }
}

impl CommitStatusSink for GitHubStatusClient {
    #[allow(clippy::too_many_arguments)]
    fn create_commit_status(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
        state: CommitState,
        description: &str,
        target_url: &str,
        context: &str,
    ) -> Result<(), StatusError> {
        let url = format!(
            "{}/repos/{owner}/{repo}/statuses/{sha}",
            self.api_base_url.trim_end_matches('/')
        );
        tracing::debug!(%url, state = state.as_str(), "posting commit status");

        let response = self
            .http
            .post(url)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "kiln")
            .header("X-GitHub-Api-Version", GITHUB_API_VERSION)
            .bearer_auth(&self.token)
            .json(&json!({
                "state": state.as_str(),
                "description": description,
                "target_url": target_url,
                "context": context,
            }))
            .send()?;

        let status = response.status();
        if status != reqwest::StatusCode::CREATED {
            let message = response
                .text()
                .unwrap_or_else(|_| "unable to read response body".to_string());
            return Err(StatusError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }
}
