//! Shallow checkout of a single commit.

use std::io;
use std::path::Path;
use std::process::Command;

use thiserror::Error;

/// Errors from git operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// The git binary could not be run at all.
    #[error("failed to run git: {0}")]
    Spawn(#[source] io::Error),

    /// A git command exited nonzero.
    #[error("git {operation} failed for '{context}': {detail}")]
    Command {
        /// Which step failed (init, fetch, checkout).
        operation: &'static str,
        /// The repository URL or target directory involved.
        context: String,
        /// Git's stderr, or the exit status when it printed nothing.
        detail: String,
    },
}

/// Something that can materialize a commit into a directory.
pub trait Checkout {
    /// Leave `target_dir` containing the worktree at `commit_sha`, with a
    /// populated `.git` subdirectory. The caller guarantees exclusive use of
    /// `target_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`GitError`] when any step fails.
    fn checkout(&self, repo_url: &str, commit_sha: &str, target_dir: &Path) -> Result<(), GitError>;
}

/// Checkout via the system git binary: init an empty repository in the
/// target, shallow-fetch only the requested commit, then force-checkout its
/// tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct Git;

impl Checkout for Git {
    fn checkout(
        &self,
        repo_url: &str,
        commit_sha: &str,
        target_dir: &Path,
    ) -> Result<(), GitError> {
        let target = target_dir.to_string_lossy();

        run_git(&["-C", &target, "init", "-q"], "init", &target)?;
        run_git(
            &["-C", &target, "fetch", "--depth=1", repo_url, commit_sha],
            "fetch",
            repo_url,
        )?;

        let git_dir = format!("{target}/.git");
        run_git(
            &[
                "--git-dir",
                &git_dir,
                "--work-tree",
                &target,
                "checkout",
                commit_sha,
                "--",
                ".",
            ],
            "checkout",
            repo_url,
        )?;

        Ok(())
    }
}

fn run_git(args: &[&str], operation: &'static str, context: &str) -> Result<(), GitError> {
    let output = Command::new("git")
        .env("GIT_TERMINAL_PROMPT", "0")
        .args(args)
        .output()
        .map_err(GitError::Spawn)?;

    if !output.status.success() {
        let mut detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if detail.is_empty() {
            detail = format!("exit status {}", output.status);
        }
        return Err(GitError::Command {
            operation,
            context: context.to_string(),
            detail,
        });
    }
    Ok(())
}
