//! The dispatch loop.
//!
//! One thread, one tick every 500 ms, three phases:
//!
//! 1. reconcile: find registered builders whose process is gone, classify
//!    them through the exit-code sentinel, finalize the build and post a
//!    terminal commit status;
//! 2. start: spawn a builder for every pending build, oldest first;
//! 3. sweep: delete every workspace the store no longer references.
//!
//! The loop never aborts. Every per-build error becomes a log line and is
//! either retried on a later tick or absorbed into the build's result. A
//! store read failure in phase 1 skips the rest of the tick so the sweep
//! cannot run against stale retention data.

use std::collections::HashSet;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

use chrono::Utc;

use crate::build::controller::BuilderControl;
use crate::config::Config;
use crate::github::{CommitState, CommitStatusSink};
use crate::store::db::{BuildResult, DbStore, Repo, RunningBuilder};
use crate::store::fs::FsStore;

/// Fixed pause between dispatch ticks.
pub const DISPATCH_POLL_PERIOD: Duration = Duration::from_millis(500);

/// The dispatch loop over its collaborators.
pub struct Processor<C, S> {
    /// Build store.
    pub db: DbStore,
    /// Workspace store.
    pub fs: FsStore,
    /// Repository configuration.
    pub config: Config,
    /// Builder supervision.
    pub controller: C,
    /// Commit-status collaborator, when one is configured.
    pub status: Option<S>,
}

impl<C: BuilderControl, S: CommitStatusSink> Processor<C, S> {
    /// Run ticks until something arrives on (or closes) the shutdown
    /// channel. Builders keep running when the loop exits; the next daemon
    /// incarnation inherits them through the builders table.
    pub fn run(&self, shutdown: &Receiver<()>) {
        loop {
            match shutdown.recv_timeout(DISPATCH_POLL_PERIOD) {
                Err(RecvTimeoutError::Timeout) => self.tick(),
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    /// Run one dispatch tick.
    pub fn tick(&self) {
        if !self.reconcile_finished_builders() {
            return;
        }
        self.start_pending_builds();
        self.sweep_workspaces();
    }

    /// Phase 1. Returns false when the builders table could not be read, in
    /// which case the whole tick is skipped.
    fn reconcile_finished_builders(&self) -> bool {
        let builders = match self.db.list_builders() {
            Ok(builders) => builders,
            Err(error) => {
                tracing::error!(%error, "failed to list running builders");
                return false;
            }
        };

        for builder in builders {
            if self.controller.is_running(builder.pid, builder.build_id) {
                continue;
            }
            self.finalize_builder(&builder);
        }
        true
    }

    fn finalize_builder(&self, builder: &RunningBuilder) {
        let result = match self.fs.read_and_clean_exit_code(builder.build_id) {
            Ok(0) => BuildResult::Success,
            Ok(exit_code) => {
                tracing::info!(
                    build_id = builder.build_id,
                    exit_code,
                    "build command failed"
                );
                BuildResult::Failure
            }
            Err(error) => {
                tracing::warn!(
                    build_id = builder.build_id,
                    %error,
                    "builder died without a readable exit code"
                );
                BuildResult::Error
            }
        };

        // Only a successful default-branch build may become the repo cache.
        // A repo that has dropped out of the configuration is still
        // finalized, just never promoted.
        let repo_config = self.config.repo(&builder.repo.owner, &builder.repo.name);
        if repo_config.is_none() {
            tracing::warn!(repo = %builder.repo, "repository is no longer configured");
        }
        let cache_build_files = result == BuildResult::Success
            && repo_config.is_some_and(|cfg| builder.git_ref == cfg.default_branch_ref());

        if let Err(error) =
            self.db
                .finish_build(builder.build_id, Utc::now(), result, cache_build_files)
        {
            tracing::error!(
                build_id = builder.build_id,
                %error,
                "failed to record finished build; retrying next tick"
            );
            return;
        }
        tracing::info!(build_id = builder.build_id, result = %result, "build finished");

        self.post_status(
            &builder.repo,
            &builder.commit_sha,
            CommitState::from(result),
            builder.build_id,
            status_description(result),
        );
    }

    /// Phase 2: dispatch pending builds in creation order.
    fn start_pending_builds(&self) {
        let pending = match self.db.get_pending_builds() {
            Ok(pending) => pending,
            Err(error) => {
                tracing::error!(%error, "failed to list pending builds");
                return;
            }
        };

        for build in pending {
            let Some(repo_config) = self.config.repo(&build.repo.owner, &build.repo.name) else {
                tracing::error!(
                    repo = %build.repo,
                    build_id = build.id,
                    "missing repository configuration"
                );
                continue;
            };

            let run_deploy = build.git_ref == repo_config.default_branch_ref();
            let pid = match self.controller.start(repo_config, &build, run_deploy) {
                Ok(pid) => pid,
                Err(error) => {
                    tracing::error!(
                        build_id = build.id,
                        %error,
                        "failed to start builder; build stays pending"
                    );
                    continue;
                }
            };

            if let Err(error) = self.db.start_build(build.id, Utc::now(), pid, build.cache_id) {
                tracing::error!(build_id = build.id, pid, %error, "failed to record builder start");
                continue;
            }
            tracing::info!(build_id = build.id, pid, repo = %build.repo, "builder started");

            self.post_status(
                &build.repo,
                &build.commit_sha,
                CommitState::Pending,
                build.id,
                "Build started",
            );
        }
    }

    /// Phase 3: delete workspaces the store no longer references.
    fn sweep_workspaces(&self) {
        let in_use = match self.db.list_build_dirs_in_use() {
            Ok(ids) => ids,
            Err(error) => {
                tracing::error!(%error, "failed to list workspaces in use");
                return;
            }
        };
        let retained: HashSet<u64> = in_use.into_iter().collect();

        match self.fs.retain_build_dirs(&retained) {
            Ok(outcome) => {
                if !outcome.deleted.is_empty() {
                    tracing::info!(deleted = ?outcome.deleted, "swept unused workspaces");
                }
                for (build_id, error) in &outcome.failures {
                    tracing::warn!(build_id, %error, "failed to delete workspace");
                }
            }
            Err(error) => tracing::error!(%error, "workspace sweep failed"),
        }
    }

    /// Post a commit status; failures are logged and never retried.
    fn post_status(
        &self,
        repo: &Repo,
        commit_sha: &str,
        state: CommitState,
        build_id: u64,
        description: &str,
    ) {
        let Some(status) = &self.status else { return };
        let Some(github) = &self.config.github else {
            return;
        };

        let target_url = github
            .target_url_base
            .as_ref()
            .map(|base| format!("{}/builds/{build_id}", base.trim_end_matches('/')))
            .unwrap_or_default();

        if let Err(error) = status.create_commit_status(
            &repo.owner,
            &repo.name,
            commit_sha,
            state,
            description,
            &target_url,
            &github.status_context,
        ) {
            tracing::warn!(repo = %repo, commit_sha, %error, "failed to post commit status");
        }
    }
}

fn status_description(result: BuildResult) -> &'static str {
    match result {
        BuildResult::Success => "Build succeeded",
        BuildResult::Failure => "Build failed",
        BuildResult::Canceled => "Build canceled",
        BuildResult::Timeout => "Build timed out",
        BuildResult::Error => "Build hit an internal error",
    }
}
