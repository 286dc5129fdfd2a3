//! Supervision of builder processes across daemon restarts.
//!
//! Builders are spawned into their own process group so daemon signals and
//! restarts do not touch them; the dispatcher re-discovers them from the
//! builders table afterwards. Liveness is a two-gate check: the pid must
//! accept a no-op signal AND its environment must carry the expected build
//! id tag. The second gate keeps a recycled pid from being mistaken for a
//! builder that is long gone.

use std::io;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use nix::sys::signal::kill;
use nix::unistd::Pid;
use thiserror::Error;

use crate::build::builder::{BuilderParams, BUILD_ID_ENV_VAR, PARAMS_ENV_VAR};
use crate::config::RepoConfig;
use crate::store::db::PendingBuild;
use crate::store::fs::{FsStore, WorkspaceError};

/// argv[1] of a builder child process.
pub const BUILDER_SUBCOMMAND: &str = "builder";

/// Errors from spawning builder processes.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The params blob could not be serialized.
    #[error("failed to encode builder params: {0}")]
    Params(#[from] serde_json::Error),

    /// The path of the current executable could not be determined.
    #[error("failed to locate the current executable: {0}")]
    Executable(#[source] io::Error),

    /// The builder-log file could not be opened.
    #[error("failed to open builder log for build {build_id}: {source}")]
    BuilderLog {
        /// Build the log belongs to.
        build_id: u64,
        /// The underlying error.
        #[source]
        source: WorkspaceError,
    },

    /// The child process could not be spawned.
    #[error("failed to spawn builder for build {build_id}: {source}")]
    Spawn {
        /// Build that stays pending.
        build_id: u64,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
}

/// The supervision capability the dispatcher depends on. Implemented by
/// [`BuilderController`]; tests substitute an in-memory fake.
pub trait BuilderControl {
    /// Spawn a builder child for a pending build and return its pid.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError`] when the child cannot be spawned; the
    /// build stays pending and is retried on the next tick.
    fn start(
        &self,
        repo: &RepoConfig,
        build: &PendingBuild,
        run_deploy: bool,
    ) -> Result<u32, ControllerError>;

    /// Whether the builder spawned for `build_id` is still alive at `pid`.
    fn is_running(&self, pid: u32, build_id: u64) -> bool;
}

/// Spawns builder children by re-executing the current binary, and probes
/// their liveness through `/proc`.
#[derive(Debug, Clone)]
pub struct BuilderController {
    fs: FsStore,
}

impl BuilderController {
    /// Create a controller over the given workspace store.
    #[must_use]
    pub fn new(fs: FsStore) -> Self {
        Self { fs }
    }

    /// Assemble the params blob for a pending build. The deploy command is
    /// only included when the dispatcher asked for a deploy; the builder
    /// itself never decides that.
    fn builder_params(
        &self,
        repo: &RepoConfig,
        build: &PendingBuild,
        run_deploy: bool,
    ) -> BuilderParams {
        BuilderParams {
            data_dir: self.fs.root().to_path_buf(),
            build_id: build.id,
            cache_id: build.cache_id,
            repo_owner: build.repo.owner.clone(),
            repo_name: build.repo.name.clone(),
            commit_sha: build.commit_sha.clone(),
            path_env_var: std::env::var("PATH").unwrap_or_default(),
            env_vars: repo.env_vars.clone(),
            build_cmd: repo.build_command.clone(),
            build_secrets: repo.build_secrets.clone(),
            deploy_cmd: if run_deploy {
                repo.deploy_command.clone()
            } else {
                Vec::new()
            },
            deploy_secrets: repo.deploy_secrets.clone(),
        }
    }
}

impl BuilderControl for BuilderController {
    fn start(
        &self,
        repo: &RepoConfig,
        build: &PendingBuild,
        run_deploy: bool,
    ) -> Result<u32, ControllerError> {
        let params = self.builder_params(repo, build, run_deploy);
        let params_json = serde_json::to_string(&params)?;

        let exe = std::env::current_exe().map_err(ControllerError::Executable)?;
        let log = self
            .fs
            .open_builder_logs(build.id)
            .map_err(|source| ControllerError::BuilderLog {
                build_id: build.id,
                source,
            })?;
        let log_err = log
            .try_clone()
            .map_err(|source| ControllerError::Spawn {
                build_id: build.id,
                source,
            })?;

        let child = Command::new(exe)
            .arg(BUILDER_SUBCOMMAND)
            .env_clear()
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .env(PARAMS_ENV_VAR, &params_json)
            .env(BUILD_ID_ENV_VAR, build.id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            // Own process group: the builder must outlive server restarts.
            .process_group(0)
            .spawn()
            .map_err(|source| ControllerError::Spawn {
                build_id: build.id,
                source,
            })?;

        Ok(child.id())
    }

    fn is_running(&self, pid: u32, build_id: u64) -> bool {
        let Ok(raw_pid) = i32::try_from(pid) else {
            return false;
        };
        if kill(Pid::from_raw(raw_pid), None).is_err() {
            return false;
        }
        has_build_tag(pid, build_id)
    }
}

/// Second liveness gate: the process environment must contain the build-id
/// tag variable. A zombie's environ reads empty, so an exited-but-unreaped
/// builder correctly fails this gate.
fn has_build_tag(pid: u32, build_id: u64) -> bool {
    let Ok(environ) = std::fs::read(format!("/proc/{pid}/environ")) else {
        return false;
    };
    let tag = format!("{BUILD_ID_ENV_VAR}={build_id}");
    environ.split(|b| *b == 0).any(|var| var == tag.as_bytes())
}
