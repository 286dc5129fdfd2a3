//! The out-of-process builder: runs one build attempt end-to-end.
//!
//! The server re-executes its own binary with the `builder` argument and a
//! serialized [`BuilderParams`] blob in the environment. The child prepares
//! the workspace (optionally seeded from the repo cache), checks out the
//! commit, runs the build command and, on a default-branch build that
//! succeeded, the deploy command, then writes the exit-code sentinel as its
//! final action. A missing sentinel is how the dispatcher tells an
//! infrastructure failure from a command failure.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::build::git::{Checkout, Git, GitError};
use crate::build::runner::{CmdRunner, CommandRunner, RunnerError};
use crate::store::fs::{FsStore, WorkspaceError};

/// Environment variable carrying the serialized [`BuilderParams`].
pub const PARAMS_ENV_VAR: &str = "CI_BUILDER_PARAMS";

/// Environment variable carrying the build id, used only as a liveness tag
/// when probing a builder process.
pub const BUILD_ID_ENV_VAR: &str = "CI_BUILDER_BUILD_ID";

/// Everything a builder child needs to run one build, passed as one JSON
/// blob in the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderParams {
    /// Data dir the workspace store is rooted at.
    pub data_dir: PathBuf,
    /// Build to run.
    pub build_id: u64,
    /// Workspace to seed from, if the repo has a cache.
    #[serde(default)]
    pub cache_id: Option<u64>,
    /// Repository owner.
    pub repo_owner: String,
    /// Repository name.
    pub repo_name: String,
    /// Commit to check out.
    pub commit_sha: String,
    /// PATH to expose inside the sandbox.
    pub path_env_var: String,
    /// Plain environment variables for build and deploy commands.
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    /// Build command argv.
    pub build_cmd: Vec<String>,
    /// Secrets merged into the build command's environment.
    #[serde(default)]
    pub build_secrets: HashMap<String, String>,
    /// Deploy command argv; empty when no deploy should run.
    #[serde(default)]
    pub deploy_cmd: Vec<String>,
    /// Secrets merged into the deploy command's environment.
    #[serde(default)]
    pub deploy_secrets: HashMap<String, String>,
}

/// Errors that abort a build attempt before the sentinel is written.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The params environment variable was not set.
    #[error("missing {PARAMS_ENV_VAR} in the environment")]
    MissingParams,

    /// The params blob did not deserialize.
    #[error("failed to decode builder params: {0}")]
    BadParams(#[from] serde_json::Error),

    /// Workspace preparation or the sentinel write failed.
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    /// The checkout failed.
    #[error(transparent)]
    Git(#[from] GitError),

    /// Command execution infrastructure failed.
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

/// The subset of the workspace store a builder needs. Split out so the
/// orchestration logic is testable without a filesystem.
pub trait BuildWorkspace {
    /// See [`FsStore::create_build_dir`].
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError`] on filesystem failure.
    fn create_build_dir(
        &self,
        build_id: u64,
        cache_id: Option<u64>,
        checkout_dir: &str,
    ) -> Result<PathBuf, WorkspaceError>;

    /// See [`FsStore::write_exit_code`].
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError`] on filesystem failure.
    fn write_exit_code(&self, build_id: u64, exit_code: i32) -> Result<(), WorkspaceError>;
}

impl BuildWorkspace for FsStore {
    fn create_build_dir(
        &self,
        build_id: u64,
        cache_id: Option<u64>,
        checkout_dir: &str,
    ) -> Result<PathBuf, WorkspaceError> {
        FsStore::create_build_dir(self, build_id, cache_id, checkout_dir)
    }

    fn write_exit_code(&self, build_id: u64, exit_code: i32) -> Result<(), WorkspaceError> {
        FsStore::write_exit_code(self, build_id, exit_code)
    }
}

/// Orchestrates one build attempt over its collaborator seams.
pub struct Builder<'a> {
    /// Workspace preparation and the sentinel write.
    pub fs: &'a dyn BuildWorkspace,
    /// Commit checkout.
    pub git: &'a dyn Checkout,
    /// Sandboxed command execution.
    pub runner: &'a dyn CommandRunner,
    /// Maps `(owner, name)` to a clone URL.
    pub repo_url: &'a dyn Fn(&str, &str) -> String,
}

impl Builder<'_> {
    /// Run the build described by `params` and write its exit-code sentinel.
    ///
    /// The deploy command runs only when one is configured and the build
    /// command exited zero; its exit code then becomes the build's. A
    /// nonzero command exit is not an error here.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError`] on infrastructure failure; the sentinel is not
    /// written in that case and the dispatcher will classify the build as
    /// `error`.
    pub fn run(&self, params: &BuilderParams) -> Result<(), BuildError> {
        let checkout_subdir = format!("{}/{}", params.repo_owner, params.repo_name);
        let build_dir =
            self.fs
                .create_build_dir(params.build_id, params.cache_id, &checkout_subdir)?;
        let checkout_dir = build_dir.join(&params.repo_owner).join(&params.repo_name);

        let url = (self.repo_url)(&params.repo_owner, &params.repo_name);
        tracing::info!(%url, commit = %params.commit_sha, "checking out source");
        self.git.checkout(&url, &params.commit_sha, &checkout_dir)?;

        tracing::info!(command = ?params.build_cmd, "running build command");
        let env = command_env(params, &build_dir, &params.build_secrets);
        let build_exit = self.runner.run(
            params.build_id,
            &build_dir,
            &checkout_dir,
            &params.build_cmd,
            &env,
        )?;
        tracing::info!(exit_code = build_exit, "build command finished");

        let final_exit = if params.deploy_cmd.is_empty() {
            build_exit
        } else if build_exit != 0 {
            tracing::info!("deploy requested but the build failed");
            build_exit
        } else {
            tracing::info!(command = ?params.deploy_cmd, "running deploy command");
            let env = command_env(params, &build_dir, &params.deploy_secrets);
            let deploy_exit = self.runner.run(
                params.build_id,
                &build_dir,
                &checkout_dir,
                &params.deploy_cmd,
                &env,
            )?;
            tracing::info!(exit_code = deploy_exit, "deploy command finished");
            deploy_exit
        };

        self.fs.write_exit_code(params.build_id, final_exit)?;
        Ok(())
    }
}

/// Compose a command environment: the `CI`/`PATH`/`HOME` defaults, then the
/// configured variables, then the secrets. Secrets are merged last so they
/// win on duplicate names.
fn command_env(
    params: &BuilderParams,
    build_dir: &Path,
    secrets: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("CI".to_string(), "true".to_string());
    env.insert("PATH".to_string(), params.path_env_var.clone());
    env.insert(
        "HOME".to_string(),
        build_dir.to_string_lossy().into_owned(),
    );
    for (key, value) in &params.env_vars {
        env.insert(key.clone(), value.clone());
    }
    for (key, value) in secrets {
        env.insert(key.clone(), value.clone());
    }
    env
}

/// Clone URL on github.com for a repository.
#[must_use]
pub fn github_repo_url(owner: &str, name: &str) -> String {
    format!("https://github.com/{owner}/{name}.git")
}

/// Entry point of the builder child process: deserialize [`BuilderParams`]
/// from the environment and run the build against the real stores.
///
/// # Errors
///
/// Returns [`BuildError`] when the params are missing or malformed, or on
/// any infrastructure failure during the build. The process must then exit
/// nonzero without a sentinel.
pub fn run_builder() -> Result<(), BuildError> {
    let raw = std::env::var(PARAMS_ENV_VAR).map_err(|_| BuildError::MissingParams)?;
    let params: BuilderParams = serde_json::from_str(&raw)?;
    tracing::info!(
        build_id = params.build_id,
        repo = %format!("{}/{}", params.repo_owner, params.repo_name),
        "builder starting"
    );

    let fs = FsStore::new(&params.data_dir);
    let runner = CmdRunner { fs: &fs };
    let builder = Builder {
        fs: &fs,
        git: &Git,
        runner: &runner,
        repo_url: &github_repo_url,
    };
    builder.run(&params)?;

    tracing::info!(build_id = params.build_id, "builder finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use super::*;
    use crate::build::git::GitError;

    fn params(build_cmd: Vec<String>, deploy_cmd: Vec<String>) -> BuilderParams {
        BuilderParams {
            data_dir: PathBuf::from("/data"),
            build_id: 101,
            cache_id: Some(99),
            repo_owner: "owner".to_string(),
            repo_name: "repo".to_string(),
            commit_sha: "3745d6557067287eda95a33b9b2e5bfc3f21171a".to_string(),
            path_env_var: "/usr/local/bin:/usr/bin".to_string(),
            env_vars: [("ENV_A", "env a"), ("SHARED", "from env")]
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .into(),
            build_cmd,
            build_secrets: [("BUILD_SECRET", "build s"), ("SHARED", "from secret")]
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .into(),
            deploy_cmd,
            deploy_secrets: [("DEPLOY_SECRET", "deploy s")]
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .into(),
        }
    }

    #[derive(Default)]
    struct MockWorkspace {
        dirs: RefCell<Vec<(u64, Option<u64>, String)>>,
        exit_codes: RefCell<Vec<(u64, i32)>>,
    }

    impl BuildWorkspace for MockWorkspace {
        fn create_build_dir(
            &self,
            build_id: u64,
            cache_id: Option<u64>,
            checkout_dir: &str,
        ) -> Result<PathBuf, WorkspaceError> {
            self.dirs
                .borrow_mut()
                .push((build_id, cache_id, checkout_dir.to_string()));
            Ok(PathBuf::from(format!("/mockdir/{build_id}")))
        }

        fn write_exit_code(&self, build_id: u64, exit_code: i32) -> Result<(), WorkspaceError> {
            self.exit_codes.borrow_mut().push((build_id, exit_code));
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockGit {
        calls: RefCell<Vec<(String, String, PathBuf)>>,
    }

    impl Checkout for MockGit {
        fn checkout(
            &self,
            repo_url: &str,
            commit_sha: &str,
            target_dir: &std::path::Path,
        ) -> Result<(), GitError> {
            self.calls.borrow_mut().push((
                repo_url.to_string(),
                commit_sha.to_string(),
                target_dir.to_path_buf(),
            ));
            Ok(())
        }
    }

    struct RunnerCall {
        build_id: u64,
        sandbox_dir: PathBuf,
        work_dir: PathBuf,
        argv: Vec<String>,
        env: HashMap<String, String>,
    }

    struct MockRunner {
        results: RefCell<VecDeque<i32>>,
        calls: RefCell<Vec<RunnerCall>>,
    }

    impl MockRunner {
        fn with_results(results: &[i32]) -> Self {
            Self {
                results: RefCell::new(results.iter().copied().collect()),
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl CommandRunner for MockRunner {
        fn run(
            &self,
            build_id: u64,
            sandbox_dir: &Path,
            work_dir: &Path,
            argv: &[String],
            env: &HashMap<String, String>,
        ) -> Result<i32, RunnerError> {
            self.calls.borrow_mut().push(RunnerCall {
                build_id,
                sandbox_dir: sandbox_dir.to_path_buf(),
                work_dir: work_dir.to_path_buf(),
                argv: argv.to_vec(),
                env: env.clone(),
            });
            Ok(self.results.borrow_mut().pop_front().expect("no result"))
        }
    }

    fn run_case(p: &BuilderParams, results: &[i32]) -> (MockWorkspace, MockGit, MockRunner) {
        let fs = MockWorkspace::default();
        let git = MockGit::default();
        let runner = MockRunner::with_results(results);
        Builder {
            fs: &fs,
            git: &git,
            runner: &runner,
            repo_url: &github_repo_url,
        }
        .run(p)
        .unwrap();
        (fs, git, runner)
    }

    #[test]
    fn prepares_workspace_and_checks_out() {
        let p = params(vec!["make".to_string()], Vec::new());
        let (fs, git, runner) = run_case(&p, &[0]);

        assert_eq!(
            *fs.dirs.borrow(),
            vec![(101, Some(99), "owner/repo".to_string())]
        );
        assert_eq!(
            *git.calls.borrow(),
            vec![(
                "https://github.com/owner/repo.git".to_string(),
                p.commit_sha.clone(),
                PathBuf::from("/mockdir/101/owner/repo"),
            )]
        );

        let calls = runner.calls.borrow();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].build_id, 101);
        assert_eq!(calls[0].sandbox_dir, PathBuf::from("/mockdir/101"));
        assert_eq!(calls[0].work_dir, PathBuf::from("/mockdir/101/owner/repo"));
        assert_eq!(calls[0].argv, vec!["make"]);
        assert_eq!(*fs.exit_codes.borrow(), vec![(101, 0)]);
    }

    #[test]
    fn build_env_merges_secrets_over_env_vars() {
        let p = params(vec!["make".to_string()], Vec::new());
        let (_fs, _git, runner) = run_case(&p, &[0]);

        let calls = runner.calls.borrow();
        let env = &calls[0].env;
        assert_eq!(env["CI"], "true");
        assert_eq!(env["PATH"], "/usr/local/bin:/usr/bin");
        assert_eq!(env["HOME"], "/mockdir/101");
        assert_eq!(env["ENV_A"], "env a");
        assert_eq!(env["BUILD_SECRET"], "build s");
        assert_eq!(env["SHARED"], "from secret");
        assert!(!env.contains_key("DEPLOY_SECRET"));
    }

    #[test]
    fn failed_build_skips_deploy() {
        let p = params(vec!["make".to_string()], vec!["deploy".to_string()]);
        let (fs, _git, runner) = run_case(&p, &[5]);

        assert_eq!(runner.calls.borrow().len(), 1);
        assert_eq!(*fs.exit_codes.borrow(), vec![(101, 5)]);
    }

    #[test]
    fn successful_build_runs_deploy_with_deploy_secrets() {
        let p = params(vec!["make".to_string()], vec!["deploy".to_string()]);
        let (fs, _git, runner) = run_case(&p, &[0, 3]);

        let calls = runner.calls.borrow();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].argv, vec!["deploy"]);
        let env = &calls[1].env;
        assert_eq!(env["DEPLOY_SECRET"], "deploy s");
        assert_eq!(env["SHARED"], "from env");
        assert!(!env.contains_key("BUILD_SECRET"));

        // The deploy exit code becomes the build's.
        assert_eq!(*fs.exit_codes.borrow(), vec![(101, 3)]);
    }

    #[test]
    fn empty_deploy_command_means_no_deploy() {
        let p = params(vec!["make".to_string()], Vec::new());
        let (fs, _git, runner) = run_case(&p, &[0]);
        assert_eq!(runner.calls.borrow().len(), 1);
        assert_eq!(*fs.exit_codes.borrow(), vec![(101, 0)]);
    }

    #[test]
    fn params_blob_uses_stable_field_names() {
        let p = params(vec!["make".to_string()], Vec::new());
        let value = serde_json::to_value(&p).unwrap();
        for key in [
            "data_dir",
            "build_id",
            "cache_id",
            "repo_owner",
            "repo_name",
            "commit_sha",
            "path_env_var",
            "env_vars",
            "build_cmd",
            "build_secrets",
            "deploy_cmd",
            "deploy_secrets",
        ] {
            assert!(value.get(key).is_some(), "missing field {key}");
        }

        let round_tripped: BuilderParams = serde_json::from_value(value).unwrap();
        assert_eq!(round_tripped, p);
    }
}
