//! On-disk workspace store.
//!
//! Directory layout under the data dir:
//!
//! ```text
//! build/<build_id>/            per-build workspace (sandbox root, HOME)
//! build-logs/<build_id>.jsonl  structured captured command output
//! builder-logs/<build_id>.txt  the builder child's own stdout/stderr
//! exit-code/<build_id>         decimal exit code, written once per build
//! ```
//!
//! The workspace of the latest successful default-branch build is retained
//! as the repo cache and archive-copied into new workspaces before checkout.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;

const BUILD_DIR: &str = "build";
const BUILD_LOGS_DIR: &str = "build-logs";
const BUILDER_LOGS_DIR: &str = "builder-logs";
const EXIT_CODE_DIR: &str = "exit-code";

const DIR_MODE: u32 = 0o700;
const FILE_MODE: u32 = 0o600;

/// Errors from the workspace store.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// An I/O operation failed.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// What was being done.
        context: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// A workspace directory for this build already exists.
    #[error("workspace for build {0} already exists")]
    WorkspaceExists(u64),

    /// The archive copy from the cache workspace failed.
    #[error("archive copy of '{src}' to '{dst}' failed: {detail}", src = .src.display(), dst = .dst.display())]
    CopyFailed {
        /// Copy source (the cache workspace).
        src: PathBuf,
        /// Copy destination (the new workspace).
        dst: PathBuf,
        /// `cp` diagnostics.
        detail: String,
    },

    /// The exit-code sentinel did not hold a nonnegative decimal.
    #[error("exit-code file for build {build_id} holds '{contents}'")]
    ExitCodeMalformed {
        /// Build whose sentinel was read.
        build_id: u64,
        /// What the file held instead.
        contents: String,
    },

    /// The sentinel was parsed but could not be removed afterwards.
    #[error("failed to remove exit-code file for build {build_id} (code {code}): {source}")]
    ExitCodeCleanup {
        /// Build whose sentinel was read.
        build_id: u64,
        /// The successfully parsed exit code.
        code: i32,
        /// The unlink error.
        #[source]
        source: io::Error,
    },

    /// A log line could not be decoded.
    #[error("malformed log entry for build {build_id}: {source}")]
    LogDecode {
        /// Build whose log was read.
        build_id: u64,
        /// The decode error.
        #[source]
        source: serde_json::Error,
    },
}

impl WorkspaceError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Result of one retention sweep over the workspace pool.
#[derive(Debug, Default)]
pub struct RetainOutcome {
    /// Workspace ids that were deleted, ascending.
    pub deleted: Vec<u64>,
    /// Workspaces that could not be deleted; retried on the next sweep.
    pub failures: Vec<(u64, WorkspaceError)>,
}

/// Handle to the on-disk workspace store rooted at the data dir.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Create a handle rooted at `root`. No filesystem access happens here;
    /// call [`FsStore::create_root_dirs`] once at startup.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The data dir this store is rooted at.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Idempotently create the `build/`, `build-logs/`, `builder-logs/` and
    /// `exit-code/` directories with mode 0700.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::Io`] when a directory cannot be created.
    pub fn create_root_dirs(&self) -> Result<(), WorkspaceError> {
        for sub in [BUILD_DIR, BUILD_LOGS_DIR, BUILDER_LOGS_DIR, EXIT_CODE_DIR] {
            let path = self.root.join(sub);
            ensure_dir_0700(&path)
                .map_err(|e| WorkspaceError::io(format!("creating '{}'", path.display()), e))?;
        }
        Ok(())
    }

    /// Path of the workspace directory for a build.
    #[must_use]
    pub fn build_dir(&self, build_id: u64) -> PathBuf {
        self.root.join(BUILD_DIR).join(build_id.to_string())
    }

    fn exit_code_file(&self, build_id: u64) -> PathBuf {
        self.root.join(EXIT_CODE_DIR).join(build_id.to_string())
    }

    pub(crate) fn build_log_file(&self, build_id: u64) -> PathBuf {
        self.root
            .join(BUILD_LOGS_DIR)
            .join(format!("{build_id}.jsonl"))
    }

    fn builder_log_file(&self, build_id: u64) -> PathBuf {
        self.root
            .join(BUILDER_LOGS_DIR)
            .join(format!("{build_id}.txt"))
    }

    /// Create the workspace for a build and return its absolute path.
    ///
    /// With a `cache_id`, the cache workspace is archive-copied (`cp -a`,
    /// preserving attributes and symlinks) into place; otherwise an empty
    /// 0700 directory is created. `checkout_dir` is a relative subpath that
    /// is created inside the workspace for the source checkout.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::WorkspaceExists`] when a directory for this
    /// build is already present (build ids never repeat, so this means
    /// corruption), [`WorkspaceError::CopyFailed`] when the archive copy
    /// fails, and [`WorkspaceError::Io`] on any other filesystem failure.
    /// Partial directories may remain; the retention sweep removes them.
    pub fn create_build_dir(
        &self,
        build_id: u64,
        cache_id: Option<u64>,
        checkout_dir: &str,
    ) -> Result<PathBuf, WorkspaceError> {
        let build_dir = self.build_dir(build_id);
        if build_dir.exists() {
            return Err(WorkspaceError::WorkspaceExists(build_id));
        }

        match cache_id {
            // The copy creates the workspace directory itself.
            Some(cache_id) => copy_dir_archive(&self.build_dir(cache_id), &build_dir)?,
            None => fs::DirBuilder::new()
                .mode(DIR_MODE)
                .create(&build_dir)
                .map_err(|e| {
                    WorkspaceError::io(format!("creating workspace '{}'", build_dir.display()), e)
                })?,
        }

        let checkout = build_dir.join(checkout_dir);
        fs::DirBuilder::new()
            .recursive(true)
            .mode(DIR_MODE)
            .create(&checkout)
            .map_err(|e| {
                WorkspaceError::io(format!("creating checkout dir '{}'", checkout.display()), e)
            })?;

        std::path::absolute(&build_dir)
            .map_err(|e| WorkspaceError::io("resolving workspace path", e))
    }

    /// Write the exit-code sentinel for a build: the decimal code, one line,
    /// mode 0600, overwriting any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::Io`] when the file cannot be written.
    pub fn write_exit_code(&self, build_id: u64, exit_code: i32) -> Result<(), WorkspaceError> {
        let path = self.exit_code_file(build_id);
        let context = || format!("writing exit-code file '{}'", path.display());
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(FILE_MODE)
            .open(&path)
            .map_err(|e| WorkspaceError::io(context(), e))?;
        file.write_all(exit_code.to_string().as_bytes())
            .map_err(|e| WorkspaceError::io(context(), e))
    }

    /// Read a build's exit-code sentinel, parse it as a nonnegative decimal
    /// and remove the file.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::Io`] when the file is missing or unreadable
    /// (the dispatcher classifies the build as `error` in that case),
    /// [`WorkspaceError::ExitCodeMalformed`] when it does not parse, and
    /// [`WorkspaceError::ExitCodeCleanup`] when the parsed value could not
    /// be cleaned up.
    pub fn read_and_clean_exit_code(&self, build_id: u64) -> Result<i32, WorkspaceError> {
        let path = self.exit_code_file(build_id);
        let data = fs::read_to_string(&path).map_err(|e| {
            WorkspaceError::io(format!("reading exit-code file '{}'", path.display()), e)
        })?;
        let code = data
            .trim_end()
            .parse::<u32>()
            .ok()
            .and_then(|code| i32::try_from(code).ok())
            .ok_or_else(|| WorkspaceError::ExitCodeMalformed {
                build_id,
                contents: data.trim_end().to_string(),
            })?;

        match fs::remove_file(&path) {
            Ok(()) => Ok(code),
            Err(source) => Err(WorkspaceError::ExitCodeCleanup {
                build_id,
                code,
                source,
            }),
        }
    }

    /// Delete every workspace whose id is not in `retained`.
    ///
    /// Entries under `build/` with non-numeric names are left alone. A
    /// failed deletion is recorded in the outcome and does not stop the
    /// sweep. Sandboxed builds can leave files without write permission, so
    /// a failed `remove_dir_all` chmods the whole tree to 0700 and retries
    /// once.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::Io`] only when the pool itself cannot be
    /// enumerated.
    pub fn retain_build_dirs(
        &self,
        retained: &HashSet<u64>,
    ) -> Result<RetainOutcome, WorkspaceError> {
        let build_root = self.root.join(BUILD_DIR);
        let entries = fs::read_dir(&build_root).map_err(|e| {
            WorkspaceError::io(format!("listing workspaces in '{}'", build_root.display()), e)
        })?;

        let mut outcome = RetainOutcome::default();
        for entry in entries {
            let entry = entry
                .map_err(|e| WorkspaceError::io("listing workspaces", e))?;
            let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u64>().ok())
            else {
                continue;
            };
            if retained.contains(&id) {
                continue;
            }

            match remove_tree(&entry.path()) {
                Ok(()) => outcome.deleted.push(id),
                Err(e) => outcome
                    .failures
                    .push((id, WorkspaceError::io(format!("deleting workspace {id}"), e))),
            }
        }
        outcome.deleted.sort_unstable();
        Ok(outcome)
    }

    /// Open the append-only structured log file for a build, creating it if
    /// absent.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::Io`] when the file cannot be opened.
    pub fn open_build_logs(&self, build_id: u64) -> Result<File, WorkspaceError> {
        open_append(&self.build_log_file(build_id))
    }

    /// Open the append-only log file capturing a builder child's own
    /// stdout/stderr, creating it if absent.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::Io`] when the file cannot be opened.
    pub fn open_builder_logs(&self, build_id: u64) -> Result<File, WorkspaceError> {
        open_append(&self.builder_log_file(build_id))
    }
}

fn open_append(path: &Path) -> Result<File, WorkspaceError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .mode(FILE_MODE)
        .open(path)
        .map_err(|e| WorkspaceError::io(format!("opening log file '{}'", path.display()), e))
}

fn ensure_dir_0700(path: &Path) -> io::Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    fs::DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(path)
}

fn copy_dir_archive(src: &Path, dst: &Path) -> Result<(), WorkspaceError> {
    let output = Command::new("cp")
        .arg("-a")
        .arg(src)
        .arg(dst)
        .output()
        .map_err(|e| WorkspaceError::io("running cp", e))?;
    if !output.status.success() {
        return Err(WorkspaceError::CopyFailed {
            src: src.to_path_buf(),
            dst: dst.to_path_buf(),
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

fn remove_tree(path: &Path) -> io::Result<()> {
    if fs::remove_dir_all(path).is_ok() {
        return Ok(());
    }
    chmod_tree(path);
    fs::remove_dir_all(path)
}

fn chmod_tree(path: &Path) {
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(DIR_MODE));
    if let Ok(entries) = fs::read_dir(path) {
        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                chmod_tree(&entry.path());
            } else if !file_type.is_symlink() {
                let _ = fs::set_permissions(&entry.path(), fs::Permissions::from_mode(DIR_MODE));
            }
        }
    }
}
