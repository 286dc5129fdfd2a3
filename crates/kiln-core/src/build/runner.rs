//! Sandboxed command execution with dual-stream log capture.
//!
//! Commands run under bubblewrap: every namespace except network is
//! unshared, the whole filesystem is bind-mounted read-only, and only the
//! build workspace is writable, at its own absolute path so that paths in
//! build output stay meaningful. stdout and stderr are scanned line by line
//! on two threads, funnelled through one bounded channel, and written as
//! JSON lines by a single writer so entries land in the log in the order
//! they were captured.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{Receiver, SyncSender};
use std::{sync, thread};

use chrono::Utc;
use thiserror::Error;

use crate::store::fs::{FsStore, WorkspaceError};
use crate::store::logs::{LogEntry, LogStream};

/// Capacity of the channel between the stream scanners and the log writer.
pub const LOG_CHANNEL_CAPACITY: usize = 100;

/// Infrastructure errors while running a command. A nonzero exit of the
/// command itself is not an error; it is reported through the exit code.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The build log file could not be opened.
    #[error("failed to open build log for build {build_id}: {source}")]
    OpenLog {
        /// Build the command belongs to.
        build_id: u64,
        /// The underlying error.
        #[source]
        source: WorkspaceError,
    },

    /// The command was given an empty argv.
    #[error("cannot run an empty command")]
    EmptyCommand,

    /// The command could not be spawned.
    #[error("failed to start command '{program}': {source}")]
    Spawn {
        /// argv[0] of the wrapped command.
        program: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// Waiting for the command failed.
    #[error("failed to wait for command: {0}")]
    Wait(#[source] io::Error),

    /// Reading a stdout/stderr pipe failed.
    #[error("failed to read command output: {0}")]
    Read(#[source] io::Error),

    /// Writing to the log file failed.
    #[error("failed to write log file: {0}")]
    Write(#[source] io::Error),

    /// Encoding a log entry failed.
    #[error("failed to encode log entry: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Something that can execute one build or deploy command for a build.
pub trait CommandRunner {
    /// Run `argv` with exactly `env` as its environment, rooted at
    /// `sandbox_dir` and started in `work_dir`, streaming captured output to
    /// the build's log file. Returns the command's exit code.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError`] only for infrastructure failures.
    fn run(
        &self,
        build_id: u64,
        sandbox_dir: &Path,
        work_dir: &Path,
        argv: &[String],
        env: &HashMap<String, String>,
    ) -> Result<i32, RunnerError>;
}

/// Runs commands under the bubblewrap sandbox, logging to the workspace
/// store's build log files.
#[derive(Debug, Clone, Copy)]
pub struct CmdRunner<'a> {
    /// Workspace store providing the log files.
    pub fs: &'a FsStore,
}

impl CommandRunner for CmdRunner<'_> {
    fn run(
        &self,
        build_id: u64,
        sandbox_dir: &Path,
        work_dir: &Path,
        argv: &[String],
        env: &HashMap<String, String>,
    ) -> Result<i32, RunnerError> {
        if argv.is_empty() {
            return Err(RunnerError::EmptyCommand);
        }
        let argv = sandbox_argv(sandbox_dir, work_dir, argv);

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let log = self
            .fs
            .open_build_logs(build_id)
            .map_err(|source| RunnerError::OpenLog { build_id, source })?;
        run_logged(cmd, log)
    }
}

/// Wrap `argv` in the bubblewrap sandbox invocation: die with the parent,
/// unshare everything but network, bind `/` read-only with a fresh `/dev`
/// and `/tmp`, mount the workspace read-write at its own path, and start in
/// `work_dir`.
#[must_use]
pub fn sandbox_argv(sandbox_dir: &Path, work_dir: &Path, argv: &[String]) -> Vec<String> {
    let sandbox = sandbox_dir.to_string_lossy().into_owned();
    let mut wrapped = vec![
        "bwrap".to_string(),
        "--die-with-parent".to_string(),
        "--unshare-all".to_string(),
        "--share-net".to_string(),
        "--ro-bind".to_string(),
        "/".to_string(),
        "/".to_string(),
        "--dev".to_string(),
        "/dev".to_string(),
        "--tmpfs".to_string(),
        "/tmp".to_string(),
        "--bind".to_string(),
        sandbox.clone(),
        sandbox,
        "--chdir".to_string(),
        work_dir.to_string_lossy().into_owned(),
    ];
    wrapped.extend(argv.iter().cloned());
    wrapped
}

/// Spawn a prepared command (stdout/stderr must be piped) and stream its
/// output to `log` as JSON lines. Returns the exit code, `-1` when the
/// command died from a signal.
///
/// Used directly by tests and by [`CmdRunner`] underneath the sandbox
/// wrapper.
///
/// # Errors
///
/// Returns [`RunnerError`] for spawn, pipe, encode or write failures.
pub fn run_logged(mut cmd: Command, log: File) -> Result<i32, RunnerError> {
    let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
        program: cmd.get_program().to_string_lossy().into_owned(),
        source,
    })?;
    let stdout = child.stdout.take().expect("stdout must be piped");
    let stderr = child.stderr.take().expect("stderr must be piped");

    let (entry_tx, entry_rx) = sync::mpsc::sync_channel::<LogEntry>(LOG_CHANNEL_CAPACITY);

    let status = thread::scope(|scope| -> Result<ExitStatus, RunnerError> {
        let out_scanner = {
            let tx = entry_tx.clone();
            scope.spawn(move || scan_stream(LogStream::Out, stdout, &tx))
        };
        let err_scanner = {
            let tx = entry_tx.clone();
            scope.spawn(move || scan_stream(LogStream::Err, stderr, &tx))
        };
        // The writer's channel closes once both scanners hit EOF.
        drop(entry_tx);
        let writer = scope.spawn(move || write_entries(&entry_rx, log));

        let status = child.wait().map_err(RunnerError::Wait);
        let out_result = out_scanner.join().expect("stdout scanner panicked");
        let err_result = err_scanner.join().expect("stderr scanner panicked");
        let write_result = writer.join().expect("log writer panicked");

        let status = status?;
        out_result?;
        err_result?;
        write_result?;
        Ok(status)
    })?;

    Ok(exit_code(status))
}

fn exit_code(status: ExitStatus) -> i32 {
    // Signal deaths have no exit code; -1 fails the sentinel parse and the
    // build is classified as an internal error.
    status.code().unwrap_or(-1)
}

fn scan_stream(
    stream: LogStream,
    pipe: impl Read,
    tx: &SyncSender<LogEntry>,
) -> Result<(), RunnerError> {
    for line in BufReader::new(pipe).lines() {
        let line = line.map_err(RunnerError::Read)?;
        let entry = LogEntry {
            stream,
            timestamp: Utc::now(),
            text: line,
        };
        if tx.send(entry).is_err() {
            // Writer bailed out; its error is what the caller will see.
            break;
        }
    }
    Ok(())
}

fn write_entries(rx: &Receiver<LogEntry>, mut log: File) -> Result<(), RunnerError> {
    // One write per line, unbuffered, so live tailers see entries as soon as
    // they are captured.
    for entry in rx {
        serde_json::to_writer(&mut log, &entry).map_err(RunnerError::Encode)?;
        log.write_all(b"\n").map_err(RunnerError::Write)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use super::*;

    fn capture(script: &str, env: &[(&str, &str)]) -> (i32, Vec<LogEntry>) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        store.create_root_dirs().unwrap();

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(script)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in env {
            cmd.env(key, value);
        }

        let log = store.open_build_logs(1).unwrap();
        let code = run_logged(cmd, log).unwrap();
        let entries = store.get_logs(1).unwrap();
        (code, entries)
    }

    #[test]
    fn captures_both_streams_and_the_exit_code() {
        let (code, entries) = capture("echo one; echo two 1>&2; echo three; exit 7", &[]);
        assert_eq!(code, 7);

        let out: Vec<&str> = entries
            .iter()
            .filter(|e| e.stream == LogStream::Out)
            .map(|e| e.text.as_str())
            .collect();
        let err: Vec<&str> = entries
            .iter()
            .filter(|e| e.stream == LogStream::Err)
            .map(|e| e.text.as_str())
            .collect();
        assert_eq!(out, vec!["one", "three"]);
        assert_eq!(err, vec!["two"]);
    }

    #[test]
    fn high_exit_codes_are_preserved() {
        let (code, _) = capture("exit 137", &[]);
        assert_eq!(code, 137);
    }

    #[test]
    fn signal_death_reports_minus_one() {
        let (code, _) = capture("kill -9 $$", &[]);
        assert_eq!(code, -1);
    }

    #[test]
    fn child_env_is_exactly_what_was_passed() {
        let (code, entries) = capture("printenv FOO; printenv BAR || echo BAR-unset", &[(
            "FOO", "bar",
        )]);
        assert_eq!(code, 0);
        let texts: Vec<&str> = entries.iter().map(|e| e.text.as_str()).collect();
        assert!(texts.contains(&"bar"));
        assert!(texts.contains(&"BAR-unset"));
    }

    #[test]
    fn log_lines_are_wellformed_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        store.create_root_dirs().unwrap();

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg("echo alpha; echo beta")
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let log = store.open_build_logs(2).unwrap();
        run_logged(cmd, log).unwrap();

        let raw = fs::read_to_string(dir.path().join("build-logs/2.jsonl")).unwrap();
        for line in raw.lines() {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(value["stream"], "out");
            assert!(value["timestamp"].is_string());
            assert!(!value["text"].as_str().unwrap().contains('\n'));
        }
    }

    #[test]
    fn sandbox_wraps_the_command() {
        let sandbox = PathBuf::from("/data/build/42");
        let work = PathBuf::from("/data/build/42/owner/repo");
        let argv = vec!["make".to_string(), "test".to_string()];

        let wrapped = sandbox_argv(&sandbox, &work, &argv);
        assert_eq!(
            wrapped,
            vec![
                "bwrap",
                "--die-with-parent",
                "--unshare-all",
                "--share-net",
                "--ro-bind",
                "/",
                "/",
                "--dev",
                "/dev",
                "--tmpfs",
                "/tmp",
                "--bind",
                "/data/build/42",
                "/data/build/42",
                "--chdir",
                "/data/build/42/owner/repo",
                "make",
                "test",
            ]
        );
    }
}
