//! Reading the structured build logs.
//!
//! A build log is newline-delimited JSON, one [`LogEntry`] per line, written
//! by the command runner inside the builder. Readers only ever see whole
//! lines: every write is line-terminated, and [`LogTailer`] buffers partial
//! trailing lines until the newline arrives.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::fs::{FsStore, WorkspaceError};

/// Which output stream a log line was captured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    /// The command's stdout.
    Out,
    /// The command's stderr.
    Err,
}

/// One captured line of command output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Stream the line was read from.
    pub stream: LogStream,
    /// When the line was captured.
    pub timestamp: DateTime<Utc>,
    /// The line, without its trailing newline.
    pub text: String,
}

impl FsStore {
    /// Read a build's whole log file. A log file that does not exist yet
    /// yields an empty list.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::Io`] on read failure and
    /// [`WorkspaceError::LogDecode`] when a line is not a valid entry.
    pub fn get_logs(&self, build_id: u64) -> Result<Vec<LogEntry>, WorkspaceError> {
        let path = self.build_log_file(build_id);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(WorkspaceError::io(
                    format!("opening log file '{}'", path.display()),
                    e,
                ))
            }
        };

        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| WorkspaceError::io("reading log file", e))?;
            if line.is_empty() {
                continue;
            }
            let entry = serde_json::from_str(&line)
                .map_err(|source| WorkspaceError::LogDecode { build_id, source })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Create a tailer over a build's log file, yielding entries starting at
    /// `from_line` (1-based). The file does not need to exist yet.
    #[must_use]
    pub fn tail_logs(&self, build_id: u64, from_line: u64) -> LogTailer {
        LogTailer {
            build_id,
            path: self.build_log_file(build_id),
            reader: None,
            partial: String::new(),
            from_line,
            current_line: 0,
        }
    }
}

/// Incremental reader over a build's log file for live viewers.
///
/// Each [`LogTailer::read`] call yields the entries appended since the last
/// call. The underlying file is opened on the first call that finds it;
/// until then reads return empty batches.
#[derive(Debug)]
pub struct LogTailer {
    build_id: u64,
    path: PathBuf,
    reader: Option<BufReader<File>>,
    partial: String,
    from_line: u64,
    current_line: u64,
}

impl LogTailer {
    /// Read all complete entries currently available.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::Io`] on read failure and
    /// [`WorkspaceError::LogDecode`] when a complete line fails to parse.
    pub fn read(&mut self) -> Result<Vec<LogEntry>, WorkspaceError> {
        if self.reader.is_none() {
            match File::open(&self.path) {
                Ok(file) => self.reader = Some(BufReader::new(file)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => {
                    return Err(WorkspaceError::io(
                        format!("opening log file '{}'", self.path.display()),
                        e,
                    ))
                }
            }
        }
        let reader = self.reader.as_mut().expect("reader opened above");

        let mut entries = Vec::new();
        loop {
            let mut chunk = String::new();
            let n = reader
                .read_line(&mut chunk)
                .map_err(|e| WorkspaceError::io("reading log file", e))?;
            if n == 0 {
                return Ok(entries);
            }
            if !chunk.ends_with('\n') {
                // Line still being written; keep what we have and pick the
                // rest up on the next call.
                self.partial.push_str(&chunk);
                return Ok(entries);
            }

            let line = if self.partial.is_empty() {
                chunk
            } else {
                let mut line = std::mem::take(&mut self.partial);
                line.push_str(&chunk);
                line
            };

            self.current_line += 1;
            if self.current_line < self.from_line {
                continue;
            }

            let entry = serde_json::from_str(line.trim_end_matches('\n')).map_err(|source| {
                WorkspaceError::LogDecode {
                    build_id: self.build_id,
                    source,
                }
            })?;
            entries.push(entry);
        }
    }
}
