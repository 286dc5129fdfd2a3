//! # kiln-core
//!
//! Build lifecycle engine for kiln, a self-hosted continuous-integration
//! server. A source-control event enqueues a build; the dispatcher hands it
//! to a sandboxed child process that checks out the commit, runs the
//! configured commands and streams structured logs to disk; results are
//! reported back through the build store and, optionally, GitHub commit
//! statuses.
//!
//! The engine is split along its two durable stores:
//!
//! - [`store::db::DbStore`] holds repositories, builds and live-builder
//!   registrations in SQLite (authoritative for build state)
//! - [`store::fs::FsStore`] holds per-build workspaces, log files and
//!   exit-code sentinels on disk (authoritative for build artifacts)
//!
//! [`build::processor::Processor`] reconciles the two on a fixed tick,
//! [`build::builder`] runs one build end-to-end inside its own process, and
//! [`build::controller::BuilderController`] supervises those processes
//! across daemon restarts.
//!
//! Process supervision relies on `/proc` and the sandbox on bubblewrap, so
//! the engine is Linux-only.

#![warn(missing_docs)]

pub mod build;
pub mod config;
pub mod github;
pub mod store;

pub use config::{Config, GithubConfig, RepoConfig};
pub use store::db::{Build, BuildMeta, BuildResult, DbStore, PendingBuild, Repo, RunningBuilder};
pub use store::fs::FsStore;
pub use store::logs::{LogEntry, LogStream};
