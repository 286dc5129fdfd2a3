//! SQLite-backed build store.
//!
//! Holds repositories, builds and the live-builders table. The connection is
//! shared behind a mutex; every multi-statement operation runs inside a
//! single transaction. SQLite transactions are serializable, so the
//! counter-increment-plus-insert pair in [`DbStore::create_build`] needs no
//! retry loop; an IMMEDIATE transaction takes the write lock up front.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use thiserror::Error;

/// Maximum length of a build ref.
pub const MAX_REF_LENGTH: usize = 255;
/// Maximum length of a build author.
pub const MAX_AUTHOR_LENGTH: usize = 100;
/// Commit messages longer than this are truncated on creation.
pub const MAX_MESSAGE_LENGTH: usize = 1000;
/// Maximum length of a build link.
pub const MAX_LINK_LENGTH: usize = 255;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS repos (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    owner         TEXT NOT NULL,
    name          TEXT NOT NULL,
    build_counter INTEGER NOT NULL DEFAULT 0,
    cache_id      INTEGER REFERENCES builds (id),
    UNIQUE (owner, name)
);

CREATE TABLE IF NOT EXISTS builds (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    repo_id    INTEGER NOT NULL REFERENCES repos (id),
    number     INTEGER NOT NULL,
    link       TEXT NOT NULL,
    ref        TEXT NOT NULL,
    commit_sha TEXT NOT NULL,
    message    TEXT NOT NULL,
    author     TEXT NOT NULL,
    created    TEXT NOT NULL,
    started    TEXT,
    finished   TEXT,
    result     TEXT
);

CREATE TABLE IF NOT EXISTS builders (
    build_id INTEGER PRIMARY KEY REFERENCES builds (id),
    pid      INTEGER NOT NULL,
    cache_id INTEGER REFERENCES builds (id)
);
";

/// Errors from the build store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying SQLite operation failed.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The connection mutex was poisoned by a panicking thread.
    #[error("build store connection lock poisoned")]
    LockPoisoned,

    /// No repository with the given owner and name is registered.
    #[error("no repository named {owner}/{name}")]
    RepoNotFound {
        /// Repository owner.
        owner: String,
        /// Repository name.
        name: String,
    },

    /// No build with the given id exists.
    #[error("build {0} does not exist")]
    BuildNotFound(u64),

    /// The submitted build metadata was rejected.
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Rejections produced when validating submitted build metadata.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// The ref does not start with `refs/`.
    #[error("ref must start with 'refs/', got '{0}'")]
    RefFormat(String),

    /// The ref exceeds [`MAX_REF_LENGTH`].
    #[error("ref exceeds {MAX_REF_LENGTH} characters")]
    RefTooLong,

    /// The commit SHA is not 40 lowercase hex characters.
    #[error("commit SHA must be 40 lowercase hex characters, got '{0}'")]
    CommitShaFormat(String),

    /// The author exceeds [`MAX_AUTHOR_LENGTH`].
    #[error("author exceeds {MAX_AUTHOR_LENGTH} characters")]
    AuthorTooLong,

    /// A non-empty link does not start with `https://`.
    #[error("link must start with 'https://', got '{0}'")]
    LinkFormat(String),

    /// The link exceeds [`MAX_LINK_LENGTH`].
    #[error("link exceeds {MAX_LINK_LENGTH} characters")]
    LinkTooLong,
}

/// Terminal outcome of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildResult {
    /// The build command (and deploy, if any) exited zero.
    Success,
    /// A user command exited nonzero.
    Failure,
    /// The build was canceled by a user.
    Canceled,
    /// The build ran past its time limit.
    Timeout,
    /// The CI itself failed; the builder died without a readable sentinel.
    Error,
}

impl BuildResult {
    /// Stable textual form, as stored in the database and reported upstream.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Canceled => "canceled",
            Self::Timeout => "timeout",
            Self::Error => "error",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            "canceled" => Some(Self::Canceled),
            "timeout" => Some(Self::Timeout),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for BuildResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for BuildResult {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for BuildResult {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Self::parse(s)
            .ok_or_else(|| FromSqlError::Other(format!("unknown build result '{s}'").into()))
    }
}

/// A repository identified by owner and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Repo {
    /// Repository owner (user or organization).
    pub owner: String,
    /// Repository name.
    pub name: String,
}

impl fmt::Display for Repo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Source metadata attached to a build on creation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BuildMeta {
    /// Link to the commit or change, empty or `https://…`.
    pub link: String,
    /// Full git ref the build was triggered for, e.g. `refs/heads/main`.
    pub git_ref: String,
    /// 40-character lowercase hex commit SHA.
    pub commit_sha: String,
    /// Commit message (truncated to [`MAX_MESSAGE_LENGTH`] on creation).
    pub message: String,
    /// Commit author.
    pub author: String,
}

/// A build row joined with its repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Build {
    /// Globally unique build id.
    pub id: u64,
    /// Surrogate key of the owning repository.
    pub repo_id: u64,
    /// Per-repository build number.
    pub number: u64,
    /// Source metadata.
    pub meta: BuildMeta,
    /// When the build was enqueued.
    pub created: DateTime<Utc>,
    /// When a builder was started for it, if any.
    pub started: Option<DateTime<Utc>>,
    /// When the build finished, if it has.
    pub finished: Option<DateTime<Utc>>,
    /// Terminal result, present iff `finished` is.
    pub result: Option<BuildResult>,
    /// Owning repository.
    pub repo: Repo,
}

/// A build waiting to be dispatched, joined with the repo's current cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingBuild {
    /// Build id.
    pub id: u64,
    /// Workspace to seed this build from, if the repo has a cache.
    pub cache_id: Option<u64>,
    /// Owning repository.
    pub repo: Repo,
    /// Full git ref.
    pub git_ref: String,
    /// Commit to build.
    pub commit_sha: String,
}

/// A live-builder registration joined with build and repo metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningBuilder {
    /// OS process id of the builder child.
    pub pid: u32,
    /// Build the process is running.
    pub build_id: u64,
    /// Owning repository.
    pub repo: Repo,
    /// Commit being built.
    pub commit_sha: String,
    /// Full git ref.
    pub git_ref: String,
    /// Workspace the build was seeded from, if any.
    pub cache_id: Option<u64>,
}

/// Validate submitted build metadata.
///
/// # Errors
///
/// Returns the first [`ValidationError`] encountered. The message field is
/// not validated here; it is truncated on creation instead.
pub fn validate_build_meta(meta: &BuildMeta) -> Result<(), ValidationError> {
    if !meta.git_ref.starts_with("refs/") {
        return Err(ValidationError::RefFormat(meta.git_ref.clone()));
    }
    if meta.git_ref.chars().count() > MAX_REF_LENGTH {
        return Err(ValidationError::RefTooLong);
    }

    let sha_ok = meta.commit_sha.len() == 40
        && meta
            .commit_sha
            .bytes()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
    if !sha_ok {
        return Err(ValidationError::CommitShaFormat(meta.commit_sha.clone()));
    }

    if meta.author.chars().count() > MAX_AUTHOR_LENGTH {
        return Err(ValidationError::AuthorTooLong);
    }

    if !meta.link.is_empty() {
        if !meta.link.starts_with("https://") {
            return Err(ValidationError::LinkFormat(meta.link.clone()));
        }
        if meta.link.chars().count() > MAX_LINK_LENGTH {
            return Err(ValidationError::LinkTooLong);
        }
    }

    Ok(())
}

fn truncate_message(message: &str) -> &str {
    match message.char_indices().nth(MAX_MESSAGE_LENGTH) {
        Some((idx, _)) => &message[..idx],
        None => message,
    }
}

/// Handle to the SQLite build store.
///
/// Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct DbStore {
    conn: Arc<Mutex<Connection>>,
}

impl DbStore {
    /// Open (or create) the store at the given path and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] when the database cannot be opened or
    /// the schema cannot be applied.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Open an in-memory store. Used by tests.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] when the database cannot be opened.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Register a repository; a no-op if it already exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on database failure.
    pub fn create_repo_if_not_exists(&self, repo: &Repo) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO repos (owner, name)
             VALUES (?1, ?2)
             ON CONFLICT (owner, name) DO NOTHING",
            params![repo.owner, repo.name],
        )?;
        Ok(())
    }

    /// Number of registered repositories.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on database failure.
    pub fn count_repos(&self) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM repos", [], |row| row.get(0))?)
    }

    /// Enqueue a build: validate the metadata, bump the repo's build counter
    /// and insert the build row, all in one transaction. Returns the new
    /// build id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] for rejected metadata,
    /// [`StoreError::RepoNotFound`] when the repository is not registered,
    /// and [`StoreError::Sqlite`] on database failure.
    pub fn create_build(
        &self,
        owner: &str,
        name: &str,
        meta: &BuildMeta,
        created: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        validate_build_meta(meta)?;
        let message = truncate_message(&meta.message);

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let row: Option<(u64, u64)> = tx
            .query_row(
                "UPDATE repos
                 SET build_counter = build_counter + 1
                 WHERE owner = ?1 AND name = ?2
                 RETURNING id, build_counter",
                params![owner, name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((repo_id, number)) = row else {
            return Err(StoreError::RepoNotFound {
                owner: owner.to_string(),
                name: name.to_string(),
            });
        };

        let build_id: u64 = tx.query_row(
            "INSERT INTO builds (repo_id, number, link, ref, commit_sha, message, author, created)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             RETURNING id",
            params![
                repo_id,
                number,
                meta.link,
                meta.git_ref,
                meta.commit_sha,
                message,
                meta.author,
                created
            ],
            |row| row.get(0),
        )?;

        tx.commit()?;
        Ok(build_id)
    }

    /// Record that a builder process was started for a build: sets
    /// `builds.started` and inserts the live-builder row in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::BuildNotFound`] when the build does not exist
    /// and [`StoreError::Sqlite`] on database failure.
    pub fn start_build(
        &self,
        build_id: u64,
        started: DateTime<Utc>,
        pid: u32,
        cache_id: Option<u64>,
    ) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let updated = tx.execute(
            "UPDATE builds SET started = ?1 WHERE id = ?2",
            params![started, build_id],
        )?;
        if updated == 0 {
            return Err(StoreError::BuildNotFound(build_id));
        }

        tx.execute(
            "INSERT INTO builders (build_id, pid, cache_id)
             VALUES (?1, ?2, ?3)",
            params![build_id, pid, cache_id],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Finalize a build: set `finished` and `result`, optionally promote its
    /// workspace to the repo cache, and delete the live-builder row, all in
    /// one transaction.
    ///
    /// Cache promotion is monotonic: a workspace only becomes the cache when
    /// its build id is greater than the current `cache_id`, so an older
    /// build finishing late cannot overwrite a newer cache. Calling this a
    /// second time with the same arguments is harmless.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::BuildNotFound`] when the build does not exist
    /// and [`StoreError::Sqlite`] on database failure.
    pub fn finish_build(
        &self,
        build_id: u64,
        finished: DateTime<Utc>,
        result: BuildResult,
        cache_build_files: bool,
    ) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let updated = tx.execute(
            "UPDATE builds SET finished = ?1, result = ?2 WHERE id = ?3",
            params![finished, result, build_id],
        )?;
        if updated == 0 {
            return Err(StoreError::BuildNotFound(build_id));
        }

        if cache_build_files {
            tx.execute(
                "UPDATE repos
                 SET cache_id = ?1
                 WHERE id = (SELECT repo_id FROM builds WHERE id = ?1)
                   AND (cache_id IS NULL OR cache_id < ?1)",
                params![build_id],
            )?;
        }

        tx.execute("DELETE FROM builders WHERE build_id = ?1", params![build_id])?;

        tx.commit()?;
        Ok(())
    }

    /// Fetch one build joined with its repository.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::BuildNotFound`] when no such build exists and
    /// [`StoreError::Sqlite`] on database failure.
    pub fn get_build(&self, build_id: u64) -> Result<Build, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT b.id, b.repo_id, b.number, b.link, b.ref, b.commit_sha, b.message,
                    b.author, b.created, b.started, b.finished, b.result, r.owner, r.name
             FROM builds AS b
             JOIN repos AS r ON b.repo_id = r.id
             WHERE b.id = ?1",
            params![build_id],
            build_from_row,
        )
        .optional()?
        .ok_or(StoreError::BuildNotFound(build_id))
    }

    /// List builds in descending id order, optionally only those before a
    /// given id (keyset pagination for the build list view).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on database failure.
    pub fn list_builds(
        &self,
        before_id: Option<u64>,
        limit: u32,
    ) -> Result<Vec<Build>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT b.id, b.repo_id, b.number, b.link, b.ref, b.commit_sha, b.message,
                    b.author, b.created, b.started, b.finished, b.result, r.owner, r.name
             FROM builds AS b
             JOIN repos AS r ON b.repo_id = r.id
             WHERE ?1 IS NULL OR b.id < ?1
             ORDER BY b.id DESC
             LIMIT ?2",
        )?;
        let builds = stmt
            .query_map(params![before_id, limit], build_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(builds)
    }

    /// All builds waiting for a builder, ascending by id (FIFO by creation),
    /// each joined with the owning repo's current cache id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on database failure.
    pub fn get_pending_builds(&self) -> Result<Vec<PendingBuild>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT b.id, b.ref, b.commit_sha, r.owner, r.name, r.cache_id
             FROM builds AS b
             JOIN repos AS r ON b.repo_id = r.id
             WHERE b.started IS NULL AND b.finished IS NULL AND b.result IS NULL
             ORDER BY b.id ASC",
        )?;
        let builds = stmt
            .query_map([], |row| {
                Ok(PendingBuild {
                    id: row.get(0)?,
                    git_ref: row.get(1)?,
                    commit_sha: row.get(2)?,
                    repo: Repo {
                        owner: row.get(3)?,
                        name: row.get(4)?,
                    },
                    cache_id: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(builds)
    }

    /// All live-builder registrations, ascending by build id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on database failure.
    pub fn list_builders(&self) -> Result<Vec<RunningBuilder>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT br.pid, b.id, r.owner, r.name, b.commit_sha, b.ref, br.cache_id
             FROM builders AS br
             JOIN builds AS b ON br.build_id = b.id
             JOIN repos AS r ON b.repo_id = r.id
             ORDER BY b.id ASC",
        )?;
        let builders = stmt
            .query_map([], |row| {
                Ok(RunningBuilder {
                    pid: row.get(0)?,
                    build_id: row.get(1)?,
                    repo: Repo {
                        owner: row.get(2)?,
                        name: row.get(3)?,
                    },
                    commit_sha: row.get(4)?,
                    git_ref: row.get(5)?,
                    cache_id: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(builders)
    }

    /// Workspace ids that must be kept on disk: every running builder's own
    /// workspace, every workspace a running builder was seeded from, and
    /// every repo's current cache. The dispatcher deletes everything else.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on database failure.
    pub fn list_build_dirs_in_use(&self) -> Result<Vec<u64>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT build_id FROM builders
             UNION
             SELECT cache_id FROM builders WHERE cache_id IS NOT NULL
             UNION
             SELECT cache_id FROM repos WHERE cache_id IS NOT NULL
             ORDER BY 1",
        )?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<u64>, _>>()?;
        Ok(ids)
    }
}

fn build_from_row(row: &Row<'_>) -> rusqlite::Result<Build> {
    Ok(Build {
        id: row.get(0)?,
        repo_id: row.get(1)?,
        number: row.get(2)?,
        meta: BuildMeta {
            link: row.get(3)?,
            git_ref: row.get(4)?,
            commit_sha: row.get(5)?,
            message: row.get(6)?,
            author: row.get(7)?,
        },
        created: row.get(8)?,
        started: row.get(9)?,
        finished: row.get(10)?,
        result: row.get(11)?,
        repo: Repo {
            owner: row.get(12)?,
            name: row.get(13)?,
        },
    })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn ts(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    fn sha(seed: u8) -> String {
        format!("{:038x}{:02x}", 0, seed)
    }

    fn meta(n: u8) -> BuildMeta {
        BuildMeta {
            link: format!("https://example.com/commit/{n}"),
            git_ref: "refs/heads/main".to_string(),
            commit_sha: sha(n),
            message: format!("commit {n}"),
            author: "author".to_string(),
        }
    }

    fn store_with_repos(repos: &[(&str, &str)]) -> DbStore {
        let store = DbStore::open_in_memory().unwrap();
        for (owner, name) in repos {
            store
                .create_repo_if_not_exists(&Repo {
                    owner: (*owner).to_string(),
                    name: (*name).to_string(),
                })
                .unwrap();
        }
        store
    }

    #[test]
    fn create_repo_is_idempotent() {
        let store = store_with_repos(&[("owner", "repo1"), ("owner", "repo2")]);
        store
            .create_repo_if_not_exists(&Repo {
                owner: "owner".to_string(),
                name: "repo1".to_string(),
            })
            .unwrap();
        assert_eq!(store.count_repos().unwrap(), 2);
    }

    #[test]
    fn create_build_assigns_ids_and_numbers() {
        let store = store_with_repos(&[("owner", "repo1"), ("owner", "repo2")]);

        assert_eq!(
            store
                .create_build("owner", "repo1", &meta(1), ts(11))
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .create_build("owner", "repo1", &meta(2), ts(12))
                .unwrap(),
            2
        );
        assert_eq!(
            store
                .create_build("owner", "repo2", &meta(3), ts(21))
                .unwrap(),
            3
        );

        // Per-repo numbers restart at 1 for each repository.
        assert_eq!(store.get_build(1).unwrap().number, 1);
        assert_eq!(store.get_build(2).unwrap().number, 2);
        assert_eq!(store.get_build(3).unwrap().number, 1);
    }

    #[test]
    fn create_build_requires_registered_repo() {
        let store = store_with_repos(&[]);
        let err = store
            .create_build("ghost", "repo", &meta(1), ts(1))
            .unwrap_err();
        assert!(matches!(err, StoreError::RepoNotFound { .. }));
    }

    #[test]
    fn get_build_round_trips() {
        let store = store_with_repos(&[("owner", "repo")]);
        let id = store.create_build("owner", "repo", &meta(7), ts(7)).unwrap();

        let build = store.get_build(id).unwrap();
        assert_eq!(build.id, id);
        assert_eq!(build.number, 1);
        assert_eq!(build.meta, meta(7));
        assert_eq!(build.created, ts(7));
        assert_eq!(build.started, None);
        assert_eq!(build.finished, None);
        assert_eq!(build.result, None);
        assert_eq!(build.repo.to_string(), "owner/repo");

        assert!(matches!(
            store.get_build(100),
            Err(StoreError::BuildNotFound(100))
        ));
    }

    #[test]
    fn list_builds_paginates_descending() {
        let store = store_with_repos(&[("owner", "repo")]);
        for n in 1..=4 {
            store
                .create_build("owner", "repo", &meta(n), ts(i64::from(n)))
                .unwrap();
        }

        let ids: Vec<u64> = store
            .list_builds(None, 10)
            .unwrap()
            .iter()
            .map(|b| b.id)
            .collect();
        assert_eq!(ids, vec![4, 3, 2, 1]);

        let ids: Vec<u64> = store
            .list_builds(Some(3), 10)
            .unwrap()
            .iter()
            .map(|b| b.id)
            .collect();
        assert_eq!(ids, vec![2, 1]);

        let ids: Vec<u64> = store
            .list_builds(None, 2)
            .unwrap()
            .iter()
            .map(|b| b.id)
            .collect();
        assert_eq!(ids, vec![4, 3]);
    }

    #[test]
    fn pending_builds_are_fifo_and_carry_cache() {
        let store = store_with_repos(&[("owner", "repo1"), ("owner", "repo2")]);
        store
            .create_build("owner", "repo1", &meta(1), ts(11))
            .unwrap();
        store
            .create_build("owner", "repo1", &meta(2), ts(12))
            .unwrap();
        store
            .create_build("owner", "repo2", &meta(3), ts(21))
            .unwrap();

        let pending = store.get_pending_builds().unwrap();
        assert_eq!(
            pending.iter().map(|b| b.id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        // Finish build 1 with promotion: build 2 of the same repo now sees it
        // as its seed cache, repo2's build does not.
        store.start_build(1, ts(1011), 4001, None).unwrap();
        store
            .finish_build(1, ts(2011), BuildResult::Success, true)
            .unwrap();

        let pending = store.get_pending_builds().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, 2);
        assert_eq!(pending[0].cache_id, Some(1));
        assert_eq!(pending[1].id, 3);
        assert_eq!(pending[1].cache_id, None);
    }

    #[test]
    fn builder_rows_track_running_builds() {
        let store = store_with_repos(&[("owner", "repo")]);
        store
            .create_build("owner", "repo", &meta(1), ts(1))
            .unwrap();
        store
            .create_build("owner", "repo", &meta(2), ts(2))
            .unwrap();
        assert!(store.list_builders().unwrap().is_empty());

        store.start_build(1, ts(10), 4001, None).unwrap();
        store.start_build(2, ts(11), 4002, Some(1)).unwrap();

        let builders = store.list_builders().unwrap();
        assert_eq!(builders.len(), 2);
        assert_eq!(builders[0].build_id, 1);
        assert_eq!(builders[0].pid, 4001);
        assert_eq!(builders[0].cache_id, None);
        assert_eq!(builders[1].build_id, 2);
        assert_eq!(builders[1].cache_id, Some(1));

        let started = store.get_build(1).unwrap().started;
        assert_eq!(started, Some(ts(10)));

        store
            .finish_build(1, ts(20), BuildResult::Success, false)
            .unwrap();
        let builders = store.list_builders().unwrap();
        assert_eq!(builders.len(), 1);
        assert_eq!(builders[0].build_id, 2);

        let build = store.get_build(1).unwrap();
        assert_eq!(build.finished, Some(ts(20)));
        assert_eq!(build.result, Some(BuildResult::Success));
    }

    #[test]
    fn start_build_requires_existing_build() {
        let store = store_with_repos(&[("owner", "repo")]);
        assert!(matches!(
            store.start_build(9, ts(1), 100, None),
            Err(StoreError::BuildNotFound(9))
        ));
    }

    #[test]
    fn cache_promotion_is_monotonic() {
        let store = store_with_repos(&[("owner", "repo")]);
        let older = store
            .create_build("owner", "repo", &meta(1), ts(1))
            .unwrap();
        let newer = store
            .create_build("owner", "repo", &meta(2), ts(2))
            .unwrap();
        store.start_build(older, ts(10), 4001, None).unwrap();
        store.start_build(newer, ts(11), 4002, None).unwrap();

        // The newer build finishes first and becomes the cache; the older
        // build finishing late must not displace it.
        store
            .finish_build(newer, ts(20), BuildResult::Success, true)
            .unwrap();
        store
            .finish_build(older, ts(21), BuildResult::Success, true)
            .unwrap();

        assert_eq!(store.list_build_dirs_in_use().unwrap(), vec![newer]);
    }

    #[test]
    fn finish_build_twice_is_safe() {
        let store = store_with_repos(&[("owner", "repo")]);
        let id = store.create_build("owner", "repo", &meta(1), ts(1)).unwrap();
        store.start_build(id, ts(10), 4001, None).unwrap();

        store
            .finish_build(id, ts(20), BuildResult::Failure, false)
            .unwrap();
        store
            .finish_build(id, ts(20), BuildResult::Failure, false)
            .unwrap();

        let build = store.get_build(id).unwrap();
        assert_eq!(build.result, Some(BuildResult::Failure));
        assert!(store.list_builders().unwrap().is_empty());
    }

    #[test]
    fn retention_set_is_the_union_of_live_references() {
        let store = store_with_repos(&[("owner", "repo1"), ("owner", "repo2")]);
        for n in 1..=4 {
            let repo = if n <= 2 { "repo1" } else { "repo2" };
            store
                .create_build("owner", repo, &meta(n), ts(i64::from(n)))
                .unwrap();
        }

        // Build 1 finished and is repo1's cache; build 2 runs seeded from it;
        // build 4 runs with no cache.
        store.start_build(1, ts(10), 4001, None).unwrap();
        store
            .finish_build(1, ts(20), BuildResult::Success, true)
            .unwrap();
        store.start_build(2, ts(30), 4002, Some(1)).unwrap();
        store.start_build(4, ts(31), 4004, None).unwrap();

        assert_eq!(store.list_build_dirs_in_use().unwrap(), vec![1, 2, 4]);
    }

    #[test]
    fn message_is_truncated_on_creation() {
        let store = store_with_repos(&[("owner", "repo")]);
        let mut m = meta(1);
        m.message = "x".repeat(MAX_MESSAGE_LENGTH + 50);
        let id = store.create_build("owner", "repo", &m, ts(1)).unwrap();
        let build = store.get_build(id).unwrap();
        assert_eq!(build.meta.message.chars().count(), MAX_MESSAGE_LENGTH);
    }

    #[test]
    fn validation_rejects_bad_metadata() {
        let mut m = meta(1);
        m.commit_sha = m.commit_sha.to_uppercase();
        assert!(matches!(
            validate_build_meta(&m),
            Err(ValidationError::CommitShaFormat(_))
        ));

        let mut m = meta(1);
        m.commit_sha.truncate(39);
        assert!(matches!(
            validate_build_meta(&m),
            Err(ValidationError::CommitShaFormat(_))
        ));

        let mut m = meta(1);
        m.git_ref = "heads/main".to_string();
        assert!(matches!(
            validate_build_meta(&m),
            Err(ValidationError::RefFormat(_))
        ));

        let mut m = meta(1);
        m.git_ref = format!("refs/{}", "x".repeat(MAX_REF_LENGTH));
        assert!(matches!(
            validate_build_meta(&m),
            Err(ValidationError::RefTooLong)
        ));

        let mut m = meta(1);
        m.author = "a".repeat(MAX_AUTHOR_LENGTH + 1);
        assert!(matches!(
            validate_build_meta(&m),
            Err(ValidationError::AuthorTooLong)
        ));

        let mut m = meta(1);
        m.link = "http://example.com".to_string();
        assert!(matches!(
            validate_build_meta(&m),
            Err(ValidationError::LinkFormat(_))
        ));

        let mut m = meta(1);
        m.link = String::new();
        assert_eq!(validate_build_meta(&m), Ok(()));
    }
}
