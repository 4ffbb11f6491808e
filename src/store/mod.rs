use crate::status::{calculate_status, closed_status, review_status};
use crate::{
    Comment, CommitRef, Review, ReviewKey, ReviewMetadata, ReviewState, ReviewStatus, Side,
    Thread, ThreadArgs,
};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("no such review: {0}")]
    ReviewNotFound(ReviewKey),
    #[error("no such thread {thread_id} in {key}")]
    ThreadNotFound { key: ReviewKey, thread_id: String },
    #[error("storage task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A thread before and after a single write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadUpdate {
    pub before: Thread,
    pub after: Thread,
}

/// Outcome of the authoritative status read-check-write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRecompute {
    pub previous: ReviewStatus,
    pub current: ReviewStatus,
    pub review: Review,
}

impl StatusRecompute {
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}

/// Threads and comments made public by one author's "send drafts".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DraftPublication {
    pub threads: Vec<ThreadUpdate>,
    pub comments: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewerChange {
    Add(String),
    Remove(String),
    Approve(String),
    Unapprove(String),
}

/// Durable review storage as seen by the sync engine.
#[async_trait]
pub trait ReviewStore: Send + Sync {
    /// Insert a review; returns `false` if one already exists for its key.
    async fn create_review(&self, review: &Review) -> Result<bool>;
    async fn load_review(&self, key: &ReviewKey) -> Result<Review>;
    async fn update_metadata(&self, key: &ReviewKey, metadata: &ReviewMetadata) -> Result<()>;
    /// Open reviews of a repository whose base branch label matches.
    async fn open_reviews_with_base(&self, owner: &str, repo: &str, base_label: &str) -> Result<Vec<ReviewKey>>;

    async fn list_threads(&self, key: &ReviewKey) -> Result<Vec<Thread>>;
    /// Comments ordered by timestamp.
    async fn list_comments(&self, key: &ReviewKey) -> Result<Vec<Comment>>;
    async fn insert_thread(&self, key: &ReviewKey, thread: &Thread) -> Result<()>;
    async fn insert_comment(&self, key: &ReviewKey, comment: &Comment) -> Result<()>;

    /// Overwrite `currentArgs` only if it still equals `expected`.
    async fn compare_and_set_position(
        &self,
        key: &ReviewKey,
        thread_id: &str,
        expected: &ThreadArgs,
        next: &ThreadArgs,
    ) -> Result<bool>;
    async fn set_thread_resolved(&self, key: &ReviewKey, thread_id: &str, resolved: bool) -> Result<ThreadUpdate>;
    async fn stage_resolution(&self, key: &ReviewKey, thread_id: &str, pending: Option<bool>) -> Result<ThreadUpdate>;
    async fn publish_drafts(&self, key: &ReviewKey, author: &str) -> Result<DraftPublication>;

    /// Atomic signed increment of the unresolved counter.
    async fn increment_unresolved(&self, key: &ReviewKey, delta: i64) -> Result<()>;
    /// Recompute the counter from the threads; returns the new value.
    async fn recount_unresolved(&self, key: &ReviewKey) -> Result<i64>;
    /// Returns whether the reviewer sets changed.
    async fn apply_reviewer_change(&self, key: &ReviewKey, change: &ReviewerChange) -> Result<bool>;
    async fn recompute_status(&self, key: &ReviewKey) -> Result<StatusRecompute>;
    async fn set_closed(&self, key: &ReviewKey, merged: bool) -> Result<()>;
    async fn reopen(&self, key: &ReviewKey) -> Result<StatusRecompute>;
    async fn touch_last_comment(&self, key: &ReviewKey, timestamp: i64) -> Result<()>;
    async fn set_summary_review_id(&self, key: &ReviewKey, review_id: u64) -> Result<()>;
}

const SCHEMA_SQL: &str = "
    CREATE TABLE IF NOT EXISTS reviews (
        owner             TEXT    NOT NULL,
        repo              TEXT    NOT NULL,
        number            INTEGER NOT NULL,
        author            TEXT    NOT NULL,
        title             TEXT    NOT NULL,
        base_label        TEXT    NOT NULL,
        base_sha          TEXT    NOT NULL,
        head_label        TEXT    NOT NULL,
        head_sha          TEXT    NOT NULL,
        updated_at        INTEGER NOT NULL,
        status            TEXT    NOT NULL DEFAULT 'needs_review',
        closed            INTEGER NOT NULL DEFAULT 0,
        reviewers         TEXT    NOT NULL DEFAULT '[]',
        approvers         TEXT    NOT NULL DEFAULT '[]',
        unresolved        INTEGER NOT NULL DEFAULT 0,
        last_comment      INTEGER NOT NULL DEFAULT 0,
        summary_review_id INTEGER,
        PRIMARY KEY (owner, repo, number)
    );

    CREATE TABLE IF NOT EXISTS threads (
        owner            TEXT    NOT NULL,
        repo             TEXT    NOT NULL,
        number           INTEGER NOT NULL,
        id               TEXT    NOT NULL,
        username         TEXT    NOT NULL,
        draft            INTEGER NOT NULL,
        resolved         INTEGER NOT NULL DEFAULT 0,
        pending_resolved INTEGER,
        cur_file         TEXT    NOT NULL,
        cur_sha          TEXT    NOT NULL,
        cur_line         INTEGER NOT NULL,
        cur_side         TEXT    NOT NULL,
        cur_content      TEXT    NOT NULL,
        orig_file        TEXT    NOT NULL,
        orig_sha         TEXT    NOT NULL,
        orig_line        INTEGER NOT NULL,
        orig_side        TEXT    NOT NULL,
        orig_content     TEXT    NOT NULL,
        PRIMARY KEY (owner, repo, number, id),
        FOREIGN KEY (owner, repo, number) REFERENCES reviews(owner, repo, number) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS comments (
        owner     TEXT    NOT NULL,
        repo      TEXT    NOT NULL,
        number    INTEGER NOT NULL,
        id        TEXT    NOT NULL,
        thread_id TEXT    NOT NULL,
        username  TEXT    NOT NULL,
        draft     INTEGER NOT NULL,
        timestamp INTEGER NOT NULL,
        text      TEXT    NOT NULL,
        PRIMARY KEY (owner, repo, number, id),
        FOREIGN KEY (owner, repo, number, thread_id)
            REFERENCES threads(owner, repo, number, id) ON DELETE CASCADE
    );
";

const REVIEW_COLUMNS: &str = "owner, repo, number, author, title, base_label, base_sha, \
     head_label, head_sha, updated_at, status, closed, reviewers, approvers, unresolved, \
     last_comment, summary_review_id";

const THREAD_COLUMNS: &str = "id, username, draft, resolved, pending_resolved, \
     cur_file, cur_sha, cur_line, cur_side, cur_content, \
     orig_file, orig_sha, orig_line, orig_side, orig_content";

/// SQLite-backed review storage.
///
/// Blocking rusqlite calls run on `spawn_blocking`; the connection is shared
/// behind a mutex so every call sees a consistent database.
#[derive(Clone)]
pub struct ReviewDb {
    conn: Arc<Mutex<Connection>>,
}

impl ReviewDb {
    /// Open or create the review database at the given path.
    ///
    /// Creates the necessary tables if they don't exist.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Task("connection mutex poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

#[async_trait]
impl ReviewStore for ReviewDb {
    async fn create_review(&self, review: &Review) -> Result<bool> {
        let review = review.clone();
        self.with_conn(move |conn| insert_review(conn, &review)).await
    }

    async fn load_review(&self, key: &ReviewKey) -> Result<Review> {
        let key = key.clone();
        self.with_conn(move |conn| load_review(conn, &key)).await
    }

    async fn update_metadata(&self, key: &ReviewKey, metadata: &ReviewMetadata) -> Result<()> {
        let key = key.clone();
        let m = metadata.clone();
        self.with_conn(move |conn| {
            let rows = conn.execute(
                "UPDATE reviews SET title = ?4, base_label = ?5, base_sha = ?6,
                        head_label = ?7, head_sha = ?8, updated_at = ?9
                 WHERE owner = ?1 AND repo = ?2 AND number = ?3",
                params![
                    key.owner,
                    key.repo,
                    key.number as i64,
                    m.title,
                    m.base.label,
                    m.base.sha,
                    m.head.label,
                    m.head.sha,
                    m.updated_at
                ],
            )?;
            if rows == 0 {
                return Err(StoreError::ReviewNotFound(key));
            }
            Ok(())
        })
        .await
    }

    async fn open_reviews_with_base(&self, owner: &str, repo: &str, base_label: &str) -> Result<Vec<ReviewKey>> {
        let (owner, repo, base_label) = (owner.to_string(), repo.to_string(), base_label.to_string());
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT owner, repo, number FROM reviews
                 WHERE owner = ?1 AND repo = ?2 AND base_label = ?3 AND closed = 0
                 ORDER BY number",
            )?;
            let keys = stmt
                .query_map(params![owner, repo, base_label], |row| {
                    Ok(ReviewKey::new(
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)? as u64,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(keys)
        })
        .await
    }

    async fn list_threads(&self, key: &ReviewKey) -> Result<Vec<Thread>> {
        let key = key.clone();
        self.with_conn(move |conn| list_threads(conn, &key)).await
    }

    async fn list_comments(&self, key: &ReviewKey) -> Result<Vec<Comment>> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, thread_id, username, draft, timestamp, text FROM comments
                 WHERE owner = ?1 AND repo = ?2 AND number = ?3
                 ORDER BY timestamp, id",
            )?;
            let comments = stmt
                .query_map(params![key.owner, key.repo, key.number as i64], |row| {
                    Ok(Comment {
                        id: row.get(0)?,
                        thread_id: row.get(1)?,
                        username: row.get(2)?,
                        draft: row.get(3)?,
                        timestamp: row.get(4)?,
                        text: row.get(5)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(comments)
        })
        .await
    }

    async fn insert_thread(&self, key: &ReviewKey, thread: &Thread) -> Result<()> {
        let key = key.clone();
        let t = thread.clone();
        self.with_conn(move |conn| {
            ensure_review(conn, &key)?;
            let (cur, orig) = (&t.current_args, &t.original_args);
            conn.execute(
                &format!(
                    "INSERT INTO threads (owner, repo, number, {THREAD_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
                ),
                params![
                    key.owner,
                    key.repo,
                    key.number as i64,
                    t.id,
                    t.username,
                    t.draft,
                    t.resolved,
                    t.pending_resolved,
                    cur.file,
                    cur.sha,
                    cur.line,
                    cur.side.as_str(),
                    cur.line_content,
                    orig.file,
                    orig.sha,
                    orig.line,
                    orig.side.as_str(),
                    orig.line_content
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn insert_comment(&self, key: &ReviewKey, comment: &Comment) -> Result<()> {
        let key = key.clone();
        let c = comment.clone();
        self.with_conn(move |conn| {
            load_thread(conn, &key, &c.thread_id)?;
            conn.execute(
                "INSERT INTO comments (owner, repo, number, id, thread_id, username, draft, timestamp, text)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    key.owner,
                    key.repo,
                    key.number as i64,
                    c.id,
                    c.thread_id,
                    c.username,
                    c.draft,
                    c.timestamp,
                    c.text
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn compare_and_set_position(
        &self,
        key: &ReviewKey,
        thread_id: &str,
        expected: &ThreadArgs,
        next: &ThreadArgs,
    ) -> Result<bool> {
        let key = key.clone();
        let thread_id = thread_id.to_string();
        let (old, new) = (expected.clone(), next.clone());
        self.with_conn(move |conn| {
            let rows = conn.execute(
                "UPDATE threads
                 SET cur_file = ?5, cur_sha = ?6, cur_line = ?7, cur_side = ?8, cur_content = ?9
                 WHERE owner = ?1 AND repo = ?2 AND number = ?3 AND id = ?4
                   AND cur_file = ?10 AND cur_sha = ?11 AND cur_line = ?12
                   AND cur_side = ?13 AND cur_content = ?14",
                params![
                    key.owner,
                    key.repo,
                    key.number as i64,
                    thread_id,
                    new.file,
                    new.sha,
                    new.line,
                    new.side.as_str(),
                    new.line_content,
                    old.file,
                    old.sha,
                    old.line,
                    old.side.as_str(),
                    old.line_content
                ],
            )?;
            if rows == 0 {
                // Distinguish a lost race from a missing thread
                load_thread(conn, &key, &thread_id)?;
                return Ok(false);
            }
            Ok(true)
        })
        .await
    }

    async fn set_thread_resolved(&self, key: &ReviewKey, thread_id: &str, resolved: bool) -> Result<ThreadUpdate> {
        let key = key.clone();
        let thread_id = thread_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let before = load_thread(&tx, &key, &thread_id)?;
            tx.execute(
                "UPDATE threads SET resolved = ?5
                 WHERE owner = ?1 AND repo = ?2 AND number = ?3 AND id = ?4",
                params![key.owner, key.repo, key.number as i64, thread_id, resolved],
            )?;
            let after = load_thread(&tx, &key, &thread_id)?;
            tx.commit()?;
            Ok(ThreadUpdate { before, after })
        })
        .await
    }

    async fn stage_resolution(&self, key: &ReviewKey, thread_id: &str, pending: Option<bool>) -> Result<ThreadUpdate> {
        let key = key.clone();
        let thread_id = thread_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let before = load_thread(&tx, &key, &thread_id)?;
            tx.execute(
                "UPDATE threads SET pending_resolved = ?5
                 WHERE owner = ?1 AND repo = ?2 AND number = ?3 AND id = ?4",
                params![key.owner, key.repo, key.number as i64, thread_id, pending],
            )?;
            let after = load_thread(&tx, &key, &thread_id)?;
            tx.commit()?;
            Ok(ThreadUpdate { before, after })
        })
        .await
    }

    async fn publish_drafts(&self, key: &ReviewKey, author: &str) -> Result<DraftPublication> {
        let key = key.clone();
        let author = author.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let n = key.number as i64;

            // Threads the author created as drafts or commented on in drafts
            let thread_ids: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM threads
                     WHERE owner = ?1 AND repo = ?2 AND number = ?3 AND username = ?4 AND draft = 1
                     UNION
                     SELECT thread_id FROM comments
                     WHERE owner = ?1 AND repo = ?2 AND number = ?3 AND username = ?4 AND draft = 1",
                )?;
                stmt.query_map(params![key.owner, key.repo, n, author], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            };

            let mut threads = Vec::new();
            for thread_id in thread_ids {
                let before = load_thread(&tx, &key, &thread_id)?;
                tx.execute(
                    "UPDATE threads
                     SET draft = CASE WHEN username = ?5 THEN 0 ELSE draft END,
                         resolved = COALESCE(pending_resolved, resolved),
                         pending_resolved = NULL
                     WHERE owner = ?1 AND repo = ?2 AND number = ?3 AND id = ?4",
                    params![key.owner, key.repo, n, thread_id, author],
                )?;
                let after = load_thread(&tx, &key, &thread_id)?;
                if after != before {
                    threads.push(ThreadUpdate { before, after });
                }
            }

            let comments = tx.execute(
                "UPDATE comments SET draft = 0
                 WHERE owner = ?1 AND repo = ?2 AND number = ?3 AND username = ?4 AND draft = 1",
                params![key.owner, key.repo, n, author],
            )?;
            tx.commit()?;

            Ok(DraftPublication { threads, comments })
        })
        .await
    }

    async fn increment_unresolved(&self, key: &ReviewKey, delta: i64) -> Result<()> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let rows = conn.execute(
                "UPDATE reviews SET unresolved = unresolved + ?4
                 WHERE owner = ?1 AND repo = ?2 AND number = ?3",
                params![key.owner, key.repo, key.number as i64, delta],
            )?;
            if rows == 0 {
                return Err(StoreError::ReviewNotFound(key));
            }
            Ok(())
        })
        .await
    }

    async fn recount_unresolved(&self, key: &ReviewKey) -> Result<i64> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            ensure_review(&tx, &key)?;
            let n = key.number as i64;
            let count: i64 = tx.query_row(
                "SELECT COUNT(*) FROM threads
                 WHERE owner = ?1 AND repo = ?2 AND number = ?3 AND draft = 0 AND resolved = 0",
                params![key.owner, key.repo, n],
                |row| row.get(0),
            )?;
            tx.execute(
                "UPDATE reviews SET unresolved = ?4 WHERE owner = ?1 AND repo = ?2 AND number = ?3",
                params![key.owner, key.repo, n, count],
            )?;
            tx.commit()?;
            Ok(count)
        })
        .await
    }

    async fn apply_reviewer_change(&self, key: &ReviewKey, change: &ReviewerChange) -> Result<bool> {
        let key = key.clone();
        let change = change.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut state = load_review(&tx, &key)?.state;
            let before = state.clone();
            match &change {
                ReviewerChange::Add(login) => state.add_reviewer(login),
                ReviewerChange::Remove(login) => state.remove_reviewer(login),
                ReviewerChange::Approve(login) => state.add_approver(login),
                ReviewerChange::Unapprove(login) => state.remove_approver(login),
            };
            let changed = state.reviewers != before.reviewers || state.approvers != before.approvers;
            if changed {
                tx.execute(
                    "UPDATE reviews SET reviewers = ?4, approvers = ?5
                     WHERE owner = ?1 AND repo = ?2 AND number = ?3",
                    params![
                        key.owner,
                        key.repo,
                        key.number as i64,
                        encode_set(&state.reviewers),
                        encode_set(&state.approvers)
                    ],
                )?;
            }
            tx.commit()?;
            Ok(changed)
        })
        .await
    }

    async fn recompute_status(&self, key: &ReviewKey) -> Result<StatusRecompute> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut review = load_review(&tx, &key)?;
            let previous = review.state.status;
            let current = review_status(&review.state);
            if current != previous {
                write_status(&tx, &key, current, review.state.closed)?;
                review.state.status = current;
            }
            tx.commit()?;
            Ok(StatusRecompute { previous, current, review })
        })
        .await
    }

    async fn set_closed(&self, key: &ReviewKey, merged: bool) -> Result<()> {
        let key = key.clone();
        self.with_conn(move |conn| {
            ensure_review(conn, &key)?;
            write_status(conn, &key, closed_status(merged), true)
        })
        .await
    }

    async fn reopen(&self, key: &ReviewKey) -> Result<StatusRecompute> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut review = load_review(&tx, &key)?;
            let previous = review.state.status;
            let state = &review.state;
            let current = calculate_status(&state.reviewers, &state.approvers, state.unresolved);
            write_status(&tx, &key, current, false)?;
            tx.commit()?;
            review.state.status = current;
            review.state.closed = false;
            Ok(StatusRecompute { previous, current, review })
        })
        .await
    }

    async fn touch_last_comment(&self, key: &ReviewKey, timestamp: i64) -> Result<()> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let rows = conn.execute(
                "UPDATE reviews SET last_comment = MAX(last_comment, ?4)
                 WHERE owner = ?1 AND repo = ?2 AND number = ?3",
                params![key.owner, key.repo, key.number as i64, timestamp],
            )?;
            if rows == 0 {
                return Err(StoreError::ReviewNotFound(key));
            }
            Ok(())
        })
        .await
    }

    async fn set_summary_review_id(&self, key: &ReviewKey, review_id: u64) -> Result<()> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let rows = conn.execute(
                "UPDATE reviews SET summary_review_id = ?4
                 WHERE owner = ?1 AND repo = ?2 AND number = ?3",
                params![key.owner, key.repo, key.number as i64, review_id as i64],
            )?;
            if rows == 0 {
                return Err(StoreError::ReviewNotFound(key));
            }
            Ok(())
        })
        .await
    }
}

fn insert_review(conn: &Connection, review: &Review) -> Result<bool> {
    let (m, s) = (&review.metadata, &review.state);
    let rows = conn.execute(
        &format!(
            "INSERT OR IGNORE INTO reviews ({REVIEW_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
        ),
        params![
            m.owner,
            m.repo,
            m.number as i64,
            m.author,
            m.title,
            m.base.label,
            m.base.sha,
            m.head.label,
            m.head.sha,
            m.updated_at,
            s.status.as_str(),
            s.closed,
            encode_set(&s.reviewers),
            encode_set(&s.approvers),
            s.unresolved,
            s.last_comment,
            review.summary_review_id.map(|id| id as i64)
        ],
    )?;
    Ok(rows == 1)
}

fn load_review(conn: &Connection, key: &ReviewKey) -> Result<Review> {
    conn.query_row(
        &format!(
            "SELECT {REVIEW_COLUMNS} FROM reviews WHERE owner = ?1 AND repo = ?2 AND number = ?3"
        ),
        params![key.owner, key.repo, key.number as i64],
        read_review,
    )
    .optional()?
    .ok_or_else(|| StoreError::ReviewNotFound(key.clone()))
}

fn ensure_review(conn: &Connection, key: &ReviewKey) -> Result<()> {
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM reviews WHERE owner = ?1 AND repo = ?2 AND number = ?3",
            params![key.owner, key.repo, key.number as i64],
            |row| row.get(0),
        )
        .optional()?;
    match exists {
        Some(_) => Ok(()),
        None => Err(StoreError::ReviewNotFound(key.clone())),
    }
}

fn write_status(conn: &Connection, key: &ReviewKey, status: ReviewStatus, closed: bool) -> Result<()> {
    conn.execute(
        "UPDATE reviews SET status = ?4, closed = ?5
         WHERE owner = ?1 AND repo = ?2 AND number = ?3",
        params![key.owner, key.repo, key.number as i64, status.as_str(), closed],
    )?;
    Ok(())
}

fn list_threads(conn: &Connection, key: &ReviewKey) -> Result<Vec<Thread>> {
    ensure_review(conn, key)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {THREAD_COLUMNS} FROM threads
         WHERE owner = ?1 AND repo = ?2 AND number = ?3
         ORDER BY rowid"
    ))?;
    let threads = stmt
        .query_map(params![key.owner, key.repo, key.number as i64], read_thread)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(threads)
}

fn load_thread(conn: &Connection, key: &ReviewKey, thread_id: &str) -> Result<Thread> {
    conn.query_row(
        &format!(
            "SELECT {THREAD_COLUMNS} FROM threads
             WHERE owner = ?1 AND repo = ?2 AND number = ?3 AND id = ?4"
        ),
        params![key.owner, key.repo, key.number as i64, thread_id],
        read_thread,
    )
    .optional()?
    .ok_or_else(|| StoreError::ThreadNotFound {
        key: key.clone(),
        thread_id: thread_id.to_string(),
    })
}

fn read_review(row: &Row<'_>) -> rusqlite::Result<Review> {
    let status: String = row.get(10)?;
    let reviewers: String = row.get(12)?;
    let approvers: String = row.get(13)?;

    Ok(Review {
        metadata: ReviewMetadata {
            owner: row.get(0)?,
            repo: row.get(1)?,
            number: row.get::<_, i64>(2)? as u64,
            author: row.get(3)?,
            title: row.get(4)?,
            base: CommitRef {
                label: row.get(5)?,
                sha: row.get(6)?,
            },
            head: CommitRef {
                label: row.get(7)?,
                sha: row.get(8)?,
            },
            updated_at: row.get(9)?,
        },
        state: ReviewState {
            status: ReviewStatus::parse(&status)
                .ok_or_else(|| conversion_error(10, format!("invalid review status: {status}")))?,
            closed: row.get(11)?,
            reviewers: decode_set(&reviewers, 12)?,
            approvers: decode_set(&approvers, 13)?,
            unresolved: row.get(14)?,
            last_comment: row.get(15)?,
        },
        summary_review_id: row.get::<_, Option<i64>>(16)?.map(|id| id as u64),
    })
}

fn read_thread(row: &Row<'_>) -> rusqlite::Result<Thread> {
    Ok(Thread {
        id: row.get(0)?,
        username: row.get(1)?,
        draft: row.get(2)?,
        resolved: row.get(3)?,
        pending_resolved: row.get(4)?,
        current_args: read_args(row, 5)?,
        original_args: read_args(row, 10)?,
    })
}

fn read_args(row: &Row<'_>, offset: usize) -> rusqlite::Result<ThreadArgs> {
    let side: String = row.get(offset + 3)?;
    Ok(ThreadArgs {
        file: row.get(offset)?,
        sha: row.get(offset + 1)?,
        line: row.get(offset + 2)?,
        side: side
            .parse::<Side>()
            .map_err(|e| conversion_error(offset + 3, e))?,
        line_content: row.get(offset + 4)?,
    })
}

fn encode_set(set: &BTreeSet<String>) -> String {
    serde_json::to_string(set).unwrap_or_else(|_| "[]".to_string())
}

fn decode_set(raw: &str, column: usize) -> rusqlite::Result<BTreeSet<String>> {
    serde_json::from_str(raw).map_err(|e| conversion_error(column, e.to_string()))
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ReviewKey {
        ReviewKey::new("octo", "widgets", 7)
    }

    fn review() -> Review {
        Review::new(ReviewMetadata {
            owner: "octo".to_string(),
            repo: "widgets".to_string(),
            number: 7,
            author: "carol".to_string(),
            title: "Add widgets".to_string(),
            base: CommitRef { label: "octo:main".to_string(), sha: "b1".to_string() },
            head: CommitRef { label: "octo:feature".to_string(), sha: "h1".to_string() },
            updated_at: 1_000,
        })
    }

    fn args(line: i64) -> ThreadArgs {
        ThreadArgs {
            file: "src/lib.rs".to_string(),
            sha: "h1".to_string(),
            line,
            side: Side::Right,
            line_content: "let x = 1;".to_string(),
        }
    }

    async fn seeded_db() -> ReviewDb {
        let db = ReviewDb::open_in_memory().unwrap();
        assert!(db.create_review(&review()).await.unwrap());
        db
    }

    #[test]
    fn open_creates_db() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("reviews.db");
        let _db = ReviewDb::open(&db_path).unwrap();
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn review_round_trips() {
        let db = seeded_db().await;
        let loaded = db.load_review(&key()).await.unwrap();
        assert_eq!(loaded, review());
    }

    #[tokio::test]
    async fn creating_twice_keeps_the_first() {
        let db = seeded_db().await;
        let mut other = review();
        other.metadata.title = "Different".to_string();
        assert!(!db.create_review(&other).await.unwrap());
        assert_eq!(db.load_review(&key()).await.unwrap().metadata.title, "Add widgets");
    }

    #[tokio::test]
    async fn missing_review_is_not_found() {
        let db = ReviewDb::open_in_memory().unwrap();
        assert!(matches!(
            db.load_review(&key()).await,
            Err(StoreError::ReviewNotFound(_))
        ));
        assert!(matches!(
            db.increment_unresolved(&key(), 1).await,
            Err(StoreError::ReviewNotFound(_))
        ));
    }

    #[tokio::test]
    async fn compare_and_set_rejects_stale_expectation() {
        let db = seeded_db().await;
        let thread = Thread::new("t1", "alice", args(10), false);
        db.insert_thread(&key(), &thread).await.unwrap();

        let moved = ThreadArgs { line: 12, sha: "h2".to_string(), ..args(10) };
        assert!(db.compare_and_set_position(&key(), "t1", &args(10), &moved).await.unwrap());

        let stale = ThreadArgs { line: 99, ..args(10) };
        assert!(!db.compare_and_set_position(&key(), "t1", &args(10), &stale).await.unwrap());

        let threads = db.list_threads(&key()).await.unwrap();
        assert_eq!(threads[0].current_args, moved);
        assert_eq!(threads[0].original_args, args(10));
    }

    #[tokio::test]
    async fn compare_and_set_on_missing_thread_is_not_found() {
        let db = seeded_db().await;
        assert!(matches!(
            db.compare_and_set_position(&key(), "nope", &args(1), &args(2)).await,
            Err(StoreError::ThreadNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn increments_accumulate() {
        let db = seeded_db().await;
        db.increment_unresolved(&key(), 1).await.unwrap();
        db.increment_unresolved(&key(), 1).await.unwrap();
        db.increment_unresolved(&key(), -1).await.unwrap();
        assert_eq!(db.load_review(&key()).await.unwrap().state.unresolved, 1);
    }

    #[tokio::test]
    async fn recount_counts_published_unresolved_threads() {
        let db = seeded_db().await;
        db.insert_thread(&key(), &Thread::new("t1", "alice", args(1), false)).await.unwrap();
        db.insert_thread(&key(), &Thread::new("t2", "alice", args(2), true)).await.unwrap();
        db.insert_thread(&key(), &Thread::new("t3", "alice", args(3), false)).await.unwrap();
        db.set_thread_resolved(&key(), "t3", true).await.unwrap();
        db.increment_unresolved(&key(), 5).await.unwrap();

        assert_eq!(db.recount_unresolved(&key()).await.unwrap(), 1);
        assert_eq!(db.load_review(&key()).await.unwrap().state.unresolved, 1);
    }

    #[tokio::test]
    async fn recompute_writes_only_on_change() {
        let db = seeded_db().await;
        let first = db.recompute_status(&key()).await.unwrap();
        assert!(!first.changed());

        db.apply_reviewer_change(&key(), &ReviewerChange::Approve("bob".to_string()))
            .await
            .unwrap();
        let second = db.recompute_status(&key()).await.unwrap();
        assert!(second.changed());
        assert_eq!(second.previous, ReviewStatus::NeedsReview);
        assert_eq!(second.current, ReviewStatus::Approved);
        assert_eq!(db.load_review(&key()).await.unwrap().state.status, ReviewStatus::Approved);
    }

    #[tokio::test]
    async fn closing_freezes_and_reopening_recomputes() {
        let db = seeded_db().await;
        db.apply_reviewer_change(&key(), &ReviewerChange::Add("bob".to_string()))
            .await
            .unwrap();
        db.set_closed(&key(), true).await.unwrap();
        let closed = db.recompute_status(&key()).await.unwrap();
        assert_eq!(closed.current, ReviewStatus::ClosedMerged);
        assert!(!closed.changed());

        let reopened = db.reopen(&key()).await.unwrap();
        assert_eq!(reopened.current, ReviewStatus::NeedsApproval);
        assert!(!db.load_review(&key()).await.unwrap().state.closed);
    }

    #[tokio::test]
    async fn open_reviews_filter_by_base_label() {
        let db = seeded_db().await;
        let mut other = review();
        other.metadata.number = 8;
        other.metadata.base.label = "octo:develop".to_string();
        db.create_review(&other).await.unwrap();
        let mut closed = review();
        closed.metadata.number = 9;
        db.create_review(&closed).await.unwrap();
        db.set_closed(&ReviewKey::new("octo", "widgets", 9), false).await.unwrap();

        let keys = db.open_reviews_with_base("octo", "widgets", "octo:main").await.unwrap();
        assert_eq!(keys, vec![key()]);
    }

    #[tokio::test]
    async fn publishing_drafts_applies_staged_resolution() {
        let db = seeded_db().await;
        db.insert_thread(&key(), &Thread::new("t1", "alice", args(1), false)).await.unwrap();
        db.insert_thread(&key(), &Thread::new("t2", "bob", args(2), true)).await.unwrap();
        db.insert_comment(
            &key(),
            &Comment {
                id: "c1".to_string(),
                thread_id: "t1".to_string(),
                username: "bob".to_string(),
                draft: true,
                timestamp: 5,
                text: "fixed?".to_string(),
            },
        )
        .await
        .unwrap();
        db.stage_resolution(&key(), "t1", Some(true)).await.unwrap();

        let published = db.publish_drafts(&key(), "bob").await.unwrap();
        assert_eq!(published.comments, 1);
        assert_eq!(published.threads.len(), 2);

        let threads = db.list_threads(&key()).await.unwrap();
        let t1 = threads.iter().find(|t| t.id == "t1").unwrap();
        assert!(t1.resolved);
        assert_eq!(t1.pending_resolved, None);
        assert!(!t1.draft);
        let t2 = threads.iter().find(|t| t.id == "t2").unwrap();
        assert!(!t2.draft);

        let comments = db.list_comments(&key()).await.unwrap();
        assert!(!comments[0].draft);
    }

    #[tokio::test]
    async fn comment_on_missing_thread_is_rejected() {
        let db = seeded_db().await;
        let comment = Comment {
            id: "c1".to_string(),
            thread_id: "ghost".to_string(),
            username: "bob".to_string(),
            draft: false,
            timestamp: 1,
            text: "hi".to_string(),
        };
        assert!(matches!(
            db.insert_comment(&key(), &comment).await,
            Err(StoreError::ThreadNotFound { .. })
        ));
    }
}
