use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

/// A job that keeps failing transiently is retried until it has been
/// attempted this many times.
pub const MAX_ATTEMPTS: u32 = 3;

const SCHEMA: &str = "
PRAGMA journal_mode=WAL;
PRAGMA busy_timeout=5000;

CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    src_path TEXT NOT NULL,
    hash TEXT NOT NULL UNIQUE,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    extra TEXT
);

CREATE TABLE IF NOT EXISTS outputs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id INTEGER NOT NULL,
    tag TEXT NOT NULL,
    path TEXT NOT NULL,
    width INTEGER,
    height INTEGER,
    fmt TEXT,
    FOREIGN KEY(job_id) REFERENCES jobs(id)
);
";

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("unknown job status: {0}")]
    BadStatus(String),
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString, serde::Serialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub src_path: String,
    pub hash: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub extra: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: u64,
    pub running: u64,
    pub done: u64,
    pub failed: u64,
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Local checkpoint file for upscale jobs. One connection serialized behind
/// a mutex; every statement is short, and WAL keeps concurrent readers
/// (e.g. a second CLI invocation) out of our way.
pub struct JobStore {
    conn: Mutex<Connection>,
}

impl JobStore {
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, DbError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("job store mutex poisoned")
    }

    /// Insert a new pending job unless `hash` is already tracked.
    /// Returns the new job id, or `None` when deduplicated.
    pub fn enqueue(
        &self,
        src_path: &str,
        hash: &str,
        extra: Option<&str>,
    ) -> Result<Option<i64>, DbError> {
        let conn = self.conn();
        let ts = now();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO jobs (src_path, hash, status, attempts, error, created_at, updated_at, extra)
             VALUES (?1, ?2, ?3, 0, NULL, ?4, ?4, ?5)",
            params![src_path, hash, JobStatus::Pending.to_string(), ts, extra],
        )?;
        if inserted == 0 {
            return Ok(None);
        }
        Ok(Some(conn.last_insert_rowid()))
    }

    /// Atomically claim the next eligible job (pending, or failed with
    /// attempts left) and flip it to `running`.
    pub fn claim_next(&self) -> Result<Option<Job>, DbError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "UPDATE jobs SET status = ?1, updated_at = ?2
                 WHERE id = (
                     SELECT id FROM jobs
                     WHERE status = ?3 OR (status = ?4 AND attempts < ?5)
                     ORDER BY id
                     LIMIT 1
                 )
                 RETURNING id, src_path, hash, status, attempts, error, created_at, updated_at, extra",
                params![
                    JobStatus::Running.to_string(),
                    now(),
                    JobStatus::Pending.to_string(),
                    JobStatus::Failed.to_string(),
                    MAX_ATTEMPTS,
                ],
                job_from_row,
            )
            .optional()?;
        row.map(TryInto::try_into).transpose()
    }

    pub fn mark_done(&self, id: i64) -> Result<(), DbError> {
        self.conn().execute(
            "UPDATE jobs SET status = ?1, error = NULL, updated_at = ?2 WHERE id = ?3",
            params![JobStatus::Done.to_string(), now(), id],
        )?;
        Ok(())
    }

    /// Record a failure. Transient failures spend one attempt; fatal ones
    /// exhaust the attempt budget so the job is never claimed again.
    pub fn mark_failed(&self, id: i64, error: &str, fatal: bool) -> Result<(), DbError> {
        let conn = self.conn();
        if fatal {
            conn.execute(
                "UPDATE jobs SET status = ?1, attempts = ?2, error = ?3, updated_at = ?4 WHERE id = ?5",
                params![JobStatus::Failed.to_string(), MAX_ATTEMPTS, error, now(), id],
            )?;
        } else {
            conn.execute(
                "UPDATE jobs SET status = ?1, attempts = attempts + 1, error = ?2, updated_at = ?3 WHERE id = ?4",
                params![JobStatus::Failed.to_string(), error, now(), id],
            )?;
        }
        Ok(())
    }

    pub fn record_output(
        &self,
        job_id: i64,
        tag: &str,
        path: &str,
        dimensions: Option<(u32, u32)>,
        fmt: Option<&str>,
    ) -> Result<(), DbError> {
        self.conn().execute(
            "INSERT INTO outputs (job_id, tag, path, width, height, fmt)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                job_id,
                tag,
                path,
                dimensions.map(|(w, _)| w),
                dimensions.map(|(_, h)| h),
                fmt,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: i64) -> Result<Option<Job>, DbError> {
        let row = self
            .conn()
            .query_row(
                "SELECT id, src_path, hash, status, attempts, error, created_at, updated_at, extra
                 FROM jobs WHERE id = ?1",
                params![id],
                job_from_row,
            )
            .optional()?;
        row.map(TryInto::try_into).transpose()
    }

    pub fn counts(&self) -> Result<StatusCounts, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
        let mut counts = StatusCounts::default();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            match JobStatus::from_str(&status).map_err(|_| DbError::BadStatus(status))? {
                JobStatus::Pending => counts.pending = count,
                JobStatus::Running => counts.running = count,
                JobStatus::Done => counts.done = count,
                JobStatus::Failed => counts.failed = count,
            }
        }
        Ok(counts)
    }

    /// Drop all tracked jobs and outputs (the `--reset-db` escape hatch).
    pub fn reset(&self) -> Result<(), DbError> {
        let conn = self.conn();
        conn.execute("DELETE FROM outputs", [])?;
        conn.execute("DELETE FROM jobs", [])?;
        Ok(())
    }
}

struct RawJob {
    id: i64,
    src_path: String,
    hash: String,
    status: String,
    attempts: u32,
    error: Option<String>,
    created_at: String,
    updated_at: String,
    extra: Option<String>,
}

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawJob> {
    Ok(RawJob {
        id: row.get(0)?,
        src_path: row.get(1)?,
        hash: row.get(2)?,
        status: row.get(3)?,
        attempts: row.get(4)?,
        error: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        extra: row.get(8)?,
    })
}

impl TryFrom<RawJob> for Job {
    type Error = DbError;

    fn try_from(raw: RawJob) -> Result<Self, DbError> {
        let status =
            JobStatus::from_str(&raw.status).map_err(|_| DbError::BadStatus(raw.status))?;
        Ok(Job {
            id: raw.id,
            src_path: raw.src_path,
            hash: raw.hash,
            status,
            attempts: raw.attempts,
            error: raw.error,
            created_at: raw.created_at,
            updated_at: raw.updated_at,
            extra: raw.extra,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> JobStore {
        JobStore::open_in_memory().expect("open in-memory store")
    }

    #[test]
    fn enqueue_deduplicates_by_hash() {
        let store = store();
        let first = store.enqueue("a.png", "hash-1", None).expect("enqueue");
        assert!(first.is_some());
        let dup = store.enqueue("a-copy.png", "hash-1", None).expect("enqueue");
        assert!(dup.is_none());
        assert_eq!(store.counts().expect("counts").pending, 1);
    }

    #[test]
    fn claim_flips_to_running_in_id_order() {
        let store = store();
        let first = store.enqueue("a.png", "h1", None).expect("enqueue").expect("new");
        store.enqueue("b.png", "h2", None).expect("enqueue");

        let claimed = store.claim_next().expect("claim").expect("job available");
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(
            store.get(first).expect("get").expect("exists").status,
            JobStatus::Running
        );
    }

    #[test]
    fn transient_failures_are_retried_until_the_attempt_cap() {
        let store = store();
        let id = store.enqueue("a.png", "h1", None).expect("enqueue").expect("new");

        for attempt in 1..MAX_ATTEMPTS {
            let job = store.claim_next().expect("claim").expect("eligible");
            assert_eq!(job.id, id);
            store.mark_failed(id, "flaky", false).expect("mark failed");
            assert_eq!(
                store.get(id).expect("get").expect("exists").attempts,
                attempt
            );
        }

        // Last allowed attempt, then the job drops out of the eligible set.
        let job = store.claim_next().expect("claim").expect("eligible");
        assert_eq!(job.id, id);
        store.mark_failed(id, "flaky", false).expect("mark failed");
        assert!(store.claim_next().expect("claim").is_none());
    }

    #[test]
    fn fatal_failure_is_never_claimed_again() {
        let store = store();
        let id = store.enqueue("a.png", "h1", None).expect("enqueue").expect("new");

        store.claim_next().expect("claim").expect("eligible");
        store.mark_failed(id, "bad weights", true).expect("mark failed");

        assert!(store.claim_next().expect("claim").is_none());
        let job = store.get(id).expect("get").expect("exists");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, MAX_ATTEMPTS);
        assert_eq!(job.error.as_deref(), Some("bad weights"));
    }

    #[test]
    fn done_jobs_record_outputs_and_counts() {
        let store = store();
        let id = store.enqueue("a.png", "h1", None).expect("enqueue").expect("new");
        store.claim_next().expect("claim").expect("eligible");
        store
            .record_output(id, "upscaled", "out/a.png", Some((128, 96)), Some("png"))
            .expect("record output");
        store.mark_done(id).expect("mark done");

        let counts = store.counts().expect("counts");
        assert_eq!(counts.done, 1);
        assert_eq!(counts.pending + counts.running + counts.failed, 0);
    }

    #[test]
    fn reset_clears_everything() {
        let store = store();
        store.enqueue("a.png", "h1", None).expect("enqueue");
        store.reset().expect("reset");
        assert_eq!(store.counts().expect("counts"), StatusCounts::default());
        assert!(store.claim_next().expect("claim").is_none());
    }
}
