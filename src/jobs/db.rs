use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use super::models::*;

/// Async-safe handle to the job database.
///
/// Wraps `JobDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<JobDb>>,
}

impl DbHandle {
    pub fn new(db: JobDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&JobDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Synchronous access for test fixtures.
    #[cfg(test)]
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, JobDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct JobDb {
    conn: Connection,
}

const JOB_COLUMNS: &str = "id, owner_id, scope_id, session_id, intent, status, working_dir, process_id, output, error, exit_code, metadata, created_at, started_at, completed_at";

impl JobDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")
            .context("Failed to configure SQLite pragmas")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    owner_id TEXT NOT NULL,
                    scope_id TEXT NOT NULL,
                    session_id TEXT,
                    intent TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    working_dir TEXT NOT NULL,
                    process_id INTEGER,
                    output TEXT NOT NULL DEFAULT '',
                    error TEXT,
                    exit_code INTEGER,
                    metadata TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS job_logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                    level TEXT NOT NULL,
                    message TEXT NOT NULL,
                    metadata TEXT,
                    timestamp TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS scope_snapshots (
                    scope_id TEXT PRIMARY KEY,
                    owner_id TEXT NOT NULL,
                    location TEXT,
                    last_sync_error TEXT,
                    last_synced_at TEXT,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_owner ON jobs(owner_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_jobs_scope ON jobs(scope_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_job_logs_job ON job_logs(job_id, timestamp);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Job CRUD ──────────────────────────────────────────────────────

    pub fn create_job(&self, id: Uuid, new: &NewJob, working_dir: &str) -> Result<Job> {
        let intent = serde_json::to_string(&new.intent).context("Failed to serialize intent")?;
        self.conn
            .execute(
                "INSERT INTO jobs (id, owner_id, scope_id, session_id, intent, working_dir, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id.to_string(),
                    new.owner_id.to_string(),
                    new.scope_id.to_string(),
                    new.session_id.map(|s| s.to_string()),
                    intent,
                    working_dir,
                    now_timestamp(),
                ],
            )
            .context("Failed to insert job")?;
        self.get_job(id)?.context("Job not found after insert")
    }

    pub fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        let sql = format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id.to_string()], JobRow::from_row)
            .optional()
            .context("Failed to query job")?;
        row.map(JobRow::into_job).transpose()
    }

    pub fn list_jobs_by_owner(&self, owner_id: Uuid, limit: i64) -> Result<Vec<Job>> {
        self.list_jobs_where("owner_id = ?1", params![owner_id.to_string(), limit])
    }

    pub fn list_jobs_by_scope(&self, scope_id: Uuid, limit: i64) -> Result<Vec<Job>> {
        self.list_jobs_where("scope_id = ?1", params![scope_id.to_string(), limit])
    }

    /// One owner's jobs in a scope. Filtered in SQL so `limit` counts only
    /// that owner's rows.
    pub fn list_owner_jobs_in_scope(
        &self,
        owner_id: Uuid,
        scope_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Job>> {
        self.list_jobs_where(
            "scope_id = ?1 AND owner_id = ?2",
            params![scope_id.to_string(), owner_id.to_string(), limit],
        )
    }

    /// `filter` binds its values first; the limit is the last parameter.
    fn list_jobs_where<P: rusqlite::Params>(&self, filter: &str, values: P) -> Result<Vec<Job>> {
        let limit_index = filter.matches('?').count() + 1;
        let sql = format!(
            "SELECT {} FROM jobs WHERE {} ORDER BY created_at DESC, rowid DESC LIMIT ?{}",
            JOB_COLUMNS, filter, limit_index
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare job listing")?;
        let rows = stmt
            .query_map(values, JobRow::from_row)
            .context("Failed to list jobs")?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row.context("Failed to read job row")?.into_job()?);
        }
        Ok(jobs)
    }

    // ── Lifecycle transitions ─────────────────────────────────────────
    //
    // Every transition is guarded on the source state in SQL, so once a
    // job is terminal no later write can move it.

    /// `pending -> running`, recording the PID and start time. Returns
    /// `false` if the job was not pending.
    pub fn mark_running(&self, id: Uuid, process_id: u32) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET status = 'running', process_id = ?1, started_at = ?2
                 WHERE id = ?3 AND status = 'pending'",
                params![process_id, now_timestamp(), id.to_string()],
            )
            .context("Failed to mark job running")?;
        Ok(changed > 0)
    }

    /// Move a job into a terminal state. Returns `false` when the current
    /// state is not an allowed source for `outcome.status`.
    pub fn finish_job(&self, id: Uuid, outcome: &JobOutcome) -> Result<bool> {
        anyhow::ensure!(
            outcome.status.is_terminal(),
            "finish_job requires a terminal status, got {}",
            outcome.status
        );
        let sources = outcome
            .status
            .allowed_sources()
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE jobs SET status = ?1, exit_code = ?2, error = ?3, completed_at = ?4
             WHERE id = ?5 AND status IN ({})",
            sources
        );
        let changed = self
            .conn
            .execute(
                &sql,
                params![
                    outcome.status.as_str(),
                    outcome.exit_code,
                    outcome.error,
                    now_timestamp(),
                    id.to_string(),
                ],
            )
            .context("Failed to finish job")?;
        Ok(changed > 0)
    }

    /// Store the captured output buffer and merge `metadata` into the job's
    /// metadata bag.
    pub fn record_output(
        &self,
        id: Uuid,
        output: &str,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let current: Option<String> = self
            .conn
            .query_row(
                "SELECT metadata FROM jobs WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read job metadata")?;
        let Some(current) = current else {
            anyhow::bail!("Job {} not found", id);
        };
        let mut merged: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&current).unwrap_or_default();
        merged.extend(metadata);
        let merged = serde_json::to_string(&merged).context("Failed to serialize metadata")?;
        self.conn
            .execute(
                "UPDATE jobs SET output = ?1, metadata = ?2 WHERE id = ?3",
                params![output, merged, id.to_string()],
            )
            .context("Failed to record job output")?;
        Ok(())
    }

    /// Fail every job left `pending` or `running` by a previous process.
    /// Their live handles died with it, so they can never be cancelled.
    pub fn fail_interrupted_jobs(&self) -> Result<usize> {
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET status = 'failed', error = 'Server restarted while job was in flight', completed_at = ?1
                 WHERE status IN ('pending', 'running')",
                params![now_timestamp()],
            )
            .context("Failed to fail interrupted jobs")?;
        Ok(changed)
    }

    // ── Job logs ──────────────────────────────────────────────────────

    pub fn insert_log(&self, job_id: Uuid, entry: &NewLogEntry) -> Result<LogEntry> {
        let mut inserted = self.insert_logs(job_id, std::slice::from_ref(entry))?;
        inserted.pop().context("Log entry not returned after insert")
    }

    /// Append a batch of log lines in one transaction. Timestamps never
    /// go backwards for a job, even if the wall clock does.
    pub fn insert_logs(&self, job_id: Uuid, entries: &[NewLogEntry]) -> Result<Vec<LogEntry>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin log transaction")?;
        let job_key = job_id.to_string();
        let latest: Option<String> = tx
            .query_row(
                "SELECT MAX(timestamp) FROM job_logs WHERE job_id = ?1",
                params![job_key],
                |row| row.get(0),
            )
            .context("Failed to read latest log timestamp")?;
        let now = now_timestamp();
        let timestamp = match latest {
            Some(latest) if latest > now => latest,
            _ => now,
        };

        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let metadata = match &entry.metadata {
                Some(m) => Some(serde_json::to_string(m).context("Failed to serialize log metadata")?),
                None => None,
            };
            tx.execute(
                "INSERT INTO job_logs (job_id, level, message, metadata, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![job_key, entry.level.as_str(), entry.message, metadata, timestamp],
            )
            .context("Failed to insert log entry")?;
            out.push(LogEntry {
                id: tx.last_insert_rowid(),
                job_id,
                level: entry.level,
                message: entry.message.clone(),
                timestamp: timestamp.clone(),
                metadata: entry.metadata.clone(),
            });
        }
        tx.commit().context("Failed to commit log batch")?;
        Ok(out)
    }

    /// Oldest-first, ties broken by insertion order.
    pub fn get_logs(&self, job_id: Uuid, limit: i64) -> Result<Vec<LogEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, level, message, metadata, timestamp FROM job_logs
                 WHERE job_id = ?1 ORDER BY timestamp ASC, id ASC LIMIT ?2",
            )
            .context("Failed to prepare get_logs")?;
        let rows = stmt
            .query_map(params![job_id.to_string(), limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .context("Failed to query logs")?;
        let mut logs = Vec::new();
        for row in rows {
            let (id, level, message, metadata, timestamp) = row?;
            let metadata = match metadata {
                Some(s) => Some(
                    serde_json::from_str(&s)
                        .map_err(|e| anyhow::anyhow!("corrupt log metadata JSON '{}': {}", s, e))?,
                ),
                None => None,
            };
            logs.push(LogEntry {
                id,
                job_id,
                level: LogLevel::from_str(&level).map_err(|e| anyhow::anyhow!(e))?,
                message,
                timestamp,
                metadata,
            });
        }
        Ok(logs)
    }

    // ── Scope snapshots ───────────────────────────────────────────────

    pub fn get_scope_snapshot(&self, scope_id: Uuid) -> Result<Option<ScopeSnapshot>> {
        let row = self
            .conn
            .query_row(
                "SELECT scope_id, owner_id, location, last_sync_error, last_synced_at, updated_at
                 FROM scope_snapshots WHERE scope_id = ?1",
                params![scope_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query scope snapshot")?;
        match row {
            Some((scope, owner, location, last_sync_error, last_synced_at, updated_at)) => {
                Ok(Some(ScopeSnapshot {
                    scope_id: parse_uuid(&scope)?,
                    owner_id: parse_uuid(&owner)?,
                    location,
                    last_sync_error,
                    last_synced_at,
                    updated_at,
                }))
            }
            None => Ok(None),
        }
    }

    /// Point the scope at a freshly uploaded snapshot and clear any
    /// previous sync failure.
    pub fn record_snapshot_success(
        &self,
        scope_id: Uuid,
        owner_id: Uuid,
        location: &str,
    ) -> Result<ScopeSnapshot> {
        let now = now_timestamp();
        self.conn
            .execute(
                "INSERT INTO scope_snapshots (scope_id, owner_id, location, last_sync_error, last_synced_at, updated_at)
                 VALUES (?1, ?2, ?3, NULL, ?4, ?4)
                 ON CONFLICT(scope_id) DO UPDATE SET
                    location = excluded.location,
                    last_sync_error = NULL,
                    last_synced_at = excluded.last_synced_at,
                    updated_at = excluded.updated_at",
                params![scope_id.to_string(), owner_id.to_string(), location, now],
            )
            .context("Failed to record snapshot")?;
        self.get_scope_snapshot(scope_id)?
            .context("Scope snapshot not found after upsert")
    }

    /// Remember that the latest sync failed, leaving the previous location
    /// (if any) untouched.
    pub fn record_snapshot_failure(
        &self,
        scope_id: Uuid,
        owner_id: Uuid,
        error: &str,
    ) -> Result<ScopeSnapshot> {
        self.conn
            .execute(
                "INSERT INTO scope_snapshots (scope_id, owner_id, location, last_sync_error, updated_at)
                 VALUES (?1, ?2, NULL, ?3, ?4)
                 ON CONFLICT(scope_id) DO UPDATE SET
                    last_sync_error = excluded.last_sync_error,
                    updated_at = excluded.updated_at",
                params![scope_id.to_string(), owner_id.to_string(), error, now_timestamp()],
            )
            .context("Failed to record sync failure")?;
        self.get_scope_snapshot(scope_id)?
            .context("Scope snapshot not found after upsert")
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("invalid UUID in database: '{}'", s))
}

struct JobRow {
    id: String,
    owner_id: String,
    scope_id: String,
    session_id: Option<String>,
    intent: String,
    status: String,
    working_dir: String,
    process_id: Option<u32>,
    output: String,
    error: Option<String>,
    exit_code: Option<i32>,
    metadata: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            scope_id: row.get(2)?,
            session_id: row.get(3)?,
            intent: row.get(4)?,
            status: row.get(5)?,
            working_dir: row.get(6)?,
            process_id: row.get(7)?,
            output: row.get(8)?,
            error: row.get(9)?,
            exit_code: row.get(10)?,
            metadata: row.get(11)?,
            created_at: row.get(12)?,
            started_at: row.get(13)?,
            completed_at: row.get(14)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        let status = JobStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse job status")?;
        let intent: JobIntent = serde_json::from_str(&self.intent)
            .with_context(|| format!("corrupt intent JSON for job {}", self.id))?;
        let metadata = serde_json::from_str(&self.metadata)
            .with_context(|| format!("corrupt metadata JSON for job {}", self.id))?;
        Ok(Job {
            id: parse_uuid(&self.id)?,
            owner_id: parse_uuid(&self.owner_id)?,
            scope_id: parse_uuid(&self.scope_id)?,
            session_id: self.session_id.as_deref().map(parse_uuid).transpose()?,
            intent,
            status,
            working_dir: self.working_dir,
            process_id: self.process_id,
            output: self.output,
            error: self.error,
            exit_code: self.exit_code,
            metadata,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
