//! Authoritative job state and the live-process handle table.
//!
//! The handle map is the only structure mutated by more than one task: the
//! runner registers and unregisters entries, `cancel` removes them. It sits
//! behind a `std::sync::Mutex` private to this module and the lock is only
//! held for single map operations, never across an `.await`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::db::DbHandle;
use super::events::{EventBus, JobEventKind};
use super::launcher::split_command;
use super::models::*;
use super::multiplexer::MuxSummary;
use crate::errors::JobError;

pub const DEFAULT_LIST_LIMIT: i64 = 20;
pub const MAX_LIST_LIMIT: i64 = 100;
pub const DEFAULT_LOG_LIMIT: i64 = 100;
pub const MAX_LOG_LIMIT: i64 = 1000;

/// Clamp a caller-supplied limit into `[1, max]`, substituting `default`
/// when absent or non-positive.
pub fn clamp_limit(limit: Option<i64>, default: i64, max: i64) -> i64 {
    match limit {
        Some(n) if n > 0 => n.min(max),
        _ => default,
    }
}

/// Directory a job runs in: one fresh tree per job under the scope.
pub fn working_dir_for(root: &Path, owner_id: Uuid, scope_id: Uuid, job_id: Uuid) -> PathBuf {
    root.join(owner_id.to_string())
        .join(scope_id.to_string())
        .join(job_id.to_string())
}

/// Control handle for a running process. The runner owns the child; this
/// carries the signal that tells it to kill.
struct LiveHandle {
    pid: u32,
    kill: oneshot::Sender<CancelReason>,
}

pub struct JobRegistry {
    db: DbHandle,
    bus: EventBus,
    workspace_root: PathBuf,
    live: std::sync::Mutex<HashMap<Uuid, LiveHandle>>,
}

impl JobRegistry {
    pub fn new(db: DbHandle, bus: EventBus, workspace_root: PathBuf) -> Self {
        Self {
            db,
            bus,
            workspace_root,
            live: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    // ── Creation & queries ───────────────────────────────────────────

    /// Reject malformed requests before anything is written.
    pub fn validate(new: &NewJob) -> Result<(), JobError> {
        if new.owner_id.is_nil() {
            return Err(JobError::Validation("owner id is required".into()));
        }
        if new.scope_id.is_nil() {
            return Err(JobError::Validation("scope id is required".into()));
        }
        match &new.intent {
            JobIntent::Command { command } => {
                if split_command(command).is_empty() {
                    return Err(JobError::Validation("Empty command".into()));
                }
            }
            JobIntent::Tool { input, options } => {
                if input.trim().is_empty() {
                    return Err(JobError::Validation("input is required".into()));
                }
                if options.resume
                    && options
                        .tool_session_id
                        .as_deref()
                        .is_none_or(|s| s.trim().is_empty())
                {
                    return Err(JobError::Validation(
                        "resume requires a tool_session_id".into(),
                    ));
                }
                for (i, image) in options.images.iter().enumerate() {
                    if image.extension().is_none() {
                        return Err(JobError::Validation(format!(
                            "image {} has unsupported mime type '{}'",
                            i, image.mime_type
                        )));
                    }
                    if image.decode().is_err() {
                        return Err(JobError::Validation(format!(
                            "image {} is not valid base64",
                            i
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Persist a new pending job. Does not start it.
    pub async fn create(&self, new: NewJob) -> Result<Job, JobError> {
        Self::validate(&new)?;
        let id = Uuid::new_v4();
        let working_dir = working_dir_for(&self.workspace_root, new.owner_id, new.scope_id, id)
            .display()
            .to_string();
        let job = self
            .db
            .call(move |db| db.create_job(id, &new, &working_dir))
            .await
            .map_err(JobError::Store)?;
        tracing::info!(job_id = %job.id, owner_id = %job.owner_id, scope_id = %job.scope_id, kind = job.intent.kind(), "job created");
        self.bus
            .publish(job.id, JobEventKind::Status { job: job.clone() });
        Ok(job)
    }

    pub async fn get(&self, id: Uuid) -> Result<Job, JobError> {
        self.db
            .call(move |db| db.get_job(id))
            .await
            .map_err(JobError::Store)?
            .ok_or(JobError::NotFound { id })
    }

    pub async fn list_by_owner(&self, owner_id: Uuid, limit: Option<i64>) -> Result<Vec<Job>, JobError> {
        let limit = clamp_limit(limit, DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT);
        self.db
            .call(move |db| db.list_jobs_by_owner(owner_id, limit))
            .await
            .map_err(JobError::Store)
    }

    pub async fn list_by_scope(&self, scope_id: Uuid, limit: Option<i64>) -> Result<Vec<Job>, JobError> {
        let limit = clamp_limit(limit, DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT);
        self.db
            .call(move |db| db.list_jobs_by_scope(scope_id, limit))
            .await
            .map_err(JobError::Store)
    }

    pub async fn list_owner_in_scope(
        &self,
        owner_id: Uuid,
        scope_id: Uuid,
        limit: Option<i64>,
    ) -> Result<Vec<Job>, JobError> {
        let limit = clamp_limit(limit, DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT);
        self.db
            .call(move |db| db.list_owner_jobs_in_scope(owner_id, scope_id, limit))
            .await
            .map_err(JobError::Store)
    }

    pub async fn logs(&self, id: Uuid, limit: Option<i64>) -> Result<Vec<LogEntry>, JobError> {
        let limit = clamp_limit(limit, DEFAULT_LOG_LIMIT, MAX_LOG_LIMIT);
        self.db
            .call(move |db| db.get_logs(id, limit))
            .await
            .map_err(JobError::Store)
    }

    // ── Live handles ─────────────────────────────────────────────────

    /// Record a running process. The returned receiver fires when the job
    /// is cancelled.
    pub fn register(&self, id: Uuid, pid: u32) -> oneshot::Receiver<CancelReason> {
        let (kill, rx) = oneshot::channel();
        let mut live = self.lock_live();
        if live.insert(id, LiveHandle { pid, kill }).is_some() {
            tracing::warn!(job_id = %id, "replaced an existing live handle");
        }
        rx
    }

    /// Drop the handle for an exited process. Returns whether one existed.
    pub fn unregister(&self, id: Uuid) -> bool {
        self.lock_live().remove(&id).is_some()
    }

    pub fn is_live(&self, id: Uuid) -> bool {
        self.lock_live().contains_key(&id)
    }

    fn lock_live(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, LiveHandle>> {
        // A poisoned map is still structurally valid; keep serving it.
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Kill a running job and mark it cancelled. Fails with `NotRunning`
    /// when there is no live handle, including after a previous cancel.
    pub async fn cancel(&self, id: Uuid, reason: CancelReason) -> Result<Job, JobError> {
        let handle = self.lock_live().remove(&id);
        let Some(handle) = handle else {
            return Err(JobError::NotRunning { id });
        };
        tracing::info!(job_id = %id, pid = handle.pid, %reason, "cancelling job");
        // The runner may already be past its select; the kill is then moot.
        let _ = handle.kill.send(reason);

        let outcome = JobOutcome {
            status: JobStatus::Cancelled,
            exit_code: None,
            error: Some(JobError::Cancelled { reason }.to_string()),
        };
        self.finish(id, outcome).await?;
        self.get(id).await
    }

    // ── Lifecycle writes ─────────────────────────────────────────────

    /// `pending -> running` once the process exists.
    pub async fn mark_running(&self, job: &Job, pid: u32) -> Result<(), JobError> {
        let id = job.id;
        let changed = self
            .db
            .call(move |db| db.mark_running(id, pid))
            .await
            .map_err(JobError::Store)?;
        if !changed {
            tracing::warn!(job_id = %id, "job was not pending when its process started");
            return Ok(());
        }
        self.log(
            id,
            NewLogEntry::info("Job started").with_metadata(json!({
                "kind": job.intent.kind(),
                "command": job.intent.summary(),
                "working_dir": job.working_dir,
            })),
        )
        .await;
        self.log(id, NewLogEntry::info(format!("Process started with PID: {}", pid)))
            .await;
        self.publish_status(id).await;
        Ok(())
    }

    /// Move a job to a terminal state. A no-op (returning `false`) if the
    /// state machine does not allow it, e.g. the job is already cancelled.
    pub async fn finish(&self, id: Uuid, outcome: JobOutcome) -> Result<bool, JobError> {
        if !is_valid_transition(JobStatus::Running, outcome.status) {
            return Err(JobError::Store(anyhow::anyhow!(
                "cannot finish job with non-terminal status {}",
                outcome.status
            )));
        }
        let notice = match (&outcome.status, outcome.exit_code) {
            (JobStatus::Completed, _) => NewLogEntry::info("Job completed successfully"),
            (JobStatus::Failed, Some(code)) => {
                NewLogEntry::error(format!("Job failed with exit code {}", code))
            }
            (JobStatus::Failed, None) => NewLogEntry::error(format!(
                "Job failed: {}",
                outcome.error.as_deref().unwrap_or("")
            )),
            _ => NewLogEntry::warn(match outcome.error.as_deref() {
                Some(e) if e.contains("client disconnected") => "Job cancelled: client disconnected",
                _ => "Job cancelled by user",
            }),
        };
        let status = outcome.status;
        let changed = self
            .db
            .call(move |db| db.finish_job(id, &outcome))
            .await
            .map_err(JobError::Store)?;
        if changed {
            tracing::info!(job_id = %id, %status, "job finished");
            self.log(id, notice).await;
            self.publish_status(id).await;
        }
        Ok(changed)
    }

    /// Fail a job that never got a process.
    pub async fn fail_before_start(&self, id: Uuid, error: String) -> Result<bool, JobError> {
        self.log(id, NewLogEntry::error(error.clone())).await;
        self.bus
            .publish(id, JobEventKind::Error { message: error.clone() });
        self.finish(
            id,
            JobOutcome {
                status: JobStatus::Failed,
                exit_code: None,
                error: Some(error),
            },
        )
        .await
    }

    pub async fn record_output(&self, id: Uuid, summary: &MuxSummary) -> Result<(), JobError> {
        let output = summary.output.clone();
        let mut metadata = serde_json::Map::new();
        if let Some(session) = &summary.tool_session_id {
            metadata.insert("tool_session_id".into(), session.clone().into());
        }
        if !summary.response.is_empty() {
            metadata.insert("response".into(), summary.response.clone().into());
        }
        self.db
            .call(move |db| db.record_output(id, &output, metadata))
            .await
            .map_err(JobError::Store)
    }

    /// Append one status notice and forward it. Failures are logged; a
    /// lost notice never fails the job.
    pub async fn log(&self, id: Uuid, entry: NewLogEntry) {
        match self.db.call(move |db| db.insert_log(id, &entry)).await {
            Ok(entry) => self.bus.publish(id, JobEventKind::Log { entry }),
            Err(e) => tracing::error!(job_id = %id, error = %format!("{:#}", e), "failed to write job log"),
        }
    }

    async fn publish_status(&self, id: Uuid) {
        match self.get(id).await {
            Ok(job) => self.bus.publish(id, JobEventKind::Status { job }),
            Err(e) => tracing::warn!(job_id = %id, error = %e, "failed to reload job for status event"),
        }
    }

    /// Ordered, batched log writer for one job's output lines.
    pub fn log_sink(&self, id: Uuid) -> (LogSink, LogWriter) {
        LogSink::spawn(self.db.clone(), self.bus.clone(), id)
    }
}

// ── Log sink ─────────────────────────────────────────────────────────

/// Cheap, non-blocking handle for appending log lines. Entries are written
/// in send order by a single writer task.
#[derive(Clone)]
pub struct LogSink {
    job_id: Uuid,
    tx: mpsc::UnboundedSender<NewLogEntry>,
}

/// Owns the writer task. `flush` completes once every `LogSink` clone has
/// been dropped and all entries are persisted.
pub struct LogWriter {
    handle: JoinHandle<()>,
}

const LOG_BATCH_SIZE: usize = 64;

impl LogSink {
    pub fn spawn(db: DbHandle, bus: EventBus, job_id: Uuid) -> (LogSink, LogWriter) {
        let (tx, mut rx) = mpsc::unbounded_channel::<NewLogEntry>();
        let handle = tokio::spawn(async move {
            let mut batch = Vec::new();
            loop {
                match rx.recv().await {
                    Some(entry) => batch.push(entry),
                    None => break,
                }
                while batch.len() < LOG_BATCH_SIZE {
                    match rx.try_recv() {
                        Ok(entry) => batch.push(entry),
                        Err(_) => break,
                    }
                }
                let entries = std::mem::take(&mut batch);
                let count = entries.len();
                match db.call(move |db| db.insert_logs(job_id, &entries)).await {
                    Ok(written) => {
                        for entry in written {
                            bus.publish(job_id, JobEventKind::Log { entry });
                        }
                    }
                    Err(e) => {
                        tracing::error!(job_id = %job_id, count, error = %format!("{:#}", e), "failed to write log batch")
                    }
                }
            }
        });
        (LogSink { job_id, tx }, LogWriter { handle })
    }

    pub fn log(&self, entry: NewLogEntry) {
        if self.tx.send(entry).is_err() {
            tracing::warn!(job_id = %self.job_id, "log writer closed; dropping entry");
        }
    }
}

impl LogWriter {
    pub async fn flush(self) {
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "log writer task panicked");
        }
    }
}
