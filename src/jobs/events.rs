use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::models::{Job, LogEntry};

/// Capacity of the process-wide event channel. Slow subscribers that fall
/// further behind than this observe `Lagged` and skip ahead.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Capacity of each per-job channel. Only that job's own traffic counts
/// against it.
pub const JOB_CHANNEL_CAPACITY: usize = 256;

// ── Event types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum JobEventKind {
    /// Snapshot of the job record.
    Status { job: Job },
    /// A persisted log line.
    Log { entry: LogEntry },
    /// A structured object parsed from the tool's stdout.
    Response { payload: Value },
    SessionIdentified { tool_session_id: String },
    /// A plain-text stdout line.
    Output { line: String },
    /// A stderr line or an internal failure.
    Error { message: String },
    /// Post-run snapshot failure; does not affect job status.
    UploadError { message: String },
    /// Last event for a job. Carries the final record.
    Finished { job: Job },
}

#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub job_id: Uuid,
    #[serde(flatten)]
    pub kind: JobEventKind,
}

impl JobEvent {
    /// SSE event name. The terminal name depends on which view the client
    /// is watching.
    pub fn sse_name(&self, logs_view: bool) -> &'static str {
        match &self.kind {
            JobEventKind::Status { .. } => "build_status",
            JobEventKind::Log { .. } => "build_log",
            JobEventKind::Response { .. } => "response",
            JobEventKind::SessionIdentified { .. } => "session-identified",
            JobEventKind::Output { .. } => "output",
            JobEventKind::Error { .. } => "error",
            JobEventKind::UploadError { .. } => "upload_error",
            JobEventKind::Finished { .. } if logs_view => "build_complete",
            JobEventKind::Finished { .. } => "complete",
        }
    }

    /// SSE data payload.
    pub fn sse_data(&self) -> Value {
        match &self.kind {
            JobEventKind::Status { job } | JobEventKind::Finished { job } => {
                serde_json::to_value(job).unwrap_or(Value::Null)
            }
            JobEventKind::Log { entry } => serde_json::to_value(entry).unwrap_or(Value::Null),
            JobEventKind::Response { payload } => payload.clone(),
            JobEventKind::SessionIdentified { tool_session_id } => {
                json!({ "session_id": tool_session_id })
            }
            JobEventKind::Output { line } => json!({ "data": line }),
            JobEventKind::Error { message } | JobEventKind::UploadError { message } => {
                json!({ "error": message })
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, JobEventKind::Finished { .. })
    }
}

// ── Bus ──────────────────────────────────────────────────────────────

type JobChannels = Arc<Mutex<HashMap<Uuid, broadcast::Sender<JobEvent>>>>;

fn lock_channels(jobs: &JobChannels) -> MutexGuard<'_, HashMap<Uuid, broadcast::Sender<JobEvent>>> {
    jobs.lock().unwrap_or_else(|e| e.into_inner())
}

/// Fan-out of job events. Every event goes to the process-wide channel and
/// to the job's own channel while that job has subscribers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
    jobs: JobChannels,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tx,
            jobs: Arc::default(),
        }
    }

    pub fn publish(&self, job_id: Uuid, kind: JobEventKind) {
        let event = JobEvent { job_id, kind };
        if let Some(tx) = lock_channels(&self.jobs).get(&job_id) {
            let _ = tx.send(event.clone());
        }
        let _ = self.tx.send(event); // Ignore error if no receivers
    }

    /// Every job's events, in publish order.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    /// One job's events. Other jobs' traffic never causes this receiver
    /// to lag.
    pub fn subscribe_job(&self, job_id: Uuid) -> JobSubscription {
        let rx = lock_channels(&self.jobs)
            .entry(job_id)
            .or_insert_with(|| broadcast::channel(JOB_CHANNEL_CAPACITY).0)
            .subscribe();
        JobSubscription {
            job_id,
            rx,
            jobs: self.jobs.clone(),
        }
    }

    #[cfg(test)]
    fn has_job_channel(&self, job_id: Uuid) -> bool {
        lock_channels(&self.jobs).contains_key(&job_id)
    }
}

/// Receiver for a single job. The job's channel is removed when its last
/// subscription drops.
pub struct JobSubscription {
    job_id: Uuid,
    rx: broadcast::Receiver<JobEvent>,
    jobs: JobChannels,
}

impl JobSubscription {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub async fn recv(&mut self) -> Result<JobEvent, broadcast::error::RecvError> {
        self.rx.recv().await
    }
}

impl Drop for JobSubscription {
    fn drop(&mut self) {
        let mut jobs = lock_channels(&self.jobs);
        if jobs
            .get(&self.job_id)
            .is_some_and(|tx| tx.receiver_count() <= 1)
        {
            jobs.remove(&self.job_id);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = JobEvent {
            job_id: Uuid::nil(),
            kind: JobEventKind::Output {
                line: "hello".into(),
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"output\""));
        assert!(json.contains("\"data\":{\"line\":\"hello\"}"));
        assert!(json.contains("\"job_id\""));
    }

    #[test]
    fn test_sse_names() {
        let ev = |kind| JobEvent {
            job_id: Uuid::nil(),
            kind,
        };
        assert_eq!(
            ev(JobEventKind::SessionIdentified {
                tool_session_id: "s".into()
            })
            .sse_name(false),
            "session-identified"
        );
        assert_eq!(
            ev(JobEventKind::UploadError {
                message: "zip failed".into()
            })
            .sse_name(true),
            "upload_error"
        );
        assert_eq!(
            ev(JobEventKind::Response {
                payload: json!({})
            })
            .sse_name(false),
            "response"
        );
    }

    #[test]
    fn test_sse_payloads() {
        let out = JobEvent {
            job_id: Uuid::nil(),
            kind: JobEventKind::Output { line: "hi".into() },
        };
        assert_eq!(out.sse_data(), json!({"data": "hi"}));

        let err = JobEvent {
            job_id: Uuid::nil(),
            kind: JobEventKind::Error {
                message: "warning: x".into(),
            },
        };
        assert_eq!(err.sse_data(), json!({"error": "warning: x"}));
        assert!(!err.is_terminal());

        let session = JobEvent {
            job_id: Uuid::nil(),
            kind: JobEventKind::SessionIdentified {
                tool_session_id: "abc".into(),
            },
        };
        assert_eq!(session.sse_data(), json!({"session_id": "abc"}));
    }

    #[tokio::test]
    async fn test_bus_delivers_to_subscribers() {
        let bus = EventBus::new();
        bus.publish(Uuid::nil(), JobEventKind::Output { line: "lost".into() });
        let mut rx = bus.subscribe();
        let id = Uuid::new_v4();
        bus.publish(id, JobEventKind::Output { line: "seen".into() });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.job_id, id);
        match event.kind {
            JobEventKind::Output { line } => assert_eq!(line, "seen"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_job_subscription_ignores_other_jobs_traffic() {
        let bus = EventBus::new();
        let busy = Uuid::new_v4();
        let quiet = Uuid::new_v4();
        let mut busy_rx = bus.subscribe_job(busy);
        let mut quiet_rx = bus.subscribe_job(quiet);

        for i in 0..(JOB_CHANNEL_CAPACITY * 8) {
            bus.publish(busy, JobEventKind::Output { line: i.to_string() });
        }
        bus.publish(quiet, JobEventKind::Output { line: "mine".into() });

        let event = quiet_rx.recv().await.unwrap();
        assert_eq!(event.job_id, quiet);
        assert!(matches!(event.kind, JobEventKind::Output { ref line } if line == "mine"));
        assert!(matches!(
            busy_rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }

    #[test]
    fn test_job_channel_removed_with_last_subscription() {
        let bus = EventBus::new();
        let id = Uuid::new_v4();
        let first = bus.subscribe_job(id);
        let second = bus.subscribe_job(id);
        drop(first);
        assert!(bus.has_job_channel(id));
        drop(second);
        assert!(!bus.has_job_channel(id));

        // No channel, no per-job send.
        bus.publish(id, JobEventKind::Output { line: "x".into() });
        assert!(!bus.has_job_channel(id));
    }
}
