//! Server-sent event streams for a single job.
//!
//! Each stream is driven by a pump task writing into a bounded channel that
//! axum drains. The pump ends on the terminal event, on client disconnect
//! (the receiver is dropped), or when the bus closes. An attached stream
//! owns a `DropGuard`, so the pump ending early cancels the job.

use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event, Sse};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::DropGuard;

use super::events::{JobEvent, JobEventKind, JobSubscription};
use super::models::{Job, JobIntent};
use super::orchestrator::Orchestrator;
use super::registry::MAX_LOG_LIMIT;

const STREAM_BUFFER: usize = 64;

pub type JobSse = Sse<ReceiverStream<Result<Event, Infallible>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamView {
    /// Persisted log lines with build_* event names.
    Logs,
    /// Classified tool output.
    Events,
}

impl StreamView {
    pub fn default_for(intent: &JobIntent) -> Self {
        match intent {
            JobIntent::Command { .. } => Self::Logs,
            JobIntent::Tool { .. } => Self::Events,
        }
    }
}

pub struct StreamRequest {
    pub job: Job,
    /// Must be subscribed before `job` was loaded.
    pub events: JobSubscription,
    pub view: StreamView,
    pub keepalive: Duration,
    /// Present for attached streams.
    pub guard: Option<DropGuard>,
}

pub fn keepalive_event() -> Event {
    Event::default().event("keepalive").data("{}")
}

/// Error event telling an events-view client that `skipped` events were
/// dropped because it fell behind.
pub fn lag_notice(job_id: uuid::Uuid, skipped: u64) -> JobEvent {
    JobEvent {
        job_id,
        kind: JobEventKind::Error {
            message: format!("event stream lagged; {} events skipped", skipped),
        },
    }
}

/// Render an event for `view`, or `None` if the view does not carry it.
/// Log entries at or below `last_log_id` were already sent.
pub fn render(event: &JobEvent, view: StreamView, last_log_id: &mut i64) -> Option<Event> {
    let logs_view = view == StreamView::Logs;
    let carried = match (&event.kind, view) {
        (JobEventKind::Status { .. }, _)
        | (JobEventKind::UploadError { .. }, _)
        | (JobEventKind::Finished { .. }, _) => true,
        (JobEventKind::Log { entry }, StreamView::Logs) => {
            if entry.id <= *last_log_id {
                return None;
            }
            *last_log_id = entry.id;
            true
        }
        (JobEventKind::Log { .. }, StreamView::Events) => false,
        (_, StreamView::Events) => true,
        (_, StreamView::Logs) => false,
    };
    carried.then(|| {
        Event::default()
            .event(event.sse_name(logs_view))
            .data(event.sse_data().to_string())
    })
}

/// Start streaming `req.job` and return the response body.
pub fn stream_job(orchestrator: Orchestrator, req: StreamRequest) -> JobSse {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    tokio::spawn(async move {
        let StreamRequest {
            job,
            events,
            view,
            keepalive,
            guard,
        } = req;
        let id = job.id;
        let attached = guard.is_some();
        let pump = Pump {
            orchestrator,
            tx,
            view,
            keepalive,
            last_log_id: 0,
        };
        let reason = pump.run(job, events).await;
        tracing::debug!(job_id = %id, attached, ?reason, "event stream closed");
        drop(guard);
    });
    Sse::new(ReceiverStream::new(rx))
}

#[derive(Debug, PartialEq, Eq)]
enum PumpEnd {
    Terminal,
    ClientGone,
    BusClosed,
}

struct Pump {
    orchestrator: Orchestrator,
    tx: mpsc::Sender<Result<Event, Infallible>>,
    view: StreamView,
    keepalive: Duration,
    last_log_id: i64,
}

impl Pump {
    async fn send(&self, event: Event) -> Result<(), PumpEnd> {
        self.tx.send(Ok(event)).await.map_err(|_| PumpEnd::ClientGone)
    }

    /// Returns whether anything was sent.
    async fn send_job_event(&mut self, event: &JobEvent) -> Result<bool, PumpEnd> {
        match render(event, self.view, &mut self.last_log_id) {
            Some(rendered) => self.send(rendered).await.map(|()| true),
            None => Ok(false),
        }
    }

    /// Replay persisted logs newer than the last one sent.
    async fn replay_logs(&mut self, job: &Job) -> Result<(), PumpEnd> {
        if self.view != StreamView::Logs {
            return Ok(());
        }
        let logs = match self.orchestrator.get_logs(job.id, Some(MAX_LOG_LIMIT)).await {
            Ok(logs) => logs,
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "log replay failed");
                return Ok(());
            }
        };
        for entry in logs {
            let event = JobEvent {
                job_id: job.id,
                kind: JobEventKind::Log { entry },
            };
            self.send_job_event(&event).await?;
        }
        Ok(())
    }

    async fn send_terminal(&mut self, job: Job) -> Result<(), PumpEnd> {
        let event = JobEvent {
            job_id: job.id,
            kind: JobEventKind::Finished { job },
        };
        self.send_job_event(&event).await.map(|_| ())
    }

    async fn run(mut self, job: Job, mut events: JobSubscription) -> PumpEnd {
        match self.stream(job, &mut events).await {
            Ok(()) => PumpEnd::Terminal,
            Err(end) => end,
        }
    }

    async fn stream(
        &mut self,
        job: Job,
        events: &mut JobSubscription,
    ) -> Result<(), PumpEnd> {
        let id = job.id;
        self.send_job_event(&JobEvent {
            job_id: id,
            kind: JobEventKind::Status { job: job.clone() },
        })
        .await?;
        self.replay_logs(&job).await?;

        if job.status.is_terminal() {
            return self.send_terminal(job).await;
        }

        let tick = tokio::time::sleep(self.keepalive);
        tokio::pin!(tick);
        let mut terminal_seen = false;

        loop {
            tokio::select! {
                _ = self.tx.closed() => return Err(PumpEnd::ClientGone),
                received = events.recv() => match received {
                    Ok(event) => {
                        let sent = self.send_job_event(&event).await?;
                        if event.is_terminal() {
                            return Ok(());
                        }
                        if sent {
                            tick.as_mut().reset(Instant::now() + self.keepalive);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(job_id = %id, skipped, "event stream lagged");
                        // Logs can be rebuilt from the database; other
                        // events are gone, so say so.
                        self.replay_logs(&job).await?;
                        self.send_job_event(&lag_notice(id, skipped)).await?;
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(PumpEnd::BusClosed),
                },
                _ = &mut tick => {
                    self.send(keepalive_event()).await?;
                    tick.as_mut().reset(Instant::now() + self.keepalive);
                    // Catch a terminal state whose event never reached us.
                    // One tick of grace lets post-run sync finish first.
                    if let Ok(current) = self.orchestrator.get_job(id).await
                        && current.status.is_terminal()
                    {
                        if !terminal_seen {
                            terminal_seen = true;
                            continue;
                        }
                        self.replay_logs(&current).await?;
                        return self.send_terminal(current).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::models::{LogEntry, LogLevel, now_timestamp};
    use uuid::Uuid;

    fn log_event(id: i64) -> JobEvent {
        JobEvent {
            job_id: Uuid::nil(),
            kind: JobEventKind::Log {
                entry: LogEntry {
                    id,
                    job_id: Uuid::nil(),
                    level: LogLevel::Info,
                    message: format!("line {}", id),
                    timestamp: now_timestamp(),
                    metadata: None,
                },
            },
        }
    }

    #[test]
    fn test_default_view_follows_intent() {
        assert_eq!(
            StreamView::default_for(&JobIntent::Command {
                command: "make".into()
            }),
            StreamView::Logs
        );
        assert_eq!(
            StreamView::default_for(&JobIntent::Tool {
                input: "hi".into(),
                options: Default::default()
            }),
            StreamView::Events
        );
    }

    #[test]
    fn test_logs_view_dedupes_by_id() {
        let mut last = 0;
        assert!(render(&log_event(1), StreamView::Logs, &mut last).is_some());
        assert!(render(&log_event(2), StreamView::Logs, &mut last).is_some());
        assert!(render(&log_event(2), StreamView::Logs, &mut last).is_none());
        assert!(render(&log_event(1), StreamView::Logs, &mut last).is_none());
        assert_eq!(last, 2);
    }

    #[test]
    fn test_lag_notice_reaches_events_view_only() {
        let mut last = 0;
        let notice = lag_notice(Uuid::nil(), 12);
        assert_eq!(
            notice.sse_data(),
            serde_json::json!({"error": "event stream lagged; 12 events skipped"})
        );
        assert!(render(&notice, StreamView::Events, &mut last).is_some());
        assert!(render(&notice, StreamView::Logs, &mut last).is_none());
    }

    #[test]
    fn test_views_filter_kinds() {
        let mut last = 0;
        let output = JobEvent {
            job_id: Uuid::nil(),
            kind: JobEventKind::Output { line: "x".into() },
        };
        assert!(render(&output, StreamView::Logs, &mut last).is_none());
        assert!(render(&output, StreamView::Events, &mut last).is_some());
        assert!(render(&log_event(5), StreamView::Events, &mut last).is_none());
        assert_eq!(last, 0);

        let upload = JobEvent {
            job_id: Uuid::nil(),
            kind: JobEventKind::UploadError {
                message: "down".into(),
            },
        };
        assert!(render(&upload, StreamView::Logs, &mut last).is_some());
        assert!(render(&upload, StreamView::Events, &mut last).is_some());
    }

    #[tokio::test]
    async fn test_missed_terminal_event_is_sent_after_one_tick() {
        use axum::response::IntoResponse;
        use http_body_util::BodyExt;
        use std::sync::Arc;

        use crate::config::Config;
        use crate::jobs::db::JobDb;
        use crate::jobs::models::{JobStatus, NewJob};
        use crate::sync::store::LocalStore;

        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.workspace.root = tmp.path().join("jobs");
        let store = Arc::new(LocalStore::new(tmp.path().join("store")));
        let orchestrator =
            Orchestrator::start(JobDb::new_in_memory().unwrap(), store, &config).unwrap();

        // Created but never run, so no Finished event is ever published.
        let job = orchestrator
            .registry()
            .create(NewJob {
                owner_id: Uuid::new_v4(),
                scope_id: Uuid::new_v4(),
                session_id: None,
                intent: JobIntent::Command {
                    command: "true".into(),
                },
            })
            .await
            .unwrap();
        let events = orchestrator.subscribe_job(job.id);
        let id = job.id;
        let sse = stream_job(
            orchestrator.clone(),
            StreamRequest {
                job,
                events,
                view: StreamView::Logs,
                keepalive: Duration::from_millis(100),
                guard: None,
            },
        );
        assert!(orchestrator
            .registry()
            .fail_before_start(id, "workspace unavailable".into())
            .await
            .unwrap());

        let bytes = tokio::time::timeout(
            Duration::from_secs(5),
            sse.into_response().into_body().collect(),
        )
        .await
        .expect("terminal event should close the stream")
        .unwrap()
        .to_bytes();
        let text = String::from_utf8_lossy(&bytes);
        let names: Vec<&str> = text.lines().filter_map(|l| l.strip_prefix("event: ")).collect();

        assert_eq!(names.last(), Some(&"build_complete"));
        assert_eq!(names.iter().filter(|n| **n == "build_complete").count(), 1);
        let done_at = names.len() - 1;
        assert!(names[..done_at].iter().filter(|n| **n == "keepalive").count() >= 2);
        assert!(text.contains("workspace unavailable"));

        let stored = orchestrator.get_job(id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
    }
}
