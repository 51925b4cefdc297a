//! Fan-in over a child's stdout and stderr.
//!
//! Two reader tasks feed one bounded channel. Each reader owns a clone of
//! the sender, so the channel closes exactly when the last reader hits
//! end-of-stream, whichever order the pipes close in.

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::events::{EventBus, JobEventKind};
use super::models::{LogLevel, NewLogEntry};
use super::registry::LogSink;
use crate::stream;

/// Buffer between the readers and the classifier.
pub const LINE_CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

#[derive(Debug)]
struct RawLine {
    stream: StreamKind,
    text: String,
}

/// What the multiplexer collected once both streams are drained.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MuxSummary {
    /// Every line from both streams, newline-terminated, in arrival order.
    pub output: String,
    /// Accumulated response text of a tool turn.
    pub response: String,
    /// Last tool session id seen on stdout.
    pub tool_session_id: Option<String>,
}

/// Classification of a single non-empty line.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    Error(String),
    Structured(Value),
    Text(String),
}

pub fn classify(stream: StreamKind, text: &str) -> Classified {
    match stream {
        StreamKind::Stderr => Classified::Error(text.to_string()),
        StreamKind::Stdout => match serde_json::from_str::<Value>(text.trim()) {
            Ok(value) if value.is_object() => Classified::Structured(value),
            _ => Classified::Text(text.to_string()),
        },
    }
}

pub struct Multiplexer {
    job_id: Uuid,
    bus: EventBus,
    sink: LogSink,
}

impl Multiplexer {
    pub fn new(job_id: Uuid, bus: EventBus, sink: LogSink) -> Self {
        Self { job_id, bus, sink }
    }

    /// Drain both pipes, classifying and forwarding each line. Returns once
    /// both readers have reached end-of-stream.
    pub async fn run<O, E>(self, stdout: O, stderr: E) -> MuxSummary
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        tokio::spawn(read_lines(stdout, StreamKind::Stdout, tx.clone()));
        tokio::spawn(read_lines(stderr, StreamKind::Stderr, tx));

        let mut summary = MuxSummary::default();
        while let Some(line) = rx.recv().await {
            self.handle_line(line, &mut summary);
        }
        summary
    }

    fn handle_line(&self, line: RawLine, summary: &mut MuxSummary) {
        summary.output.push_str(&line.text);
        summary.output.push('\n');
        if line.text.trim().is_empty() {
            return;
        }

        match classify(line.stream, &line.text) {
            Classified::Error(message) => {
                self.sink.log(
                    NewLogEntry::error(message.clone())
                        .with_metadata(json!({ "stream": line.stream.as_str() })),
                );
                self.bus.publish(self.job_id, JobEventKind::Error { message });
            }
            Classified::Structured(value) => {
                if let Some(text) = stream::response_text(&value) {
                    summary.response.push_str(&text);
                }
                let message = stream::summarize(&value).unwrap_or_else(|| line.text.clone());
                self.sink
                    .log(NewLogEntry::info(message).with_metadata(value.clone()));

                let new_session = stream::session_id(&value)
                    .filter(|id| summary.tool_session_id.as_deref() != Some(*id))
                    .map(str::to_string);
                self.bus
                    .publish(self.job_id, JobEventKind::Response { payload: value });

                if let Some(id) = new_session {
                    tracing::debug!(job_id = %self.job_id, tool_session_id = %id, "tool session identified");
                    self.sink.log(NewLogEntry::new(
                        LogLevel::Debug,
                        format!("Session ID captured: {}", id),
                    ));
                    self.bus.publish(
                        self.job_id,
                        JobEventKind::SessionIdentified {
                            tool_session_id: id.clone(),
                        },
                    );
                    summary.tool_session_id = Some(id);
                }
            }
            Classified::Text(text) => {
                summary.response.push_str(&text);
                summary.response.push('\n');
                self.sink.log(NewLogEntry::info(text.clone()));
                self.bus
                    .publish(self.job_id, JobEventKind::Output { line: text });
            }
        }
    }
}

/// Read newline-delimited lines as bytes so that neither invalid UTF-8 nor
/// a very long line ends the stream early.
async fn read_lines<R>(reader: R, stream: StreamKind, tx: mpsc::Sender<RawLine>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                if tx.send(RawLine { stream, text }).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(stream = stream.as_str(), error = %e, "pipe read failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::db::{DbHandle, JobDb};
    use crate::jobs::events::JobEvent;
    use crate::jobs::models::{JobIntent, NewJob};
    use std::io::Cursor;
    use tokio::io::AsyncWriteExt;

    fn setup() -> (DbHandle, EventBus, Uuid) {
        let db = DbHandle::new(JobDb::new_in_memory().unwrap());
        let id = Uuid::new_v4();
        db.lock_sync()
            .unwrap()
            .create_job(
                id,
                &NewJob {
                    owner_id: Uuid::new_v4(),
                    scope_id: Uuid::new_v4(),
                    session_id: None,
                    intent: JobIntent::Command {
                        command: "x".into(),
                    },
                },
                "/w",
            )
            .unwrap();
        (db, EventBus::new(), id)
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<JobEvent>) -> Vec<JobEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn test_classify_lines() {
        assert_eq!(
            classify(StreamKind::Stderr, "{\"a\":1}"),
            Classified::Error("{\"a\":1}".into())
        );
        assert!(matches!(
            classify(StreamKind::Stdout, "{\"type\":\"system\"}"),
            Classified::Structured(_)
        ));
        assert_eq!(
            classify(StreamKind::Stdout, "[1,2]"),
            Classified::Text("[1,2]".into())
        );
        assert_eq!(
            classify(StreamKind::Stdout, "{broken"),
            Classified::Text("{broken".into())
        );
    }

    #[tokio::test]
    async fn test_mux_classifies_and_accumulates() {
        let (db, bus, id) = setup();
        let mut rx = bus.subscribe();
        let (sink, writer) = LogSink::spawn(db.clone(), bus.clone(), id);

        let stdout = Cursor::new(
            b"plain line\n{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"Hi!\"}]},\"session_id\":\"s1\"}\n{\"type\":\"result\",\"subtype\":\"success\",\"session_id\":\"s1\"}\n\n".to_vec(),
        );
        let stderr = Cursor::new(b"warning: careful\n".to_vec());

        let summary = Multiplexer::new(id, bus.clone(), sink)
            .run(stdout, stderr)
            .await;
        writer.flush().await;

        assert_eq!(summary.response, "plain line\nHi!");
        assert_eq!(summary.tool_session_id.as_deref(), Some("s1"));
        assert!(summary.output.contains("plain line\n"));
        assert!(summary.output.contains("warning: careful\n"));

        let events = drain(&mut rx);
        let names: Vec<&str> = events.iter().map(|e| e.sse_name(false)).collect();
        assert_eq!(names.iter().filter(|n| **n == "session-identified").count(), 1);
        assert_eq!(names.iter().filter(|n| **n == "response").count(), 2);
        assert_eq!(names.iter().filter(|n| **n == "output").count(), 1);
        assert_eq!(names.iter().filter(|n| **n == "error").count(), 1);

        let logs = db.lock_sync().unwrap().get_logs(id, 100).unwrap();
        // 4 non-empty lines + one session notice
        assert_eq!(logs.len(), 5);
        assert!(logs.iter().any(|l| l.level == LogLevel::Error && l.message == "warning: careful"));
    }

    #[tokio::test]
    async fn test_mux_survives_invalid_utf8() {
        let (db, bus, id) = setup();
        let (sink, writer) = LogSink::spawn(db.clone(), bus.clone(), id);
        let stdout = Cursor::new(b"ok\n\xff\xfe bad\nafter\n".to_vec());
        let summary = Multiplexer::new(id, bus, sink)
            .run(stdout, Cursor::new(Vec::new()))
            .await;
        writer.flush().await;
        assert!(summary.output.ends_with("after\n"));
        assert_eq!(summary.output.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_mux_waits_for_both_streams_with_asymmetric_close() {
        let (db, bus, id) = setup();
        let (sink, writer) = LogSink::spawn(db, bus.clone(), id);
        let (mut out_w, out_r) = tokio::io::duplex(64);
        let (err_w, err_r) = tokio::io::duplex(64);
        drop(err_w); // stderr closes immediately

        let handle = tokio::spawn(Multiplexer::new(id, bus, sink).run(out_r, err_r));

        for i in 0..200 {
            out_w.write_all(format!("line {}\n", i).as_bytes()).await.unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished(), "stdout still open");
        drop(out_w);

        let summary = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("mux must finish once both streams close")
            .unwrap();
        writer.flush().await;
        assert_eq!(summary.output.lines().count(), 200);
        assert!(summary.output.ends_with("line 199\n"));
    }

    #[tokio::test]
    async fn test_long_line_does_not_block_other_stream() {
        let (db, bus, id) = setup();
        let (sink, writer) = LogSink::spawn(db, bus.clone(), id);
        let long = "x".repeat(1 << 20);
        let stdout = Cursor::new(format!("{}\n", long).into_bytes());
        let stderr = Cursor::new(b"err\n".to_vec());
        let summary = Multiplexer::new(id, bus, sink)
            .run(stdout, stderr)
            .await;
        writer.flush().await;
        assert!(summary.output.contains("err\n"));
        assert!(summary.output.len() > long.len());
    }
}
