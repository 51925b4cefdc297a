use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current UTC time with fixed microsecond precision, so lexical order of
/// stored timestamps equals chronological order.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ── Job status ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// The states a job may be in immediately before entering `self`.
    pub fn allowed_sources(&self) -> &'static [JobStatus] {
        match self {
            Self::Pending => &[],
            Self::Running => &[Self::Pending],
            Self::Completed => &[Self::Running],
            Self::Failed => &[Self::Pending, Self::Running],
            Self::Cancelled => &[Self::Running],
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check whether a status transition follows the job state machine.
pub fn is_valid_transition(from: JobStatus, to: JobStatus) -> bool {
    to.allowed_sources().contains(&from)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    User,
    Disconnect,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "cancelled by user"),
            Self::Disconnect => write!(f, "client disconnected"),
        }
    }
}

// ── Intent ────────────────────────────────────────────────────────────

/// Permission mode passed through to the coding tool.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    #[default]
    Default,
    AcceptEdits,
    BypassPermissions,
    /// Read-only planning; the most restrictive mode.
    Plan,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "acceptEdits",
            Self::BypassPermissions => "bypassPermissions",
            Self::Plan => "plan",
        }
    }
}

impl FromStr for PermissionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Self::Default),
            "acceptEdits" | "accept_edits" => Ok(Self::AcceptEdits),
            "bypassPermissions" | "bypass_permissions" => Ok(Self::BypassPermissions),
            "plan" => Ok(Self::Plan),
            _ => Err(format!(
                "Invalid permission mode '{}'. Valid values: default, acceptEdits, bypassPermissions, plan",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageAttachment {
    /// Base64-encoded image bytes (standard alphabet, padded).
    pub data: String,
    pub mime_type: String,
}

impl ImageAttachment {
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(self.data.trim())
    }

    /// File extension for the attachment, or `None` for non-image types.
    pub fn extension(&self) -> Option<&'static str> {
        match self.mime_type.as_str() {
            "image/png" => Some("png"),
            "image/jpeg" | "image/jpg" => Some("jpg"),
            "image/gif" => Some("gif"),
            "image/webp" => Some("webp"),
            _ => None,
        }
    }
}

/// Structured options for a coding-tool turn. Every field has an explicit
/// default so an empty JSON object is a valid bundle.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolOptions {
    pub model: Option<String>,
    pub resume: bool,
    pub tool_session_id: Option<String>,
    pub permission_mode: PermissionMode,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub skip_permissions: bool,
    pub images: Vec<ImageAttachment>,
}

/// What a job runs: a literal shell command, or a coding-tool turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobIntent {
    Command {
        command: String,
    },
    Tool {
        input: String,
        #[serde(default)]
        options: ToolOptions,
    },
}

impl JobIntent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Command { .. } => "command",
            Self::Tool { .. } => "tool",
        }
    }

    /// The command line or the user input, used for log metadata and
    /// commit messages.
    pub fn summary(&self) -> &str {
        match self {
            Self::Command { command } => command,
            Self::Tool { input, .. } => input,
        }
    }
}

// ── Job ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub scope_id: Uuid,
    pub session_id: Option<Uuid>,
    pub intent: JobIntent,
    pub status: JobStatus,
    pub working_dir: String,
    pub process_id: Option<u32>,
    pub output: String,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub metadata: serde_json::Value,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

/// A validated creation request, before the job row exists.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub owner_id: Uuid,
    pub scope_id: Uuid,
    pub session_id: Option<Uuid>,
    pub intent: JobIntent,
}

/// Field values written when a job reaches a terminal state.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

// ── Logs ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid log level: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub id: i64,
    pub job_id: Uuid,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: String,
    pub metadata: Option<serde_json::Value>,
}

/// A log line before it is persisted; the store assigns id and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLogEntry {
    pub level: LogLevel,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
}

impl NewLogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            metadata: None,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warn, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

// ── Scope snapshots ───────────────────────────────────────────────────

/// Durable pointer from a scope to its latest packed working directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScopeSnapshot {
    pub scope_id: Uuid,
    pub owner_id: Uuid,
    /// `bucket/objectKey`; `None` until the first successful upload.
    pub location: Option<String>,
    pub last_sync_error: Option<String>,
    pub last_synced_at: Option<String>,
    pub updated_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(JobStatus::from_str("queued").is_err());
    }

    #[test]
    fn test_valid_transitions() {
        use JobStatus::*;
        assert!(is_valid_transition(Pending, Running));
        assert!(is_valid_transition(Pending, Failed));
        assert!(is_valid_transition(Running, Completed));
        assert!(is_valid_transition(Running, Failed));
        assert!(is_valid_transition(Running, Cancelled));
    }

    #[test]
    fn test_invalid_transitions() {
        use JobStatus::*;
        assert!(!is_valid_transition(Pending, Completed));
        assert!(!is_valid_transition(Pending, Cancelled));
        assert!(!is_valid_transition(Running, Pending));
        for terminal in [Completed, Failed, Cancelled] {
            for to in [Pending, Running, Completed, Failed, Cancelled] {
                assert!(
                    !is_valid_transition(terminal, to),
                    "{} -> {} must be rejected",
                    terminal,
                    to
                );
            }
        }
    }

    #[test]
    fn test_intent_serializes_with_kind_tag() {
        let intent = JobIntent::Command {
            command: "make test".into(),
        };
        let json = serde_json::to_value(&intent).unwrap();
        assert_eq!(json["kind"], "command");
        assert_eq!(json["command"], "make test");
    }

    #[test]
    fn test_tool_intent_defaults_options() {
        let intent: JobIntent =
            serde_json::from_str(r#"{"kind":"tool","input":"add a readme"}"#).unwrap();
        match intent {
            JobIntent::Tool { input, options } => {
                assert_eq!(input, "add a readme");
                assert_eq!(options, ToolOptions::default());
                assert_eq!(options.permission_mode, PermissionMode::Default);
            }
            _ => panic!("expected tool intent"),
        }
    }

    #[test]
    fn test_permission_mode_serde_uses_cli_names() {
        let opts: ToolOptions =
            serde_json::from_str(r#"{"permission_mode":"acceptEdits"}"#).unwrap();
        assert_eq!(opts.permission_mode, PermissionMode::AcceptEdits);
        assert_eq!(opts.permission_mode.as_str(), "acceptEdits");
        assert_eq!(
            "bypass_permissions".parse::<PermissionMode>().unwrap(),
            PermissionMode::BypassPermissions
        );
        assert!("yolo".parse::<PermissionMode>().is_err());
    }

    #[test]
    fn test_image_attachment_decode_and_extension() {
        let img = ImageAttachment {
            data: STANDARD.encode(b"\x89PNG"),
            mime_type: "image/png".into(),
        };
        assert_eq!(img.decode().unwrap(), b"\x89PNG");
        assert_eq!(img.extension(), Some("png"));

        let bad = ImageAttachment {
            data: "not base64!!".into(),
            mime_type: "text/plain".into(),
        };
        assert!(bad.decode().is_err());
        assert_eq!(bad.extension(), None);
    }

    #[test]
    fn test_timestamps_sort_lexically() {
        let a = now_timestamp();
        let b = now_timestamp();
        assert_eq!(a.len(), b.len());
        assert!(a <= b);
        assert!(a.ends_with('Z'));
    }
}
