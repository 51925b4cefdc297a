//! Typed error hierarchy for jobforge.
//!
//! Four top-level enums cover the subsystems:
//! - `JobError`: job creation, cancellation, and queries
//! - `LaunchError`: building and spawning the external process
//! - `SyncError`: archive packing/unpacking and object store transfers
//! - `ConfigError`: loading `jobforge.toml` and environment overrides

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::jobs::models::CancelReason;

/// Errors surfaced by the orchestrator's public operations.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Invalid job request: {0}")]
    Validation(String),

    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} not found or not running")]
    NotRunning { id: Uuid },

    #[error(transparent)]
    Spawn(#[from] LaunchError),

    #[error("Process exited with code {exit_code}: {message}")]
    Runtime { exit_code: i32, message: String },

    #[error("Job cancelled: {reason}")]
    Cancelled { reason: CancelReason },

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Job store error: {0}")]
    Store(#[source] anyhow::Error),
}

/// Errors from the process launcher.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Child process is missing its {0} pipe")]
    MissingPipe(&'static str),
}

/// Errors from the artifact synchronizer. Never fatal to a job's outcome
/// once the process has run.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Archive entry '{name}' escapes the working directory")]
    UnsafeEntry { name: String },

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Failed to download snapshot {location}: {source}")]
    Download {
        location: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to upload snapshot {location}: {source}")]
    Upload {
        location: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Invalid snapshot location '{0}': expected bucket/objectKey")]
    InvalidLocation(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Sync task failed: {0}")]
    Task(String),
}

/// Errors loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value '{value}' for {key}")]
    InvalidEnv { key: String, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_error_spawn_carries_program_and_kind() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = LaunchError::Spawn {
            program: "claude".to_string(),
            source: io_err,
        };
        match &err {
            LaunchError::Spawn { program, source } => {
                assert_eq!(program, "claude");
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            _ => panic!("Expected Spawn variant"),
        }
        assert!(err.to_string().contains("claude"));
    }

    #[test]
    fn job_error_converts_from_launch_error() {
        let err: JobError = LaunchError::MissingPipe("stdout").into();
        match &err {
            JobError::Spawn(LaunchError::MissingPipe(pipe)) => assert_eq!(*pipe, "stdout"),
            _ => panic!("Expected JobError::Spawn(MissingPipe)"),
        }
    }

    #[test]
    fn job_error_converts_from_sync_error() {
        let err: JobError = SyncError::UnsafeEntry {
            name: "../../etc/passwd".to_string(),
        }
        .into();
        match &err {
            JobError::Sync(SyncError::UnsafeEntry { name }) => {
                assert_eq!(name, "../../etc/passwd");
            }
            _ => panic!("Expected JobError::Sync(UnsafeEntry)"),
        }
        assert!(err.to_string().contains("escapes"));
    }

    #[test]
    fn job_error_not_running_carries_id() {
        let id = Uuid::new_v4();
        let err = JobError::NotRunning { id };
        match &err {
            JobError::NotRunning { id: got } => assert_eq!(*got, id),
            _ => panic!("Expected NotRunning"),
        }
        assert!(err.to_string().contains(&id.to_string()));
    }

    #[test]
    fn job_error_runtime_display_includes_exit_code() {
        let err = JobError::Runtime {
            exit_code: 2,
            message: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "Process exited with code 2: boom");
    }

    #[test]
    fn cancelled_display_names_reason() {
        let err = JobError::Cancelled {
            reason: CancelReason::Disconnect,
        };
        assert!(err.to_string().contains("client disconnected"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_error<E: std::error::Error + Send + Sync + 'static>() {}
        assert_error::<JobError>();
        assert_error::<LaunchError>();
        assert_error::<SyncError>();
        assert_error::<ConfigError>();
    }
}
