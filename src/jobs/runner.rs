//! Drives one job from `pending` to a terminal state.
//!
//! Order of work: materialize, launch, multiplex until exit or kill,
//! finalize, then commit and persist for jobs that actually ran. The
//! `Finished` event is published last, after logs are flushed and the
//! working directory is gone.

use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::events::JobEventKind;
use super::launcher::{self, ArgContext, LaunchSpec, ProcessHandle};
use super::models::*;
use super::multiplexer::{MuxSummary, Multiplexer};
use super::registry::JobRegistry;
use crate::config::ToolConfig;
use crate::errors::JobError;
use crate::sync::Synchronizer;

/// How long to wait for output pipes to close once the process is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Extra wait after killing the group of a process whose pipes outlived it.
const KILL_GRACE: Duration = Duration::from_secs(1);

/// Recorded when the exit status could not be collected.
pub const WAIT_FAILED_EXIT_CODE: i32 = -1;

enum Exit {
    Exited(std::io::Result<ExitStatus>),
    Killed(CancelReason),
}

pub struct JobRunner {
    registry: Arc<JobRegistry>,
    sync: Arc<Synchronizer>,
    tool: ToolConfig,
}

/// Sibling directory for decoded image attachments, kept out of the
/// working tree so they are never persisted.
pub fn attachments_dir(working_dir: &Path) -> PathBuf {
    let mut name = working_dir.as_os_str().to_os_string();
    name.push(".attachments");
    PathBuf::from(name)
}

/// Exit code for a finished process. A signal death is reported as
/// `128 + signal`, as shells do.
pub fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

impl JobRunner {
    pub fn new(registry: Arc<JobRegistry>, sync: Arc<Synchronizer>, tool: ToolConfig) -> Self {
        Self {
            registry,
            sync,
            tool,
        }
    }

    /// Run `job` to completion. `detach` fires when an attached client goes
    /// away; detached jobs pass a token nobody cancels.
    pub async fn execute(&self, job: Job, detach: CancellationToken) {
        let id = job.id;
        let workdir = PathBuf::from(&job.working_dir);
        let attachments = attachments_dir(&workdir);

        self.run(&job, &detach, &workdir, &attachments).await;
        self.sync.cleanup(&[&workdir, &attachments]).await;

        match self.registry.get(id).await {
            Ok(job) => {
                tracing::info!(job_id = %id, status = %job.status, "job done");
                self.registry
                    .bus()
                    .publish(id, JobEventKind::Finished { job });
            }
            Err(e) => tracing::error!(job_id = %id, error = %e, "failed to load finished job"),
        }
    }

    async fn run(&self, job: &Job, detach: &CancellationToken, workdir: &Path, attachments: &Path) {
        let id = job.id;

        if let Err(e) = self.sync.materialize(job).await {
            self.fail_before_start(id, format!("Failed to prepare working directory: {}", e))
                .await;
            return;
        }
        if detach.is_cancelled() {
            self.fail_before_start(id, "client disconnected before launch".to_string())
                .await;
            return;
        }

        let argv = match self.argv_for(job, attachments).await {
            Ok(argv) => argv,
            Err(e) => {
                self.fail_before_start(id, e.to_string()).await;
                return;
            }
        };
        let spec = LaunchSpec {
            argv,
            cwd: workdir.to_path_buf(),
            env: launcher::job_env(job.owner_id, job.scope_id, workdir),
        };

        let ProcessHandle {
            mut child,
            stdout,
            stderr,
            pid,
        } = match launcher::launch(&spec) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "launch failed");
                self.fail_before_start(id, JobError::from(e).to_string()).await;
                return;
            }
        };

        // Running before registering, so a cancel never sees a pending job.
        if let Err(e) = self.registry.mark_running(job, pid).await {
            tracing::warn!(job_id = %id, error = %e, "failed to mark job running");
        }
        let mut cancel_rx = self.registry.register(id, pid);

        let (sink, writer) = self.registry.log_sink(id);
        let mut mux = tokio::spawn(
            Multiplexer::new(id, self.registry.bus().clone(), sink).run(stdout, stderr),
        );

        let exit = tokio::select! {
            status = child.wait() => Exit::Exited(status),
            reason = &mut cancel_rx => Exit::Killed(reason.unwrap_or(CancelReason::User)),
            _ = detach.cancelled() => {
                if let Err(e) = self.registry.cancel(id, CancelReason::Disconnect).await {
                    tracing::debug!(job_id = %id, error = %e, "disconnect cancel raced");
                }
                Exit::Killed(CancelReason::Disconnect)
            }
        };

        // The process is gone or going; a cancel from here on has nothing
        // to kill.
        self.registry.unregister(id);
        if let Exit::Killed(_) = exit {
            kill_process_group(id, pid);
            if let Err(e) = child.kill().await {
                tracing::warn!(job_id = %id, pid, error = %e, "failed to kill process");
            }
        }
        let summary = drain(id, pid, &mut mux).await;

        writer.flush().await;
        if let Err(e) = self.registry.record_output(id, &summary).await {
            tracing::warn!(job_id = %id, error = %e, "failed to record output");
        }

        let outcome = outcome_for(&exit, &summary);
        if let Err(e) = self.registry.finish(id, outcome).await {
            tracing::error!(job_id = %id, error = %e, "failed to finalize job");
        }

        self.post_run(id, workdir).await;
    }

    /// Commit and persist for jobs that ran to completion or failure.
    /// Cancelled jobs skip both.
    async fn post_run(&self, id: Uuid, workdir: &Path) {
        let job = match self.registry.get(id).await {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "failed to reload job");
                return;
            }
        };
        if !matches!(job.status, JobStatus::Completed | JobStatus::Failed) {
            return;
        }

        if let JobIntent::Tool { input, .. } = &job.intent {
            self.sync.commit(workdir, input).await;
        }

        if let Err(e) = self.sync.persist(&job, workdir).await {
            let message = e.to_string();
            tracing::warn!(job_id = %id, error = %message, "snapshot persist failed");
            self.registry
                .log(id, NewLogEntry::warn(format!("Snapshot upload failed: {}", message)))
                .await;
            self.registry
                .bus()
                .publish(id, JobEventKind::UploadError { message });
            self.sync.record_failure(&job, &e).await;
        }
    }

    async fn argv_for(&self, job: &Job, attachments: &Path) -> Result<Vec<String>, JobError> {
        let mut ctx = ArgContext {
            tool_command: self.tool.command.clone(),
            default_model: self.tool.default_model.clone(),
            ..Default::default()
        };
        if let JobIntent::Tool { options, .. } = &job.intent {
            ctx.image_paths = launcher::write_attachments(attachments, &options.images)
                .await
                .map_err(|e| JobError::Validation(format!("Failed to write attachments: {}", e)))?;
            ctx.mcp_config = self
                .tool
                .resolved_config_path()
                .and_then(|path| launcher::detect_mcp_config(&path));
        }
        Ok(launcher::build_argv(&job.intent, &ctx))
    }

    async fn fail_before_start(&self, id: Uuid, error: String) {
        if let Err(e) = self.registry.fail_before_start(id, error).await {
            tracing::error!(job_id = %id, error = %e, "failed to record job failure");
        }
    }
}

/// Wait for the multiplexer to hit EOF on both pipes. Forked descendants
/// can hold them open past the job's exit; they are killed once
/// `DRAIN_TIMEOUT` passes.
async fn drain(id: Uuid, pid: u32, mux: &mut JoinHandle<MuxSummary>) -> MuxSummary {
    let joined = match tokio::time::timeout(DRAIN_TIMEOUT, &mut *mux).await {
        Ok(joined) => joined,
        Err(_) => {
            tracing::warn!(job_id = %id, pid, "output still open after exit, killing process group");
            kill_process_group(id, pid);
            match tokio::time::timeout(KILL_GRACE, &mut *mux).await {
                Ok(joined) => joined,
                Err(_) => {
                    tracing::warn!(job_id = %id, "output did not drain, dropping multiplexer");
                    mux.abort();
                    return MuxSummary::default();
                }
            }
        }
    };
    joined.unwrap_or_else(|e| {
        tracing::error!(job_id = %id, error = %e, "multiplexer task failed");
        MuxSummary::default()
    })
}

/// SIGKILL the job's process group. Missing groups are fine; the job
/// may have reaped everything already.
#[cfg(unix)]
fn kill_process_group(id: Uuid, pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if raw <= 0 {
        return;
    }
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(job_id = %id, pid, error = %e, "failed to kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_id: Uuid, _pid: u32) {}

fn outcome_for(exit: &Exit, summary: &MuxSummary) -> JobOutcome {
    match exit {
        Exit::Exited(Ok(status)) if status.success() => JobOutcome {
            status: JobStatus::Completed,
            exit_code: Some(0),
            error: None,
        },
        Exit::Exited(Ok(status)) => {
            let code = exit_code(status);
            let message = summary
                .output
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("no output")
                .to_string();
            JobOutcome {
                status: JobStatus::Failed,
                exit_code: Some(code),
                error: Some(JobError::Runtime { exit_code: code, message }.to_string()),
            }
        }
        Exit::Exited(Err(e)) => JobOutcome {
            status: JobStatus::Failed,
            exit_code: Some(WAIT_FAILED_EXIT_CODE),
            error: Some(format!("Failed to wait for process: {}", e)),
        },
        Exit::Killed(reason) => JobOutcome {
            status: JobStatus::Cancelled,
            exit_code: None,
            error: Some(JobError::Cancelled { reason: *reason }.to_string()),
        },
    }
}
