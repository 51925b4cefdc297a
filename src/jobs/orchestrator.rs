//! The public facade: job creation, cancellation, and queries.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio_util::sync::{CancellationToken, DropGuard};
use uuid::Uuid;

use super::db::{DbHandle, JobDb};
use super::events::{EventBus, JobEvent, JobSubscription};
use super::models::*;
use super::registry::JobRegistry;
use super::runner::JobRunner;
use crate::config::{Config, StorageBackend};
use crate::errors::JobError;
use crate::sync::Synchronizer;
use crate::sync::store::{LocalStore, ObjectStore, S3Store};

/// A job bound to one client connection. Dropping `guard` cancels the job
/// as `client disconnected`.
pub struct AttachedJob {
    pub job: Job,
    pub events: JobSubscription,
    pub guard: DropGuard,
}

#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<JobRegistry>,
    runner: Arc<JobRunner>,
}

/// Object store selected by `[storage].backend`.
pub fn build_store(config: &Config) -> Arc<dyn ObjectStore> {
    let storage = &config.storage;
    match storage.backend {
        StorageBackend::S3 => Arc::new(S3Store::new(
            &storage.endpoint,
            storage.use_ssl,
            &storage.region,
            &storage.access_key,
            &storage.secret_key,
        )),
        StorageBackend::Local => Arc::new(LocalStore::new(storage.local_root.clone())),
    }
}

impl Orchestrator {
    pub fn new(db: DbHandle, store: Arc<dyn ObjectStore>, config: &Config) -> Self {
        let bus = EventBus::new();
        let registry = Arc::new(JobRegistry::new(
            db.clone(),
            bus,
            config.workspace.root.clone(),
        ));
        let sync = Arc::new(Synchronizer::new(
            store,
            db,
            config.storage.bucket.clone(),
            config.workspace.template_zip.clone(),
        ));
        let runner = Arc::new(JobRunner::new(
            registry.clone(),
            sync,
            config.tool.clone(),
        ));
        Self { registry, runner }
    }

    /// Open the database at `[database].path`, fail jobs orphaned by a
    /// previous process, and wire up the configured store.
    pub fn open(config: &Config) -> Result<Self> {
        if let Some(parent) = config.database.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let db = JobDb::new(&config.database.path).with_context(|| {
            format!("Failed to open database at {}", config.database.path.display())
        })?;
        Self::start(db, build_store(config), config)
    }

    /// Like [`Orchestrator::open`], with an explicit database and store.
    pub fn start(db: JobDb, store: Arc<dyn ObjectStore>, config: &Config) -> Result<Self> {
        let interrupted = db.fail_interrupted_jobs()?;
        if interrupted > 0 {
            tracing::warn!(count = interrupted, "failed jobs interrupted by a previous shutdown");
        }
        std::fs::create_dir_all(&config.workspace.root).with_context(|| {
            format!(
                "Failed to create workspace root {}",
                config.workspace.root.display()
            )
        })?;
        Ok(Self::new(DbHandle::new(db), store, config))
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Create a job and start it in the background. Returns the pending
    /// record immediately.
    pub async fn create_job(&self, new: NewJob) -> Result<Job, JobError> {
        let job = self.registry.create(new).await?;
        self.spawn(job.clone(), CancellationToken::new());
        Ok(job)
    }

    /// Create a job whose lifetime is bound to the returned guard. The
    /// event receiver is subscribed before the job starts, so nothing is
    /// missed.
    pub async fn create_attached(&self, new: NewJob) -> Result<AttachedJob, JobError> {
        let job = self.registry.create(new).await?;
        let events = self.registry.bus().subscribe_job(job.id);
        let token = CancellationToken::new();
        self.spawn(job.clone(), token.clone());
        Ok(AttachedJob {
            job,
            events,
            guard: token.drop_guard(),
        })
    }

    fn spawn(&self, job: Job, token: CancellationToken) {
        let runner = self.runner.clone();
        tokio::spawn(async move {
            runner.execute(job, token).await;
        });
    }

    pub async fn cancel_job(&self, id: Uuid) -> Result<Job, JobError> {
        self.registry.cancel(id, CancelReason::User).await
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Job, JobError> {
        self.registry.get(id).await
    }

    pub async fn list_jobs_by_owner(&self, owner_id: Uuid, limit: Option<i64>) -> Result<Vec<Job>, JobError> {
        self.registry.list_by_owner(owner_id, limit).await
    }

    pub async fn list_jobs_by_scope(&self, scope_id: Uuid, limit: Option<i64>) -> Result<Vec<Job>, JobError> {
        self.registry.list_by_scope(scope_id, limit).await
    }

    /// Scope listing restricted to one owner.
    pub async fn list_owner_jobs_in_scope(
        &self,
        owner_id: Uuid,
        scope_id: Uuid,
        limit: Option<i64>,
    ) -> Result<Vec<Job>, JobError> {
        self.registry.list_owner_in_scope(owner_id, scope_id, limit).await
    }

    pub async fn get_logs(&self, id: Uuid, limit: Option<i64>) -> Result<Vec<LogEntry>, JobError> {
        self.registry.logs(id, limit).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.registry.bus().subscribe()
    }

    pub fn subscribe_job(&self, id: Uuid) -> JobSubscription {
        self.registry.bus().subscribe_job(id)
    }
}
