//! Artifact synchronizer: moves a scope's working tree between the durable
//! object store and a per-job local directory.
//!
//! - `materialize` unpacks the latest snapshot (or the bootstrap template)
//! - `persist` packs the tree and uploads it, updating the scope record
//! - `commit` takes a best-effort git snapshot inside the tree
//! - `cleanup` removes local directories once a job is done

pub mod archive;
pub mod git;
pub mod store;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use uuid::Uuid;

use crate::errors::SyncError;
use crate::jobs::db::DbHandle;
use crate::jobs::models::{Job, ScopeSnapshot};
use store::{ObjectLocation, ObjectStore};

pub const SNAPSHOT_FILE_NAME: &str = "snapshot.zip";

pub struct Synchronizer {
    store: Arc<dyn ObjectStore>,
    db: DbHandle,
    bucket: String,
    template_zip: Option<PathBuf>,
}

async fn blocking<F, R>(f: F) -> Result<R, SyncError>
where
    F: FnOnce() -> Result<R, SyncError> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SyncError::Task(e.to_string()))?
}

impl Synchronizer {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        db: DbHandle,
        bucket: impl Into<String>,
        template_zip: Option<PathBuf>,
    ) -> Self {
        Self {
            store,
            db,
            bucket: bucket.into(),
            template_zip,
        }
    }

    /// Where the scope's snapshot lives in the object store.
    pub fn location_for(&self, owner_id: Uuid, scope_id: Uuid) -> ObjectLocation {
        ObjectLocation::new(
            &self.bucket,
            format!("users/{}/projects/{}/{}", owner_id, scope_id, SNAPSHOT_FILE_NAME),
        )
    }

    pub async fn snapshot(&self, scope_id: Uuid) -> Result<Option<ScopeSnapshot>, SyncError> {
        self.db
            .call(move |db| db.get_scope_snapshot(scope_id))
            .await
            .map_err(|source| SyncError::Download {
                location: format!("scope {}", scope_id),
                source,
            })
    }

    /// Prepare the job's working directory from the latest snapshot, the
    /// bootstrap template, or nothing.
    pub async fn materialize(&self, job: &Job) -> Result<PathBuf, SyncError> {
        let dir = PathBuf::from(&job.working_dir);
        if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&dir)
                .await
                .map_err(|source| SyncError::Io {
                    path: dir.clone(),
                    source,
                })?;
        }
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| SyncError::Io {
                path: dir.clone(),
                source,
            })?;

        let location = self
            .snapshot(job.scope_id)
            .await?
            .and_then(|s| s.location);

        let bytes = match location {
            Some(location) => {
                let parsed: ObjectLocation = location.parse()?;
                tracing::debug!(job_id = %job.id, location = %parsed, "downloading snapshot");
                let bytes = self
                    .store
                    .get(&parsed)
                    .await
                    .map_err(|source| SyncError::Download { location, source })?;
                Some(bytes)
            }
            None => self.template_bytes().await?,
        };

        if let Some(bytes) = bytes {
            let target = dir.clone();
            let files = blocking(move || archive::unpack_into(&bytes, &target)).await?;
            tracing::info!(job_id = %job.id, files, dir = %dir.display(), "materialized working directory");
        } else {
            tracing::info!(job_id = %job.id, dir = %dir.display(), "starting from an empty working directory");
        }
        Ok(dir)
    }

    async fn template_bytes(&self) -> Result<Option<Vec<u8>>, SyncError> {
        let Some(path) = &self.template_zip else {
            return Ok(None);
        };
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "project template not found; using an empty directory");
                Ok(None)
            }
            Err(source) => Err(SyncError::Io {
                path: path.clone(),
                source,
            }),
        }
    }

    /// Pack `dir` and upload it as the scope's snapshot. On success the
    /// scope record points at the new location.
    pub async fn persist(&self, job: &Job, dir: &Path) -> Result<ObjectLocation, SyncError> {
        let location = self.location_for(job.owner_id, job.scope_id);
        let src = dir.to_path_buf();
        let bytes = blocking(move || archive::pack_dir(&src)).await?;
        let size = bytes.len();

        let upload_err = |source| SyncError::Upload {
            location: location.to_string(),
            source,
        };
        self.store
            .ensure_bucket(&location.bucket)
            .await
            .map_err(upload_err)?;
        self.store
            .put(&location, bytes)
            .await
            .map_err(upload_err)?;

        let (scope_id, owner_id, loc) = (job.scope_id, job.owner_id, location.to_string());
        self.db
            .call(move |db| db.record_snapshot_success(scope_id, owner_id, &loc))
            .await
            .map_err(upload_err)?;

        tracing::info!(job_id = %job.id, location = %location, bytes = size, "persisted snapshot");
        Ok(location)
    }

    /// Remember a failed sync on the scope record.
    pub async fn record_failure(&self, job: &Job, error: &SyncError) {
        let (scope_id, owner_id, message) = (job.scope_id, job.owner_id, error.to_string());
        if let Err(e) = self
            .db
            .call(move |db| db.record_snapshot_failure(scope_id, owner_id, &message))
            .await
        {
            tracing::warn!(job_id = %job.id, error = %format!("{:#}", e), "failed to record sync failure");
        }
    }

    /// Best-effort git commit of the tree. Never fails the caller.
    pub async fn commit(&self, dir: &Path, message: &str) {
        let (dir, message) = (dir.to_path_buf(), message.to_string());
        let result =
            tokio::task::spawn_blocking(move || git::commit_all(&dir, &message)).await;
        match result {
            Ok(Ok(git::CommitOutcome::Committed(sha))) => {
                tracing::debug!(sha = %sha, "committed working directory")
            }
            Ok(Ok(git::CommitOutcome::Unchanged)) => {
                tracing::debug!("working directory unchanged; no commit")
            }
            Ok(Err(e)) => tracing::warn!(error = %format!("{:#}", e), "git commit failed"),
            Err(e) => tracing::warn!(error = %e, "git commit task failed"),
        }
    }

    /// Remove local directories. Missing paths are fine.
    pub async fn cleanup(&self, dirs: &[&Path]) {
        for dir in dirs {
            match tokio::fs::remove_dir_all(dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "failed to remove directory")
                }
            }
        }
    }
}
