use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, Query, State},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use uuid::Uuid;

use super::models::{Job, JobIntent, NewJob, ToolOptions};
use super::orchestrator::Orchestrator;
use super::sse::{self, JobSse, StreamRequest, StreamView};
use crate::errors::JobError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orchestrator: Orchestrator,
    pub keepalive: Duration,
}

pub type SharedState = Arc<AppState>;

/// Header carrying the already-authenticated owner id.
pub const OWNER_HEADER: &str = "x-owner-id";

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateCommandJobRequest {
    pub command: String,
    pub session_id: Option<Uuid>,
}

#[derive(Deserialize)]
pub struct CreateToolJobRequest {
    pub input: String,
    #[serde(default)]
    pub options: ToolOptions,
    pub session_id: Option<Uuid>,
}

#[derive(Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct StreamQuery {
    pub view: Option<StreamView>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match &err {
            JobError::Validation(_) => ApiError::BadRequest(err.to_string()),
            JobError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            JobError::NotRunning { .. } => ApiError::Conflict(err.to_string()),
            _ => {
                tracing::error!(error = %err, "request failed");
                ApiError::Internal(err.to_string())
            }
        }
    }
}

// ── Owner extraction ──────────────────────────────────────────────────

/// The caller's owner id, from [`OWNER_HEADER`].
pub struct OwnerId(pub Uuid);

impl<S: Send + Sync> FromRequestParts<S> for OwnerId {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(OWNER_HEADER)
            .ok_or_else(|| ApiError::Unauthorized(format!("missing {} header", OWNER_HEADER)))?;
        value
            .to_str()
            .ok()
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .filter(|id| !id.is_nil())
            .map(OwnerId)
            .ok_or_else(|| ApiError::Unauthorized(format!("invalid {} header", OWNER_HEADER)))
    }
}

/// Load a job, hiding other owners' jobs as not found.
async fn owned_job(state: &AppState, owner: Uuid, id: Uuid) -> Result<Job, ApiError> {
    let job = state.orchestrator.get_job(id).await?;
    if job.owner_id != owner {
        return Err(JobError::NotFound { id }.into());
    }
    Ok(job)
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route(
            "/api/scopes/{scope_id}/jobs",
            get(list_scope_jobs).post(create_command_job),
        )
        .route("/api/scopes/{scope_id}/tool-jobs", post(create_tool_job))
        .route("/api/scopes/{scope_id}/turns", post(create_turn))
        .route("/api/jobs", get(list_owner_jobs))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .route("/api/jobs/{id}/logs", get(get_logs))
        .route("/api/jobs/{id}/stream", get(stream_job))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn create_command_job(
    State(state): State<SharedState>,
    OwnerId(owner_id): OwnerId,
    Path(scope_id): Path<Uuid>,
    Json(req): Json<CreateCommandJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .orchestrator
        .create_job(NewJob {
            owner_id,
            scope_id,
            session_id: req.session_id,
            intent: JobIntent::Command {
                command: req.command,
            },
        })
        .await?;
    Ok((StatusCode::CREATED, Json(job)))
}

fn tool_job(owner_id: Uuid, scope_id: Uuid, req: CreateToolJobRequest) -> NewJob {
    NewJob {
        owner_id,
        scope_id,
        session_id: req.session_id,
        intent: JobIntent::Tool {
            input: req.input,
            options: req.options,
        },
    }
}

async fn create_tool_job(
    State(state): State<SharedState>,
    OwnerId(owner_id): OwnerId,
    Path(scope_id): Path<Uuid>,
    Json(req): Json<CreateToolJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .orchestrator
        .create_job(tool_job(owner_id, scope_id, req))
        .await?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// Create a tool turn and stream it. Closing the connection cancels it.
async fn create_turn(
    State(state): State<SharedState>,
    OwnerId(owner_id): OwnerId,
    Path(scope_id): Path<Uuid>,
    Json(req): Json<CreateToolJobRequest>,
) -> Result<JobSse, ApiError> {
    let attached = state
        .orchestrator
        .create_attached(tool_job(owner_id, scope_id, req))
        .await?;
    let view = StreamView::default_for(&attached.job.intent);
    Ok(sse::stream_job(
        state.orchestrator.clone(),
        StreamRequest {
            job: attached.job,
            events: attached.events,
            view,
            keepalive: state.keepalive,
            guard: Some(attached.guard),
        },
    ))
}

async fn list_scope_jobs(
    State(state): State<SharedState>,
    OwnerId(owner_id): OwnerId,
    Path(scope_id): Path<Uuid>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let jobs = state
        .orchestrator
        .list_owner_jobs_in_scope(owner_id, scope_id, query.limit)
        .await?;
    Ok(Json(jobs))
}

async fn list_owner_jobs(
    State(state): State<SharedState>,
    OwnerId(owner_id): OwnerId,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let jobs = state
        .orchestrator
        .list_jobs_by_owner(owner_id, query.limit)
        .await?;
    Ok(Json(jobs))
}

async fn get_job(
    State(state): State<SharedState>,
    OwnerId(owner_id): OwnerId,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(owned_job(&state, owner_id, id).await?))
}

async fn cancel_job(
    State(state): State<SharedState>,
    OwnerId(owner_id): OwnerId,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    owned_job(&state, owner_id, id).await?;
    let job = state.orchestrator.cancel_job(id).await?;
    Ok(Json(job))
}

async fn get_logs(
    State(state): State<SharedState>,
    OwnerId(owner_id): OwnerId,
    Path(id): Path<Uuid>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    owned_job(&state, owner_id, id).await?;
    let logs = state.orchestrator.get_logs(id, query.limit).await?;
    Ok(Json(logs))
}

/// Observe a job without owning it; disconnecting leaves it running.
async fn stream_job(
    State(state): State<SharedState>,
    OwnerId(owner_id): OwnerId,
    Path(id): Path<Uuid>,
    Query(query): Query<StreamQuery>,
) -> Result<JobSse, ApiError> {
    // Subscribe before the snapshot so no event falls in between
    let events = state.orchestrator.subscribe_job(id);
    let job = owned_job(&state, owner_id, id).await?;
    let view = query
        .view
        .unwrap_or_else(|| StreamView::default_for(&job.intent));
    Ok(sse::stream_job(
        state.orchestrator.clone(),
        StreamRequest {
            job,
            events,
            view,
            keepalive: state.keepalive,
            guard: None,
        },
    ))
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::jobs::db::JobDb;
    use crate::jobs::models::JobStatus;
    use crate::sync::store::LocalStore;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_app() -> (Router, tempfile::TempDir) {
        app_with(Duration::from_millis(200), |_, _| {})
    }

    fn app_with(
        keepalive: Duration,
        configure: impl FnOnce(&mut Config, &std::path::Path),
    ) -> (Router, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.workspace.root = tmp.path().join("jobs");
        config.workspace.template_zip = None;
        configure(&mut config, tmp.path());
        let store = Arc::new(LocalStore::new(tmp.path().join("store")));
        let orchestrator =
            Orchestrator::start(JobDb::new_in_memory().unwrap(), store, &config).unwrap();
        let state = Arc::new(AppState {
            orchestrator,
            keepalive,
        });
        (api_router().with_state(state), tmp)
    }

    /// App whose coding tool is a shell script that ignores its arguments.
    #[cfg(unix)]
    fn tool_app(script: &str, keepalive: Duration) -> (Router, tempfile::TempDir) {
        use std::os::unix::fs::PermissionsExt;
        app_with(keepalive, |config, dir| {
            let path = dir.join("fake-tool.sh");
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            config.tool.command = path.to_string_lossy().into_owned();
            config.tool.config_path = Some(dir.join("no-tool-config.json"));
        })
    }

    fn turn_request(owner: Uuid) -> Request<Body> {
        request(
            "POST",
            &format!("/api/scopes/{}/turns", Uuid::new_v4()),
            Some(owner),
            Some(serde_json::json!({"input": "make the tests pass"})),
        )
    }

    async fn sse_text(body: Body) -> String {
        let bytes = tokio::time::timeout(Duration::from_secs(15), body.collect())
            .await
            .expect("stream must close after the terminal event")
            .unwrap()
            .to_bytes();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn event_names(text: &str) -> Vec<&str> {
        text.lines().filter_map(|l| l.strip_prefix("event: ")).collect()
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn request(method: &str, uri: &str, owner: Option<Uuid>, body: Option<serde_json::Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(owner) = owner {
            builder = builder.header(OWNER_HEADER, owner.to_string());
        }
        match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn wait_terminal(app: &Router, owner: Uuid, id: &str) -> Job {
        for _ in 0..100 {
            let resp = app
                .clone()
                .oneshot(request("GET", &format!("/api/jobs/{}", id), Some(owner), None))
                .await
                .unwrap();
            let job: Job = body_json(resp.into_body()).await;
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("job {} did not finish", id);
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _tmp) = test_app();
        let resp = app.oneshot(request("GET", "/health", None, None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_missing_owner_is_unauthorized() {
        let (app, _tmp) = test_app();
        let resp = app.oneshot(request("GET", "/api/jobs", None, None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body: serde_json::Value = body_json(resp.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains(OWNER_HEADER));
    }

    #[tokio::test]
    async fn test_empty_command_is_bad_request() {
        let (app, _tmp) = test_app();
        let uri = format!("/api/scopes/{}/jobs", Uuid::new_v4());
        let resp = app
            .oneshot(request("POST", &uri, Some(Uuid::new_v4()), Some(serde_json::json!({"command": "  "}))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_create_run_and_read_logs() {
        let (app, _tmp) = test_app();
        let owner = Uuid::new_v4();
        let scope = Uuid::new_v4();

        let resp = app
            .clone()
            .oneshot(request(
                "POST",
                &format!("/api/scopes/{}/jobs", scope),
                Some(owner),
                Some(serde_json::json!({"command": "echo hi"})),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let job: Job = body_json(resp.into_body()).await;
        assert_eq!(job.status, JobStatus::Pending);

        let done = wait_terminal(&app, owner, &job.id.to_string()).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.exit_code, Some(0));
        assert!(done.output.contains("hi"));

        let resp = app
            .clone()
            .oneshot(request("GET", &format!("/api/jobs/{}/logs", job.id), Some(owner), None))
            .await
            .unwrap();
        let logs: Vec<serde_json::Value> = body_json(resp.into_body()).await;
        assert!(logs.iter().any(|l| l["message"] == "hi"));

        let resp = app
            .clone()
            .oneshot(request("GET", &format!("/api/scopes/{}/jobs", scope), Some(owner), None))
            .await
            .unwrap();
        let jobs: Vec<Job> = body_json(resp.into_body()).await;
        assert_eq!(jobs.len(), 1);

        // Cancelling a finished job conflicts
        let resp = app
            .clone()
            .oneshot(request("POST", &format!("/api/jobs/{}/cancel", job.id), Some(owner), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_other_owner_sees_not_found() {
        let (app, _tmp) = test_app();
        let owner = Uuid::new_v4();
        let resp = app
            .clone()
            .oneshot(request(
                "POST",
                &format!("/api/scopes/{}/jobs", Uuid::new_v4()),
                Some(owner),
                Some(serde_json::json!({"command": "true"})),
            ))
            .await
            .unwrap();
        let job: Job = body_json(resp.into_body()).await;

        let resp = app
            .oneshot(request("GET", &format!("/api/jobs/{}", job.id), Some(Uuid::new_v4()), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stream_of_finished_job_replays_and_closes() {
        let (app, _tmp) = test_app();
        let owner = Uuid::new_v4();
        let resp = app
            .clone()
            .oneshot(request(
                "POST",
                &format!("/api/scopes/{}/jobs", Uuid::new_v4()),
                Some(owner),
                Some(serde_json::json!({"command": "echo streamed"})),
            ))
            .await
            .unwrap();
        let job: Job = body_json(resp.into_body()).await;
        wait_terminal(&app, owner, &job.id.to_string()).await;

        let resp = app
            .oneshot(request("GET", &format!("/api/jobs/{}/stream", job.id), Some(owner), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = tokio::time::timeout(Duration::from_secs(5), resp.into_body().collect())
            .await
            .expect("stream must close after the terminal event")
            .unwrap()
            .to_bytes();
        let text = String::from_utf8_lossy(&bytes);
        let status_at = text.find("event: build_status").unwrap();
        let log_at = text.find("event: build_log").unwrap();
        let done_at = text.find("event: build_complete").unwrap();
        assert!(status_at < log_at && log_at < done_at);
        assert!(text.contains("streamed"));
        assert_eq!(text.matches("event: build_complete").count(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_turn_events_arrive_in_order_with_one_complete() {
        let (app, _tmp) = tool_app(
            r#"echo '{"type":"system","subtype":"init","session_id":"sess-1"}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"done"}]}}'
echo 'plain line'"#,
            Duration::from_secs(5),
        );
        let resp = app.oneshot(turn_request(Uuid::new_v4())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = sse_text(resp.into_body()).await;
        let names = event_names(&text);

        assert_eq!(names.first(), Some(&"build_status"));
        assert_eq!(names.last(), Some(&"complete"));
        assert_eq!(names.iter().filter(|n| **n == "complete").count(), 1);
        assert!(!names.contains(&"build_log"));
        assert!(!names.contains(&"build_complete"));

        let at = |name: &str| names.iter().position(|n| *n == name).unwrap();
        assert!(at("response") < at("session-identified"));
        assert!(at("session-identified") < at("output"));
        assert!(at("output") < at("complete"));
        assert_eq!(names.iter().filter(|n| **n == "session-identified").count(), 1);
        assert!(text.contains(r#"{"session_id":"sess-1"}"#));
        assert!(text.contains(r#"{"data":"plain line"}"#));
        assert!(text.contains(r#""status":"completed""#));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_idle_turn_sends_keepalive() {
        let (app, _tmp) = tool_app("sleep 1\necho 'late'", Duration::from_millis(200));
        let resp = app.oneshot(turn_request(Uuid::new_v4())).await.unwrap();
        let text = sse_text(resp.into_body()).await;
        let names = event_names(&text);

        let first_keepalive = names.iter().position(|n| *n == "keepalive").unwrap();
        let output = names.iter().position(|n| *n == "output").unwrap();
        assert!(first_keepalive < output);
        assert!(text.contains("event: keepalive\ndata: {}"));
        assert_eq!(names.last(), Some(&"complete"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_turn_disconnect_cancels_job() {
        let (app, _tmp) = tool_app("echo 'ready'\nsleep 30", Duration::from_secs(5));
        let owner = Uuid::new_v4();
        let resp = app.clone().oneshot(turn_request(owner)).await.unwrap();
        let mut body = resp.into_body();

        let mut text = String::new();
        while !text.contains("event: output") {
            let frame = tokio::time::timeout(Duration::from_secs(10), body.frame())
                .await
                .expect("turn should produce output")
                .expect("stream ended early")
                .unwrap();
            if let Ok(data) = frame.into_data() {
                text.push_str(&String::from_utf8_lossy(&data));
            }
        }
        let first_data = text
            .lines()
            .find_map(|l| l.strip_prefix("data: "))
            .unwrap();
        let job: Job = serde_json::from_str(first_data).unwrap();
        drop(body);

        let done = wait_terminal(&app, owner, &job.id.to_string()).await;
        assert_eq!(done.status, JobStatus::Cancelled);
        assert!(done.error.unwrap().contains("client disconnected"));
    }

    #[tokio::test]
    async fn test_scope_listing_limits_within_owner() {
        let (app, _tmp) = test_app();
        let (owner, other) = (Uuid::new_v4(), Uuid::new_v4());
        let scope = Uuid::new_v4();
        let create = |who: Uuid| {
            request(
                "POST",
                &format!("/api/scopes/{}/jobs", scope),
                Some(who),
                Some(serde_json::json!({"command": "true"})),
            )
        };
        let resp = app.clone().oneshot(create(owner)).await.unwrap();
        let mine: Job = body_json(resp.into_body()).await;
        for _ in 0..3 {
            app.clone().oneshot(create(other)).await.unwrap();
        }

        let resp = app
            .oneshot(request(
                "GET",
                &format!("/api/scopes/{}/jobs?limit=2", scope),
                Some(owner),
                None,
            ))
            .await
            .unwrap();
        let jobs: Vec<Job> = body_json(resp.into_body()).await;
        assert_eq!(jobs.iter().map(|j| j.id).collect::<Vec<_>>(), vec![mine.id]);
    }
}
