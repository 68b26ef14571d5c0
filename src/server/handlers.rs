use anyhow::{Context, Result};
use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

use super::models::{DeleteRequest, ServerError, TranslateResponse, UploadResponse};
use super::state::ServerState;
use crate::jobs::{Admission, DeleteReport, JobConfig, JobView, Scheduler};
use crate::settings::Settings;

const OWNER_TOKEN_HEADER: &str = "x-owner-token";
const MAX_UPLOAD_BYTES: usize = 200 * 1024 * 1024;

pub async fn run_server(settings: Settings, addr: String) -> Result<()> {
    let scheduler = crate::build_scheduler(&settings)?;
    startup(&scheduler, &settings).await;
    let state = Arc::new(ServerState {
        settings,
        scheduler,
    });
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| "failed to bind server address")?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        })
        .await?;
    let scheduler = state.scheduler.clone();
    tokio::task::spawn_blocking(move || scheduler.flush_store()).await?;
    Ok(())
}

/// Sweeps stale state, resumes unfinished jobs, then schedules periodic sweeps.
async fn startup(scheduler: &Scheduler, settings: &Settings) {
    let sweep = scheduler.clone();
    let delete_orphans = settings.maintenance_delete_orphans;
    match tokio::task::spawn_blocking(move || sweep.run_maintenance(delete_orphans)).await {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => tracing::warn!("startup maintenance failed: {:#}", err),
        Err(err) => tracing::warn!("startup maintenance panicked: {}", err),
    }
    if let Err(err) = scheduler.resume_from_store() {
        tracing::warn!("failed to resume jobs: {:#}", err);
    }
    if settings.maintenance_enabled {
        scheduler.spawn_maintenance(
            Duration::from_secs(settings.maintenance_interval_seconds),
            delete_orphans,
        );
    }
}

pub(crate) fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/upload",
            post(upload).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/api/translate", post(translate))
        .route("/api/tasks", get(tasks))
        .route("/api/tasks/:id/status", get(task_status))
        .route("/api/tasks/delete", post(delete_tasks))
        .with_state(state)
        .layer(axum::middleware::from_fn(cors_middleware))
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn cors_middleware(req: Request<Body>, next: Next) -> Result<Response<Body>, StatusCode> {
    if req.method() == Method::OPTIONS {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::NO_CONTENT;
        apply_cors_headers(response.headers_mut());
        return Ok(response);
    }
    let mut response = next.run(req).await;
    apply_cors_headers(response.headers_mut());
    Ok(response)
}

fn apply_cors_headers(headers: &mut HeaderMap) {
    headers.insert("access-control-allow-origin", HeaderValue::from_static("*"));
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("GET,POST,OPTIONS"),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("content-type,authorization,x-owner-token"),
    );
}

async fn upload(
    State(state): State<Arc<ServerState>>,
    body: Bytes,
) -> Result<Json<UploadResponse>, ServerError> {
    if !body.starts_with(b"%PDF") {
        return Err(ServerError::bad_request("upload is not a PDF"));
    }
    let file_id = uuid::Uuid::new_v4().simple().to_string();
    let dir = &state.settings.uploads_dir;
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create upload dir: {}", dir.display()))?;
    let path = dir.join(format!("{}.pdf", file_id));
    tokio::fs::write(&path, &body)
        .await
        .with_context(|| format!("failed to store upload: {}", path.display()))?;
    Ok(Json(UploadResponse {
        file_id,
        size: body.len(),
    }))
}

async fn translate(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(config): Json<JobConfig>,
) -> Result<Json<TranslateResponse>, ServerError> {
    config
        .validate()
        .map_err(|err| ServerError::bad_request(err.to_string()))?;
    let file_name = config.source_file_name();
    let owner = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    let submission = state
        .scheduler
        .submit(config, OffsetDateTime::now_utc(), owner)?;
    if submission.status == Admission::Invalid {
        return Err(ServerError::not_found(format!(
            "source file not found: {}",
            file_name
        )));
    }
    let queue_position = state.scheduler.queue_position(&submission.job_id);
    Ok(Json(TranslateResponse {
        task_id: submission.job_id,
        status: submission.status,
        owner_token: submission.owner_token,
        queue_position,
    }))
}

async fn tasks(State(state): State<Arc<ServerState>>) -> Result<Json<Vec<JobView>>, ServerError> {
    let views = state.scheduler.list()?;
    Ok(Json(views.into_iter().map(redact).collect()))
}

async fn task_status(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<JobView>, ServerError> {
    match state.scheduler.status(&id)? {
        Some(view) => Ok(Json(redact(view))),
        None => Err(ServerError::not_found(format!("task not found: {}", id))),
    }
}

async fn delete_tasks(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(request): Json<DeleteRequest>,
) -> Result<Json<DeleteReport>, ServerError> {
    if request.task_ids.is_empty() {
        return Err(ServerError::bad_request("task_ids is empty"));
    }
    let token = headers
        .get(OWNER_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    Ok(Json(state.scheduler.delete_jobs(&request.task_ids, token).await))
}

fn redact(mut view: JobView) -> JobView {
    view.job.owner_token.clear();
    view
}
