//! HTTP surface: accept copy requests and report their progress.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use time::format_description::well_known::Rfc3339;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::migrate::model::{AsyncStartCopy, CopyRequest, QueueMessage};
use crate::migrate::paths;
use crate::storage::{JobState, StateStore};

const RETRY_AFTER_SECS: &str = "5";

pub struct ApiState {
    pub store: StateStore,
    /// Base address clients poll, without a trailing slash.
    pub public_url: String,
    pub tenant_url: String,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/copy", post(start_copy))
        .route("/copy/status", get(copy_status))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    #[serde(rename = "taskId")]
    task_id: Option<String>,
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn start_copy(State(state): State<Arc<ApiState>>, body: Bytes) -> Response {
    let request = match serde_json::from_slice::<CopyRequest>(&body) {
        Ok(request) => request,
        Err(err) => {
            warn!(error = %err, body = %String::from_utf8_lossy(&body), "rejecting malformed copy request");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    if let Err(err) = request.validate() {
        warn!(error = %err, "rejecting invalid copy request");
        return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
    }
    for site in [&request.source_site, &request.dest_site] {
        if !paths::is_within_tenant(site, &state.tenant_url) {
            warn!(site = %site, "rejecting copy request outside the tenant");
            return (StatusCode::BAD_REQUEST, format!("{site} is outside the tenant"))
                .into_response();
        }
    }

    let job_id = Uuid::new_v4();
    match enqueue(&state.store, job_id, request).await {
        Ok(()) => {
            info!(job = %job_id, "copy request accepted");
            working_on_it(&state.public_url, job_id)
        }
        Err(err) => {
            error!(job = %job_id, error = %err, "failed to accept copy request");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn enqueue(
    store: &StateStore,
    job_id: Uuid,
    request: CopyRequest,
) -> anyhow::Result<()> {
    let body = QueueMessage::StartCopy(AsyncStartCopy {
        start: request,
        request_id: job_id,
    })
    .to_json()?;
    store.create_job(job_id).await?;
    store.send_message(&body).await?;
    Ok(())
}

async fn copy_status(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<StatusQuery>,
) -> Response {
    let Some(job_id) = query
        .task_id
        .as_deref()
        .and_then(|raw| Uuid::parse_str(raw.trim()).ok())
    else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let job = match state.store.get_job(job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            error!(job = %job_id, error = %err, "failed to read job status");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    match job.state() {
        JobState::Running => working_on_it(&state.public_url, job_id),
        JobState::Succeeded => {
            let finished_at = job
                .finished_at_utc()
                .and_then(|at| at.format(&Rfc3339).ok());
            (
                StatusCode::OK,
                Json(json!({ "taskId": job_id, "finishedAt": finished_at })),
            )
                .into_response()
        }
        JobState::Failed(error) => (StatusCode::INTERNAL_SERVER_ERROR, error).into_response(),
    }
}

/// 202 pointing the caller at the status endpoint.
fn working_on_it(public_url: &str, job_id: Uuid) -> Response {
    let location = format!("{public_url}/copy/status?taskId={job_id}");
    let mut response = StatusCode::ACCEPTED.into_response();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&location) {
        headers.insert(header::LOCATION, value);
    }
    headers.insert(header::RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
    response
}
