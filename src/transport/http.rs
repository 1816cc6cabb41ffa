use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::AdmissionError;
use crate::job::{CommandChainRequest, JobState, JobStatusRecord};
use crate::queue::JobTicket;
use crate::service::JobService;

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: String,
}

pub struct ApiError(StatusCode, String);

impl From<AdmissionError> for ApiError {
    fn from(e: AdmissionError) -> Self {
        let status = match &e {
            AdmissionError::Malformed(_) => StatusCode::BAD_REQUEST,
            AdmissionError::Signature(_) => StatusCode::UNAUTHORIZED,
            AdmissionError::UnknownJob(_) => StatusCode::NOT_FOUND,
            AdmissionError::AlreadyStarted(_) | AdmissionError::AlreadyFinished(_) => StatusCode::CONFLICT,
        };
        ApiError(status, e.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError(StatusCode::BAD_REQUEST, format!("invalid JSON body: {}", e.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorBody { error: self.1 })).into_response()
    }
}

#[derive(Serialize)]
pub struct CancelBody {
    pub id: String,
    pub status: JobState,
}

#[derive(Serialize)]
pub struct LogsBody {
    pub id: String,
    pub lines: Vec<String>,
}

pub fn router(service: Arc<JobService>) -> Router {
    Router::new()
        .route("/jobs", post(submit_job))
        .route("/jobs/{id}", get(job_status).put(modify_job).delete(cancel_job))
        .route("/jobs/{id}/logs", get(job_logs))
        .with_state(service)
}

/// Serves the API on `listener` until `shutdown` fires.
pub async fn serve(listener: TcpListener, service: Arc<JobService>, shutdown: CancellationToken) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "HTTP submission API listening");
    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

async fn submit_job(
    State(service): State<Arc<JobService>>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<JobTicket>), ApiError> {
    let Json(body) = body?;
    let request = CommandChainRequest::from_json(body)?;
    let ticket = service.submit(request).await?;
    Ok((StatusCode::ACCEPTED, Json(ticket)))
}

async fn modify_job(
    State(service): State<Arc<JobService>>,
    Path(id): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<JobStatusRecord>, ApiError> {
    let Json(body) = body?;
    let request = CommandChainRequest::from_json(body)?;
    Ok(Json(service.modify(&id, request).await?))
}

async fn cancel_job(
    State(service): State<Arc<JobService>>,
    Path(id): Path<String>,
) -> Result<Json<CancelBody>, ApiError> {
    let status = service.cancel(&id).await?;
    Ok(Json(CancelBody { id, status }))
}

async fn job_status(
    State(service): State<Arc<JobService>>,
    Path(id): Path<String>,
) -> Result<Json<JobStatusRecord>, ApiError> {
    Ok(Json(service.status(&id)?))
}

async fn job_logs(
    State(service): State<Arc<JobService>>,
    Path(id): Path<String>,
) -> Result<Json<LogsBody>, ApiError> {
    let lines = service.logs(&id)?;
    Ok(Json(LogsBody { id, lines }))
}
