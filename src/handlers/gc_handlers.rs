//! Admin endpoints for the garbage collector.
//!
//! - POST /admin/gc -> run a collection now
//! - GET  /admin/gc -> last run, scheduler state and whether a run is due

use crate::{
    errors::{AppError, CacheError},
    models::gc_log::GcLogEntry,
    services::gc_service::GcState,
    state::AppState,
};
use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

#[derive(Serialize)]
struct GcStatusResponse {
    state: GcState,
    due: bool,
    last_run: Option<GcLogEntry>,
}

/// `POST /admin/gc`
///
/// A partial failure still answers with the report (HTTP 500) so callers can
/// see what was reclaimed and what was not.
pub async fn run_gc(State(state): State<AppState>) -> Result<Response, AppError> {
    match state.gc.run().await {
        Ok(report) => Ok((StatusCode::OK, Json(report)).into_response()),
        Err(CacheError::PartialGcFailure { report }) => {
            Ok((StatusCode::INTERNAL_SERVER_ERROR, Json(report)).into_response())
        }
        Err(err) => Err(err.into()),
    }
}

/// `GET /admin/gc`
pub async fn gc_status(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let last_run = state.gc.last_run().await?;
    let due = state.gc.is_due().await?;
    Ok(Json(GcStatusResponse {
        state: state.gc.state(),
        due,
        last_run,
    }))
}
