//! Routes for the image cache.
//!
//! ## Structure
//! - **Images**
//!   - `PUT  /images/{guid}`      : store under a caller-chosen guid
//!   - `POST /images`             : store under a generated guid
//!   - `GET  /images/{guid}`      : download (counts the download)
//!   - `GET  /images/{guid}/info` : metadata record only
//!
//! - **Statistics**
//!   - `GET  /statistics/{date}`  : daily counters (`YYYY-MM-DD`)
//!
//! - **Admin**
//!   - `POST /admin/gc`           : run garbage collection now
//!   - `GET  /admin/gc`           : last run and scheduler state

use crate::{
    handlers::{
        gc_handlers::{gc_status, run_gc},
        health_handlers::{healthz, readyz},
        image_handlers::{get_image, image_info, post_image, put_image},
        statistics_handlers::daily_statistic,
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post, put},
};

/// Largest accepted upload body.
pub const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

/// Build the router. Every handler receives the shared `AppState`.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/images", post(post_image))
        .route("/images/{guid}", put(put_image).get(get_image))
        .route("/images/{guid}/info", get(image_info))
        .route("/statistics/{date}", get(daily_statistic))
        .route("/admin/gc", post(run_gc).get(gc_status))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
}
