use axum::{
    Router,
    routing::{get, post},
};

use crate::AppState;
use crate::handlers::{events, inventory, jobs, layout};

/// All API routes under `/api`.
pub fn api_router() -> Router<AppState> {
    Router::new()
        // Layout
        .route(
            "/api/layout",
            get(layout::get_layout).put(layout::put_layout),
        )
        .route("/api/layout/import", post(layout::import_layout))
        .route("/api/layout/export", get(layout::export_layout))
        // Inventory
        .route("/api/ports", get(inventory::list_ports))
        .route("/api/ports/physical", get(inventory::list_physical_ports))
        .route("/api/drives", get(inventory::list_drives))
        .route("/api/images", get(inventory::list_images))
        // Jobs & batch
        .route("/api/batch/start", post(jobs::start_batch))
        .route("/api/batch/cancel", post(jobs::cancel_batch))
        .route("/api/batch/retry", post(jobs::retry_batch))
        .route("/api/jobs", get(jobs::list_jobs))
        .route("/api/jobs/{id}", get(jobs::get_job))
        .route("/api/jobs/{id}/cancel", post(jobs::cancel_job))
        .route("/api/jobs/{id}/retry", post(jobs::retry_job))
        .route("/api/cells/{id}/eject", post(jobs::eject_cell))
        // Event stream
        .route("/api/events", get(events::events))
}
