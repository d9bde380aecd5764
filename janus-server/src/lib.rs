//! # Janus Server
//!
//! Operator console for mass-flashing disk images to removable drives
//! plugged in through USB hubs.
//!
//! ## Overview
//!
//! The server is a thin Axum edge over `janus-core`:
//!
//! - **REST API**: layout, inventory, image catalog, batch and job control
//! - **Event stream**: `GET /api/events` relays the core event bus as
//!   server-sent events
//! - **Static UI**: an optional `web/` directory served as-is
//!
//! All orchestration lives in the core; handlers translate HTTP in and out.

use std::sync::Arc;

use axum::Router;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};

use janus_core::{DeviceInventory, EventBus, ImageCatalog, JobManager, LayoutStore};

/// Server config
pub mod config;

/// Error types and handling
pub mod errors;

/// Request handlers, grouped by resource
pub mod handlers;

/// Route table
pub mod routes;

/// Server application state
#[derive(Clone)]
pub struct AppState {
    pub bus: Arc<EventBus>,
    pub inventory: Arc<dyn DeviceInventory>,
    pub catalog: Arc<ImageCatalog>,
    pub layout: Arc<LayoutStore>,
    pub jobs: Arc<JobManager>,
}

/// Assemble the application router.
///
/// `web_dir` is served as the UI when the directory exists; the API works
/// without it.
pub fn create_app(state: AppState, web_dir: Option<&std::path::Path>) -> Router {
    let mut app = Router::new().merge(routes::api_router());

    if let Some(dir) = web_dir.filter(|d| d.is_dir()) {
        app = app.fallback_service(ServeDir::new(dir).append_index_html_on_directories(true));
    }

    app.layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
