use axum::{
    Json,
    extract::{Query, State},
};
use serde::Deserialize;

use janus_model::{DriveInfo, ImageInfo, PhysicalPort, PortEntry};

use crate::AppState;
use crate::errors::AppResult;

#[derive(Debug, Deserialize)]
pub struct DrivesQuery {
    /// `?removable=1` restricts the listing to removable drives.
    #[serde(default)]
    removable: u8,
}

pub async fn list_drives(
    State(state): State<AppState>,
    Query(query): Query<DrivesQuery>,
) -> Json<Vec<DriveInfo>> {
    Json(state.inventory.list_drives(query.removable != 0).await)
}

pub async fn list_images(State(state): State<AppState>) -> AppResult<Json<Vec<ImageInfo>>> {
    Ok(Json(state.catalog.list_images()?))
}

pub async fn list_ports(State(state): State<AppState>) -> Json<Vec<PortEntry>> {
    Json(state.inventory.list_ports().await)
}

pub async fn list_physical_ports(State(state): State<AppState>) -> Json<Vec<PhysicalPort>> {
    Json(state.inventory.list_physical_ports().await)
}
