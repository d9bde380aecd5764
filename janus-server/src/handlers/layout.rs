use axum::{
    Json,
    extract::{Multipart, State},
    http::header,
    response::IntoResponse,
};
use serde_json::{Value, json};

use janus_model::LayoutConfig;

use crate::AppState;
use crate::errors::{AppError, AppResult};

pub async fn get_layout(State(state): State<AppState>) -> Json<LayoutConfig> {
    Json(state.layout.load())
}

pub async fn put_layout(
    State(state): State<AppState>,
    Json(layout): Json<LayoutConfig>,
) -> AppResult<Json<Value>> {
    state.layout.save(&layout)?;
    Ok(Json(json!({ "ok": true })))
}

/// Multipart upload of a layout JSON file; the first file field wins.
pub async fn import_layout(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<Json<LayoutConfig>> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(err.to_string()))?
    {
        let data = field
            .bytes()
            .await
            .map_err(|err| AppError::bad_request(err.to_string()))?;
        let layout = state
            .layout
            .import(&data)
            .map_err(|err| AppError::bad_request(err.to_string()))?;
        return Ok(Json(layout));
    }
    Err(AppError::bad_request("missing layout file"))
}

pub async fn export_layout(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let bytes = state.layout.export_bytes()?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/json"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=layout.json",
            ),
        ],
        bytes,
    ))
}
