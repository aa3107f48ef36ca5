//! Request handlers

use async_stream::stream;
use axum::{
    extract::State,
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Response, Sse,
    },
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::info;

use super::error::ApiError;
use super::state::AppState;
use crate::core::device::DeviceInfo;
use crate::core::orchestrator::FlashRequest;

/// Body of `POST /api/flash`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashBody {
    pub device: String,
    pub image: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
}

/// `POST /api/flash`
///
/// Streams push-event frames when `stream` is set; otherwise waits for the
/// run and answers with its terminal object.
pub async fn flash(
    State(state): State<AppState>,
    Json(body): Json<FlashBody>,
) -> Result<Response, ApiError> {
    if body.device.trim().is_empty() {
        return Err(ApiError::bad_request("device must not be empty"));
    }
    if body.image.trim().is_empty() {
        return Err(ApiError::bad_request("image must not be empty"));
    }

    let mut handle = state.orchestrator.start(FlashRequest {
        device: body.device.trim().to_string(),
        image: body.image.trim().to_string(),
        label: body.label.filter(|l| !l.trim().is_empty()),
        sha256: body.sha256.filter(|s| !s.trim().is_empty()),
    })?;
    info!("Accepted run {} (stream: {})", handle.id, body.stream);

    if !body.stream {
        return Ok(Json(handle.wait_terminal().await).into_response());
    }

    let events = stream! {
        while let Some(event) = handle.next_event().await {
            let terminal = event.is_terminal();
            yield Ok::<_, Infallible>(Event::default().data(event.to_json()));
            if terminal {
                break;
            }
        }
    };

    Ok(Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response())
}

/// `GET /api/devices`
pub async fn devices(State(state): State<AppState>) -> Result<Json<Vec<DeviceInfo>>, ApiError> {
    let inventory = Arc::clone(&state.inventory);
    let devices = tokio::task::spawn_blocking(move || inventory.list())
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(devices))
}

/// `GET /api/health`
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "commit": option_env!("VERGEN_GIT_SHA"),
    }))
}
