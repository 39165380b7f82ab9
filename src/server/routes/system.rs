//! Host resource endpoints.

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;

use crate::server::AppState;
use crate::sse::{self, RelayOptions};
use crate::system::ResourceSnapshot;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/system/resources", get(resources))
        .route("/system/resources/stream", get(resources_stream))
}

/// GET /system/resources - One snapshot.
pub async fn resources(State(state): State<AppState>) -> Json<ResourceSnapshot> {
    Json(state.monitor.snapshot(state.docker.as_ref()).await)
}

/// GET /system/resources/stream - A snapshot every two seconds over SSE.
pub async fn resources_stream(State(state): State<AppState>) -> Response {
    let frames = state.monitor.clone().frames(state.docker.clone());
    sse::response(frames, RelayOptions::snapshots())
}
