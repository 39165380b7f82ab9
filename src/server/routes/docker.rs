//! Container, image and event endpoints.

use axum::Json;
use axum::Router;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::docker::{
    ConnectionCounts, ContainerDetails, ContainerListItem, ContainerSpec, CreatedContainer,
    ImageInfo, demux,
};
use crate::error::ApiError;
use crate::server::AppState;
use crate::sse::{self, RelayOptions};

/// Lines returned by the non-streaming log endpoint.
pub const LOG_TAIL: usize = 100;

/// Endpoints open to any signed-in user.
pub fn user_routes() -> Router<AppState> {
    Router::new()
        .route("/docker/containers", get(list_containers))
        .route("/docker/containers/{id}", get(inspect_container))
        .route("/docker/containers/{id}/start", post(start_container))
        .route("/docker/containers/{id}/stop", post(stop_container))
        .route("/docker/containers/{id}/restart", post(restart_container))
        .route("/docker/containers/{id}/logs", get(container_logs))
        .route("/docker/containers/{id}/logs-stream", get(container_logs_stream))
        .route("/docker/events-stream", get(events_stream))
        .route("/docker/connections", get(connections))
}

/// Endpoints that change containers or images.
pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/docker/containers", post(create_container))
        .route(
            "/docker/containers/{id}",
            put(update_container).delete(remove_container),
        )
        .route("/docker/containers/{id}/exec", post(exec))
        .route("/docker/images", get(list_images))
        .route("/docker/images/{*image}", delete(remove_image))
        .route("/docker/pull", get(pull_image))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    /// Include stopped containers; defaults to true.
    pub all: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    pub command: String,
}

#[derive(Debug, Deserialize)]
pub struct PullQuery {
    #[serde(rename = "imageName")]
    pub image_name: Option<String>,
}

/// GET /docker/containers - List containers.
pub async fn list_containers(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ContainerListItem>>, ApiError> {
    let containers = state
        .docker
        .list_containers(query.all.unwrap_or(true))
        .await?;
    Ok(Json(containers))
}

/// GET /docker/containers/{id} - Inspect one container.
pub async fn inspect_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ContainerDetails>, ApiError> {
    Ok(Json(state.docker.container_details(&id).await?))
}

/// POST /docker/containers - Create a container.
pub async fn create_container(
    State(state): State<AppState>,
    payload: Result<Json<ContainerSpec>, JsonRejection>,
) -> Result<(StatusCode, Json<CreatedContainer>), ApiError> {
    let Json(spec) = payload?;
    let created = state.docker.create_container(&spec).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// PUT /docker/containers/{id} - Replace a container with a new config.
pub async fn update_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ContainerSpec>, JsonRejection>,
) -> Result<Json<CreatedContainer>, ApiError> {
    let Json(spec) = payload?;
    let created = state.docker.update_container(&id, &spec).await?;
    Ok(Json(created))
}

/// DELETE /docker/containers/{id} - Remove a container.
pub async fn remove_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.docker.remove_container(&id).await?;
    Ok(StatusCode::OK)
}

/// POST /docker/containers/{id}/start
pub async fn start_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.docker.start_container(&id).await?;
    Ok(StatusCode::OK)
}

/// POST /docker/containers/{id}/stop
pub async fn stop_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.docker.stop_container(&id).await?;
    Ok(StatusCode::OK)
}

/// POST /docker/containers/{id}/restart
pub async fn restart_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.docker.restart_container(&id).await?;
    Ok(StatusCode::OK)
}

/// GET /docker/containers/{id}/logs - Recent log lines as plain text.
pub async fn container_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let logs = state.docker.logs(&id, LOG_TAIL).await?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], logs).into_response())
}

/// GET /docker/containers/{id}/logs-stream - Follow the log over SSE.
pub async fn container_logs_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let raw = state.docker.follow_logs(&id).await?;
    let frames = demux::lines(raw).map(|line| line.map(|l| sse::line_frame(&l)));
    tracing::debug!(id = %id, "Log stream opened");
    Ok(sse::response(frames, RelayOptions::logs()))
}

/// GET /docker/events-stream - The daemon's event feed over SSE.
pub async fn events_stream(State(state): State<AppState>) -> Result<Response, ApiError> {
    let events = state.docker.events().await?;
    let frames = events.map(|item| match item {
        Ok(event) => sse::json_frame(&event).map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    });
    Ok(sse::response(frames, RelayOptions::events()))
}

/// GET /docker/connections - Established connections across running containers.
pub async fn connections(State(state): State<AppState>) -> Result<Json<ConnectionCounts>, ApiError> {
    Ok(Json(state.docker.all_connections().await?))
}

/// POST /docker/containers/{id}/exec - Run a shell command, return its output.
pub async fn exec(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ExecRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = payload?;
    if request.command.trim().is_empty() {
        return Err(ApiError::bad_request("command is required"));
    }
    tracing::info!(id = %id, command = %request.command, "Exec");
    let output = state.docker.exec(&id, &request.command).await?;
    Ok(Json(json!({ "output": output })))
}

/// GET /docker/images - List local images.
pub async fn list_images(State(state): State<AppState>) -> Result<Json<Vec<ImageInfo>>, ApiError> {
    Ok(Json(state.docker.list_images().await?))
}

/// DELETE /docker/images/{image} - Force-remove an image.
pub async fn remove_image(
    State(state): State<AppState>,
    Path(image): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.docker.remove_image(&image).await?;
    Ok(StatusCode::OK)
}

/// GET /docker/pull?imageName= - Pull an image, streaming progress over SSE.
pub async fn pull_image(
    State(state): State<AppState>,
    Query(query): Query<PullQuery>,
) -> Result<Response, ApiError> {
    let image = query
        .image_name
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("image name is required"))?;

    let progress = state.docker.pull_image(&image).await?;
    let progress = sse::commit_on_first_item(progress).await?;

    let options = RelayOptions {
        eof_marker: false,
        ..RelayOptions::logs()
    };
    Ok(sse::response(pull_frames(progress), options))
}

/// Progress frames for a pull.
///
/// A message carrying `errorDetail.message` becomes a final `{"error": ...}`
/// frame; a pull that runs to completion ends with the EOF marker.
fn pull_frames<S, E>(progress: S) -> impl Stream<Item = Result<Bytes, String>> + Send + 'static
where
    S: Stream<Item = Result<Value, E>> + Send + Unpin + 'static,
    E: std::fmt::Display + Send + 'static,
{
    futures::stream::unfold(Some(progress), |source| async move {
        let mut source = source?;
        match source.next().await {
            Some(Ok(message)) => match pull_error(&message) {
                Some(error) => {
                    let frame = sse::json_frame(&json!({ "error": error })).map_err(|e| e.to_string());
                    Some((frame, None))
                }
                None => {
                    let frame = sse::json_frame(&message).map_err(|e| e.to_string());
                    Some((frame, Some(source)))
                }
            },
            Some(Err(e)) => Some((Err(e.to_string()), None)),
            None => Some((Ok(Bytes::from_static(sse::EOF_FRAME)), None)),
        }
    })
}

fn pull_error(message: &Value) -> Option<String> {
    message
        .get("errorDetail")
        .and_then(|detail| detail.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;

    #[test]
    fn test_pull_error_extraction() {
        let failed = json!({"errorDetail": {"message": "manifest unknown"}, "error": "manifest unknown"});
        assert_eq!(pull_error(&failed).as_deref(), Some("manifest unknown"));
        assert_eq!(pull_error(&json!({"status": "Downloading"})), None);
    }

    #[tokio::test]
    async fn test_pull_frames_end_with_eof() {
        let progress = futures::stream::iter(vec![
            Ok::<_, String>(json!({"status": "Pulling fs layer"})),
            Ok(json!({"status": "Download complete"})),
        ]);
        let frames: Vec<Bytes> = pull_frames(progress).try_collect().await.unwrap();
        assert_eq!(frames.len(), 3);
        assert!(frames[0].starts_with(b"data: {"));
        assert_eq!(frames[2], Bytes::from_static(sse::EOF_FRAME));
    }

    #[tokio::test]
    async fn test_pull_frames_stop_at_error() {
        let progress = futures::stream::iter(vec![
            Ok::<_, String>(json!({"status": "Pulling"})),
            Ok(json!({"errorDetail": {"message": "denied"}})),
            Ok(json!({"status": "never sent"})),
        ]);
        let frames: Vec<Bytes> = pull_frames(progress).try_collect().await.unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1], Bytes::from_static(b"data: {\"error\":\"denied\"}\n\n"));
    }
}
