//! File API over the volume sandbox.

use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use serde::Deserialize;
use serde_json::{Value, json};

use super::message;
use crate::error::ApiError;
use crate::files::{DownloadSource, FileEntry, UploadOutcome};
use crate::server::AppState;

/// Listing, reading and downloading.
pub fn read_routes() -> Router<AppState> {
    Router::new()
        .route("/files", get(list_files))
        .route("/files/content", get(read_file))
        .route("/files/download", get(download))
}

/// Everything that changes the tree.
pub fn write_routes() -> Router<AppState> {
    Router::new()
        .route("/files", delete(delete_path))
        .route("/files/content", post(write_file))
        .route("/files/directory", post(create_directory))
        .route("/files/move", post(move_path))
        .route(
            "/files/upload",
            post(upload_file).layer(DefaultBodyLimit::disable()),
        )
        .route(
            "/files/upload/directory",
            post(upload_directory).layer(DefaultBodyLimit::disable()),
        )
}

#[derive(Debug, Default, Deserialize)]
pub struct PathQuery {
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct WriteRequest {
    pub path: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct DirectoryRequest {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct MoveRequest {
    pub source: String,
    pub destination: String,
}

/// GET /files?path= - List a directory.
pub async fn list_files(
    State(state): State<AppState>,
    Query(query): Query<PathQuery>,
) -> Result<Json<Vec<FileEntry>>, ApiError> {
    Ok(Json(state.files.list(&query.path).await?))
}

/// GET /files/content?path= - Read a text file.
pub async fn read_file(
    State(state): State<AppState>,
    Query(query): Query<PathQuery>,
) -> Result<Json<Value>, ApiError> {
    require_path(&query.path)?;
    let content = state.files.read_text(&query.path).await?;
    Ok(Json(json!({ "content": content })))
}

/// POST /files/content - Write a file.
pub async fn write_file(
    State(state): State<AppState>,
    payload: Result<Json<WriteRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    state.files.write_text(&request.path, &request.content).await?;
    Ok(message("file updated successfully"))
}

/// POST /files/directory - Create a directory and its parents.
pub async fn create_directory(
    State(state): State<AppState>,
    payload: Result<Json<DirectoryRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    require_path(&request.path)?;
    state.files.create_dir(&request.path).await?;
    Ok(message("directory created successfully"))
}

/// DELETE /files?path= - Delete a file or directory tree.
pub async fn delete_path(
    State(state): State<AppState>,
    Query(query): Query<PathQuery>,
) -> Result<Response, ApiError> {
    require_path(&query.path)?;
    state.files.delete(&query.path).await?;
    Ok(message("deleted successfully"))
}

/// POST /files/move - Rename within the sandbox.
pub async fn move_path(
    State(state): State<AppState>,
    payload: Result<Json<MoveRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    state
        .files
        .rename(&request.source, &request.destination)
        .await?;
    Ok(message("moved successfully"))
}

/// GET /files/download?path= - Stream a file, or a directory as a zip.
pub async fn download(
    State(state): State<AppState>,
    Query(query): Query<PathQuery>,
) -> Result<Response, ApiError> {
    let source = state.files.download_source(&query.path).await?;
    let body = state.files.open_download(&source).await?;

    let (filename, content_type, length) = match &source {
        DownloadSource::File { name, size, .. } => (
            name.clone(),
            mime_guess::from_path(name).first_or_octet_stream().to_string(),
            Some(*size),
        ),
        DownloadSource::Directory { name, .. } => {
            (format!("{}.zip", name), "application/zip".to_string(), None)
        }
    };

    let mut response = Body::from_stream(body).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, header_value(&content_type)?);
    headers.insert(
        header::CONTENT_DISPOSITION,
        header_value(&content_disposition(&filename))?,
    );
    if let Some(length) = length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    }
    Ok(response)
}

/// POST /files/upload - Multipart `path` then `file`; zips are extracted.
pub async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let mut dir: Option<String> = None;
    let mut outcome: Option<UploadOutcome> = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("path") => dir = Some(field.text().await?),
            Some("file") => {
                let Some(dir) = dir.as_deref() else {
                    return Err(ApiError::bad_request("path field must come before file"));
                };
                let filename = field.file_name().unwrap_or_default().to_string();
                outcome = Some(state.files.save_upload(dir, &filename, field, true).await?);
            }
            _ => {}
        }
    }

    let outcome = outcome.ok_or_else(|| ApiError::bad_request("file is required"))?;
    tracing::info!(path = %outcome.path, extracted = ?outcome.extracted, "File uploaded");
    Ok((
        StatusCode::OK,
        Json(json!({ "message": "file uploaded successfully", "file": outcome })),
    ))
}

/// POST /files/upload/directory - Multipart `path` then repeated `files`,
/// each named by its path relative to the uploaded directory.
pub async fn upload_directory(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let mut dir: Option<String> = None;
    let mut saved = Vec::new();

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("path") => dir = Some(field.text().await?),
            Some("files") => {
                let Some(dir) = dir.as_deref() else {
                    return Err(ApiError::bad_request("path field must come before files"));
                };
                let filename = field.file_name().unwrap_or_default().to_string();
                saved.push(state.files.save_upload(dir, &filename, field, false).await?);
            }
            _ => {}
        }
    }

    if saved.is_empty() {
        return Err(ApiError::bad_request("no files uploaded"));
    }
    tracing::info!(count = saved.len(), "Directory uploaded");
    Ok((
        StatusCode::OK,
        Json(json!({ "message": "directory uploaded successfully", "files": saved })),
    ))
}

fn require_path(path: &str) -> Result<(), ApiError> {
    if path.trim().is_empty() {
        return Err(ApiError::bad_request("path is required"));
    }
    Ok(())
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value).map_err(|e| ApiError::internal(format!("invalid header: {}", e)))
}

/// `attachment` disposition with an ASCII fallback name and an RFC 5987
/// UTF-8 name.
fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if fallback == filename {
        format!("attachment; filename=\"{}\"", filename)
    } else {
        format!(
            "attachment; filename=\"{}\"; filename*=UTF-8''{}",
            fallback,
            urlencoding::encode(filename)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_disposition_ascii() {
        assert_eq!(
            content_disposition("site.zip"),
            "attachment; filename=\"site.zip\""
        );
        assert_eq!(
            content_disposition("my notes.txt"),
            "attachment; filename=\"my notes.txt\""
        );
    }

    #[test]
    fn test_content_disposition_non_ascii() {
        let value = content_disposition("résumé.pdf");
        assert!(value.starts_with("attachment; filename=\"r_sum_.pdf\""));
        assert!(value.ends_with("filename*=UTF-8''r%C3%A9sum%C3%A9.pdf"));
        assert!(HeaderValue::from_str(&value).is_ok());
    }

    #[test]
    fn test_content_disposition_quotes_replaced() {
        let value = content_disposition("a\"b.txt");
        assert!(value.starts_with("attachment; filename=\"a_b.txt\""));
    }

    #[test]
    fn test_require_path() {
        assert!(require_path("").is_err());
        assert!(require_path("  ").is_err());
        assert!(require_path("app/config.yml").is_ok());
    }
}
