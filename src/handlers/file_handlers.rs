//! HTTP handlers for file operations, metadata and the event stream.
//! Downloads stream object bodies instead of buffering them in memory.

use crate::{
    errors::AppError,
    models::{
        file_record::{FileRecord, MetadataUpdate, Tag},
        reports::{DeleteReport, MoveReport, UploadedFile},
    },
    services::{file_service::FileService, tenant::TenantContext},
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use tracing::debug;

#[derive(Debug, Deserialize)]
pub struct PathParam {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct PathsReq {
    pub paths: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct MoveFilesReq {
    pub paths: Vec<String>,
    #[serde(default)]
    pub target: String,
}

#[derive(Debug, Deserialize)]
pub struct RenameFileReq {
    pub path: String,
    pub new_name: String,
}

/// Body of `PUT /api/files/metadata`. Absent fields stay unchanged.
#[derive(Debug, Deserialize)]
pub struct SaveMetadataReq {
    pub path: String,
    pub note: Option<String>,
    pub tags: Option<Vec<String>>,
    pub favorite: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct PreviewResponse {
    pub path: String,
    pub content: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MoveResponse {
    #[serde(flatten)]
    pub report: MoveReport,
    pub summary: String,
}

/// `POST /api/files`: multipart with an optional `directory` field and one or
/// more `file`/`files` parts.
pub async fn upload_files(
    State(service): State<FileService>,
    ctx: TenantContext,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let mut directory = String::new();
    let mut files: Vec<(String, Bytes)> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::bad_request(e.body_text()))?
    {
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            "directory" => {
                directory = field
                    .text()
                    .await
                    .map_err(|e| AppError::bad_request(e.body_text()))?;
            }
            "file" | "files" => {
                let name = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| AppError::bad_request("file part without a file name"))?;
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::bad_request(e.body_text()))?;
                files.push((name, data));
            }
            other => debug!(field = %other, "ignoring multipart field"),
        }
    }

    if files.is_empty() {
        return Err(AppError::bad_request("no files in upload"));
    }

    let mut uploaded: Vec<UploadedFile> = Vec::with_capacity(files.len());
    for (name, data) in files {
        uploaded.push(service.upload_file(&ctx, &directory, &name, data).await?);
    }
    Ok((StatusCode::CREATED, Json(uploaded)))
}

/// `GET /api/files/download?path=` as a streaming response.
pub async fn download_file(
    State(service): State<FileService>,
    ctx: TenantContext,
    Query(params): Query<PathParam>,
) -> Result<Response, AppError> {
    let download = service.download_file(&ctx, &params.path).await?;

    let mut response = Response::new(Body::from_stream(download.stream));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(download.content_type),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(download.size));
    let disposition = if download.inline { "inline" } else { "attachment" };
    set_disposition(headers, disposition, &download.filename);

    Ok(response)
}

/// `POST /api/files/bundle`: the selected files as one zip archive.
pub async fn download_bundle(
    State(service): State<FileService>,
    ctx: TenantContext,
    Json(req): Json<PathsReq>,
) -> Result<Response, AppError> {
    let archive = service.download_bundle(&ctx, &req.paths).await?;

    let mut response = Response::new(Body::from(archive));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/zip"),
    );
    set_disposition(headers, "attachment", "files.zip");

    Ok(response)
}

pub async fn move_files(
    State(service): State<FileService>,
    ctx: TenantContext,
    Json(req): Json<MoveFilesReq>,
) -> Result<Json<MoveResponse>, AppError> {
    let report = service.move_files(&ctx, &req.paths, &req.target).await?;
    let summary = report.summary();
    Ok(Json(MoveResponse { report, summary }))
}

pub async fn rename_file(
    State(service): State<FileService>,
    ctx: TenantContext,
    Json(req): Json<RenameFileReq>,
) -> Result<impl IntoResponse, AppError> {
    let path = service.rename_file(&ctx, &req.path, &req.new_name).await?;
    Ok(Json(json!({ "path": path })))
}

pub async fn delete_files(
    State(service): State<FileService>,
    ctx: TenantContext,
    Json(req): Json<PathsReq>,
) -> Result<Json<DeleteReport>, AppError> {
    Ok(Json(service.delete_files(&ctx, &req.paths).await?))
}

pub async fn get_metadata(
    State(service): State<FileService>,
    ctx: TenantContext,
    Query(params): Query<PathParam>,
) -> Result<Json<FileRecord>, AppError> {
    Ok(Json(service.get_metadata(&ctx, &params.path).await?))
}

pub async fn save_metadata(
    State(service): State<FileService>,
    ctx: TenantContext,
    Json(req): Json<SaveMetadataReq>,
) -> Result<Json<FileRecord>, AppError> {
    let update = MetadataUpdate {
        note: req.note,
        tags: req.tags,
        favorite: req.favorite,
    };
    Ok(Json(service.save_metadata(&ctx, &req.path, &update).await?))
}

pub async fn preview_file(
    State(service): State<FileService>,
    ctx: TenantContext,
    Query(params): Query<PathParam>,
) -> Result<Json<PreviewResponse>, AppError> {
    let content = service.preview_text(&ctx, &params.path).await?;
    Ok(Json(PreviewResponse {
        path: params.path,
        content,
    }))
}

pub async fn list_tags(
    State(service): State<FileService>,
    ctx: TenantContext,
) -> Result<Json<Vec<Tag>>, AppError> {
    Ok(Json(service.tags(&ctx).await?))
}

/// `GET /api/events`: Server-Sent Events carrying the tenant's file events.
pub async fn events(
    State(service): State<FileService>,
    ctx: TenantContext,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = service.subscribe(&ctx).into_stream().map(|notification| {
        let event = Event::default()
            .event(notification.event.name())
            .json_data(&*notification)
            .unwrap_or_else(|_| Event::default().comment("unserializable event"));
        Ok(event)
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn set_disposition(headers: &mut HeaderMap, disposition: &str, filename: &str) {
    let escaped = filename.replace(['"', '\\'], "_");
    let raw = format!("{}; filename=\"{}\"", disposition, escaped);
    let value = HeaderValue::from_bytes(raw.as_bytes())
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));
    headers.insert(header::CONTENT_DISPOSITION, value);
}
