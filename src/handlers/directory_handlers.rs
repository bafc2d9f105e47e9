//! HTTP handlers for folder operations and the folder tree.

use crate::{
    errors::AppError,
    models::{
        directory::{DirectoryListing, DirectoryNode},
        reports::{DeleteReport, TreeMove},
    },
    services::{
        file_service::{FileQuery, FileService, SortDirection, SortKey},
        tenant::TenantContext,
    },
};
use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;

/// Query params for `GET /api/directories`.
#[derive(Debug, Deserialize)]
pub struct BrowseParams {
    #[serde(default)]
    pub path: String,
    pub search: Option<String>,
    pub file_type: Option<String>,
    pub tag: Option<String>,
    pub sort: Option<SortKey>,
    pub direction: Option<SortDirection>,
}

#[derive(Debug, Deserialize)]
pub struct PathParam {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateDirectoryReq {
    #[serde(default)]
    pub parent: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct RenameDirectoryReq {
    pub path: String,
    pub new_name: String,
}

#[derive(Debug, Deserialize)]
pub struct MoveDirectoryReq {
    pub path: String,
    #[serde(default)]
    pub target: String,
}

/// `GET /api/tree`: the whole folder tree; first visit initializes the root.
pub async fn get_tree(
    State(service): State<FileService>,
    ctx: TenantContext,
) -> Result<Json<DirectoryNode>, AppError> {
    service.ensure_root(&ctx).await?;
    Ok(Json(service.build_tree(&ctx).await?))
}

pub async fn browse_directory(
    State(service): State<FileService>,
    ctx: TenantContext,
    Query(params): Query<BrowseParams>,
) -> Result<Json<DirectoryListing>, AppError> {
    let query = FileQuery {
        search: params.search,
        file_type: params.file_type,
        tag: params.tag,
        sort: params.sort.unwrap_or_default(),
        direction: params.direction.unwrap_or_default(),
    };
    Ok(Json(service.browse(&ctx, &params.path, &query).await?))
}

pub async fn create_directory(
    State(service): State<FileService>,
    ctx: TenantContext,
    Json(req): Json<CreateDirectoryReq>,
) -> Result<impl IntoResponse, AppError> {
    let path = service
        .create_directory(&ctx, &req.parent, &req.name)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "path": path }))))
}

pub async fn rename_directory(
    State(service): State<FileService>,
    ctx: TenantContext,
    Json(req): Json<RenameDirectoryReq>,
) -> Result<Json<TreeMove>, AppError> {
    Ok(Json(
        service
            .rename_directory(&ctx, &req.path, &req.new_name)
            .await?,
    ))
}

pub async fn move_directory(
    State(service): State<FileService>,
    ctx: TenantContext,
    Json(req): Json<MoveDirectoryReq>,
) -> Result<Json<TreeMove>, AppError> {
    Ok(Json(
        service
            .move_directory(&ctx, &req.path, &req.target)
            .await?,
    ))
}

pub async fn delete_directory(
    State(service): State<FileService>,
    ctx: TenantContext,
    Query(params): Query<PathParam>,
) -> Result<Json<DeleteReport>, AppError> {
    Ok(Json(service.delete_directory(&ctx, &params.path).await?))
}
