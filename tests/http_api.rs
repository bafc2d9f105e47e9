//! HTTP surface: routing, tenant headers, status codes and response shapes.

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use file_vault::{
    routes::routes::routes,
    services::{
        file_service::FileService,
        notifications::Notifier,
        path_index::PathIndex,
        storage::{ObjectStorage, StorageTimeouts, remote::RemoteBackend},
    },
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use tower::ServiceExt;

const BOUNDARY: &str = "vault-boundary";

async fn app() -> Router {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let index = PathIndex::new(Arc::new(pool));
    index.migrate().await.unwrap();
    let storage = ObjectStorage::new(
        Arc::new(RemoteBackend::in_memory()),
        StorageTimeouts::default(),
    );
    let service = FileService::new(storage, index, Notifier::default(), 0.0);
    routes().with_state(service)
}

fn get(uri: &str, tenant: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-tenant-id", tenant)
        .body(Body::empty())
        .unwrap()
}

fn send_json(method: &str, uri: &str, tenant: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("x-tenant-id", tenant)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn upload(tenant: &str, directory: &str, name: &str, content: &str) -> Request<Body> {
    let body = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"directory\"\r\n\r\n{dir}\r\n\
         --{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{name}\"\r\n\
         Content-Type: application/octet-stream\r\n\r\n{content}\r\n--{b}--\r\n",
        b = BOUNDARY,
        dir = directory,
        name = name,
        content = content,
    );
    Request::builder()
        .method("POST")
        .uri("/api/files")
        .header("x-tenant-id", tenant)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

async fn call_json(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let (status, body) = call(app, request).await;
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn healthz_needs_no_tenant() {
    let app = app().await;
    let request = Request::builder()
        .uri("/healthz")
        .body(Body::empty())
        .unwrap();
    let (status, body) = call_json(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn readyz_checks_index_and_storage() {
    let app = app().await;
    let request = Request::builder()
        .uri("/readyz")
        .body(Body::empty())
        .unwrap();
    let (status, body) = call_json(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["checks"]["sqlite"]["ok"], true);
    assert_eq!(body["checks"]["storage"]["ok"], true);
    assert_eq!(body["backend"], "memory");
}

#[tokio::test]
async fn api_requires_a_valid_tenant_header() {
    let app = app().await;
    let request = Request::builder()
        .uri("/api/tree")
        .body(Body::empty())
        .unwrap();
    let (status, body) = call_json(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], 400);

    let (status, _) = call(&app, get("/api/tree", "../etc")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn folder_lifecycle_over_http() {
    let app = app().await;

    let (status, body) = call_json(
        &app,
        send_json("POST", "/api/directories", "T1", json!({ "name": "Reports" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["path"], "Reports");

    let (status, _) = call(
        &app,
        send_json("POST", "/api/directories", "T1", json!({ "name": "Reports" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = call_json(
        &app,
        send_json(
            "POST",
            "/api/directories/rename",
            "T1",
            json!({ "path": "Reports", "new_name": "Archive" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["path"], "Archive");

    let (status, tree) = call_json(&app, get("/api/tree", "T1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tree["name"], "Home");
    assert_eq!(tree["children"][0]["path"], "Archive");

    let delete = Request::builder()
        .method("DELETE")
        .uri("/api/directories?path=Archive")
        .header("x-tenant-id", "T1")
        .body(Body::empty())
        .unwrap();
    let (status, body) = call_json(&app, delete).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], 1);

    let (status, body) = call_json(&app, get("/api/directories?path=", "T1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["directories"], json!([]));
}

#[tokio::test]
async fn upload_then_download_and_metadata() {
    let app = app().await;

    let (status, body) = call_json(&app, upload("T1", "", "notes.txt", "hello")).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body[0]["path"], "notes.txt");
    assert_eq!(body[0]["size"], 5);
    assert_eq!(body[0]["etag"], "5d41402abc4b2a76b9719d911017c592");

    let response = app
        .clone()
        .oneshot(get("/api/files/download?path=notes.txt", "T1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        "inline; filename=\"notes.txt\""
    );
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"hello");

    let (status, record) = call_json(
        &app,
        send_json(
            "PUT",
            "/api/files/metadata",
            "T1",
            json!({ "path": "notes.txt", "note": "greeting", "tags": ["inbox"] }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(record["note"], "greeting");
    assert_eq!(record["tags"][0]["name"], "inbox");
    assert_eq!(record["tags"][0]["color"], "#6c757d");

    let (status, tags) = call_json(&app, get("/api/tags", "T1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tags.as_array().unwrap().len(), 1);

    let (status, preview) = call_json(&app, get("/api/files/preview?path=notes.txt", "T1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(preview["content"], "hello");

    let (status, _) = call(&app, get("/api/files/download?path=notes.txt", "T2")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn move_rename_and_delete_files_over_http() {
    let app = app().await;
    call(
        &app,
        send_json("POST", "/api/directories", "T1", json!({ "name": "dst" })),
    )
    .await;
    call(&app, upload("T1", "", "a.txt", "a")).await;

    let (status, body) = call_json(
        &app,
        send_json(
            "POST",
            "/api/files/move",
            "T1",
            json!({ "paths": ["a.txt", "missing.txt"], "target": "dst" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["moved"][0]["new_path"], "dst/a.txt");
    assert_eq!(body["errors"][0]["path"], "missing.txt");
    assert!(body["summary"].as_str().unwrap().starts_with("1 moved, 1 failed"));

    let (status, body) = call_json(
        &app,
        send_json(
            "POST",
            "/api/files/rename",
            "T1",
            json!({ "path": "dst/a.txt", "new_name": "b.txt" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["path"], "dst/b.txt");

    let (status, body) = call_json(
        &app,
        send_json(
            "POST",
            "/api/files/delete",
            "T1",
            json!({ "paths": ["dst/b.txt", "dst/b.txt", "nope.txt"] }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], 1);
}

#[tokio::test]
async fn bundle_download_is_a_zip() {
    let app = app().await;
    call(&app, upload("T1", "", "a.txt", "a")).await;

    let response = app
        .clone()
        .oneshot(send_json(
            "POST",
            "/api/files/bundle",
            "T1",
            json!({ "paths": ["a.txt"] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/zip");
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert!(bytes.starts_with(b"PK"));
}

#[tokio::test]
async fn missing_file_metadata_is_not_found() {
    let app = app().await;
    let (status, body) = call_json(&app, get("/api/files/metadata?path=ghost.txt", "T1")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], 404);
}
