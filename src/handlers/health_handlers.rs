//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks the path index and a storage round trip

use crate::{models::object_key::ObjectKey, services::file_service::FileService};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

const CANARY_PAYLOAD: &[u8] = b"readyz";

/// `GET /healthz`
///
/// Very small liveness probe; always returns 200 OK and never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness probe that:
/// 1. Runs a lightweight query against the SQLite path index (`SELECT 1`).
/// 2. Writes, reads back and deletes a canary object outside every tenant
///    namespace (tenant ids never start with `.`).
///
/// HTTP 200 when all checks pass, HTTP 503 when any check fails.
pub async fn readyz(State(service): State<FileService>) -> impl IntoResponse {
    // 1) SQLite check
    let sqlite_check = match service.index().ping().await {
        Ok(()) => (true, None::<String>),
        Err(e) => (false, Some(format!("error: {}", e))),
    };

    // 2) Storage write/read/delete check
    let storage_check = storage_round_trip(&service).await;

    let sqlite_ok = sqlite_check.0;
    let storage_ok = storage_check.0;
    let overall_ok = sqlite_ok && storage_ok;

    let mut checks = HashMap::new();
    checks.insert(
        "sqlite",
        CheckStatus {
            ok: sqlite_ok,
            error: sqlite_check.1,
        },
    );
    checks.insert(
        "storage",
        CheckStatus {
            ok: storage_ok,
            error: storage_check.1,
        },
    );

    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        backend: service.storage().kind(),
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn storage_round_trip(service: &FileService) -> (bool, Option<String>) {
    let storage = service.storage();
    let key = match ObjectKey::parse(&format!(".readyz/{}", Uuid::new_v4())) {
        Ok(key) => key,
        Err(e) => return (false, Some(e.to_string())),
    };

    if let Err(e) = storage.put(&key, Bytes::from_static(CANARY_PAYLOAD)).await {
        return (false, Some(format!("could not write canary object: {}", e)));
    }
    let read = storage.read(&key).await;
    // best-effort cleanup; a leftover canary is reported but not fatal
    let cleanup = storage.delete(&key).await;

    match (read, cleanup) {
        (Ok(bytes), Ok(())) if bytes.as_ref() == CANARY_PAYLOAD => (true, None),
        (Ok(bytes), Err(e)) if bytes.as_ref() == CANARY_PAYLOAD => {
            (true, Some(format!("could not remove canary object: {}", e)))
        }
        (Ok(_), _) => (false, Some("canary object content mismatch".to_string())),
        (Err(e), _) => (false, Some(format!("could not read canary object: {}", e))),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    backend: &'static str,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}
