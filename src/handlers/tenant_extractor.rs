//! Turns the gateway-supplied identity headers into a [`TenantContext`].
//!
//! Authentication happens upstream; this service trusts `x-tenant-id` and
//! `x-actor-id` as given. A missing actor defaults to the tenant itself.

use crate::{
    errors::AppError,
    services::tenant::{TenantContext, TenantId},
};
use axum::{extract::FromRequestParts, http::request::Parts};

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const ACTOR_HEADER: &str = "x-actor-id";

impl<S> FromRequestParts<S> for TenantContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let tenant = header(TENANT_HEADER)
            .ok_or_else(|| AppError::bad_request(format!("missing {} header", TENANT_HEADER)))?;
        let tenant_id = TenantId::parse(tenant)?;
        let actor = header(ACTOR_HEADER).unwrap_or(tenant).to_string();

        Ok(TenantContext::new(tenant_id, actor))
    }
}
