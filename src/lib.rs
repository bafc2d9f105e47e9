//! Multi-tenant file manager over a flat object store.
//!
//! Folders are synthesized from key prefixes and emulated with placeholder
//! objects; per-file metadata lives in a SQLite path index.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
