//! Core data models for the file vault.
//!
//! Directory nodes and listings are synthesized from object keys on every
//! request; only [`file_record::FileRecord`] and [`file_record::Tag`] map to
//! database tables via `sqlx::FromRow`.

pub mod directory;
pub mod file_record;
pub mod object_key;
pub mod reports;
