use super::storage::StorageError;
use crate::models::object_key::InvalidKey;
use thiserror::Error;
use zip::result::ZipError;

/// Errors surfaced by the file manager core.
#[derive(Debug, Error)]
pub enum FileError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("storage backend failure: {0}")]
    Backend(StorageError),
    #[error("path index failure: {0}")]
    Index(#[from] sqlx::Error),
    #[error("index out of sync: {0}")]
    Consistency(String),
    #[error("could not build archive: {0}")]
    Archive(#[from] ZipError),
}

impl FileError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        FileError::InvalidInput(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        FileError::NotFound(what.into())
    }

    /// Backend failures that may go away on retry (timeouts, I/O, transport).
    pub fn is_transient(&self) -> bool {
        matches!(self, FileError::Backend(err) if err.is_transient())
    }
}

impl From<StorageError> for FileError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => FileError::NotFound(key),
            StorageError::InvalidKey(key) => {
                FileError::InvalidInput(format!("invalid path `{}`", key))
            }
            other => FileError::Backend(other),
        }
    }
}

impl From<InvalidKey> for FileError {
    fn from(err: InvalidKey) -> Self {
        FileError::InvalidInput(format!("invalid path `{}`", err.0))
    }
}

pub type FileResult<T> = Result<T, FileError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn storage_errors_map_onto_core_variants() {
        assert!(matches!(
            FileError::from(StorageError::NotFound("t1/a".into())),
            FileError::NotFound(_)
        ));
        assert!(matches!(
            FileError::from(StorageError::InvalidKey("t1//a".into())),
            FileError::InvalidInput(_)
        ));
        let timeout = FileError::from(StorageError::Timeout {
            op: "list",
            after: Duration::from_secs(1),
        });
        assert!(matches!(timeout, FileError::Backend(_)));
        assert!(timeout.is_transient());
    }
}
