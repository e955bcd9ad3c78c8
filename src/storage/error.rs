//! Object layer error types
//!
//! All errors that can occur while talking to an object store are defined here.
//! We use `thiserror` for ergonomic error definition and better error messages

use std::path::PathBuf;

use thiserror::Error;

use crate::storage::types::ObjectRef;

/// the main error type for object store operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// error from the underlying Git library
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    /// the requested object is not in the store
    #[error("object not found: {0}")]
    ObjectNotFound(ObjectRef),

    /// I/O error (filesystem level)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// object database is missing and creation was not requested
    #[error("object store not initialized: {0}")]
    NotInitialized(PathBuf),
}

impl StorageError {
    /// check if this error indicates the object doesn't exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::ObjectNotFound(_))
    }
}

/// result type alias for object store operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let r = ObjectRef::for_content(b"x").unwrap();
        assert!(StorageError::ObjectNotFound(r).is_not_found());
        assert!(!StorageError::NotInitialized(PathBuf::from("/tmp/x")).is_not_found());
    }
}
