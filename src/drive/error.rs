//! Driver error types.

use thiserror::Error;

use crate::drive::types::{Commit, File, InvalidNameError, RepoName};
use crate::storage::StorageError;

/// Result type for driver operations.
pub type DriveResult<T> = Result<T, DriveError>;

/// Coarse classification of a [`DriveError`].
///
/// Callers branch on this instead of inspecting messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidName,
    NotFound,
    Conflict,
    CycleDetected,
    AlreadyFinished,
    Aborted,
    Cancelled,
    Internal,
}

/// Errors that can occur during driver operations.
#[derive(Debug, Error)]
pub enum DriveError {
    /// Repo or branch name failed validation.
    #[error("invalid name: {0}")]
    InvalidName(#[from] InvalidNameError),

    #[error("repo not found: {0}")]
    RepoNotFound(String),

    #[error("commit not found: {0}")]
    CommitNotFound(Commit),

    /// File reads and globs need a finished commit.
    #[error("commit {0} is not finished")]
    CommitNotFinished(Commit),

    /// `list_commit` bounds that are not on one lineage.
    #[error("commit {ancestor} is not an ancestor of {descendant}")]
    NotAncestor { ancestor: Commit, descendant: Commit },

    #[error("branch not found: {repo}/{branch}")]
    BranchNotFound { repo: RepoName, branch: String },

    #[error("file not found: {0}")]
    FileNotFound(File),

    /// A tree reference passed to `build_commit` does not resolve.
    #[error("tree object not found: {0}")]
    TreeNotFound(String),

    #[error("repo already exists: {0}")]
    RepoExists(RepoName),

    /// Non-forced delete of a repo other repos list as provenance.
    #[error("repo {repo} is provenance of: {}", .dependents.join(", "))]
    RepoHasDependents { repo: RepoName, dependents: Vec<String> },

    /// Delete of a commit that still has child commits.
    #[error("commit {0} has child commits")]
    CommitHasChildren(Commit),

    /// File/directory collision in a tree.
    #[error("path conflict at {path}: {reason}")]
    PathConflict { path: String, reason: String },

    #[error("provenance cycle: {repo} is reachable from {via}")]
    CycleDetected { repo: RepoName, via: RepoName },

    /// Finish or write against a commit that is no longer open.
    #[error("commit {0} has already finished")]
    AlreadyFinished(Commit),

    /// A stream wait target went away before it could be satisfied.
    #[error("aborted: {0}")]
    Aborted(String),

    #[error("cancelled by caller")]
    Cancelled,

    #[error("corrupted tree {object}: {reason}")]
    InvalidTree { object: String, reason: String },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DriveError {
    /// Structured classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DriveError::InvalidName(_) => ErrorKind::InvalidName,
            DriveError::RepoNotFound(_)
            | DriveError::CommitNotFound(_)
            | DriveError::CommitNotFinished(_)
            | DriveError::NotAncestor { .. }
            | DriveError::BranchNotFound { .. }
            | DriveError::FileNotFound(_)
            | DriveError::TreeNotFound(_) => ErrorKind::NotFound,
            DriveError::Storage(e) if e.is_not_found() => ErrorKind::NotFound,
            DriveError::RepoExists(_)
            | DriveError::RepoHasDependents { .. }
            | DriveError::CommitHasChildren(_)
            | DriveError::PathConflict { .. } => ErrorKind::Conflict,
            DriveError::CycleDetected { .. } => ErrorKind::CycleDetected,
            DriveError::AlreadyFinished(_) => ErrorKind::AlreadyFinished,
            DriveError::Aborted(_) => ErrorKind::Aborted,
            DriveError::Cancelled => ErrorKind::Cancelled,
            DriveError::InvalidTree { .. }
            | DriveError::Storage(_)
            | DriveError::Serialization(_)
            | DriveError::Io(_) => ErrorKind::Internal,
        }
    }

    /// check if this error indicates the resource doesn't exist
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// check if this error is a conflict
    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    /// check if this error came from touching a finished commit
    pub fn is_already_finished(&self) -> bool {
        self.kind() == ErrorKind::AlreadyFinished
    }

    pub(crate) fn path_conflict(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PathConflict {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::types::CommitId;
    use crate::storage::ObjectRef;

    fn commit() -> Commit {
        Commit::new(RepoName::new("data").unwrap(), CommitId::new("c1"))
    }

    #[test]
    fn test_error_classification() {
        assert!(DriveError::RepoNotFound("x".into()).is_not_found());
        assert!(DriveError::CommitHasChildren(commit()).is_conflict());
        assert!(DriveError::AlreadyFinished(commit()).is_already_finished());
        assert_eq!(DriveError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(DriveError::Aborted("gone".into()).kind(), ErrorKind::Aborted);
        assert_eq!(
            DriveError::from(InvalidNameError::Empty).kind(),
            ErrorKind::InvalidName
        );
    }

    #[test]
    fn test_storage_not_found_maps_to_not_found() {
        let missing = StorageError::ObjectNotFound(ObjectRef::for_content(b"x").unwrap());
        assert!(DriveError::from(missing).is_not_found());
    }

    #[test]
    fn test_already_finished_message() {
        let err = DriveError::AlreadyFinished(commit());
        assert_eq!(err.to_string(), "commit data@c1 has already finished");
    }
}
