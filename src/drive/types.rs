//! core identifiers and info records for the driver.

use std::borrow::Borrow;
use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::ObjectRef;

/// Check a repo name against the `[A-Za-z0-9_-]+` character class.
///
/// Pure function of the string, usable by any caller before `create_repo`.
pub fn validate_repo_name(name: &str) -> Result<(), InvalidNameError> {
    if name.is_empty() {
        return Err(InvalidNameError::Empty);
    }

    for (i, c) in name.chars().enumerate() {
        if !c.is_ascii_alphanumeric() && c != '_' && c != '-' {
            return Err(InvalidNameError::InvalidCharacter { char: c, position: i });
        }
    }

    Ok(())
}

/// A validated repo name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepoName(String);

impl RepoName {
    /// create a new RepoName, validating the input
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        validate_repo_name(&name)?;
        Ok(Self(name))
    }

    /// get the string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RepoName {
    type Error = InvalidNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RepoName> for String {
    fn from(value: RepoName) -> Self {
        value.0
    }
}

impl fmt::Display for RepoName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for RepoName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for RepoName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// a branch name, scoped to one repo
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BranchName(String);

impl BranchName {
    /// the conventional default branch
    pub const MASTER: &'static str = "master";

    /// create a new BranchName
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        if name.is_empty() {
            return Err(InvalidNameError::Empty);
        }
        if name.contains("..") || name.ends_with('/') || name.starts_with('/') {
            return Err(InvalidNameError::InvalidPath(name));
        }
        if let Some((i, c)) = name.chars().enumerate().find(|(_, c)| c.is_whitespace()) {
            return Err(InvalidNameError::InvalidCharacter { char: c, position: i });
        }
        Ok(Self(name))
    }

    pub fn master() -> Self {
        Self(Self::MASTER.to_string())
    }

    /// get the short name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for BranchName {
    type Error = InvalidNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BranchName> for String {
    fn from(value: BranchName) -> Self {
        value.0
    }
}

impl fmt::Display for BranchName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Borrow<str> for BranchName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Opaque commit identifier, unique within a driver.
///
/// Generated ids are lower-case ULIDs, so they sort by creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommitId(String);

impl CommitId {
    /// wrap an existing id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh ULID-based commit id.
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A commit reference: the repo it lives in plus its id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Commit {
    pub repo: RepoName,
    pub id: CommitId,
}

impl Commit {
    pub fn new(repo: RepoName, id: CommitId) -> Self {
        Self { repo, id }
    }
}

impl fmt::Display for Commit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.repo, self.id)
    }
}

/// A path inside a commit's file tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct File {
    pub commit: Commit,
    pub path: String,
}

impl File {
    pub fn new(commit: Commit, path: impl Into<String>) -> Self {
        Self {
            commit,
            path: path.into(),
        }
    }
}

impl fmt::Display for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:/{}", self.commit, self.path.trim_start_matches('/'))
    }
}

/// lifecycle state of a commit; `Finished` is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitState {
    Open,
    Finished,
}

/// How `put_file` splits an incoming byte stream into records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Delimiter {
    /// no record structure; only the byte threshold cuts shards
    #[default]
    None,
    /// one record per `\n`-terminated line
    Line,
    /// one record per top-level JSON value
    Json,
}

/// Size computation mode for `inspect_file` / `list_file`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListFileMode {
    /// compute file sizes, skip directory aggregates
    #[default]
    Normal,
    /// skip all size computation
    Fast,
    /// compute file sizes and directory aggregates
    Recurse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    File,
    Dir,
}

/// information about a repo
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepoInfo {
    pub name: RepoName,
    pub provenance: BTreeSet<RepoName>,
    pub created: DateTime<Utc>,
    pub size_bytes: u64,
}

/// information about a commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitInfo {
    pub commit: Commit,
    pub parent: Option<Commit>,
    pub branch: Option<BranchName>,
    pub provenance: Vec<Commit>,
    pub state: CommitState,
    pub tree: Option<ObjectRef>,
    pub started: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
    pub size_bytes: u64,
}

impl CommitInfo {
    pub fn is_finished(&self) -> bool {
        self.state == CommitState::Finished
    }
}

/// a branch and the commit it points at, if any
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BranchInfo {
    pub name: BranchName,
    pub head: Option<Commit>,
}

/// information about a file or directory in a commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    pub file: File,
    pub file_type: FileType,
    /// 0 when the mode skips size computation for this node
    pub size_bytes: u64,
    /// immediate children (directories only), sorted
    pub children: Vec<String>,
    /// shard references in file order (files only, empty in fast mode)
    pub objects: Vec<ObjectRef>,
}

/// error type for invalid names (repos, branches)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidNameError {
    Empty,
    InvalidCharacter { char: char, position: usize },
    InvalidPath(String),
}

impl fmt::Display for InvalidNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "name cannot be empty"),
            Self::InvalidCharacter { char, position } => write!(
                f,
                "invalid character '{}' at position {}: only alphanumeric characters, underscores, and dashes are allowed",
                char, position
            ),
            Self::InvalidPath(path) => write!(f, "invalid path: '{}'", path),
        }
    }
}

impl std::error::Error for InvalidNameError {}
