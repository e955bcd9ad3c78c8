//! pfsdrive - storage driver for a versioned, provenance-tracking file system
//!
//! Repos hold commits, commits hold immutable file trees, branches point at
//! commits, and provenance links commits across repos so that callers can
//! wait for new data to propagate through a pipeline of repos. File bytes
//! live in a content-addressed object store, by default a bare git object
//! database.
//!
//! # Example
//!
//! ```no_run
//! use std::io::Read;
//! use pfsdrive::{Delimiter, Driver, DriverConfig, File};
//!
//! let driver = Driver::open(DriverConfig::git("./objects")).unwrap();
//! driver.create_repo("data", &[]).unwrap();
//! let commit = driver.start_commit("data", None, Some("master"), &[]).unwrap();
//! driver
//!     .put_file(&File::new(commit.clone(), "/a.txt"), Delimiter::None, 0, 0, &b"hello"[..])
//!     .unwrap();
//! driver.finish_commit(&commit).unwrap();
//!
//! let mut out = String::new();
//! driver
//!     .get_file(&File::new(commit, "/a.txt"), 0, -1)
//!     .unwrap()
//!     .read_to_string(&mut out)
//!     .unwrap();
//! assert_eq!(out, "hello");
//! ```

pub mod drive;
pub mod storage;

pub use drive::{
    validate_repo_name, BranchInfo, BranchName, CancelHandle, Commit, CommitEvent, CommitId,
    CommitInfo, CommitState, CommitStream, Context, Delimiter, DriveError, DriveResult, Driver,
    DriverConfig, ErrorKind, File, FileInfo, FileReader, FileType, ListFileMode, ObjectStoreConfig,
    RepoInfo, RepoName,
};
pub use storage::{ObjectRef, ObjectStore};
