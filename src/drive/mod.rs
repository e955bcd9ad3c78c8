//! The pfs storage driver.
//!
//! Repos hold commit history; commits hold immutable file trees; branches
//! point at commits; provenance links commits across repos. Streams let
//! callers follow a branch or wait for everything downstream of a set of
//! commits to finish.
//!
//! # Architecture
//!
//! ```text
//!  ┌───────────────────────────────────────────────────────────────┐
//!  │                            Driver                             │
//!  │  repos · commits · branches · files · subscribe · flush       │
//!  └───────────────────────────────────────────────────────────────┘
//!        │                 │                  │               │
//!        ▼                 ▼                  ▼               ▼
//!  ┌────────────┐   ┌─────────────┐   ┌──────────────┐  ┌───────────┐
//!  │RepoRegistry│   │  RepoGraph  │   │ProvenanceIndex│  │ StreamHub │
//!  │ repo DAG   │   │ per repo:   │   │ commit -> its │  │ branch    │
//!  │            │   │ commits,    │   │ downstream    │  │ subs and  │
//!  │            │   │ branches,   │   │ commits       │  │ flush     │
//!  │            │   │ FileTrees   │   │               │  │ waiters   │
//!  └────────────┘   └─────────────┘   └──────────────┘  └───────────┘
//!                          │
//!                          ▼
//!                  ┌───────────────┐
//!                  │  ObjectStore  │  shards + frozen trees
//!                  └───────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use pfsdrive::{Context, Delimiter, Driver, File};
//!
//! let driver = Driver::in_memory();
//! driver.create_repo("data", &[])?;
//! let commit = driver.start_commit("data", None, Some("master"), &[])?;
//! driver.put_file(&File::new(commit.clone(), "/a.txt"), Delimiter::None, 0, 0, &b"hello"[..])?;
//! driver.finish_commit(&commit)?;
//!
//! for event in driver.subscribe_commit(&Context::background(), "data", "master", None)? {
//!     println!("{}", event.into_result()?.commit);
//! }
//! ```

mod chunk;
mod commit;
mod config;
mod context;
mod driver;
mod error;
mod glob;
mod provenance;
mod reader;
mod refs;
mod registry;
mod stream;
mod tree;
mod types;

pub use config::{DriverConfig, ObjectStoreConfig};
pub use context::{CancelHandle, Context};
pub use driver::Driver;
pub use error::{DriveError, DriveResult, ErrorKind};
pub use glob::GlobPattern;
pub use reader::FileReader;
pub use stream::{CommitEvent, CommitStream};
pub use tree::{clean_path, FileTree, Shard, TreeNode};
pub use types::{
    validate_repo_name, BranchInfo, BranchName, Commit, CommitId, CommitInfo, CommitState, Delimiter,
    File, FileInfo, FileType, InvalidNameError, ListFileMode, RepoInfo, RepoName,
};
