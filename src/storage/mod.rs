//! object layer for pfsdrive
//!
//! this module is the only place that touches git2. The driver stores file
//! shards and frozen trees here and refers to them by [`ObjectRef`] only.
//!
//!  # Architecture
//!
//! ```text
//!  ┌──────────────────────────────────────────────┐
//!  │                 ObjectStore                  │
//!  │   put(bytes) -> ObjectRef, get(ObjectRef)    │
//!  └──────────────────────────────────────────────┘
//!                 │                   │
//!                 ▼                   ▼
//!        ┌────────────────┐   ┌────────────────┐
//!        │ GitObjectStore │   │MemoryObjectStore│
//!        │ (bare git odb) │   │  (hash map)    │
//!        └────────────────┘   └────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use pfsdrive::storage::{GitObjectStore, ObjectStore};
//!
//! let store = GitObjectStore::open_or_init("./objects.git")?;
//! let r = store.put(b"hello")?;
//! assert_eq!(store.get(&r)?, b"hello");
//! ```

mod error;
mod object;
mod types;

pub use error::{StorageError, StorageResult};
pub use object::{GitObjectStore, MemoryObjectStore, ObjectStore};
pub use types::ObjectRef;
