//! file trees for commits.
//!
//! a tree is a flat map from cleaned path to node:
//! - the root directory lives at the empty path `""`
//! - directories only record their immediate child names
//! - files record an ordered list of shards, each a reference into the
//!   object store plus its byte length
//!
//! An open commit owns a mutable [`FileTree`]. Finishing the commit serializes
//! it to JSON, stores it as one object, and keeps the tree behind an `Arc`
//! from then on. Nothing mutates a tree after that.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::drive::error::{DriveError, DriveResult};
use crate::drive::types::{Commit, File, FileInfo, FileType, ListFileMode};
use crate::storage::ObjectRef;

/// One contiguous, delimiter-bounded chunk of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub object: ObjectRef,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TreeNode {
    File { shards: Vec<Shard> },
    Dir { children: BTreeSet<String> },
}

impl TreeNode {
    fn empty_dir() -> Self {
        TreeNode::Dir {
            children: BTreeSet::new(),
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, TreeNode::Dir { .. })
    }
}

/// Normalize a user path: drop empty and `.` segments, no leading slash.
///
/// `"/a//b/./c.txt"` becomes `"a/b/c.txt"`; `"/"` becomes `""` (the root).
pub fn clean_path(path: &str) -> String {
    path.split('/')
        .filter(|seg| !seg.is_empty() && *seg != ".")
        .collect::<Vec<_>>()
        .join("/")
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

/// split a cleaned, non-root path into (parent, name)
fn split_parent(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", path),
    }
}

/// A commit's namespace of files and directories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTree {
    nodes: BTreeMap<String, TreeNode>,
}

impl Default for FileTree {
    fn default() -> Self {
        Self::new()
    }
}

impl FileTree {
    /// an empty tree (root directory only)
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(String::new(), TreeNode::empty_dir());
        Self { nodes }
    }

    /// decode a frozen tree, checking that it has a root directory
    pub fn from_bytes(object: &ObjectRef, bytes: &[u8]) -> DriveResult<Self> {
        let tree: FileTree = serde_json::from_slice(bytes).map_err(|e| DriveError::InvalidTree {
            object: object.to_string(),
            reason: e.to_string(),
        })?;

        match tree.nodes.get("") {
            Some(TreeNode::Dir { .. }) => Ok(tree),
            _ => Err(DriveError::InvalidTree {
                object: object.to_string(),
                reason: "missing root directory".to_string(),
            }),
        }
    }

    /// encode for storage; BTreeMap keeps the bytes deterministic
    pub fn to_bytes(&self) -> DriveResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn get(&self, path: &str) -> Option<&TreeNode> {
        self.nodes.get(path)
    }

    /// Append shards to a file, creating it and any missing parents.
    pub fn append_file(&mut self, path: &str, shards: Vec<Shard>) -> DriveResult<()> {
        if path.is_empty() {
            return Err(DriveError::path_conflict("/", "the root is a directory"));
        }
        self.ensure_parents(path)?;

        match self.nodes.get_mut(path) {
            Some(TreeNode::File { shards: existing }) => {
                existing.extend(shards);
            }
            Some(TreeNode::Dir { .. }) => {
                return Err(DriveError::path_conflict(path, "a directory exists at this path"));
            }
            None => {
                self.nodes.insert(path.to_string(), TreeNode::File { shards });
                self.link(path);
            }
        }
        Ok(())
    }

    /// Create a directory (and missing parents). Idempotent for directories.
    pub fn make_dir(&mut self, path: &str) -> DriveResult<()> {
        if path.is_empty() {
            return Ok(());
        }
        self.ensure_parents(path)?;

        match self.nodes.get(path) {
            Some(TreeNode::File { .. }) => {
                Err(DriveError::path_conflict(path, "a file exists at this path"))
            }
            Some(TreeNode::Dir { .. }) => Ok(()),
            None => {
                self.nodes.insert(path.to_string(), TreeNode::empty_dir());
                self.link(path);
                Ok(())
            }
        }
    }

    /// Remove a path and everything below it. Returns false if absent.
    pub fn delete(&mut self, path: &str) -> bool {
        if path.is_empty() {
            self.nodes.retain(|k, _| k.is_empty());
            if let Some(TreeNode::Dir { children }) = self.nodes.get_mut("") {
                children.clear();
            }
            return true;
        }

        if self.nodes.remove(path).is_none() {
            return false;
        }

        let prefix = format!("{}/", path);
        let doomed: Vec<String> = self
            .nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            self.nodes.remove(&key);
        }

        let (parent, name) = split_parent(path);
        if let Some(TreeNode::Dir { children }) = self.nodes.get_mut(parent) {
            children.remove(name);
        }
        true
    }

    fn ensure_parents(&mut self, path: &str) -> DriveResult<()> {
        let (parent, _) = split_parent(path);
        if parent.is_empty() {
            return Ok(());
        }

        let mut prefix = String::new();
        for segment in parent.split('/') {
            prefix = join(&prefix, segment);
            match self.nodes.get(&prefix) {
                Some(TreeNode::Dir { .. }) => {}
                Some(TreeNode::File { .. }) => {
                    return Err(DriveError::path_conflict(prefix, "a file exists at this path"));
                }
                None => {
                    self.nodes.insert(prefix.clone(), TreeNode::empty_dir());
                    self.link(&prefix);
                }
            }
        }
        Ok(())
    }

    fn link(&mut self, path: &str) {
        let (parent, name) = split_parent(path);
        if let Some(TreeNode::Dir { children }) = self.nodes.get_mut(parent) {
            children.insert(name.to_string());
        }
    }

    /// every file with its shards, in path order
    pub fn files(&self) -> impl Iterator<Item = (&str, &[Shard])> {
        self.nodes.iter().filter_map(|(path, node)| match node {
            TreeNode::File { shards } => Some((path.as_str(), shards.as_slice())),
            TreeNode::Dir { .. } => None,
        })
    }

    /// total bytes below `path` (a file's own size for files)
    pub fn size_of(&self, path: &str) -> u64 {
        match self.nodes.get(path) {
            Some(TreeNode::File { shards }) => shards.iter().map(|s| s.size).sum(),
            Some(TreeNode::Dir { .. }) if path.is_empty() => self.total_size(),
            Some(TreeNode::Dir { .. }) => {
                let prefix = format!("{}/", path);
                self.nodes
                    .range(prefix.clone()..)
                    .take_while(|(k, _)| k.starts_with(&prefix))
                    .map(|(_, node)| match node {
                        TreeNode::File { shards } => shards.iter().map(|s| s.size).sum(),
                        TreeNode::Dir { .. } => 0,
                    })
                    .sum()
            }
            None => 0,
        }
    }

    pub fn total_size(&self) -> u64 {
        self.files()
            .map(|(_, shards)| shards.iter().map(|s| s.size).sum::<u64>())
            .sum()
    }

    /// Describe one node. `None` if the path does not exist.
    pub fn file_info(&self, commit: &Commit, path: &str, mode: ListFileMode) -> Option<FileInfo> {
        let node = self.nodes.get(path)?;
        let file = File::new(commit.clone(), format!("/{}", path));

        let info = match node {
            TreeNode::File { shards } => FileInfo {
                file,
                file_type: FileType::File,
                size_bytes: match mode {
                    ListFileMode::Fast => 0,
                    ListFileMode::Normal | ListFileMode::Recurse => {
                        shards.iter().map(|s| s.size).sum()
                    }
                },
                children: Vec::new(),
                objects: match mode {
                    ListFileMode::Fast => Vec::new(),
                    _ => shards.iter().map(|s| s.object).collect(),
                },
            },
            TreeNode::Dir { children } => FileInfo {
                file,
                file_type: FileType::Dir,
                size_bytes: match mode {
                    ListFileMode::Recurse => self.size_of(path),
                    ListFileMode::Normal | ListFileMode::Fast => 0,
                },
                children: children.iter().cloned().collect(),
                objects: Vec::new(),
            },
        };
        Some(info)
    }

    /// A directory's children, or the file itself when `path` is a file.
    pub fn list(&self, commit: &Commit, path: &str, mode: ListFileMode) -> Option<Vec<FileInfo>> {
        match self.nodes.get(path)? {
            TreeNode::File { .. } => Some(vec![self.file_info(commit, path, mode)?]),
            TreeNode::Dir { children } => Some(
                children
                    .iter()
                    .filter_map(|name| self.file_info(commit, &join(path, name), mode))
                    .collect(),
            ),
        }
    }
}
