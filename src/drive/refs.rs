//! Branch pointers for one repo.
//!
//! A branch is only a name and the commit it points at. It owns no data:
//! deleting a branch never deletes commits, and a branch may be left
//! pointerless when its head commit is deleted and had no parent.

use std::collections::BTreeMap;

use crate::drive::types::{BranchName, CommitId};

/// Name-ordered branch table.
#[derive(Debug, Default, Clone)]
pub(crate) struct BranchTable {
    heads: BTreeMap<BranchName, Option<CommitId>>,
}

impl BranchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or repoint a branch.
    pub fn set(&mut self, branch: BranchName, head: CommitId) {
        self.heads.insert(branch, Some(head));
    }

    /// `None` if the branch does not exist, `Some(None)` if it is pointerless.
    pub fn head(&self, branch: &str) -> Option<Option<&CommitId>> {
        self.heads.get(branch).map(Option::as_ref)
    }

    #[cfg(test)]
    pub fn contains(&self, branch: &str) -> bool {
        self.heads.contains_key(branch)
    }

    /// Remove a branch. Returns false if it did not exist.
    pub fn delete(&mut self, branch: &str) -> bool {
        self.heads.remove(branch).is_some()
    }

    pub fn list(&self) -> impl Iterator<Item = (&BranchName, Option<&CommitId>)> {
        self.heads.iter().map(|(name, head)| (name, head.as_ref()))
    }

    /// Move every branch at `from` to `to` (or leave them pointerless).
    ///
    /// Returns the names of the branches that moved.
    pub fn retarget(&mut self, from: &CommitId, to: Option<&CommitId>) -> Vec<BranchName> {
        let mut moved = Vec::new();
        for (name, head) in self.heads.iter_mut() {
            if head.as_ref() == Some(from) {
                *head = to.cloned();
                moved.push(name.clone());
            }
        }
        moved
    }

    /// commits that branches point at; a commit shared by two branches repeats
    pub fn heads(&self) -> impl Iterator<Item = &CommitId> {
        self.heads.values().flatten()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.heads.len()
    }
}
