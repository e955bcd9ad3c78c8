//! The per-repo commit graph and the open/finished state machine.
//!
//! ```text
//!   start_commit ──► OPEN ──finish_commit──► FINISHED
//!                     │                          ▲
//!                     └── put_file / mkdir /     │
//!                         delete_file            │
//!   build_commit ────────────────────────────────┘
//! ```
//!
//! Commits live in a flat map keyed by id; parent links are ids, never
//! pointers. Every commit also carries two sequence numbers: `seq` (start
//! order) and `finish_seq` (finish order). Listings sort by the first,
//! subscription replay by the second.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::drive::error::{DriveError, DriveResult};
use crate::drive::refs::BranchTable;
use crate::drive::tree::FileTree;
use crate::drive::types::{BranchInfo, BranchName, Commit, CommitId, CommitInfo, CommitState, RepoName};
use crate::storage::ObjectRef;

#[derive(Debug)]
enum Content {
    Open(FileTree),
    Finished {
        tree_ref: ObjectRef,
        tree: Arc<FileTree>,
        finished: DateTime<Utc>,
    },
}

#[derive(Debug)]
pub(crate) struct CommitNode {
    pub id: CommitId,
    pub parent: Option<CommitId>,
    pub branch: Option<BranchName>,
    pub provenance: Vec<Commit>,
    pub started: DateTime<Utc>,
    seq: u64,
    finish_seq: Option<u64>,
    content: Content,
}

impl CommitNode {
    pub fn is_finished(&self) -> bool {
        matches!(self.content, Content::Finished { .. })
    }

    fn tree(&self) -> &FileTree {
        match &self.content {
            Content::Open(tree) => tree,
            Content::Finished { tree, .. } => tree,
        }
    }
}

/// One repo's commits and branches.
#[derive(Debug)]
pub(crate) struct RepoGraph {
    repo: RepoName,
    commits: HashMap<CommitId, CommitNode>,
    branches: BranchTable,
    next_seq: u64,
    next_finish_seq: u64,
}

impl RepoGraph {
    pub fn new(repo: RepoName) -> Self {
        Self {
            repo,
            commits: HashMap::new(),
            branches: BranchTable::new(),
            next_seq: 0,
            next_finish_seq: 0,
        }
    }

    pub fn repo(&self) -> &RepoName {
        &self.repo
    }

    fn commit_ref(&self, id: &CommitId) -> Commit {
        Commit::new(self.repo.clone(), id.clone())
    }

    fn not_found(&self, id: &str) -> DriveError {
        DriveError::CommitNotFound(self.commit_ref(&CommitId::new(id)))
    }

    /// Resolve a commit id, or a branch name to the commit it points at.
    pub fn resolve(&self, id: &str) -> DriveResult<&CommitId> {
        let key = CommitId::new(id);
        if let Some((found, _)) = self.commits.get_key_value(&key) {
            return Ok(found);
        }
        match self.branches.head(id) {
            Some(Some(head)) => Ok(head),
            _ => Err(self.not_found(id)),
        }
    }

    fn node(&self, id: &str) -> DriveResult<&CommitNode> {
        let id = self.resolve(id)?.clone();
        self.commits.get(&id).ok_or_else(|| self.not_found(id.as_str()))
    }

    fn node_mut(&mut self, id: &str) -> DriveResult<&mut CommitNode> {
        let id = self.resolve(id)?.clone();
        let missing = self.not_found(id.as_str());
        self.commits.get_mut(&id).ok_or(missing)
    }

    #[cfg(test)]
    pub fn contains(&self, id: &str) -> bool {
        self.resolve(id).is_ok()
    }

    /// Pick the parent for a new commit: the explicit parent if given,
    /// otherwise the current head of `branch`.
    fn resolve_parent(&self, parent: Option<&str>, branch: Option<&BranchName>) -> DriveResult<Option<CommitId>> {
        match (parent, branch) {
            (Some(parent), _) => Ok(Some(self.resolve(parent)?.clone())),
            (None, Some(branch)) => Ok(self.branches.head(branch.as_str()).flatten().cloned()),
            (None, None) => Ok(None),
        }
    }

    fn insert(
        &mut self,
        parent: Option<CommitId>,
        branch: Option<BranchName>,
        provenance: Vec<Commit>,
        content: Content,
    ) -> CommitId {
        let id = CommitId::generate();
        let finished = matches!(content, Content::Finished { .. });
        let node = CommitNode {
            id: id.clone(),
            parent,
            branch: branch.clone(),
            provenance,
            started: Utc::now(),
            seq: self.next_seq,
            finish_seq: finished.then_some(self.next_finish_seq),
            content,
        };
        self.next_seq += 1;
        if finished {
            self.next_finish_seq += 1;
        }
        self.commits.insert(id.clone(), node);

        if let Some(branch) = branch {
            self.branches.set(branch, id.clone());
        }
        id
    }

    /// Open a new commit.
    ///
    /// The commit starts with its parent's files: the frozen tree when the
    /// parent is finished, otherwise a copy of whatever it holds right now.
    pub fn start(
        &mut self,
        parent: Option<&str>,
        branch: Option<BranchName>,
        provenance: Vec<Commit>,
    ) -> DriveResult<CommitId> {
        let parent = self.resolve_parent(parent, branch.as_ref())?;
        let tree = match &parent {
            Some(id) => self.node(id.as_str())?.tree().clone(),
            None => FileTree::new(),
        };

        let id = self.insert(parent, branch, provenance, Content::Open(tree));
        debug!(repo = %self.repo, commit = %id, "started commit");
        Ok(id)
    }

    /// Add a commit that is finished from the start, with a tree built
    /// elsewhere.
    pub fn build(
        &mut self,
        parent: Option<&str>,
        branch: Option<BranchName>,
        provenance: Vec<Commit>,
        tree_ref: ObjectRef,
        tree: Arc<FileTree>,
    ) -> DriveResult<CommitInfo> {
        let parent = self.resolve_parent(parent, branch.as_ref())?;
        let content = Content::Finished {
            tree_ref,
            tree,
            finished: Utc::now(),
        };

        let id = self.insert(parent, branch, provenance, content);
        debug!(repo = %self.repo, commit = %id, tree = %tree_ref, "built commit");
        self.info(id.as_str())
    }

    /// Freeze an open commit.
    ///
    /// `persist` stores the tree and returns its reference; it runs at most
    /// once and only for an open commit.
    pub fn finish(
        &mut self,
        id: &str,
        persist: impl FnOnce(&FileTree) -> DriveResult<ObjectRef>,
    ) -> DriveResult<CommitInfo> {
        let finish_seq = self.next_finish_seq;
        let commit = self.commit_ref(self.resolve(id)?);
        let node = self.node_mut(id)?;

        let tree = match &mut node.content {
            Content::Finished { .. } => return Err(DriveError::AlreadyFinished(commit)),
            Content::Open(tree) => std::mem::take(tree),
        };
        let tree_ref = match persist(&tree) {
            Ok(tree_ref) => tree_ref,
            Err(err) => {
                // put the tree back so the commit stays usable
                node.content = Content::Open(tree);
                return Err(err);
            }
        };

        node.content = Content::Finished {
            tree_ref,
            tree: Arc::new(tree),
            finished: Utc::now(),
        };
        node.finish_seq = Some(finish_seq);
        self.next_finish_seq += 1;

        debug!(%commit, tree = %tree_ref, "finished commit");
        self.info(commit.id.as_str())
    }

    pub fn info(&self, id: &str) -> DriveResult<CommitInfo> {
        let node = self.node(id)?;
        Ok(self.node_info(node))
    }

    fn node_info(&self, node: &CommitNode) -> CommitInfo {
        let (state, tree, finished) = match &node.content {
            Content::Open(_) => (CommitState::Open, None, None),
            Content::Finished { tree_ref, finished, .. } => {
                (CommitState::Finished, Some(*tree_ref), Some(*finished))
            }
        };
        CommitInfo {
            commit: self.commit_ref(&node.id),
            parent: node.parent.as_ref().map(|p| self.commit_ref(p)),
            branch: node.branch.clone(),
            provenance: node.provenance.clone(),
            state,
            tree,
            started: node.started,
            finished,
            size_bytes: node.tree().total_size(),
        }
    }

    /// The tree of an open commit, for writing.
    pub fn writable_tree(&mut self, id: &str) -> DriveResult<&mut FileTree> {
        let commit = self.commit_ref(self.resolve(id)?);
        match &mut self.node_mut(id)?.content {
            Content::Open(tree) => Ok(tree),
            Content::Finished { .. } => Err(DriveError::AlreadyFinished(commit)),
        }
    }

    /// Fail with `AlreadyFinished` unless the commit is open.
    pub fn ensure_open(&self, id: &str) -> DriveResult<Commit> {
        let node = self.node(id)?;
        let commit = self.commit_ref(&node.id);
        if node.is_finished() {
            return Err(DriveError::AlreadyFinished(commit));
        }
        Ok(commit)
    }

    /// The current tree of any commit, open or finished.
    pub fn tree(&self, id: &str) -> DriveResult<(Commit, &FileTree)> {
        let node = self.node(id)?;
        Ok((self.commit_ref(&node.id), node.tree()))
    }

    /// The frozen tree of a finished commit.
    pub fn frozen_tree(&self, id: &str) -> DriveResult<(Commit, Arc<FileTree>)> {
        let node = self.node(id)?;
        let commit = self.commit_ref(&node.id);
        match &node.content {
            Content::Finished { tree, .. } => Ok((commit, Arc::clone(tree))),
            Content::Open(_) => Err(DriveError::CommitNotFinished(commit)),
        }
    }

    fn children<'a>(&'a self, id: &'a CommitId) -> impl Iterator<Item = &'a CommitNode> + 'a {
        self.commits.values().filter(move |n| n.parent.as_ref() == Some(id))
    }

    /// Remove a leaf commit, moving branch heads that point at it back to
    /// its parent.
    pub fn delete(&mut self, id: &str) -> DriveResult<CommitNode> {
        let id = self.resolve(id)?.clone();
        if self.children(&id).next().is_some() {
            return Err(DriveError::CommitHasChildren(self.commit_ref(&id)));
        }

        let node = self
            .commits
            .remove(&id)
            .ok_or_else(|| self.not_found(id.as_str()))?;
        let moved = self.branches.retarget(&id, node.parent.as_ref());
        debug!(repo = %self.repo, commit = %id, retargeted = moved.len(), "deleted commit");
        Ok(node)
    }

    /// Commits on the lineage ending at `to`, newest first.
    ///
    /// - `to` given: walk parents from `to` until `from` (exclusive); `from`
    ///   must be an ancestor of `to`
    /// - `to` absent: every commit in start order, newest first, minus `from`
    ///   and its ancestors
    ///
    /// `number == 0` means no cap.
    pub fn list(&self, from: Option<&str>, to: Option<&str>, number: u64) -> DriveResult<Vec<CommitInfo>> {
        let from = from.map(|f| self.resolve(f).cloned()).transpose()?;
        let cap = if number == 0 { usize::MAX } else { number as usize };

        let Some(to) = to else {
            let excluded: HashSet<&CommitId> = match &from {
                Some(from) => self.ancestry(from).collect(),
                None => HashSet::new(),
            };
            let mut nodes: Vec<&CommitNode> = self
                .commits
                .values()
                .filter(|n| !excluded.contains(&n.id))
                .collect();
            nodes.sort_by(|a, b| b.seq.cmp(&a.seq));
            return Ok(nodes.into_iter().take(cap).map(|n| self.node_info(n)).collect());
        };

        let to = self.resolve(to)?.clone();
        let mut out = Vec::new();
        let mut reached = from.is_none();
        for id in self.ancestry(&to) {
            if from.as_ref() == Some(id) {
                reached = true;
                break;
            }
            if out.len() < cap {
                out.push(self.info(id.as_str())?);
            }
        }

        if !reached {
            if let Some(from) = from {
                return Err(DriveError::NotAncestor {
                    ancestor: self.commit_ref(&from),
                    descendant: self.commit_ref(&to),
                });
            }
        }
        Ok(out)
    }

    /// `id` followed by its ancestors, newest first.
    fn ancestry<'a>(&'a self, id: &'a CommitId) -> impl Iterator<Item = &'a CommitId> + 'a {
        std::iter::successors(self.commits.get(id), |node| {
            node.parent.as_ref().and_then(|p| self.commits.get(p))
        })
        .map(|node| &node.id)
    }

    /// Finished commits recorded on `branch`, in finish order; when `from`
    /// is given, only those that descend from it.
    pub fn replay(&self, branch: &str, from: Option<&str>) -> DriveResult<Vec<CommitInfo>> {
        let from = from.map(|f| self.resolve(f).cloned()).transpose()?;

        let mut nodes: Vec<&CommitNode> = self
            .commits
            .values()
            .filter(|n| n.finish_seq.is_some())
            .filter(|n| n.branch.as_ref().map(BranchName::as_str) == Some(branch))
            .filter(|n| match &from {
                Some(from) => n.id != *from && self.ancestry(&n.id).any(|a| a == from),
                None => true,
            })
            .collect();
        nodes.sort_by_key(|n| n.finish_seq);
        Ok(nodes.into_iter().map(|n| self.node_info(n)).collect())
    }

    pub fn set_branch(&mut self, id: &str, name: BranchName) -> DriveResult<Commit> {
        let id = self.resolve(id)?.clone();
        debug!(repo = %self.repo, branch = %name, commit = %id, "set branch");
        self.branches.set(name, id.clone());
        Ok(self.commit_ref(&id))
    }

    pub fn delete_branch(&mut self, name: &str) -> DriveResult<()> {
        if !self.branches.delete(name) {
            return Err(DriveError::BranchNotFound {
                repo: self.repo.clone(),
                branch: name.to_string(),
            });
        }
        debug!(repo = %self.repo, branch = name, "deleted branch");
        Ok(())
    }

    pub fn branches(&self) -> Vec<BranchInfo> {
        self.branches
            .list()
            .map(|(name, head)| BranchInfo {
                name: name.clone(),
                head: head.map(|id| self.commit_ref(id)),
            })
            .collect()
    }

    /// Largest finished tree that a branch head points at.
    pub fn size_bytes(&self) -> u64 {
        self.branches
            .heads()
            .filter_map(|id| self.commits.get(id))
            .filter_map(|node| match &node.content {
                Content::Finished { tree, .. } => Some(tree.total_size()),
                Content::Open(_) => None,
            })
            .max()
            .unwrap_or(0)
    }

    /// every commit, oldest first
    pub fn commits(&self) -> Vec<CommitInfo> {
        let mut nodes: Vec<&CommitNode> = self.commits.values().collect();
        nodes.sort_by_key(|n| n.seq);
        nodes.into_iter().map(|n| self.node_info(n)).collect()
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::tree::Shard;

    fn graph() -> RepoGraph {
        RepoGraph::new(RepoName::new("data").unwrap())
    }

    fn master() -> Option<BranchName> {
        Some(BranchName::master())
    }

    fn persist(tree: &FileTree) -> DriveResult<ObjectRef> {
        Ok(ObjectRef::for_content(&tree.to_bytes()?).unwrap())
    }

    fn shard(bytes: &[u8]) -> Shard {
        Shard {
            object: ObjectRef::for_content(bytes).unwrap(),
            size: bytes.len() as u64,
        }
    }

    #[test]
    fn test_start_uses_branch_head_as_parent() {
        let mut g = graph();
        let c1 = g.start(None, master(), vec![]).unwrap();
        g.finish(c1.as_str(), persist).unwrap();
        let c2 = g.start(None, master(), vec![]).unwrap();

        let info = g.info(c2.as_str()).unwrap();
        assert_eq!(info.parent.unwrap().id, c1);
        assert_eq!(g.resolve("master").unwrap(), &c2);
    }

    #[test]
    fn test_start_with_unknown_parent() {
        let mut g = graph();
        assert!(g.start(Some("nope"), None, vec![]).unwrap_err().is_not_found());
        assert_eq!(g.len(), 0);
    }

    #[test]
    fn test_finish_once() {
        let mut g = graph();
        let c1 = g.start(None, master(), vec![]).unwrap();
        let info = g.finish(c1.as_str(), persist).unwrap();
        assert_eq!(info.state, CommitState::Finished);
        assert!(info.tree.is_some());
        assert!(info.finished.is_some());

        let err = g.finish(c1.as_str(), persist).unwrap_err();
        assert!(err.is_already_finished());
        assert!(g.writable_tree(c1.as_str()).unwrap_err().is_already_finished());
    }

    #[test]
    fn test_failed_persist_keeps_commit_open() {
        let mut g = graph();
        let c1 = g.start(None, None, vec![]).unwrap();
        g.writable_tree(c1.as_str()).unwrap().append_file("f", vec![shard(b"x")]).unwrap();

        let err = g
            .finish(c1.as_str(), |_| Err(DriveError::Aborted("disk full".into())))
            .unwrap_err();
        assert!(matches!(err, DriveError::Aborted(_)));
        assert!(g.ensure_open(c1.as_str()).is_ok());
        assert!(g.tree(c1.as_str()).unwrap().1.get("f").is_some());
    }

    #[test]
    fn test_open_commit_has_no_tree() {
        let mut g = graph();
        let c1 = g.start(None, None, vec![]).unwrap();
        let info = g.info(c1.as_str()).unwrap();
        assert_eq!(info.state, CommitState::Open);
        assert!(info.tree.is_none());
        assert!(matches!(
            g.frozen_tree(c1.as_str()),
            Err(DriveError::CommitNotFinished(_))
        ));
    }

    #[test]
    fn test_child_inherits_parent_tree() {
        let mut g = graph();
        let c1 = g.start(None, master(), vec![]).unwrap();
        g.writable_tree(c1.as_str()).unwrap().append_file("a", vec![shard(b"one")]).unwrap();
        g.finish(c1.as_str(), persist).unwrap();

        let c2 = g.start(None, master(), vec![]).unwrap();
        g.writable_tree(c2.as_str()).unwrap().append_file("a", vec![shard(b"two")]).unwrap();
        assert_eq!(g.tree(c2.as_str()).unwrap().1.size_of("a"), 6);
        // the parent is untouched
        assert_eq!(g.frozen_tree(c1.as_str()).unwrap().1.size_of("a"), 3);
    }

    #[test]
    fn test_delete_leaf_only_and_retarget() {
        let mut g = graph();
        let c1 = g.start(None, master(), vec![]).unwrap();
        g.finish(c1.as_str(), persist).unwrap();
        let c2 = g.start(None, master(), vec![]).unwrap();

        assert!(g.delete(c1.as_str()).unwrap_err().is_conflict());

        g.delete(c2.as_str()).unwrap();
        assert_eq!(g.resolve("master").unwrap(), &c1);

        g.delete(c1.as_str()).unwrap();
        let branches = g.branches();
        assert_eq!(branches.len(), 1);
        assert!(branches[0].head.is_none());
        assert!(g.resolve("master").is_err());
    }

    #[test]
    fn test_list_lineage() {
        let mut g = graph();
        let mut ids = Vec::new();
        for _ in 0..4 {
            let id = g.start(None, master(), vec![]).unwrap();
            g.finish(id.as_str(), persist).unwrap();
            ids.push(id);
        }

        let between = g.list(Some(ids[0].as_str()), Some(ids[3].as_str()), 0).unwrap();
        let got: Vec<_> = between.iter().map(|i| i.commit.id.clone()).collect();
        assert_eq!(got, vec![ids[3].clone(), ids[2].clone(), ids[1].clone()]);

        let capped = g.list(None, Some("master"), 2).unwrap();
        assert_eq!(capped.len(), 2);
        assert_eq!(capped[0].commit.id, ids[3]);

        let all = g.list(None, None, 0).unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].commit.id, ids[3]);

        let after_second = g.list(Some(ids[1].as_str()), None, 0).unwrap();
        assert_eq!(after_second.len(), 2);

        // reversed bounds are not on one lineage walking down from `to`
        let err = g.list(Some(ids[3].as_str()), Some(ids[0].as_str()), 0).unwrap_err();
        assert!(matches!(err, DriveError::NotAncestor { .. }));
    }

    #[test]
    fn test_replay_is_finish_ordered_and_branch_scoped() {
        let mut g = graph();
        let base = g.start(None, master(), vec![]).unwrap();
        g.finish(base.as_str(), persist).unwrap();

        let a = g.start(None, master(), vec![]).unwrap();
        let b = g.start(Some(a.as_str()), master(), vec![]).unwrap();
        let other = g.start(None, Some(BranchName::new("dev").unwrap()), vec![]).unwrap();
        g.finish(b.as_str(), persist).unwrap();
        g.finish(other.as_str(), persist).unwrap();
        g.finish(a.as_str(), persist).unwrap();

        let replay: Vec<_> = g
            .replay("master", Some(base.as_str()))
            .unwrap()
            .into_iter()
            .map(|i| i.commit.id)
            .collect();
        assert_eq!(replay, vec![b, a]);

        assert_eq!(g.replay("master", None).unwrap().len(), 3);
        assert_eq!(g.replay("dev", None).unwrap().len(), 1);
    }

    #[test]
    fn test_size_bytes_uses_finished_heads() {
        let mut g = graph();
        let c1 = g.start(None, master(), vec![]).unwrap();
        g.writable_tree(c1.as_str()).unwrap().append_file("f", vec![shard(b"12345")]).unwrap();
        assert_eq!(g.size_bytes(), 0);
        g.finish(c1.as_str(), persist).unwrap();
        assert_eq!(g.size_bytes(), 5);
    }

    #[test]
    fn test_delete_branch() {
        let mut g = graph();
        let c1 = g.start(None, master(), vec![]).unwrap();
        g.delete_branch("master").unwrap();
        assert!(g.delete_branch("master").unwrap_err().is_not_found());
        assert!(g.contains(c1.as_str()));
    }
}
