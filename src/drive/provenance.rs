//! Commit-level provenance edges, indexed downstream.
//!
//! Each commit records its provenance (upstream) commits. The flush barrier
//! needs the opposite direction: for an upstream commit, which commits were
//! started with it in their provenance. This index keeps that reverse map
//! current as commits are started, built and deleted.
//!
//! ```text
//!   A@c1 ──► B@c2 ──► C@c3        closure([A@c1])          = {B@c2, C@c3}
//!      └───► D@c4                 closure([A@c1], to=[C])  = {C@c3}
//! ```

use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::drive::types::{Commit, RepoName};

#[derive(Debug, Default)]
pub(crate) struct ProvenanceIndex {
    downstream: HashMap<Commit, BTreeSet<Commit>>,
}

impl ProvenanceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `commit` was started with `provenance` as its inputs.
    pub fn add(&mut self, commit: &Commit, provenance: &[Commit]) {
        for upstream in provenance {
            self.downstream
                .entry(upstream.clone())
                .or_default()
                .insert(commit.clone());
        }
    }

    /// Forget a deleted commit in both directions.
    pub fn remove(&mut self, commit: &Commit, provenance: &[Commit]) {
        self.downstream.remove(commit);
        for upstream in provenance {
            if let Some(set) = self.downstream.get_mut(upstream) {
                set.remove(commit);
                if set.is_empty() {
                    self.downstream.remove(upstream);
                }
            }
        }
    }

    /// Forget every commit of a deleted repo.
    pub fn remove_repo(&mut self, repo: &RepoName) {
        self.downstream.retain(|upstream, set| {
            set.retain(|c| &c.repo != repo);
            &upstream.repo != repo && !set.is_empty()
        });
    }

    /// Every commit transitively downstream of `from`.
    ///
    /// The walk crosses every repo; only the result is filtered to
    /// `to_repos` (empty means all repos). A commit in `from` is part of the
    /// result only if it is downstream of another commit in `from`.
    pub fn closure(&self, from: &[Commit], to_repos: &[RepoName]) -> BTreeSet<Commit> {
        let mut seen: BTreeSet<Commit> = BTreeSet::new();
        let mut queue: VecDeque<&Commit> = from.iter().collect();

        while let Some(current) = queue.pop_front() {
            let Some(next) = self.downstream.get(current) else {
                continue;
            };
            for commit in next {
                if seen.insert(commit.clone()) {
                    queue.push_back(commit);
                }
            }
        }

        if !to_repos.is_empty() {
            seen.retain(|c| to_repos.contains(&c.repo));
        }
        seen
    }

    pub fn clear(&mut self) {
        self.downstream.clear();
    }

    pub fn len(&self) -> usize {
        self.downstream.values().map(BTreeSet::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::types::CommitId;

    fn c(repo: &str, id: &str) -> Commit {
        Commit::new(RepoName::new(repo).unwrap(), CommitId::new(id))
    }

    fn repo(name: &str) -> RepoName {
        RepoName::new(name).unwrap()
    }

    fn diamond() -> ProvenanceIndex {
        // A@1 -> B@2 -> C@3, A@1 -> D@4, D@4 -> C@3
        let mut index = ProvenanceIndex::new();
        index.add(&c("B", "2"), &[c("A", "1")]);
        index.add(&c("D", "4"), &[c("A", "1")]);
        index.add(&c("C", "3"), &[c("B", "2"), c("D", "4")]);
        index
    }

    #[test]
    fn test_closure_is_transitive_and_deduplicated() {
        let index = diamond();
        let closure = index.closure(&[c("A", "1")], &[]);
        assert_eq!(
            closure.into_iter().collect::<Vec<_>>(),
            vec![c("B", "2"), c("C", "3"), c("D", "4")]
        );
    }

    #[test]
    fn test_closure_filters_output_not_walk() {
        let index = diamond();
        // C is only reachable through B/D, which are filtered out of the result
        let closure = index.closure(&[c("A", "1")], &[repo("C")]);
        assert_eq!(closure.into_iter().collect::<Vec<_>>(), vec![c("C", "3")]);
    }

    #[test]
    fn test_closure_of_leaf_is_empty() {
        let index = diamond();
        assert!(index.closure(&[c("C", "3")], &[]).is_empty());
        assert!(index.closure(&[], &[]).is_empty());
    }

    #[test]
    fn test_from_commit_included_only_when_downstream_of_another() {
        let index = diamond();
        let closure = index.closure(&[c("A", "1"), c("B", "2")], &[]);
        assert!(closure.contains(&c("B", "2")));
        let closure = index.closure(&[c("B", "2")], &[]);
        assert!(!closure.contains(&c("B", "2")));
    }

    #[test]
    fn test_remove_commit() {
        let mut index = diamond();
        index.remove(&c("C", "3"), &[c("B", "2"), c("D", "4")]);
        let closure = index.closure(&[c("A", "1")], &[]);
        assert!(!closure.contains(&c("C", "3")));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_remove_repo() {
        let mut index = diamond();
        index.remove_repo(&repo("D"));
        let closure = index.closure(&[c("A", "1")], &[]);
        assert_eq!(
            closure.into_iter().collect::<Vec<_>>(),
            vec![c("B", "2"), c("C", "3")]
        );
        index.clear();
        assert_eq!(index.len(), 0);
    }
}
