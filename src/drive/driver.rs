//! The driver facade.
//!
//! `Driver` is a cheap, cloneable handle over shared state:
//!
//! ```text
//!   registry   RwLock<RepoRegistry>        repo names, repo provenance DAG
//!     └── per repo  RwLock<RepoGraph>      commits, branches, trees
//!   provenance Mutex<ProvenanceIndex>      commit provenance, downstream
//!   streams    StreamHub                   subscribers and flush waiters
//!   objects    dyn ObjectStore             shard and tree bytes
//! ```
//!
//! Locks are always taken in that order: registry, one repo graph,
//! provenance index, stream hub. Repo-level operations take the registry
//! exclusively; everything else holds it shared and serializes on the repo
//! graph, so unrelated repos never wait on each other.

use std::collections::BTreeSet;
use std::io::Read;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::drive::chunk::ShardWriter;
use crate::drive::commit::RepoGraph;
use crate::drive::config::DriverConfig;
use crate::drive::context::Context;
use crate::drive::error::{DriveError, DriveResult};
use crate::drive::glob::GlobPattern;
use crate::drive::provenance::ProvenanceIndex;
use crate::drive::reader::FileReader;
use crate::drive::registry::RepoRegistry;
use crate::drive::stream::{CommitStream, StreamHub};
use crate::drive::tree::{clean_path, FileTree, TreeNode};
use crate::drive::types::{
    BranchInfo, BranchName, Commit, CommitInfo, Delimiter, File, FileInfo, ListFileMode, RepoInfo,
    RepoName,
};
use crate::storage::{ObjectRef, ObjectStore};

type Registry = RepoRegistry<RwLock<RepoGraph>>;

/// Handle to a driver instance. Clone to share across threads.
#[derive(Clone)]
pub struct Driver {
    inner: Arc<DriverInner>,
}

struct DriverInner {
    config: DriverConfig,
    objects: Arc<dyn ObjectStore>,
    registry: RwLock<Registry>,
    provenance: Mutex<ProvenanceIndex>,
    streams: Arc<StreamHub>,
}

impl Driver {
    /// Build a driver and its object store from `config`.
    pub fn open(config: DriverConfig) -> DriveResult<Self> {
        let objects = config.build_store()?;
        info!(store = ?config.object_store, "opened driver");
        Ok(Self::with_object_store(config, objects))
    }

    /// A driver over an in-memory object store.
    pub fn in_memory() -> Self {
        Self::with_object_store(
            DriverConfig::memory(),
            Arc::new(crate::storage::MemoryObjectStore::new()),
        )
    }

    /// A driver over a caller-supplied object store.
    pub fn with_object_store(config: DriverConfig, objects: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner: Arc::new(DriverInner {
                config,
                objects,
                registry: RwLock::new(RepoRegistry::new()),
                provenance: Mutex::new(ProvenanceIndex::new()),
                streams: Arc::new(StreamHub::new()),
            }),
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.inner.config
    }

    pub fn objects(&self) -> &Arc<dyn ObjectStore> {
        &self.inner.objects
    }

    /// Run `f` with shared access to one repo's graph.
    fn with_graph<T>(&self, repo: &str, f: impl FnOnce(&RepoGraph) -> DriveResult<T>) -> DriveResult<T> {
        let registry = self.inner.registry.read();
        let graph = registry.get(repo)?.handle.read();
        f(&graph)
    }

    /// Run `f` with exclusive access to one repo's graph.
    fn with_graph_mut<T>(
        &self,
        repo: &str,
        f: impl FnOnce(&mut RepoGraph) -> DriveResult<T>,
    ) -> DriveResult<T> {
        let registry = self.inner.registry.read();
        let mut graph = registry.get(repo)?.handle.write();
        f(&mut graph)
    }

    /// Check that every commit exists and canonicalize branch names to ids.
    ///
    /// Takes each repo's graph lock only for the lookup.
    fn resolve_commits(registry: &Registry, commits: &[Commit]) -> DriveResult<Vec<Commit>> {
        let mut seen = BTreeSet::new();
        let mut resolved = Vec::with_capacity(commits.len());
        for commit in commits {
            let entry = registry.get(commit.repo.as_str())?;
            let id = entry.handle.read().resolve(commit.id.as_str())?.clone();
            let commit = Commit::new(entry.name.clone(), id);
            if seen.insert(commit.clone()) {
                resolved.push(commit);
            }
        }
        Ok(resolved)
    }

    // ==================== Repos ====================

    /// Create a repo whose provenance is `provenance`.
    pub fn create_repo(&self, name: &str, provenance: &[&str]) -> DriveResult<()> {
        let name = RepoName::new(name)?;
        let provenance = provenance
            .iter()
            .map(|p| RepoName::new(*p))
            .collect::<Result<Vec<_>, _>>()?;

        let mut registry = self.inner.registry.write();
        registry.create(name.clone(), &provenance, RwLock::new(RepoGraph::new(name.clone())))?;
        info!(repo = %name, provenance = ?provenance, "created repo");
        Ok(())
    }

    pub fn inspect_repo(&self, name: &str) -> DriveResult<RepoInfo> {
        let registry = self.inner.registry.read();
        let entry = registry.get(name)?;
        let size_bytes = entry.handle.read().size_bytes();
        Ok(RepoInfo {
            name: entry.name.clone(),
            provenance: entry.provenance.clone(),
            created: entry.created,
            size_bytes,
        })
    }

    /// Repos whose provenance includes every repo in `provenance`, in name
    /// order. An empty filter lists every repo.
    pub fn list_repo(&self, provenance: &[&str]) -> DriveResult<Vec<RepoInfo>> {
        let registry = self.inner.registry.read();
        let filter = provenance
            .iter()
            .map(|p| registry.get(p).map(|e| e.name.clone()))
            .collect::<DriveResult<Vec<_>>>()?;

        Ok(registry
            .list(&filter)
            .into_iter()
            .map(|entry| RepoInfo {
                name: entry.name.clone(),
                provenance: entry.provenance.clone(),
                created: entry.created,
                size_bytes: entry.handle.read().size_bytes(),
            })
            .collect())
    }

    /// Delete a repo with all its commits and branches.
    ///
    /// Live streams on the repo end with `Aborted`. With `force`, repos that
    /// listed it as provenance lose that edge.
    pub fn delete_repo(&self, name: &str, force: bool) -> DriveResult<()> {
        let mut registry = self.inner.registry.write();
        let entry = registry.remove(name, force)?;
        let commits = entry.handle.read().len();

        self.inner.provenance.lock().remove_repo(&entry.name);
        self.inner.streams.abort_repo(&entry.name);
        info!(repo = %entry.name, commits, force, "deleted repo");
        Ok(())
    }

    // ==================== Commits ====================

    /// Open a new commit in `repo`.
    ///
    /// `parent` is a commit id or branch name; when absent the new commit's
    /// parent is the current head of `branch`. The new commit becomes the
    /// head of `branch`.
    pub fn start_commit(
        &self,
        repo: &str,
        parent: Option<&str>,
        branch: Option<&str>,
        provenance: &[Commit],
    ) -> DriveResult<Commit> {
        let branch = branch.map(BranchName::new).transpose()?;
        let registry = self.inner.registry.read();
        let entry = registry.get(repo)?;
        let provenance = Self::resolve_commits(&registry, provenance)?;

        let mut graph = entry.handle.write();
        let id = graph.start(parent, branch, provenance.clone())?;
        let commit = Commit::new(entry.name.clone(), id);
        self.inner.provenance.lock().add(&commit, &provenance);

        info!(%commit, provenance = provenance.len(), "started commit");
        Ok(commit)
    }

    /// Add an already finished commit whose tree was stored out of band.
    ///
    /// `tree` must reference a stored tree whose shards are all present.
    pub fn build_commit(
        &self,
        repo: &str,
        parent: Option<&str>,
        branch: Option<&str>,
        provenance: &[Commit],
        tree: ObjectRef,
    ) -> DriveResult<Commit> {
        let branch = branch.map(BranchName::new).transpose()?;
        let loaded = Arc::new(self.load_tree(&tree)?);

        let registry = self.inner.registry.read();
        let entry = registry.get(repo)?;
        let provenance = Self::resolve_commits(&registry, provenance)?;

        let mut graph = entry.handle.write();
        let info = graph.build(parent, branch, provenance.clone(), tree, loaded)?;
        self.inner.provenance.lock().add(&info.commit, &provenance);
        self.inner.streams.notify_finished(&info);

        info!(commit = %info.commit, %tree, "built commit");
        Ok(info.commit)
    }

    fn load_tree(&self, tree: &ObjectRef) -> DriveResult<FileTree> {
        let bytes = match self.inner.objects.get(tree) {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Err(DriveError::TreeNotFound(tree.to_string())),
            Err(e) => return Err(e.into()),
        };
        let loaded = FileTree::from_bytes(tree, &bytes)?;

        for (path, shards) in loaded.files() {
            for shard in shards {
                let problem = match self.inner.objects.size(&shard.object) {
                    Ok(size) if size == shard.size => continue,
                    Ok(size) => format!("has {} bytes, tree records {}", size, shard.size),
                    Err(e) if e.is_not_found() => "is missing".to_string(),
                    Err(e) => return Err(e.into()),
                };
                return Err(DriveError::InvalidTree {
                    object: tree.to_string(),
                    reason: format!("shard {} of /{} {}", shard.object.short(), path, problem),
                });
            }
        }
        Ok(loaded)
    }

    /// Freeze a commit's tree and notify streams waiting on it.
    pub fn finish_commit(&self, commit: &Commit) -> DriveResult<()> {
        self.with_graph_mut(commit.repo.as_str(), |graph| {
            let objects = &self.inner.objects;
            let info = graph.finish(commit.id.as_str(), |tree| Ok(objects.put(&tree.to_bytes()?)?))?;
            self.inner.streams.notify_finished(&info);
            info!(commit = %info.commit, size = info.size_bytes, "finished commit");
            Ok(())
        })
    }

    pub fn inspect_commit(&self, commit: &Commit) -> DriveResult<CommitInfo> {
        self.with_graph(commit.repo.as_str(), |graph| graph.info(commit.id.as_str()))
    }

    /// Commits between `from` (exclusive) and `to` (inclusive), newest
    /// first, at most `number` of them (0 for no cap).
    ///
    /// Without `to`, lists every commit in the repo newer than `from`'s
    /// lineage.
    pub fn list_commit(
        &self,
        repo: &str,
        from: Option<&str>,
        to: Option<&str>,
        number: u64,
    ) -> DriveResult<Vec<CommitInfo>> {
        self.with_graph(repo, |graph| graph.list(from, to, number))
    }

    /// Stream every commit finished on `branch`.
    ///
    /// Commits already finished on the branch after `from` (or all of them
    /// when `from` is absent) are replayed first, in finish order.
    pub fn subscribe_commit(
        &self,
        ctx: &Context,
        repo: &str,
        branch: &str,
        from: Option<&str>,
    ) -> DriveResult<CommitStream> {
        let branch = BranchName::new(branch)?;
        self.with_graph(repo, |graph| {
            let replay = graph.replay(branch.as_str(), from)?;
            debug!(repo, %branch, replayed = replay.len(), "subscribing");
            Ok(self
                .inner
                .streams
                .subscribe(ctx, graph.repo().clone(), branch, replay))
        })
    }

    /// Stream the provenance closure of `from`, one event per commit as it
    /// finishes, restricted to `to_repos` (all repos when empty).
    pub fn flush_commit(&self, ctx: &Context, from: &[Commit], to_repos: &[&str]) -> DriveResult<CommitStream> {
        let registry = self.inner.registry.read();
        let to_repos = to_repos
            .iter()
            .map(|r| registry.get(r).map(|e| e.name.clone()))
            .collect::<DriveResult<Vec<_>>>()?;
        let from = Self::resolve_commits(&registry, from)?;

        let closure = self.inner.provenance.lock().closure(&from, &to_repos);
        debug!(from = from.len(), closure = closure.len(), "flushing");

        let registrar = self.inner.streams.flush_stream(ctx, closure.len());
        for commit in closure {
            let Ok(entry) = registry.get(commit.repo.as_str()) else {
                registrar.missing(&commit);
                continue;
            };
            // classify and register under the repo lock so a concurrent
            // finish lands either before (ready) or after (delivered)
            let graph = entry.handle.read();
            match graph.info(commit.id.as_str()) {
                Ok(info) if info.is_finished() => registrar.ready(info),
                Ok(_) => registrar.wait_for(commit),
                Err(_) => registrar.missing(&commit),
            }
        }
        Ok(registrar.finish())
    }

    /// Delete a commit that has no children.
    ///
    /// Branches pointing at it move to its parent; flush streams waiting on
    /// it end with `Aborted`.
    pub fn delete_commit(&self, commit: &Commit) -> DriveResult<()> {
        self.with_graph_mut(commit.repo.as_str(), |graph| {
            let node = graph.delete(commit.id.as_str())?;
            let deleted = Commit::new(graph.repo().clone(), node.id.clone());

            self.inner.provenance.lock().remove(&deleted, &node.provenance);
            if !node.is_finished() {
                self.inner.streams.abort_commit(&deleted);
            }
            info!(commit = %deleted, "deleted commit");
            Ok(())
        })
    }

    // ==================== Branches ====================

    pub fn list_branch(&self, repo: &str) -> DriveResult<Vec<BranchInfo>> {
        self.with_graph(repo, |graph| Ok(graph.branches()))
    }

    /// Point branch `name` of the commit's repo at `commit`, creating it
    /// if needed.
    pub fn set_branch(&self, commit: &Commit, name: &str) -> DriveResult<()> {
        let name = BranchName::new(name)?;
        self.with_graph_mut(commit.repo.as_str(), |graph| {
            let target = graph.set_branch(commit.id.as_str(), name.clone())?;
            info!(branch = %name, commit = %target, "set branch");
            Ok(())
        })
    }

    /// Delete a branch. The commits it pointed at are kept.
    pub fn delete_branch(&self, repo: &str, name: &str) -> DriveResult<()> {
        self.with_graph_mut(repo, |graph| {
            graph.delete_branch(name)?;
            info!(repo, branch = name, "deleted branch");
            Ok(())
        })
    }

    // ==================== Files ====================

    /// Append a byte stream to a file in an open commit.
    ///
    /// Thresholds of 0 fall back to the configured defaults. The stream is
    /// split and stored before the repo lock is taken; the commit must still
    /// be open when the shards are attached.
    pub fn put_file(
        &self,
        file: &File,
        delimiter: Delimiter,
        target_file_datums: u64,
        target_file_bytes: u64,
        reader: impl Read,
    ) -> DriveResult<()> {
        let path = clean_path(&file.path);
        if path.is_empty() {
            return Err(DriveError::path_conflict("/", "the root is a directory"));
        }
        self.with_graph(file.commit.repo.as_str(), |graph| {
            graph.ensure_open(file.commit.id.as_str()).map(|_| ())
        })?;

        let datums = match target_file_datums {
            0 => self.inner.config.default_target_file_datums,
            n => n,
        };
        let bytes = match target_file_bytes {
            0 => self.inner.config.default_target_file_bytes,
            n => n,
        };
        let shards = ShardWriter::new(self.inner.objects.as_ref(), datums, bytes).write_stream(delimiter, reader)?;
        let count = shards.len();

        self.with_graph_mut(file.commit.repo.as_str(), |graph| {
            graph.writable_tree(file.commit.id.as_str())?.append_file(&path, shards)
        })?;
        debug!(%file, shards = count, ?delimiter, "put file");
        Ok(())
    }

    /// Create an empty directory (and missing parents) in an open commit.
    pub fn make_directory(&self, file: &File) -> DriveResult<()> {
        let path = clean_path(&file.path);
        self.with_graph_mut(file.commit.repo.as_str(), |graph| {
            graph.writable_tree(file.commit.id.as_str())?.make_dir(&path)
        })?;
        debug!(%file, "made directory");
        Ok(())
    }

    /// Read `size` bytes of a file from `offset` (`size <= 0` reads to the
    /// end). The commit must be finished.
    pub fn get_file(&self, file: &File, offset: u64, size: i64) -> DriveResult<FileReader> {
        let path = clean_path(&file.path);
        let (commit, tree) = self.with_graph(file.commit.repo.as_str(), |graph| {
            graph.frozen_tree(file.commit.id.as_str())
        })?;

        match tree.get(&path) {
            Some(TreeNode::File { shards }) => Ok(FileReader::new(
                Arc::clone(&self.inner.objects),
                shards,
                offset,
                size,
            )),
            _ => Err(DriveError::FileNotFound(File::new(commit, format!("/{}", path)))),
        }
    }

    pub fn inspect_file(&self, file: &File, mode: ListFileMode) -> DriveResult<FileInfo> {
        let path = clean_path(&file.path);
        self.with_graph(file.commit.repo.as_str(), |graph| {
            let (commit, tree) = graph.tree(file.commit.id.as_str())?;
            tree.file_info(&commit, &path, mode)
                .ok_or_else(|| DriveError::FileNotFound(File::new(commit, format!("/{}", path))))
        })
    }

    /// The children of a directory (or the file itself), sorted by name.
    pub fn list_file(&self, file: &File, mode: ListFileMode) -> DriveResult<Vec<FileInfo>> {
        let path = clean_path(&file.path);
        self.with_graph(file.commit.repo.as_str(), |graph| {
            let (commit, tree) = graph.tree(file.commit.id.as_str())?;
            tree.list(&commit, &path, mode)
                .ok_or_else(|| DriveError::FileNotFound(File::new(commit, format!("/{}", path))))
        })
    }

    /// Every file of a finished commit matching `pattern`, in path order.
    pub fn glob_file(&self, commit: &Commit, pattern: &str) -> DriveResult<Vec<FileInfo>> {
        let (commit, tree) = self.with_graph(commit.repo.as_str(), |graph| graph.frozen_tree(commit.id.as_str()))?;
        let glob = GlobPattern::new(pattern);

        Ok(tree
            .files()
            .filter(|(path, _)| glob.matches(path))
            .filter_map(|(path, _)| tree.file_info(&commit, path, ListFileMode::Normal))
            .collect())
    }

    /// Remove a path (and everything below it) from an open commit.
    pub fn delete_file(&self, file: &File) -> DriveResult<()> {
        let path = clean_path(&file.path);
        self.with_graph_mut(file.commit.repo.as_str(), |graph| {
            let commit = graph.ensure_open(file.commit.id.as_str())?;
            if !graph.writable_tree(file.commit.id.as_str())?.delete(&path) {
                return Err(DriveError::FileNotFound(File::new(commit, format!("/{}", path))));
            }
            Ok(())
        })?;
        debug!(%file, "deleted file");
        Ok(())
    }

    // ==================== Admin ====================

    /// Remove every repo, commit and branch and wipe the object store.
    pub fn delete_all(&self) -> DriveResult<()> {
        let mut registry = self.inner.registry.write();
        let repos = registry.drain();

        self.inner.provenance.lock().clear();
        self.inner.streams.abort_all();
        self.inner.objects.clear()?;
        warn!(repos = repos.len(), "deleted all repos");
        Ok(())
    }

    /// Log a snapshot of every repo, branch and commit.
    pub fn dump(&self) {
        let registry = self.inner.registry.read();
        info!(
            repos = registry.len(),
            provenance_edges = self.inner.provenance.lock().len(),
            streams = self.inner.streams.registrations(),
            "driver dump"
        );

        for entry in registry.iter() {
            let graph = entry.handle.read();
            info!(
                repo = %entry.name,
                provenance = ?entry.provenance,
                commits = graph.len(),
                size = graph.size_bytes(),
                "repo"
            );
            for branch in graph.branches() {
                match &branch.head {
                    Some(head) => info!(repo = %entry.name, branch = %branch.name, head = %head.id, "branch"),
                    None => info!(repo = %entry.name, branch = %branch.name, "branch (no head)"),
                }
            }
            for commit in graph.commits() {
                info!(
                    commit = %commit.commit,
                    parent = ?commit.parent.as_ref().map(|p| p.id.to_string()),
                    state = ?commit.state,
                    provenance = commit.provenance.len(),
                    size = commit.size_bytes,
                    "commit"
                );
            }
        }
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("object_store", &self.inner.config.object_store)
            .field("repos", &self.inner.registry.read().len())
            .finish()
    }
}
