//! Commit streams and the hub that feeds them.
//!
//! The hub keeps two registries, both behind one mutex:
//! - branch subscribers keyed by `(repo, branch)`, each receiving every
//!   commit finished on that branch
//! - flush waiters keyed by commit, each receiving that one commit once it
//!   finishes (or an abort if it is deleted first)
//!
//! Every registration owns an independent unbounded channel, so a finish
//! notification never blocks on a slow consumer and each stream sees every
//! qualifying event (multicast). Callers hold the owning repo's graph lock
//! while registering and while notifying, which is what makes a finish land
//! entirely before or entirely after any concurrent registration.
//!
//! A stream whose context can end gets a small watcher thread that releases
//! its registrations the moment the context is cancelled or expires, even if
//! nobody is polling the stream. The watcher exits when the stream closes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{select, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::drive::context::Context;
use crate::drive::error::DriveError;
use crate::drive::types::{BranchName, Commit, CommitInfo, RepoName};

/// One item of a commit stream.
#[derive(Debug)]
pub enum CommitEvent {
    Commit(CommitInfo),
    /// terminal; nothing follows an error
    Error(DriveError),
}

impl CommitEvent {
    pub fn into_result(self) -> Result<CommitInfo, DriveError> {
        match self {
            CommitEvent::Commit(info) => Ok(info),
            CommitEvent::Error(err) => Err(err),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, CommitEvent::Error(_))
    }
}

#[derive(Clone)]
struct Registration {
    stream: u64,
    sender: Sender<CommitEvent>,
    ctx: Context,
}

impl Registration {
    /// false once the registration should be dropped
    fn deliver(&self, event: CommitEvent) -> bool {
        if self.ctx.is_cancelled() {
            return false;
        }
        self.sender.send(event).is_ok()
    }
}

#[derive(Default)]
struct HubState {
    branches: HashMap<(RepoName, BranchName), Vec<Registration>>,
    commits: HashMap<Commit, Vec<Registration>>,
}

/// Fan-out point for finish notifications.
#[derive(Default)]
pub(crate) struct StreamHub {
    state: Mutex<HubState>,
    next_id: AtomicU64,
}

impl StreamHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn open(self: &Arc<Self>, ctx: &Context, expected: Option<usize>) -> (Registration, CommitStream) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, events) = crossbeam_channel::unbounded();
        let registration = Registration {
            stream: id,
            sender,
            ctx: ctx.clone(),
        };
        let stream = CommitStream {
            id,
            events,
            ctx: ctx.clone(),
            hub: Arc::clone(self),
            remaining: expected,
            closed: false,
            watcher: None,
        };
        (registration, stream)
    }

    /// Open a branch stream: `replay` is delivered first, then live finishes.
    pub fn subscribe(
        self: &Arc<Self>,
        ctx: &Context,
        repo: RepoName,
        branch: BranchName,
        replay: Vec<CommitInfo>,
    ) -> CommitStream {
        let (registration, mut stream) = self.open(ctx, None);
        for info in replay {
            registration.deliver(CommitEvent::Commit(info));
        }
        debug!(stream = stream.id, %repo, %branch, "registered branch subscriber");
        self.state
            .lock()
            .branches
            .entry((repo, branch))
            .or_default()
            .push(registration);
        self.watch(&mut stream);
        stream
    }

    /// Open a flush stream that ends after `expected` commit events.
    pub fn flush_stream(self: &Arc<Self>, ctx: &Context, expected: usize) -> FlushRegistrar {
        let (registration, stream) = self.open(ctx, Some(expected));
        FlushRegistrar {
            hub: Arc::clone(self),
            registration,
            stream,
        }
    }

    /// Deliver a newly finished commit to its branch subscribers and waiters.
    pub fn notify_finished(&self, info: &CommitInfo) {
        let mut state = self.state.lock();

        if let Some(branch) = &info.branch {
            let key = (info.commit.repo.clone(), branch.clone());
            if let Some(registrations) = state.branches.get_mut(&key) {
                registrations.retain(|r| r.deliver(CommitEvent::Commit(info.clone())));
                if registrations.is_empty() {
                    state.branches.remove(&key);
                }
            }
        }

        if let Some(waiters) = state.commits.remove(&info.commit) {
            for waiter in waiters {
                waiter.deliver(CommitEvent::Commit(info.clone()));
            }
        }
    }

    /// Fail every waiter on a commit that will never finish.
    pub fn abort_commit(&self, commit: &Commit) {
        if let Some(waiters) = self.state.lock().commits.remove(commit) {
            warn!(%commit, waiters = waiters.len(), "aborting flush waiters on deleted commit");
            for waiter in waiters {
                waiter.deliver(CommitEvent::Error(DriveError::Aborted(format!(
                    "commit {} was deleted before finishing",
                    commit
                ))));
            }
        }
    }

    /// Fail every stream bound to a repo that is going away.
    pub fn abort_repo(&self, repo: &RepoName) {
        let mut state = self.state.lock();

        let branch_keys: Vec<_> = state.branches.keys().filter(|(r, _)| r == repo).cloned().collect();
        for key in branch_keys {
            for registration in state.branches.remove(&key).unwrap_or_default() {
                registration.deliver(CommitEvent::Error(DriveError::Aborted(format!(
                    "repo {} was deleted",
                    repo
                ))));
            }
        }

        let commit_keys: Vec<_> = state.commits.keys().filter(|c| &c.repo == repo).cloned().collect();
        for key in commit_keys {
            for waiter in state.commits.remove(&key).unwrap_or_default() {
                waiter.deliver(CommitEvent::Error(DriveError::Aborted(format!(
                    "repo {} was deleted before {} finished",
                    repo, key
                ))));
            }
        }
    }

    /// Fail every live stream.
    pub fn abort_all(&self) {
        let mut state = self.state.lock();
        let branches = std::mem::take(&mut state.branches);
        let commits = std::mem::take(&mut state.commits);
        drop(state);

        for registration in branches.into_values().flatten().chain(commits.into_values().flatten()) {
            registration.deliver(CommitEvent::Error(DriveError::Aborted(
                "all repos were deleted".to_string(),
            )));
        }
    }

    /// Release `stream`'s registrations as soon as its context ends. Called
    /// once every registration of the stream is in place.
    fn watch(self: &Arc<Self>, stream: &mut CommitStream) {
        if stream.remaining == Some(0) || !stream.ctx.can_end() {
            return;
        }

        let (stop, stopped) = crossbeam_channel::bounded::<()>(0);
        let hub: Weak<Self> = Arc::downgrade(self);
        let ctx = stream.ctx.clone();
        let id = stream.id;
        let spawned = thread::Builder::new()
            .name(format!("pfs-stream-{}", id))
            .spawn(move || {
                let timer = ctx.deadline_timer();
                let ended = select! {
                    recv(ctx.done()) -> _ => true,
                    recv(timer) -> _ => true,
                    recv(stopped) -> _ => false,
                };
                if let (true, Some(hub)) = (ended, hub.upgrade()) {
                    hub.deregister(id);
                    debug!(stream = id, "released registrations of cancelled stream");
                }
            });

        match spawned {
            Ok(_) => stream.watcher = Some(stop),
            // the stream still prunes itself on its next poll or finish
            Err(err) => warn!(stream = id, %err, "failed to spawn stream watcher"),
        }
    }

    /// Drop every registration belonging to `stream`.
    fn deregister(&self, stream: u64) {
        let mut state = self.state.lock();
        state.branches.retain(|_, regs| {
            regs.retain(|r| r.stream != stream);
            !regs.is_empty()
        });
        state.commits.retain(|_, regs| {
            regs.retain(|r| r.stream != stream);
            !regs.is_empty()
        });
    }

    /// live registrations (branch subscribers + flush waiters)
    pub fn registrations(&self) -> usize {
        let state = self.state.lock();
        state.branches.values().map(Vec::len).sum::<usize>()
            + state.commits.values().map(Vec::len).sum::<usize>()
    }
}

/// Builder for a flush stream's wait set.
///
/// Each target is classified under its repo's lock: already finished, gone,
/// or still open (registered as a waiter).
pub(crate) struct FlushRegistrar {
    hub: Arc<StreamHub>,
    registration: Registration,
    stream: CommitStream,
}

impl FlushRegistrar {
    pub fn ready(&self, info: CommitInfo) {
        self.registration.deliver(CommitEvent::Commit(info));
    }

    pub fn missing(&self, commit: &Commit) {
        self.registration.deliver(CommitEvent::Error(DriveError::Aborted(format!(
            "commit {} no longer exists",
            commit
        ))));
    }

    pub fn wait_for(&self, commit: Commit) {
        self.hub
            .state
            .lock()
            .commits
            .entry(commit)
            .or_default()
            .push(self.registration.clone());
    }

    pub fn finish(self) -> CommitStream {
        let mut stream = self.stream;
        debug!(stream = stream.id, expected = ?stream.remaining, "registered flush stream");
        self.hub.watch(&mut stream);
        stream
    }
}

/// A live feed of commit events.
///
/// Iterate it (or call [`recv`](Self::recv)) to block for the next event.
/// `None` means the stream has ended: all expected commits were delivered,
/// an error event was returned, or the stream was closed. Dropping the
/// stream closes it.
pub struct CommitStream {
    id: u64,
    events: Receiver<CommitEvent>,
    ctx: Context,
    hub: Arc<StreamHub>,
    remaining: Option<usize>,
    closed: bool,
    /// dropping it stops the cancellation watcher
    watcher: Option<Sender<()>>,
}

impl CommitStream {
    /// Block until the next event, cancellation, or end of stream.
    pub fn recv(&mut self) -> Option<CommitEvent> {
        if self.exhausted() {
            return None;
        }
        if self.ctx.is_cancelled() {
            return Some(self.cancelled());
        }

        // outer None: cancelled or past the deadline
        let timer = self.ctx.deadline_timer();
        let outcome = select! {
            recv(self.events) -> msg => Some(msg.ok()),
            recv(self.ctx.done()) -> _ => None,
            recv(timer) -> _ => None,
        };
        match outcome {
            Some(received) => self.accept(received),
            None => Some(self.cancelled()),
        }
    }

    /// Next event if one is ready right now.
    pub fn try_recv(&mut self) -> Option<CommitEvent> {
        if self.exhausted() {
            return None;
        }
        if self.ctx.is_cancelled() {
            return Some(self.cancelled());
        }
        match self.events.try_recv() {
            Ok(event) => self.accept(Some(event)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => self.accept(None),
        }
    }

    /// Like [`recv`](Self::recv) but gives up after `timeout`, returning
    /// `None` while leaving the stream open.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<CommitEvent> {
        if self.exhausted() {
            return None;
        }
        if self.ctx.is_cancelled() {
            return Some(self.cancelled());
        }

        let timer = self.ctx.deadline_timer();
        let outcome = select! {
            recv(self.events) -> msg => Some(msg.ok()),
            recv(self.ctx.done()) -> _ => None,
            recv(timer) -> _ => None,
            default(timeout) => return None,
        };
        match outcome {
            Some(received) => self.accept(received),
            None => Some(self.cancelled()),
        }
    }

    /// Stop delivery and release the registration. Safe to call repeatedly.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.watcher = None;
            self.hub.deregister(self.id);
            debug!(stream = self.id, "closed commit stream");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn exhausted(&mut self) -> bool {
        if self.remaining == Some(0) {
            self.close();
        }
        self.closed
    }

    fn cancelled(&mut self) -> CommitEvent {
        self.close();
        CommitEvent::Error(DriveError::Cancelled)
    }

    fn accept(&mut self, received: Option<CommitEvent>) -> Option<CommitEvent> {
        match received {
            Some(CommitEvent::Commit(info)) => {
                if let Some(remaining) = self.remaining.as_mut() {
                    *remaining = remaining.saturating_sub(1);
                    if *remaining == 0 {
                        self.close();
                    }
                }
                Some(CommitEvent::Commit(info))
            }
            Some(CommitEvent::Error(err)) => {
                self.close();
                Some(CommitEvent::Error(err))
            }
            None => {
                self.close();
                None
            }
        }
    }
}

impl Iterator for CommitStream {
    type Item = CommitEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv()
    }
}

impl Drop for CommitStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for CommitStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitStream")
            .field("id", &self.id)
            .field("remaining", &self.remaining)
            .field("closed", &self.closed)
            .finish()
    }
}
