//! Caller cancellation for stream-returning operations.
//!
//! A [`Context`] carries a `done` channel that never receives a message; it
//! becomes disconnected when the matching [`CancelHandle`] is cancelled or
//! dropped. Streams `select!` on it next to their event channel, together
//! with an optional deadline timer.

use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TryRecvError};

/// Cancellation scope supplied by the caller of a blocking operation.
#[derive(Debug, Clone)]
pub struct Context {
    done: Receiver<()>,
    deadline: Option<Instant>,
    /// false when `done` can never disconnect
    cancellable: bool,
}

/// Cancels its [`Context`] when `cancel` is called or when dropped.
#[derive(Debug)]
pub struct CancelHandle {
    _sender: Sender<()>,
}

impl CancelHandle {
    pub fn cancel(self) {
        drop(self);
    }
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self {
            done: crossbeam_channel::never(),
            deadline: None,
            cancellable: false,
        }
    }

    /// A context cancelled through the returned handle.
    pub fn with_cancel() -> (Self, CancelHandle) {
        let (sender, done) = crossbeam_channel::bounded(0);
        (
            Self {
                done,
                deadline: None,
                cancellable: true,
            },
            CancelHandle { _sender: sender },
        )
    }

    /// Background context that expires after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().timeout(timeout)
    }

    /// Background context that expires at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self::background().deadline(deadline)
    }

    /// Add (or tighten) a deadline `timeout` from now.
    pub fn timeout(self, timeout: Duration) -> Self {
        self.deadline(Instant::now() + timeout)
    }

    /// Add (or tighten) an absolute deadline.
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn is_cancelled(&self) -> bool {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return true;
            }
        }
        matches!(self.done.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Whether this context can ever end, by cancellation or deadline.
    pub(crate) fn can_end(&self) -> bool {
        self.cancellable || self.deadline.is_some()
    }

    pub(crate) fn done(&self) -> &Receiver<()> {
        &self.done
    }

    /// timer channel for the deadline, or one that never fires
    pub(crate) fn deadline_timer(&self) -> Receiver<Instant> {
        match self.deadline {
            Some(deadline) => crossbeam_channel::at(deadline),
            None => crossbeam_channel::never(),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}
