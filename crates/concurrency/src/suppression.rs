//! Thread-scoped switch that hides host-managed transactions
//!
//! While a [`SuppressionGuard`] is alive on a thread, the coordinator does not
//! consult the host transaction manager for that thread and always acquires a
//! fresh connection from the provider. Guards nest: the switch turns off when
//! the last guard on the thread is dropped.
//!
//! State is kept per thread id in a `DashMap` owned by the coordinator; the
//! guard is `!Send` so a push can only be popped on the thread that made it.

use dashmap::DashMap;
use std::marker::PhantomData;
use std::thread::ThreadId;

/// Per-thread suppression depth
#[derive(Debug, Default)]
pub struct HostSuppression {
    depth: DashMap<ThreadId, usize>,
}

impl HostSuppression {
    /// Create a switch with no thread suppressed
    pub fn new() -> Self {
        Self::default()
    }

    /// Suppress host detection on the calling thread until the guard drops
    pub fn suppress(&self) -> SuppressionGuard<'_> {
        let thread = std::thread::current().id();
        *self.depth.entry(thread).or_insert(0) += 1;
        SuppressionGuard {
            owner: self,
            thread,
            _not_send: PhantomData,
        }
    }

    /// True if host detection is suppressed on the calling thread
    pub fn is_suppressed(&self) -> bool {
        self.depth
            .get(&std::thread::current().id())
            .map(|depth| *depth > 0)
            .unwrap_or(false)
    }

    /// Number of threads currently suppressed
    pub fn suppressed_threads(&self) -> usize {
        self.depth.len()
    }

    fn pop(&self, thread: ThreadId) {
        let emptied = match self.depth.get_mut(&thread) {
            Some(mut depth) => {
                *depth = depth.saturating_sub(1);
                *depth == 0
            }
            None => false,
        };
        if emptied {
            self.depth.remove_if(&thread, |_, depth| *depth == 0);
        }
    }
}

/// Keeps host detection suppressed on one thread
#[must_use = "suppression ends as soon as the guard is dropped"]
pub struct SuppressionGuard<'a> {
    owner: &'a HostSuppression,
    thread: ThreadId,
    _not_send: PhantomData<*const ()>,
}

impl Drop for SuppressionGuard<'_> {
    fn drop(&mut self) {
        self.owner.pop(self.thread);
    }
}
