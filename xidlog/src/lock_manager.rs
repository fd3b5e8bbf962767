//! Relation-scoped reader/writer locks.
//!
//! Each relation has a FIFO wait queue: a request is granted only once it
//! reaches the head of the queue and is compatible with the current
//! holders, so a waiting writer holds back readers that arrive after it.
//! Locks are not reentrant; a thread that asks again for a lock it already
//! holds in a conflicting mode waits forever (or until the timeout).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::{Result, XidLogError};
use crate::relation::{Relation, RelationId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug)]
struct LockRequest {
    ticket: u64,
    mode: LockMode,
}

#[derive(Debug, Default)]
struct LockQueue {
    queue: VecDeque<LockRequest>,
    sharing: u32,
    exclusive: bool,
}

impl LockQueue {
    fn is_compatible(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => !self.exclusive,
            LockMode::Exclusive => !self.exclusive && self.sharing == 0,
        }
    }

    fn try_acquire(&mut self, ticket: u64, mode: LockMode) -> bool {
        match self.queue.front() {
            Some(first) if first.ticket == ticket => {}
            _ => return false,
        }
        if !self.is_compatible(mode) {
            return false;
        }
        self.queue.pop_front();
        match mode {
            LockMode::Shared => self.sharing += 1,
            LockMode::Exclusive => self.exclusive = true,
        }
        true
    }
}

#[derive(Debug, Default)]
struct WaitQueue {
    queue: Mutex<LockQueue>,
    cvar: Condvar,
}

/// Holders and waiters of one relation's lock at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockSnapshot {
    pub readers: u32,
    pub writer: bool,
    pub waiting: usize,
}

#[derive(Debug, Default)]
pub struct LockManager {
    table: Mutex<HashMap<RelationId, Arc<WaitQueue>>>,
    next_ticket: AtomicU64,
    timeout: Option<Duration>,
}

/// A held relation lock. Released on drop.
#[derive(Debug)]
pub struct RelationLockGuard {
    wait_queue: Arc<WaitQueue>,
    relation: RelationId,
    mode: LockMode,
}

impl RelationLockGuard {
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn relation(&self) -> RelationId {
        self.relation
    }

    /// Releases the lock now rather than at end of scope.
    pub fn release(self) {}
}

impl Drop for RelationLockGuard {
    fn drop(&mut self) {
        let mut queue = self.wait_queue.queue.lock();
        match self.mode {
            LockMode::Shared => queue.sharing -= 1,
            LockMode::Exclusive => queue.exclusive = false,
        }
        drop(queue);
        self.wait_queue.cvar.notify_all();
    }
}

impl LockManager {
    /// A lock manager whose acquisitions block indefinitely.
    pub fn new() -> Self {
        Self::default()
    }

    /// A lock manager whose acquisitions give up after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn acquire_read(&self, relation: &Relation) -> Result<RelationLockGuard> {
        self.lock(relation, LockMode::Shared)
    }

    pub fn acquire_write(&self, relation: &Relation) -> Result<RelationLockGuard> {
        self.lock(relation, LockMode::Exclusive)
    }

    fn wait_queue(&self, relation: RelationId) -> Arc<WaitQueue> {
        let mut table = self.table.lock();
        table.entry(relation).or_default().clone()
    }

    pub fn lock(&self, relation: &Relation, mode: LockMode) -> Result<RelationLockGuard> {
        let wait_queue = self.wait_queue(relation.id());
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let deadline = self.timeout.map(|t| Instant::now() + t);

        let mut guard = wait_queue.queue.lock();
        guard.queue.push_back(LockRequest { ticket, mode });

        loop {
            if guard.try_acquire(ticket, mode) {
                if mode == LockMode::Shared && !guard.queue.is_empty() {
                    // The next request may be another reader.
                    wait_queue.cvar.notify_all();
                }
                drop(guard);
                return Ok(RelationLockGuard {
                    wait_queue,
                    relation: relation.id(),
                    mode,
                });
            }

            match deadline {
                None => wait_queue.cvar.wait(&mut guard),
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Err(self.give_up(&wait_queue, guard, ticket, relation, mode));
                    }
                    wait_queue.cvar.wait_until(&mut guard, deadline);
                }
            }
        }
    }

    fn give_up(
        &self,
        wait_queue: &WaitQueue,
        mut guard: MutexGuard<'_, LockQueue>,
        ticket: u64,
        relation: &Relation,
        mode: LockMode,
    ) -> XidLogError {
        guard.queue.retain(|req| req.ticket != ticket);
        drop(guard);
        // Whoever was queued behind us may now be at the head.
        wait_queue.cvar.notify_all();
        let waited = self.timeout.unwrap_or_default();
        warn!(relation = relation.name(), ?mode, ?waited, "lock wait timed out");
        XidLogError::LockTimeout {
            relation: relation.name().to_string(),
            waited,
        }
    }

    /// Drops the wait queue of a relation nobody holds or waits for.
    /// Returns whether it was removed.
    pub fn forget(&self, relation: RelationId) -> bool {
        let mut table = self.table.lock();
        let idle = match table.get(&relation) {
            // Holders and waiters keep their own reference to the queue.
            Some(wait_queue) => Arc::strong_count(wait_queue) == 1,
            None => return false,
        };
        if idle {
            table.remove(&relation);
            debug!(%relation, "forgot relation lock");
        }
        idle
    }

    /// Number of relations with a wait queue.
    pub fn tracked_relations(&self) -> usize {
        self.table.lock().len()
    }

    pub fn snapshot(&self, relation: RelationId) -> LockSnapshot {
        let Some(wait_queue) = self.table.lock().get(&relation).cloned() else {
            return LockSnapshot::default();
        };
        let queue = wait_queue.queue.lock();
        let snapshot = LockSnapshot {
            readers: queue.sharing,
            writer: queue.exclusive,
            waiting: queue.queue.len(),
        };
        debug!(%relation, ?snapshot, "lock snapshot");
        snapshot
    }
}
