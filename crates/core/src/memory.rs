//! In-memory collaborators
//!
//! Reference implementations of [`Connection`], [`ConnectionProvider`] and
//! [`HostTransactionManager`] that keep all state in process memory. They
//! count every physical operation and can inject failures, which makes them
//! the adapters used throughout the test suites.
//!
//! ```
//! use std::sync::Arc;
//! use txscope_core::memory::MemoryConnectionProvider;
//! use txscope_core::Resource;
//!
//! let provider = MemoryConnectionProvider::new();
//! let resource = Resource::new("orders", provider.clone());
//! let conn = resource.acquire().unwrap();
//! resource.release(conn).unwrap();
//! assert_eq!(provider.stats().released, 1);
//! ```

use crate::error::{TxError, TxResult};
use crate::traits::{same_connection, Connection, HostTransactionManager, Resource, SharedConnection};
use crate::types::{IsolationLevel, ResourceId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

/// Failure switches shared by a provider and all of its connections
///
/// Each switch fires once and then resets.
#[derive(Debug, Default)]
pub struct FaultPlan {
    acquire: AtomicBool,
    release: AtomicBool,
    commit: AtomicBool,
    rollback: AtomicBool,
    reset: AtomicBool,
    isolation: AtomicBool,
}

impl FaultPlan {
    fn take(flag: &AtomicBool) -> bool {
        flag.swap(false, Ordering::SeqCst)
    }
}

/// Counters for physical operations
#[derive(Debug, Default)]
struct Counters {
    acquired: AtomicU64,
    released: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

/// Snapshot of a provider's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryStats {
    /// Connections handed out
    pub acquired: u64,
    /// Connections taken back
    pub released: u64,
    /// Successful physical commits
    pub commits: u64,
    /// Successful physical rollbacks
    pub rollbacks: u64,
}

impl MemoryStats {
    /// Connections currently handed out
    pub fn outstanding(&self) -> u64 {
        self.acquired.saturating_sub(self.released)
    }
}

/// A connection that only records what was done to it
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    auto_commit: bool,
    isolation: IsolationLevel,
    isolation_history: Vec<IsolationLevel>,
    commits: u64,
    rollbacks: u64,
    faults: Arc<FaultPlan>,
    counters: Arc<Counters>,
}

impl MemoryConnection {
    /// Connection number within its provider
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current auto-commit mode
    pub fn is_auto_commit(&self) -> bool {
        self.auto_commit
    }

    /// Current isolation level
    pub fn current_isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Every level set on this connection, in order
    pub fn isolation_history(&self) -> &[IsolationLevel] {
        &self.isolation_history
    }

    /// Successful commits on this connection
    pub fn commit_count(&self) -> u64 {
        self.commits
    }

    /// Successful rollbacks on this connection
    pub fn rollback_count(&self) -> u64 {
        self.rollbacks
    }
}

impl Connection for MemoryConnection {
    fn commit(&mut self) -> TxResult<()> {
        if self.auto_commit {
            return Err(TxError::database("commit", "commit with auto-commit enabled"));
        }
        if FaultPlan::take(&self.faults.commit) {
            return Err(TxError::database("commit", "injected commit failure"));
        }
        self.commits += 1;
        self.counters.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(&mut self) -> TxResult<()> {
        if self.auto_commit {
            return Err(TxError::database("rollback", "rollback with auto-commit enabled"));
        }
        if FaultPlan::take(&self.faults.rollback) {
            return Err(TxError::database("rollback", "injected rollback failure"));
        }
        self.rollbacks += 1;
        self.counters.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn auto_commit(&self) -> TxResult<bool> {
        Ok(self.auto_commit)
    }

    fn set_auto_commit(&mut self, auto_commit: bool) -> TxResult<()> {
        // Restoring auto-commit is the first step of every reset
        if auto_commit && FaultPlan::take(&self.faults.reset) {
            return Err(TxError::database("reset", "injected reset failure"));
        }
        self.auto_commit = auto_commit;
        Ok(())
    }

    fn isolation_level(&self) -> TxResult<IsolationLevel> {
        Ok(self.isolation)
    }

    fn set_isolation_level(&mut self, level: IsolationLevel) -> TxResult<()> {
        if level.is_default() {
            return Err(TxError::database(
                "set_isolation_level",
                "'default' is not a physical isolation level",
            ));
        }
        if FaultPlan::take(&self.faults.isolation) {
            return Err(TxError::database(
                "set_isolation_level",
                "injected isolation failure",
            ));
        }
        self.isolation = level;
        self.isolation_history.push(level);
        Ok(())
    }
}

/// A pooled, in-memory connection provider
///
/// Released connections go back to an idle list and are handed out again by
/// later `acquire` calls, so tests can observe the state a connection is
/// returned in.
#[derive(Debug)]
pub struct MemoryConnectionProvider {
    initial_auto_commit: bool,
    initial_isolation: IsolationLevel,
    all: Mutex<Vec<Arc<Mutex<MemoryConnection>>>>,
    idle: Mutex<Vec<Arc<Mutex<MemoryConnection>>>>,
    next_id: AtomicU64,
    faults: Arc<FaultPlan>,
    counters: Arc<Counters>,
}

impl MemoryConnectionProvider {
    /// Provider whose connections start in auto-commit with READ_COMMITTED
    pub fn new() -> Arc<Self> {
        Self::with_initial(true, IsolationLevel::ReadCommitted)
    }

    /// Provider whose connections start in the given state
    pub fn with_initial(auto_commit: bool, isolation: IsolationLevel) -> Arc<Self> {
        Arc::new(Self {
            initial_auto_commit: auto_commit,
            initial_isolation: isolation,
            all: Mutex::new(Vec::new()),
            idle: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            faults: Arc::new(FaultPlan::default()),
            counters: Arc::new(Counters::default()),
        })
    }

    /// Current counters
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            acquired: self.counters.acquired.load(Ordering::SeqCst),
            released: self.counters.released.load(Ordering::SeqCst),
            commits: self.counters.commits.load(Ordering::SeqCst),
            rollbacks: self.counters.rollbacks.load(Ordering::SeqCst),
        }
    }

    /// Every connection this provider ever created, in creation order
    pub fn connections(&self) -> Vec<Arc<Mutex<MemoryConnection>>> {
        self.all.lock().clone()
    }

    /// Create a connection outside the pool, e.g. for a host manager to own
    pub fn open_unpooled(&self) -> Arc<Mutex<MemoryConnection>> {
        let conn = Arc::new(Mutex::new(MemoryConnection {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            auto_commit: self.initial_auto_commit,
            isolation: self.initial_isolation,
            isolation_history: Vec::new(),
            commits: 0,
            rollbacks: 0,
            faults: Arc::clone(&self.faults),
            counters: Arc::clone(&self.counters),
        }));
        self.all.lock().push(Arc::clone(&conn));
        conn
    }

    /// Make the next `acquire` fail
    pub fn fail_next_acquire(&self) {
        self.faults.acquire.store(true, Ordering::SeqCst);
    }

    /// Make the next `release` fail
    pub fn fail_next_release(&self) {
        self.faults.release.store(true, Ordering::SeqCst);
    }

    /// Make the next physical commit on any connection fail
    pub fn fail_next_commit(&self) {
        self.faults.commit.store(true, Ordering::SeqCst);
    }

    /// Make the next physical rollback on any connection fail
    pub fn fail_next_rollback(&self) {
        self.faults.rollback.store(true, Ordering::SeqCst);
    }

    /// Make the next auto-commit restore on any connection fail
    pub fn fail_next_reset(&self) {
        self.faults.reset.store(true, Ordering::SeqCst);
    }

    /// Make the next isolation change on any connection fail
    pub fn fail_next_isolation(&self) {
        self.faults.isolation.store(true, Ordering::SeqCst);
    }
}

impl crate::traits::ConnectionProvider for MemoryConnectionProvider {
    fn acquire(&self, resource: &Resource) -> TxResult<SharedConnection> {
        if FaultPlan::take(&self.faults.acquire) {
            return Err(TxError::ConnectionAcquisition {
                resource: resource.name().to_string(),
                message: "injected acquire failure".to_string(),
            });
        }
        let conn = match self.idle.lock().pop() {
            Some(conn) => conn,
            None => self.open_unpooled(),
        };
        self.counters.acquired.fetch_add(1, Ordering::SeqCst);
        let shared: SharedConnection = conn;
        Ok(shared)
    }

    fn release(&self, connection: SharedConnection, resource: &Resource) -> TxResult<()> {
        if FaultPlan::take(&self.faults.release) {
            return Err(TxError::ConnectionRelease {
                resource: resource.name().to_string(),
                message: "injected release failure".to_string(),
            });
        }
        let owned = self
            .all
            .lock()
            .iter()
            .find(|candidate| {
                let candidate: SharedConnection = Arc::clone(candidate) as SharedConnection;
                same_connection(&candidate, &connection)
            })
            .cloned();
        match owned {
            Some(conn) => {
                self.idle.lock().push(conn);
                self.counters.released.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(TxError::ConnectionRelease {
                resource: resource.name().to_string(),
                message: "connection was not acquired from this provider".to_string(),
            }),
        }
    }
}

/// Host binding for one (resource, thread) pair
#[derive(Clone)]
struct HostBinding {
    connection: SharedConnection,
    transactional: bool,
}

/// In-memory stand-in for a framework-level transaction manager
///
/// Bindings are per thread: a connection bound on one thread is invisible to
/// every other thread.
#[derive(Default)]
pub struct MemoryHostManager {
    bindings: Mutex<HashMap<(ResourceId, ThreadId), HostBinding>>,
    rollback_only: Mutex<Vec<ResourceId>>,
}

impl MemoryHostManager {
    /// Empty host manager
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bind `connection` to `resource` for the calling thread
    pub fn bind(&self, resource: &Resource, connection: SharedConnection, transactional: bool) {
        self.bindings.lock().insert(
            (resource.id(), std::thread::current().id()),
            HostBinding {
                connection,
                transactional,
            },
        );
    }

    /// Remove the calling thread's binding for `resource`
    pub fn unbind(&self, resource: &Resource) -> Option<SharedConnection> {
        self.bindings
            .lock()
            .remove(&(resource.id(), std::thread::current().id()))
            .map(|binding| binding.connection)
    }

    /// Resources the coordinator asked to roll back, in order
    pub fn rollback_only_requests(&self) -> Vec<ResourceId> {
        self.rollback_only.lock().clone()
    }
}

impl HostTransactionManager for MemoryHostManager {
    fn current_managed_connection(&self, resource: &Resource) -> Option<SharedConnection> {
        self.bindings
            .lock()
            .get(&(resource.id(), std::thread::current().id()))
            .map(|binding| Arc::clone(&binding.connection))
    }

    fn is_managed_and_transactional(
        &self,
        connection: &SharedConnection,
        resource: &Resource,
    ) -> bool {
        self.bindings
            .lock()
            .get(&(resource.id(), std::thread::current().id()))
            .map(|binding| binding.transactional && same_connection(&binding.connection, connection))
            .unwrap_or(false)
    }

    fn set_rollback_only(&self, resource: &Resource) -> TxResult<()> {
        self.rollback_only.lock().push(resource.id());
        Ok(())
    }
}
