//! Collaborator traits at the coordinator boundary
//!
//! The coordinator never talks to a database driver directly. It borrows
//! connections through these traits:
//! - [`Connection`]: the physical connection operations the state machine needs
//! - [`ConnectionProvider`]: acquire/release pair for one named resource
//! - [`HostTransactionManager`]: optional framework that may already own a
//!   transactional connection for the current thread
//!
//! Thread safety: providers and host managers are shared across threads and
//! must be `Send + Sync`. Connections only need `Send`; they are always used
//! behind a mutex by exactly one transaction at a time.

use crate::error::TxResult;
use crate::types::{IsolationLevel, ResourceId};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Physical connection operations used by the transaction state machine
///
/// No `close` here: only the owning transaction hands the connection back,
/// through [`ConnectionProvider::release`].
pub trait Connection: Send {
    /// Commit the current physical transaction
    fn commit(&mut self) -> TxResult<()>;

    /// Roll back the current physical transaction
    fn rollback(&mut self) -> TxResult<()>;

    /// Current auto-commit mode
    fn auto_commit(&self) -> TxResult<bool>;

    /// Change auto-commit mode
    fn set_auto_commit(&mut self, auto_commit: bool) -> TxResult<()>;

    /// Current isolation level
    fn isolation_level(&self) -> TxResult<IsolationLevel>;

    /// Change isolation level
    fn set_isolation_level(&mut self, level: IsolationLevel) -> TxResult<()>;
}

/// A connection shared between its provider and the owning transaction
pub type SharedConnection = Arc<Mutex<dyn Connection>>;

/// True if both handles point at the same physical connection
pub fn same_connection(a: &SharedConnection, b: &SharedConnection) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Supplies and reclaims physical connections
///
/// Typically backed by a pool. Must be safe to call from any thread.
pub trait ConnectionProvider: Send + Sync {
    /// Hand out a connection for `resource`
    ///
    /// # Errors
    ///
    /// Returns `ConnectionAcquisition` if no connection can be supplied.
    fn acquire(&self, resource: &Resource) -> TxResult<SharedConnection>;

    /// Take back a connection previously returned by `acquire`
    ///
    /// # Errors
    ///
    /// Returns `ConnectionRelease` if the connection cannot be returned.
    fn release(&self, connection: SharedConnection, resource: &Resource) -> TxResult<()>;
}

/// An external, framework-level transaction manager
///
/// All queries are implicitly about the calling thread.
pub trait HostTransactionManager: Send + Sync {
    /// The connection the host currently manages for `resource`, if any
    fn current_managed_connection(&self, resource: &Resource) -> Option<SharedConnection>;

    /// True if `connection` is managed by the host and inside a host transaction
    fn is_managed_and_transactional(
        &self,
        connection: &SharedConnection,
        resource: &Resource,
    ) -> bool;

    /// True if the host has an active transaction for `resource`
    fn has_active_transaction(&self, resource: &Resource) -> bool {
        self.current_managed_connection(resource)
            .map(|conn| self.is_managed_and_transactional(&conn, resource))
            .unwrap_or(false)
    }

    /// Ask the host to roll back its transaction when its boundary ends
    fn set_rollback_only(&self, _resource: &Resource) -> TxResult<()> {
        Ok(())
    }
}

/// Handle to a resource registered with a coordinator
///
/// Cheap to clone. Carries the minted [`ResourceId`] used in registry keys,
/// a display name, and the provider connections are borrowed from.
#[derive(Clone)]
pub struct Resource {
    id: ResourceId,
    name: Arc<str>,
    provider: Arc<dyn ConnectionProvider>,
}

impl Resource {
    /// Create a handle with a freshly minted id
    pub fn new(name: impl AsRef<str>, provider: Arc<dyn ConnectionProvider>) -> Self {
        Self {
            id: ResourceId::mint(),
            name: Arc::from(name.as_ref()),
            provider,
        }
    }

    /// Minted token
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Provider connections are borrowed from
    pub fn provider(&self) -> &Arc<dyn ConnectionProvider> {
        &self.provider
    }

    /// Acquire a connection from this resource's provider
    pub fn acquire(&self) -> TxResult<SharedConnection> {
        self.provider.acquire(self)
    }

    /// Return a connection to this resource's provider
    pub fn release(&self, connection: SharedConnection) -> TxResult<()> {
        self.provider.release(connection, self)
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Resource {}
