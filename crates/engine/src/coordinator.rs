//! Transaction coordinator: the propagation API
//!
//! The TransactionCoordinator is the only surface application code and DAO
//! layers call. It resolves the calling thread's context key, reuses or
//! creates the [`Transaction`] for that key, and hands out one
//! [`TransactionScope`] per begin.
//!
//! ## Begin
//!
//! ```text
//! 1. Validate the resource handle (must be registered here)
//! 2. Resolve ContextKey(resource, current thread, creator tag)
//! 3. Registry hit: nested begin on the existing transaction
//! 4. Registry miss:
//!    a. Host manager has a transactional connection (and not suppressed): borrow it
//!    b. Otherwise acquire one from the resource's provider
//!    c. Open the transaction, begin, register
//! ```
//!
//! # Memory Ordering
//!
//! The metric counters use Relaxed ordering; they are purely observational
//! and synchronize nothing else.

use crate::config::CoordinatorConfig;
use crate::scope::TransactionScope;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};
use txscope_concurrency::{
    ConnectionOrigin, EndOutcome, HostSuppression, Transaction, TransactionRegistry,
};
use txscope_core::{
    ConnectionProvider, ContextKey, CreatorTag, HostTransactionManager, IsolationLevel, Resource,
    ResourceId, SharedConnection, TransactionStatus, TxError, TxResult,
};

/// Lifecycle counters shared by a coordinator and its scopes
#[derive(Debug, Default)]
pub struct CoordinatorMetrics {
    created: AtomicU64,
    reused: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    failed: AtomicU64,
}

impl CoordinatorMetrics {
    fn record_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    fn record_reused(&self) {
        self.reused.fetch_add(1, Ordering::Relaxed);
    }

    /// Count the physical outcome of an end call
    ///
    /// `status` is the transaction's status after the call. Errors raised
    /// after the physical step (reset or release) are counted by that status,
    /// so a commit whose release failed still counts as committed.
    pub(crate) fn record_end(&self, result: &TxResult<EndOutcome>, status: TransactionStatus) {
        let counter = match result {
            Ok(EndOutcome::Committed) => &self.committed,
            Ok(EndOutcome::RolledBack { .. }) => &self.rolled_back,
            Ok(EndOutcome::Nested { .. }) | Ok(EndOutcome::Ignored) => return,
            Err(TxError::CommitFailed { .. }) => &self.failed,
            Err(e) if e.is_database_error() => match status {
                TransactionStatus::Committed => &self.committed,
                TransactionStatus::RolledBack => &self.rolled_back,
                TransactionStatus::FailedCommit | TransactionStatus::FailedRollback => &self.failed,
                TransactionStatus::Active | TransactionStatus::MarkedRollback => return,
            },
            Err(_) => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TransactionMetrics {
        TransactionMetrics {
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a coordinator's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransactionMetrics {
    /// Transactions created (outermost begins)
    pub created: u64,
    /// Nested begins that joined an active transaction
    pub reused: u64,
    /// Physical commits
    pub committed: u64,
    /// Physical rollbacks, forced ones included
    pub rolled_back: u64,
    /// End calls that failed with a database error
    pub failed: u64,
}

impl TransactionMetrics {
    /// Created transactions that have not reached an outcome
    pub fn active(&self) -> u64 {
        self.created
            .saturating_sub(self.committed + self.rolled_back + self.failed)
    }
}

/// Reentrant, thread-scoped transaction coordinator
pub struct TransactionCoordinator {
    registry: Arc<TransactionRegistry>,
    resources: DashMap<ResourceId, Resource>,
    host: Option<Arc<dyn HostTransactionManager>>,
    suppression: HostSuppression,
    creator: CreatorTag,
    config: CoordinatorConfig,
    metrics: Arc<CoordinatorMetrics>,
}

impl TransactionCoordinator {
    /// Coordinator with default configuration on the process-wide registry
    pub fn new() -> Self {
        let config = CoordinatorConfig::default();
        Self {
            registry: TransactionRegistry::global(),
            resources: DashMap::new(),
            host: None,
            suppression: HostSuppression::new(),
            creator: config.creator(),
            config,
            metrics: Arc::new(CoordinatorMetrics::default()),
        }
    }

    /// Coordinator with an explicit configuration
    ///
    /// # Errors
    ///
    /// Returns a config error if `config` fails validation.
    pub fn with_config(config: CoordinatorConfig) -> TxResult<Self> {
        config.validate()?;
        let mut coordinator = Self::new();
        coordinator.creator = config.creator();
        coordinator.config = config;
        Ok(coordinator)
    }

    /// Use `registry` instead of the process-wide one
    pub fn with_registry(mut self, registry: Arc<TransactionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Defer to `host` when it already manages a transaction
    pub fn with_host_manager(mut self, host: Arc<dyn HostTransactionManager>) -> Self {
        self.host = Some(host);
        self
    }

    /// Active configuration
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Propagation domain of this coordinator
    pub fn creator_tag(&self) -> &CreatorTag {
        &self.creator
    }

    /// Registry this coordinator registers transactions in
    pub fn registry(&self) -> &Arc<TransactionRegistry> {
        &self.registry
    }

    /// Current counters
    pub fn metrics(&self) -> TransactionMetrics {
        self.metrics.snapshot()
    }

    // =========================================================================
    // Resources
    // =========================================================================

    /// Register a resource and mint its handle
    pub fn register_resource(
        &self,
        name: impl AsRef<str>,
        provider: Arc<dyn ConnectionProvider>,
    ) -> Resource {
        let resource = Resource::new(name, provider);
        self.resources.insert(resource.id(), resource.clone());
        debug!(target: "txscope::txn", resource = resource.name(), id = %resource.id(),
            "Resource registered");
        resource
    }

    /// Handle for a registered resource id
    pub fn resource(&self, id: ResourceId) -> Option<Resource> {
        self.resources.get(&id).map(|entry| entry.value().clone())
    }

    /// Registry slot for `resource` on the calling thread
    pub fn context_key(&self, resource: &Resource) -> ContextKey {
        ContextKey::for_current_thread(resource.id(), self.creator.clone())
    }

    /// Transaction this coordinator has active for `resource` on the calling thread
    pub fn current_transaction(&self, resource: &Resource) -> Option<Arc<Transaction>> {
        self.registry.lookup(&self.context_key(resource))
    }

    fn validate(&self, resource: &Resource) -> TxResult<()> {
        if self.resources.contains_key(&resource.id()) {
            Ok(())
        } else {
            Err(TxError::invalid_argument(format!(
                "resource '{}' ({}) is not registered with this coordinator",
                resource.name(),
                resource.id()
            )))
        }
    }

    // =========================================================================
    // Begin
    // =========================================================================

    /// Begin with the configured default isolation level
    ///
    /// # Errors
    ///
    /// See [`TransactionCoordinator::begin`].
    pub fn begin_default(&self, resource: &Resource) -> TxResult<TransactionScope> {
        self.begin(resource, IsolationLevel::Default, false)
    }

    /// Begin a (possibly nested) transaction on `resource`
    ///
    /// Joins the calling thread's active transaction for `resource` if there
    /// is one; otherwise opens a new one, borrowing the host manager's
    /// connection when it already runs a transaction.
    ///
    /// `isolation` applies to this scope only and is undone when the scope
    /// ends. A nested `Default` keeps the enclosing scope's level; an
    /// outermost `Default` falls back to the configured default isolation.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if `resource` is not registered here
    /// - `ConnectionAcquisition` if the provider has no connection
    /// - a database error if the connection cannot be configured
    pub fn begin(
        &self,
        resource: &Resource,
        isolation: IsolationLevel,
        for_update_only: bool,
    ) -> TxResult<TransactionScope> {
        self.validate(resource)?;
        let key = self.context_key(resource);

        if let Some(txn) = self.registry.lookup(&key) {
            txn.begin(isolation, for_update_only)?;
            self.metrics.record_reused();
            debug!(target: "txscope::txn", instance_id = %txn.instance_id(), status = %txn.status(),
                ref_count = txn.ref_count(), "Transaction reused");
            return Ok(TransactionScope::new(txn, Arc::clone(&self.metrics), true));
        }

        let isolation = if isolation.is_default() {
            self.config.default_isolation
        } else {
            isolation
        };
        let (connection, origin) = self.obtain_connection(resource)?;
        let txn = Transaction::open(
            key.clone(),
            resource.clone(),
            connection,
            origin,
            Arc::clone(&self.registry),
            self.config.strict_end_calls,
        )?;

        if let Err(e) = txn.begin(isolation, for_update_only) {
            self.discard(&txn);
            return Err(e);
        }
        if let Err(occupant) = self.registry.insert_if_vacant(key, Arc::clone(&txn)) {
            error!(target: "txscope::txn", instance_id = %txn.instance_id(),
                occupant = %occupant.instance_id(), "Registry slot taken during begin");
            self.discard(&txn);
            return Err(TxError::invalid_state(
                occupant.instance_id().clone(),
                occupant.status(),
                "register over",
            ));
        }

        self.metrics.record_created();
        Ok(TransactionScope::new(txn, Arc::clone(&self.metrics), false))
    }

    fn obtain_connection(
        &self,
        resource: &Resource,
    ) -> TxResult<(SharedConnection, ConnectionOrigin)> {
        if let Some(host) = self.active_host() {
            if let Some(connection) = host.current_managed_connection(resource) {
                if host.is_managed_and_transactional(&connection, resource) {
                    debug!(target: "txscope::txn", resource = resource.name(),
                        "Borrowing host-managed connection");
                    return Ok((connection, ConnectionOrigin::Host(Arc::clone(host))));
                }
            }
        }
        Ok((resource.acquire()?, ConnectionOrigin::Owned))
    }

    /// Host manager, unless interop is off or suppressed on this thread
    fn active_host(&self) -> Option<&Arc<dyn HostTransactionManager>> {
        if !self.config.host_interop || self.suppression.is_suppressed() {
            return None;
        }
        self.host.as_ref()
    }

    fn discard(&self, txn: &Arc<Transaction>) {
        if let Err(e) = txn.abandon() {
            warn!(target: "txscope::txn", instance_id = %txn.instance_id(), error = %e,
                "Failed to discard transaction after failed begin");
        }
    }

    // =========================================================================
    // Scoped helpers
    // =========================================================================

    /// Run `action` inside a transaction on `resource`
    ///
    /// # Errors
    ///
    /// See [`TransactionCoordinator::call_in_transaction_with`].
    pub fn run_in_transaction(
        &self,
        resource: &Resource,
        action: impl FnOnce(&TransactionScope) -> TxResult<()>,
    ) -> TxResult<()> {
        self.call_in_transaction(resource, action)
    }

    /// Call `action` inside a transaction on `resource` and return its value
    ///
    /// # Errors
    ///
    /// See [`TransactionCoordinator::call_in_transaction_with`].
    pub fn call_in_transaction<R>(
        &self,
        resource: &Resource,
        action: impl FnOnce(&TransactionScope) -> TxResult<R>,
    ) -> TxResult<R> {
        self.call_in_transaction_with(resource, IsolationLevel::Default, false, action)
    }

    /// Call `action` inside a transaction with explicit scope settings
    ///
    /// Begins, runs `action`, commits if it returned `Ok`, and always runs the
    /// defensive rollback afterwards, so an `Err` (or a panic) rolls the scope
    /// back.
    ///
    /// # Errors
    ///
    /// Returns the begin or commit error, or `action`'s error. If the rollback
    /// after a failed action also fails, the action's error is returned and
    /// the rollback failure is logged.
    pub fn call_in_transaction_with<R>(
        &self,
        resource: &Resource,
        isolation: IsolationLevel,
        for_update_only: bool,
        action: impl FnOnce(&TransactionScope) -> TxResult<R>,
    ) -> TxResult<R> {
        let mut scope = self.begin(resource, isolation, for_update_only)?;
        match action(&scope) {
            Ok(value) => {
                let committed = scope.commit();
                let cleanup = scope.rollback_if_not_committed();
                committed?;
                cleanup?;
                Ok(value)
            }
            Err(action_err) => {
                if let Err(e) = scope.rollback_if_not_committed() {
                    error!(target: "txscope::txn", instance_id = %scope.instance_id(), error = %e,
                        action_error = %action_err, "Rollback after failed action failed");
                }
                Err(action_err)
            }
        }
    }

    // =========================================================================
    // Outside the current transaction
    // =========================================================================

    /// Run `action` with no transaction in effect for `resource`
    ///
    /// # Errors
    ///
    /// See [`TransactionCoordinator::call_not_in_started_transaction`].
    pub fn run_not_in_started_transaction(
        &self,
        resource: &Resource,
        action: impl FnOnce() -> TxResult<()>,
    ) -> TxResult<()> {
        self.call_not_in_started_transaction(resource, action)
    }

    /// Call `action` with no transaction in effect for `resource`
    ///
    /// Host detection is suppressed on the calling thread while `action` runs,
    /// so begins inside it acquire fresh connections. If this coordinator has
    /// an active transaction for `resource`, `action` runs outside it and the
    /// transaction is restored afterwards.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if `resource` is not registered here
    /// - `TransactionLeaked` if `action` began a transaction and left it open
    /// - otherwise whatever `action` returns
    pub fn call_not_in_started_transaction<R>(
        &self,
        resource: &Resource,
        action: impl FnOnce() -> TxResult<R>,
    ) -> TxResult<R> {
        self.validate(resource)?;
        let _suppressed = self.suppression.suppress();
        match self.current_transaction(resource) {
            Some(txn) => txn.call_not_in_me(action),
            None => action(),
        }
    }

    /// True if a transaction is active for `resource` on the calling thread
    ///
    /// Counts this coordinator's transactions and, unless host interop is off
    /// or suppressed, the host manager's.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `resource` is not registered here.
    pub fn is_in_transaction(&self, resource: &Resource) -> TxResult<bool> {
        self.validate(resource)?;
        if self.current_transaction(resource).is_some() {
            return Ok(true);
        }
        Ok(self
            .active_host()
            .map(|host| host.has_active_transaction(resource))
            .unwrap_or(false))
    }
}

impl Default for TransactionCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("creator", &self.creator)
            .field("resources", &self.resources.len())
            .field("host", &self.host.is_some())
            .field("config", &self.config)
            .finish()
    }
}
