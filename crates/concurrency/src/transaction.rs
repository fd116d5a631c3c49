//! Reentrant, reference-counted transaction
//!
//! A [`Transaction`] wraps one physical connection for the lifetime of one or
//! more nested logical transactions on one thread. Every `begin` increments
//! the reference count and pushes a scope frame; every `commit`/`rollback`
//! decrements it and pops the frame. Only the end call that brings the count
//! to zero touches the physical transaction.
//!
//! ## Lifecycle
//!
//! ```text
//! open() ──► begin() ──► [nested begin/commit/rollback]* ──► outermost end
//!                                                              │
//!            ACTIVE ──commit──► COMMITTED                      │
//!            ACTIVE ──commit fails──► FAILED_COMMIT ──► ROLLED_BACK | FAILED_ROLLBACK
//!            ACTIVE | MARKED_ROLLBACK ──rollback──► ROLLED_BACK | FAILED_ROLLBACK
//!            MARKED_ROLLBACK ──commit──► (forced) ROLLED_BACK | FAILED_ROLLBACK
//! ```
//!
//! After the outermost end the connection is reset (auto-commit and isolation
//! restored to the values captured by `open`), released to its provider if
//! this transaction owns it, and the transaction is removed from the registry.
//!
//! ## Locking
//!
//! `ref_count` is only mutated while holding the `state` lock. The separate
//! `detach` lock serializes [`Transaction::call_not_in_me`].

use crate::registry::TransactionRegistry;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use txscope_core::{
    Connection, ContextKey, HostTransactionManager, InstanceId, IsolationLevel, Resource,
    SharedConnection, TransactionStatus, TxError, TxResult,
};

/// Where the physical connection came from
#[derive(Clone)]
pub enum ConnectionOrigin {
    /// Acquired from the resource's provider; released on finish
    Owned,
    /// Borrowed from a host-managed transaction; the host owns the boundary
    Host(Arc<dyn HostTransactionManager>),
}

impl ConnectionOrigin {
    fn is_owned(&self) -> bool {
        matches!(self, ConnectionOrigin::Owned)
    }
}

impl fmt::Debug for ConnectionOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionOrigin::Owned => f.write_str("Owned"),
            ConnectionOrigin::Host(_) => f.write_str("Host"),
        }
    }
}

/// Which end call is being made
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndKind {
    /// Matching commit
    Commit,
    /// Matching rollback
    Rollback,
}

impl EndKind {
    fn operation(&self) -> &'static str {
        match self {
            EndKind::Commit => "commit",
            EndKind::Rollback => "rollback",
        }
    }
}

/// Result of one end call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOutcome {
    /// A nested scope ended; `remaining` begins are still open
    Nested {
        /// Outstanding begins after this end
        remaining: i64,
    },
    /// Outermost end; the physical transaction committed
    Committed,
    /// Outermost end; the physical transaction rolled back
    RolledBack {
        /// True if a commit was turned into a rollback by a nested rollback
        forced: bool,
    },
    /// More ends than begins; the call was ignored
    Ignored,
}

impl EndOutcome {
    /// True if this call finished the transaction
    pub fn is_final(&self) -> bool {
        matches!(self, EndOutcome::Committed | EndOutcome::RolledBack { .. })
    }
}

/// Overrides saved by one nested begin
#[derive(Debug, Clone, Copy)]
struct ScopeFrame {
    previous_isolation: IsolationLevel,
    previous_for_update_only: bool,
}

/// Mutable part of a transaction, guarded by `Transaction::state`
struct TxState {
    connection: Option<SharedConnection>,
    origin: ConnectionOrigin,
    original_auto_commit: bool,
    original_isolation: IsolationLevel,
    current_isolation: IsolationLevel,
    for_update_only: bool,
    status: TransactionStatus,
    frames: Vec<ScopeFrame>,
}

/// One physical transaction shared by every nested scope on one context key
pub struct Transaction {
    instance_id: InstanceId,
    resource: Resource,
    registry: Arc<TransactionRegistry>,
    ref_count: AtomicI64,
    state: Mutex<TxState>,
    detach: Mutex<()>,
    strict_end_calls: bool,
}

impl Transaction {
    /// Wrap `connection` in a new transaction for `key`
    ///
    /// Captures the connection's auto-commit mode and isolation level, then
    /// switches an owned connection to manual commit. The transaction starts
    /// with a reference count of zero and is not registered; call
    /// [`Transaction::begin`] and register it.
    ///
    /// If `strict_end_calls` is set, end calls without a matching begin are
    /// rejected instead of logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns a database error if the connection cannot be inspected or
    /// configured. An owned connection is released before returning.
    pub fn open(
        key: ContextKey,
        resource: Resource,
        connection: SharedConnection,
        origin: ConnectionOrigin,
        registry: Arc<TransactionRegistry>,
        strict_end_calls: bool,
    ) -> TxResult<Arc<Self>> {
        let captured = {
            let mut conn = connection.lock();
            capture_and_prepare(&mut *conn, origin.is_owned())
        };
        let (original_auto_commit, original_isolation) = match captured {
            Ok(values) => values,
            Err(e) => {
                if origin.is_owned() {
                    if let Err(release_err) = resource.release(connection) {
                        warn!(target: "txscope::txn", resource = resource.name(), error = %release_err,
                            "Failed to release connection after open failure");
                    }
                }
                return Err(e);
            }
        };

        let instance_id = InstanceId::allocate(key);
        debug!(target: "txscope::txn", instance_id = %instance_id,
            status = %TransactionStatus::Active, origin = ?origin,
            auto_commit = original_auto_commit, isolation = %original_isolation,
            "Transaction created");

        Ok(Arc::new(Self {
            instance_id,
            resource,
            registry,
            ref_count: AtomicI64::new(0),
            state: Mutex::new(TxState {
                connection: Some(connection),
                origin,
                original_auto_commit,
                original_isolation,
                current_isolation: original_isolation,
                for_update_only: false,
                status: TransactionStatus::Active,
                frames: Vec::new(),
            }),
            detach: Mutex::new(()),
            strict_end_calls,
        }))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Globally unique identity
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Registry slot
    pub fn context_key(&self) -> &ContextKey {
        self.instance_id.context_key()
    }

    /// Resource the connection belongs to
    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    /// Current status
    pub fn status(&self) -> TransactionStatus {
        self.state.lock().status
    }

    /// Outstanding begins
    pub fn ref_count(&self) -> i64 {
        self.ref_count.load(Ordering::SeqCst)
    }

    /// Isolation level in force for the innermost open scope
    pub fn isolation_level(&self) -> IsolationLevel {
        self.state.lock().current_isolation
    }

    /// For-update-only hint of the innermost open scope
    pub fn is_for_update_only(&self) -> bool {
        self.state.lock().for_update_only
    }

    /// Auto-commit mode captured at creation
    pub fn original_auto_commit(&self) -> bool {
        self.state.lock().original_auto_commit
    }

    /// Isolation level captured at creation
    pub fn original_isolation(&self) -> IsolationLevel {
        self.state.lock().original_isolation
    }

    /// True if finishing returns the connection to the provider
    pub fn close_connection_on_finish(&self) -> bool {
        self.state.lock().origin.is_owned()
    }

    /// Run `f` against the physical connection
    ///
    /// The connection is locked for the duration of `f`; `f` must not begin
    /// or end transactions on the same resource.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` once the transaction has finished, or whatever
    /// `f` returns.
    pub fn with_connection<R>(
        &self,
        f: impl FnOnce(&mut dyn Connection) -> TxResult<R>,
    ) -> TxResult<R> {
        let connection = {
            let state = self.state.lock();
            match &state.connection {
                Some(conn) if !state.status.is_terminal() => Arc::clone(conn),
                _ => {
                    return Err(TxError::invalid_state(
                        self.instance_id.clone(),
                        state.status,
                        "use connection of",
                    ))
                }
            }
        };
        let mut conn = connection.lock();
        f(&mut *conn)
    }

    // =========================================================================
    // Begin / end
    // =========================================================================

    /// Open one more nested scope
    ///
    /// Pushes the current isolation level and for-update-only flag, then applies
    /// `isolation` to the connection unless it is `Default`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the transaction has finished, or a database
    /// error if the isolation level cannot be applied (the scope is not opened).
    pub fn begin(&self, isolation: IsolationLevel, for_update_only: bool) -> TxResult<()> {
        let mut state = self.state.lock();
        if !state.status.is_open() {
            return Err(TxError::invalid_state(
                self.instance_id.clone(),
                state.status,
                "begin",
            ));
        }

        let frame = ScopeFrame {
            previous_isolation: state.current_isolation,
            previous_for_update_only: state.for_update_only,
        };
        if !isolation.is_default() && isolation != state.current_isolation {
            if let Some(conn) = &state.connection {
                conn.lock().set_isolation_level(isolation)?;
            }
            state.current_isolation = isolation;
        }
        state.for_update_only = for_update_only;
        state.frames.push(frame);
        let count = self.ref_count.fetch_add(1, Ordering::SeqCst) + 1;

        debug!(target: "txscope::txn", instance_id = %self.instance_id, status = %state.status,
            ref_count = count, isolation = %state.current_isolation, for_update_only,
            "Transaction scope opened");
        Ok(())
    }

    /// End one scope with a commit
    ///
    /// # Errors
    ///
    /// See [`Transaction::end`].
    pub fn commit(&self) -> TxResult<EndOutcome> {
        self.end(EndKind::Commit)
    }

    /// End one scope with a rollback
    ///
    /// # Errors
    ///
    /// See [`Transaction::end`].
    pub fn rollback(&self) -> TxResult<EndOutcome> {
        self.end(EndKind::Rollback)
    }

    /// End one scope
    ///
    /// Nested ends only pop the scope frame; a nested rollback also marks the
    /// transaction rollback-only. The outermost end performs the physical
    /// commit or rollback, resets and releases the connection, and removes the
    /// transaction from the registry.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if the transaction already finished, or if there is no
    ///   matching begin and strict end calls are enabled
    /// - `CommitFailed` if the physical commit failed (the rollback already ran)
    /// - a database error if the rollback, the isolation restore or the release failed
    pub fn end(&self, kind: EndKind) -> TxResult<EndOutcome> {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return Err(TxError::invalid_state(
                self.instance_id.clone(),
                state.status,
                kind.operation(),
            ));
        }

        if self.ref_count.load(Ordering::SeqCst) <= 0 {
            if self.strict_end_calls {
                return Err(TxError::invalid_state(
                    self.instance_id.clone(),
                    state.status,
                    kind.operation(),
                ));
            }
            warn!(target: "txscope::txn", instance_id = %self.instance_id, status = %state.status,
                operation = kind.operation(), "End call without matching begin ignored");
            return Ok(EndOutcome::Ignored);
        }

        let remaining = self.ref_count.fetch_sub(1, Ordering::SeqCst) - 1;
        let frame = state.frames.pop();

        if remaining > 0 {
            if kind == EndKind::Rollback && state.status == TransactionStatus::Active {
                self.transition(&mut state, TransactionStatus::MarkedRollback);
            }
            let restored = match frame {
                Some(frame) => self.restore_frame(&mut state, frame),
                None => Ok(()),
            };
            debug!(target: "txscope::txn", instance_id = %self.instance_id, status = %state.status,
                ref_count = remaining, operation = kind.operation(), "Nested scope ended");
            restored?;
            return Ok(EndOutcome::Nested { remaining });
        }

        match (kind, state.status) {
            (EndKind::Commit, TransactionStatus::Active) => self.finish_commit(&mut state),
            (EndKind::Commit, _) => {
                warn!(target: "txscope::txn", instance_id = %self.instance_id, status = %state.status,
                    "Commit of rollback-only transaction forced to rollback");
                self.finish_rollback(&mut state)?;
                Ok(EndOutcome::RolledBack { forced: true })
            }
            (EndKind::Rollback, _) => {
                self.finish_rollback(&mut state)?;
                Ok(EndOutcome::RolledBack { forced: false })
            }
        }
    }

    /// Roll back and release regardless of outstanding begins
    ///
    /// Used when a transaction was leaked past its owner. Does nothing if the
    /// transaction already finished.
    ///
    /// # Errors
    ///
    /// Returns a database error if the rollback or the release failed.
    pub fn abandon(&self) -> TxResult<()> {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return Ok(());
        }
        let outstanding = self.ref_count.swap(0, Ordering::SeqCst);
        warn!(target: "txscope::txn", instance_id = %self.instance_id, status = %state.status,
            ref_count = outstanding, "Abandoning transaction");
        self.finish_rollback(&mut state)
    }

    // =========================================================================
    // Run outside
    // =========================================================================

    /// Run `action` with this transaction temporarily unregistered
    ///
    /// See [`Transaction::call_not_in_me`].
    ///
    /// # Errors
    ///
    /// See [`Transaction::call_not_in_me`].
    pub fn run_not_in_me(self: &Arc<Self>, action: impl FnOnce() -> TxResult<()>) -> TxResult<()> {
        self.call_not_in_me(action)
    }

    /// Run `action` with this transaction temporarily unregistered
    ///
    /// While `action` runs, a begin on the same resource and thread creates a
    /// fresh, unrelated transaction. Afterwards this transaction is put back
    /// into its slot, also when `action` panics.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if the transaction is finished, not registered, or
    ///   already running an action outside itself
    /// - `TransactionLeaked` if `action` left another transaction registered
    ///   in the slot. The leaked transaction is rolled back and this one is
    ///   restored; the error replaces the action's own result.
    /// - otherwise whatever `action` returns
    pub fn call_not_in_me<R>(self: &Arc<Self>, action: impl FnOnce() -> TxResult<R>) -> TxResult<R> {
        let _detached = match self.detach.try_lock() {
            Some(guard) => guard,
            None => {
                return Err(TxError::invalid_state(
                    self.instance_id.clone(),
                    self.status(),
                    "run outside (already detached)",
                ))
            }
        };

        {
            let state = self.state.lock();
            if !state.status.is_open() {
                return Err(TxError::invalid_state(
                    self.instance_id.clone(),
                    state.status,
                    "run outside",
                ));
            }
            if !self
                .registry
                .remove_if_instance(self.context_key(), &self.instance_id)
            {
                return Err(TxError::invalid_state(
                    self.instance_id.clone(),
                    state.status,
                    "run outside unregistered",
                ));
            }
        }
        debug!(target: "txscope::txn", instance_id = %self.instance_id, "Transaction detached");

        let mut reattach = Reattach {
            txn: Arc::clone(self),
            armed: true,
        };
        let result = action();
        let restored = reattach.restore();

        match restored {
            Ok(()) => result,
            Err(leak) => {
                if let Err(action_err) = &result {
                    warn!(target: "txscope::txn", instance_id = %self.instance_id, error = %action_err,
                        "Action error superseded by transaction leak");
                }
                Err(leak)
            }
        }
    }

    /// Put this transaction back into its slot after running outside it
    fn reattach(self: &Arc<Self>) -> TxResult<()> {
        // The action may have ended the outer scopes itself
        if !self.status().is_open() {
            debug!(target: "txscope::txn", instance_id = %self.instance_id,
                "Finished while detached, not restored");
            return Ok(());
        }

        let key = self.context_key().clone();
        match self.registry.insert_if_vacant(key.clone(), Arc::clone(self)) {
            Ok(()) => {
                debug!(target: "txscope::txn", instance_id = %self.instance_id, "Transaction restored");
                Ok(())
            }
            Err(leaked) => {
                error!(target: "txscope::txn", instance_id = %self.instance_id,
                    leaked = %leaked.instance_id(), "Transaction opened but not closed while detached");
                self.registry.remove_if_instance(&key, leaked.instance_id());
                if let Err(occupant) = self.registry.insert_if_vacant(key.clone(), Arc::clone(self)) {
                    // Same thread owns the slot; nothing else can have filled it
                    error!(target: "txscope::txn", instance_id = %self.instance_id,
                        occupant = %occupant.instance_id(), "Slot refilled during restore");
                }
                if let Err(e) = leaked.abandon() {
                    error!(target: "txscope::txn", leaked = %leaked.instance_id(), error = %e,
                        "Failed to roll back leaked transaction");
                }
                Err(TxError::TransactionLeaked {
                    context_key: key,
                    leaked: leaked.instance_id().clone(),
                })
            }
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn transition(&self, state: &mut TxState, next: TransactionStatus) {
        if state.status.can_transition_to(next) {
            state.status = next;
        } else {
            error!(target: "txscope::txn", instance_id = %self.instance_id, from = %state.status,
                to = %next, "Illegal status transition refused");
        }
    }

    /// Undo one nested scope's overrides
    fn restore_frame(&self, state: &mut TxState, frame: ScopeFrame) -> TxResult<()> {
        state.for_update_only = frame.previous_for_update_only;
        if frame.previous_isolation == state.current_isolation {
            return Ok(());
        }
        // current_isolation mirrors the physical level
        if let Some(conn) = &state.connection {
            if !frame.previous_isolation.is_default() {
                conn.lock().set_isolation_level(frame.previous_isolation)?;
            }
        }
        state.current_isolation = frame.previous_isolation;
        Ok(())
    }

    fn finish_commit(&self, state: &mut TxState) -> TxResult<EndOutcome> {
        let committed = match (&state.origin, &state.connection) {
            (ConnectionOrigin::Owned, Some(conn)) => conn.lock().commit(),
            _ => Ok(()),
        };

        match committed {
            Ok(()) => {
                self.transition(state, TransactionStatus::Committed);
                info!(target: "txscope::txn", instance_id = %self.instance_id, status = %state.status,
                    "Transaction committed");
                self.release(state)?;
                Ok(EndOutcome::Committed)
            }
            Err(cause) => {
                self.transition(state, TransactionStatus::FailedCommit);
                error!(target: "txscope::txn", instance_id = %self.instance_id, status = %state.status,
                    error = %cause, "Commit failed, rolling back");
                let rollback = self.physical_rollback(state).err();
                if let Err(e) = self.release(state) {
                    error!(target: "txscope::txn", instance_id = %self.instance_id, error = %e,
                        "Cleanup after failed commit failed");
                }
                Err(TxError::CommitFailed {
                    instance_id: self.instance_id.clone(),
                    cause: Box::new(cause),
                    rollback: rollback.map(Box::new),
                })
            }
        }
    }

    fn finish_rollback(&self, state: &mut TxState) -> TxResult<()> {
        let rolled_back = self.physical_rollback(state);
        let released = self.release(state);
        rolled_back.and(released)
    }

    fn physical_rollback(&self, state: &mut TxState) -> TxResult<()> {
        let result = match (&state.origin, &state.connection) {
            (ConnectionOrigin::Owned, Some(conn)) => conn.lock().rollback(),
            (ConnectionOrigin::Host(host), _) => host.set_rollback_only(&self.resource),
            (ConnectionOrigin::Owned, None) => Ok(()),
        };
        match &result {
            Ok(()) => {
                self.transition(state, TransactionStatus::RolledBack);
                info!(target: "txscope::txn", instance_id = %self.instance_id, status = %state.status,
                    "Transaction rolled back");
            }
            Err(e) => {
                self.transition(state, TransactionStatus::FailedRollback);
                error!(target: "txscope::txn", instance_id = %self.instance_id, status = %state.status,
                    error = %e, "Rollback failed");
            }
        }
        result
    }

    /// Reset the connection, hand it back if owned, and leave the registry
    ///
    /// Every step runs even if an earlier one failed; the first error wins.
    fn release(&self, state: &mut TxState) -> TxResult<()> {
        self.registry
            .remove_if_instance(self.context_key(), &self.instance_id);
        state.frames.clear();

        let Some(connection) = state.connection.take() else {
            return Ok(());
        };

        let reset = {
            let mut conn = connection.lock();
            let isolation = if state.current_isolation != state.original_isolation
                && !state.original_isolation.is_default()
            {
                conn.set_isolation_level(state.original_isolation)
            } else {
                Ok(())
            };
            let auto_commit = if state.origin.is_owned() && state.original_auto_commit {
                conn.set_auto_commit(true)
            } else {
                Ok(())
            };
            isolation.and(auto_commit)
        };
        state.current_isolation = state.original_isolation;
        state.for_update_only = false;

        let released = if state.origin.is_owned() {
            self.resource.release(connection)
        } else {
            Ok(())
        };

        if let Err(e) = &reset {
            error!(target: "txscope::txn", instance_id = %self.instance_id, error = %e,
                "Connection reset failed");
        }
        debug!(target: "txscope::txn", instance_id = %self.instance_id, status = %state.status,
            released = state.origin.is_owned(), "Transaction finished");
        reset.and(released)
    }
}

/// Capture the connection's settings and switch an owned one to manual commit
fn capture_and_prepare(
    conn: &mut dyn Connection,
    owned: bool,
) -> TxResult<(bool, IsolationLevel)> {
    let auto_commit = conn.auto_commit()?;
    let isolation = conn.isolation_level()?;
    if owned && auto_commit {
        conn.set_auto_commit(false)?;
    }
    Ok((auto_commit, isolation))
}

/// Re-registers a detached transaction, also on unwind
struct Reattach {
    txn: Arc<Transaction>,
    armed: bool,
}

impl Reattach {
    fn restore(&mut self) -> TxResult<()> {
        self.armed = false;
        self.txn.reattach()
    }
}

impl Drop for Reattach {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.txn.reattach() {
                error!(target: "txscope::txn", instance_id = %self.txn.instance_id, error = %e,
                    "Restore after panic failed");
            }
        }
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.instance_id == other.instance_id
    }
}

impl Eq for Transaction {}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("instance_id", &self.instance_id)
            .field("resource", &self.resource.name())
            .field("ref_count", &self.ref_count())
            .field("status", &self.status())
            .finish()
    }
}
