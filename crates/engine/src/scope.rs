//! Handle for one begin/end pair
//!
//! Every successful `begin` returns a [`TransactionScope`]. The scope must be
//! ended exactly once, with [`TransactionScope::commit`] or
//! [`TransactionScope::rollback`]. [`TransactionScope::rollback_if_not_committed`]
//! is the cleanup half of the usual pattern:
//!
//! ```ignore
//! let mut scope = coordinator.begin_default(&orders)?;
//! let result = do_work(&scope).and_then(|v| scope.commit().map(|_| v));
//! scope.rollback_if_not_committed()?;
//! result
//! ```
//!
//! Once a commit has run for the scope (whether or not it succeeded) the
//! cleanup call does nothing. A scope dropped while still open rolls back.

use crate::coordinator::CoordinatorMetrics;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::warn;
use txscope_concurrency::{EndOutcome, Transaction};
use txscope_core::{Connection, InstanceId, IsolationLevel, TransactionStatus, TxError, TxResult};

/// Where the begin/end pair behind a scope stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    /// Not ended yet
    Open,
    /// A commit ran (successfully or not)
    CommitAttempted,
    /// A rollback ran
    RolledBack,
}

/// One begin on a shared transaction
#[must_use = "a scope rolls back when dropped without commit"]
pub struct TransactionScope {
    txn: Arc<Transaction>,
    metrics: Arc<CoordinatorMetrics>,
    state: ScopeState,
    nested: bool,
    _not_send: PhantomData<*const ()>,
}

impl TransactionScope {
    pub(crate) fn new(txn: Arc<Transaction>, metrics: Arc<CoordinatorMetrics>, nested: bool) -> Self {
        Self {
            txn,
            metrics,
            state: ScopeState::Open,
            nested,
            _not_send: PhantomData,
        }
    }

    /// The shared transaction
    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.txn
    }

    /// Identity of the shared transaction
    pub fn instance_id(&self) -> &InstanceId {
        self.txn.instance_id()
    }

    /// Status of the shared transaction
    pub fn status(&self) -> TransactionStatus {
        self.txn.status()
    }

    /// Where this scope's begin/end pair stands
    pub fn state(&self) -> ScopeState {
        self.state
    }

    /// True if this begin joined an already active transaction
    pub fn is_nested(&self) -> bool {
        self.nested
    }

    /// Isolation level currently in force
    pub fn isolation_level(&self) -> IsolationLevel {
        self.txn.isolation_level()
    }

    /// Run `f` against the transaction's connection
    ///
    /// `f` must not begin or end transactions on the same resource.
    ///
    /// # Errors
    ///
    /// Returns `ScopeEnded` if this scope already ended, otherwise whatever
    /// the transaction or `f` returns.
    pub fn with_connection<R>(
        &self,
        f: impl FnOnce(&mut dyn Connection) -> TxResult<R>,
    ) -> TxResult<R> {
        if self.state != ScopeState::Open {
            return Err(TxError::ScopeEnded {
                operation: "use connection",
            });
        }
        self.txn.with_connection(f)
    }

    /// End this scope with a commit
    ///
    /// Only the outermost scope commits physically. If a nested scope rolled
    /// back earlier, the outermost commit rolls back instead and reports
    /// `EndOutcome::RolledBack { forced: true }` without an error.
    ///
    /// # Errors
    ///
    /// Returns `ScopeEnded` if the scope already ended, or the transaction's error.
    pub fn commit(&mut self) -> TxResult<EndOutcome> {
        if self.state != ScopeState::Open {
            return Err(TxError::ScopeEnded {
                operation: "commit",
            });
        }
        self.state = ScopeState::CommitAttempted;
        let result = self.txn.commit();
        self.metrics.record_end(&result, self.txn.status());
        result
    }

    /// End this scope with a rollback
    ///
    /// A nested rollback marks the shared transaction rollback-only; the
    /// outermost end will then roll back no matter how the other scopes end.
    ///
    /// # Errors
    ///
    /// Returns `ScopeEnded` if the scope already ended, or the transaction's error.
    pub fn rollback(&mut self) -> TxResult<EndOutcome> {
        if self.state != ScopeState::Open {
            return Err(TxError::ScopeEnded {
                operation: "rollback",
            });
        }
        self.state = ScopeState::RolledBack;
        let result = self.txn.rollback();
        self.metrics.record_end(&result, self.txn.status());
        result
    }

    /// Roll back unless this scope already ended
    ///
    /// # Errors
    ///
    /// Returns the rollback's error if a rollback was actually performed.
    pub fn rollback_if_not_committed(&mut self) -> TxResult<()> {
        match self.state {
            ScopeState::Open => self.rollback().map(|_| ()),
            ScopeState::CommitAttempted | ScopeState::RolledBack => Ok(()),
        }
    }

    /// Run `action` outside the shared transaction
    ///
    /// # Errors
    ///
    /// See [`Transaction::call_not_in_me`].
    pub fn call_not_in_me<R>(&self, action: impl FnOnce() -> TxResult<R>) -> TxResult<R> {
        self.txn.call_not_in_me(action)
    }

    /// Run `action` outside the shared transaction
    ///
    /// # Errors
    ///
    /// See [`Transaction::call_not_in_me`].
    pub fn run_not_in_me(&self, action: impl FnOnce() -> TxResult<()>) -> TxResult<()> {
        self.txn.run_not_in_me(action)
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        if self.state == ScopeState::Open {
            if let Err(e) = self.rollback_if_not_committed() {
                warn!(target: "txscope::txn", instance_id = %self.txn.instance_id(), error = %e,
                    "Rollback of dropped scope failed");
            }
        }
    }
}

impl std::fmt::Debug for TransactionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionScope")
            .field("instance_id", self.txn.instance_id())
            .field("state", &self.state)
            .field("nested", &self.nested)
            .finish()
    }
}
