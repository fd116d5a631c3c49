//! Transaction lifecycle status
//!
//! State transitions:
//! - `Active` → `MarkedRollback` (a nested participant rolled back)
//! - `Active` → `Committed` (outermost commit succeeded)
//! - `Active` → `FailedCommit` (outermost commit failed)
//! - `Active` / `MarkedRollback` / `FailedCommit` → `RolledBack` or `FailedRollback`
//!
//! Terminal states (no transitions allowed):
//! - `Committed`
//! - `RolledBack`
//! - `FailedRollback`
//!
//! `FailedCommit` is terminal for commit purposes but still admits the
//! automatic rollback that follows it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a transaction in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Transaction is open and may still commit
    Active,
    /// A nested scope rolled back; the outermost end will roll back
    MarkedRollback,
    /// Physical commit succeeded
    Committed,
    /// Physical rollback succeeded
    RolledBack,
    /// Physical commit failed
    FailedCommit,
    /// Physical rollback failed
    FailedRollback,
}

impl TransactionStatus {
    /// True once the outermost end has run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Committed
                | TransactionStatus::RolledBack
                | TransactionStatus::FailedCommit
                | TransactionStatus::FailedRollback
        )
    }

    /// True while begin/commit/rollback calls are accepted
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Active | TransactionStatus::MarkedRollback
        )
    }

    /// True if the outermost end must roll back instead of committing
    pub fn is_rollback_only(&self) -> bool {
        matches!(self, TransactionStatus::MarkedRollback)
    }

    /// Forward-only transition table
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        match (self, next) {
            (Active, MarkedRollback | Committed | FailedCommit | RolledBack | FailedRollback) => {
                true
            }
            (MarkedRollback, MarkedRollback | RolledBack | FailedRollback) => true,
            (FailedCommit, RolledBack | FailedRollback) => true,
            _ => false,
        }
    }

    /// Upper-case display name
    pub fn name(&self) -> &'static str {
        match self {
            TransactionStatus::Active => "ACTIVE",
            TransactionStatus::MarkedRollback => "MARKED_ROLLBACK",
            TransactionStatus::Committed => "COMMITTED",
            TransactionStatus::RolledBack => "ROLLED_BACK",
            TransactionStatus::FailedCommit => "FAILED_COMMIT",
            TransactionStatus::FailedRollback => "FAILED_ROLLBACK",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
