//! Concurrency layer for txscope
//!
//! This crate implements the reentrant transaction object and the state it is
//! registered in:
//! - Transaction: reference-counted wrapper around one physical connection
//! - TransactionRegistry: process-wide map from context key to transaction
//! - HostSuppression: thread-scoped switch that hides host-managed transactions
//!
//! Each transaction is created, mutated and finished on one thread. The
//! registry key embeds the thread id, so two threads never address the same
//! transaction object.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod registry;
pub mod suppression;
pub mod transaction;

pub use registry::TransactionRegistry;
pub use suppression::{HostSuppression, SuppressionGuard};
pub use transaction::{ConnectionOrigin, EndKind, EndOutcome, Transaction};
