//! Propagation layer for txscope
//!
//! This crate is what application code and DAO layers talk to:
//! - TransactionCoordinator: begin/commit/rollback with thread-scoped reuse
//! - TransactionScope: one handle per begin, rolled back if dropped open
//! - CoordinatorConfig: `txscope.toml` settings
//!
//! The coordinator is the only component that knows about:
//! - Registered resources and their providers
//! - The host transaction manager and its per-thread suppression
//! - Transaction lifecycle metrics

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod coordinator;
pub mod scope;

pub use config::{CoordinatorConfig, CONFIG_FILE_NAME};
pub use coordinator::{CoordinatorMetrics, TransactionCoordinator, TransactionMetrics};
pub use scope::{ScopeState, TransactionScope};
