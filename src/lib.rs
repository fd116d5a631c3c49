//! txscope - reentrant, thread-scoped database transactions
//!
//! Code that needs a transaction asks the coordinator for one. If the calling
//! thread already has one open for the same resource, it is reused and only
//! the outermost end call commits or rolls back physically.
//!
//! # Quick Start
//!
//! ```
//! use txscope::memory::MemoryConnectionProvider;
//! use txscope::TransactionCoordinator;
//!
//! let coordinator = TransactionCoordinator::new();
//! let provider = MemoryConnectionProvider::new();
//! let orders = coordinator.register_resource("orders", provider.clone());
//!
//! coordinator.run_in_transaction(&orders, |_scope| {
//!     // Nested calls on this thread join the same transaction
//!     coordinator.run_in_transaction(&orders, |_inner| Ok(()))
//! })?;
//!
//! assert_eq!(provider.stats().commits, 1);
//! # Ok::<(), txscope::TxError>(())
//! ```
//!
//! # Architecture
//!
//! - `txscope-core`: identifiers, status machine, errors, collaborator traits
//! - `txscope-concurrency`: the reference-counted transaction and its registry
//! - `txscope-engine`: coordinator, scopes and configuration

pub use txscope_concurrency::{
    ConnectionOrigin, EndKind, EndOutcome, HostSuppression, SuppressionGuard, Transaction,
    TransactionRegistry,
};
pub use txscope_core::memory;
pub use txscope_core::{
    same_connection, BoxError, Connection, ConnectionProvider, ContextKey, CreatorTag,
    HostTransactionManager, InstanceId, IsolationLevel, Resource, ResourceId, SharedConnection,
    Timestamp, TransactionStatus, TxError, TxResult,
};
pub use txscope_engine::{
    CoordinatorConfig, CoordinatorMetrics, ScopeState, TransactionCoordinator,
    TransactionMetrics, TransactionScope, CONFIG_FILE_NAME,
};
