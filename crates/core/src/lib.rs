//! Core types and traits for txscope
//!
//! This crate defines the foundational types used throughout the system:
//! - ResourceId / Resource: Minted handles for registered resources
//! - ContextKey: Registry slot (resource + thread + creator tag)
//! - InstanceId: Identity of one transaction object
//! - IsolationLevel: Connection isolation levels
//! - TransactionStatus: Transaction lifecycle state machine
//! - TxError: Error type hierarchy
//! - Traits: Collaborator boundaries (Connection, ConnectionProvider, HostTransactionManager)
//! - Memory: In-memory reference collaborators

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod memory;
pub mod status;
pub mod traits;
pub mod types;

pub use error::{BoxError, TxError, TxResult};
pub use status::TransactionStatus;
pub use traits::{
    same_connection, Connection, ConnectionProvider, HostTransactionManager, Resource,
    SharedConnection,
};
pub use types::{ContextKey, CreatorTag, InstanceId, IsolationLevel, ResourceId, Timestamp};
