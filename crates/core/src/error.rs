//! Error types for txscope
//!
//! A single error enum covers the whole coordinator. We use `thiserror` for
//! automatic `Display` and `Error` trait implementations.
//!
//! The variants fall into three families:
//! - **Usage errors**: the caller broke the begin/end contract
//! - **Database errors**: the physical connection or its provider failed
//! - **Action errors**: an application closure returned an error that is
//!   carried out of a propagation call unchanged

use crate::status::TransactionStatus;
use crate::types::{ContextKey, InstanceId};
use thiserror::Error;

/// Boxed source error carried by database and action failures
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type alias for txscope operations
pub type TxResult<T> = std::result::Result<T, TxError>;

/// Error types for the transaction coordinator
#[derive(Debug, Error)]
pub enum TxError {
    /// An argument was rejected before the registry was touched
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Why the argument was rejected
        reason: String,
    },

    /// The operation is not allowed in the transaction's current status
    #[error("Cannot {operation} transaction {instance_id}: status is {status}")]
    InvalidState {
        /// Transaction the call was made on
        instance_id: InstanceId,
        /// Status at the time of the call
        status: TransactionStatus,
        /// Operation that was attempted
        operation: &'static str,
    },

    /// The begin/end pair behind a scope handle has already been ended
    #[error("Cannot {operation}: transaction scope was already ended")]
    ScopeEnded {
        /// Operation that was attempted
        operation: &'static str,
    },

    /// An action run outside a transaction opened another one and left it open
    #[error("Another transaction ({leaked}) was opened but not closed while running outside {context_key}")]
    TransactionLeaked {
        /// Slot the original transaction was restored into
        context_key: ContextKey,
        /// The transaction that was left registered
        leaked: InstanceId,
    },

    /// Physical connection operation failed
    #[error("Database error during {operation}: {message}")]
    Database {
        /// Connection operation that failed (commit, rollback, reset, ...)
        operation: &'static str,
        /// Human-readable description
        message: String,
        /// Underlying driver error, if any
        #[source]
        source: Option<BoxError>,
    },

    /// Commit failed; the transaction was rolled back (or the rollback failed too)
    #[error("Commit of {instance_id} failed: {cause}")]
    CommitFailed {
        /// Transaction whose commit failed
        instance_id: InstanceId,
        /// The original commit error
        #[source]
        cause: Box<TxError>,
        /// Secondary failure of the automatic rollback, if any
        rollback: Option<Box<TxError>>,
    },

    /// The connection provider could not supply a connection
    #[error("Failed to acquire connection for resource '{resource}': {message}")]
    ConnectionAcquisition {
        /// Name of the resource
        resource: String,
        /// Human-readable description
        message: String,
    },

    /// The connection provider could not take the connection back
    #[error("Failed to release connection for resource '{resource}': {message}")]
    ConnectionRelease {
        /// Name of the resource
        resource: String,
        /// Human-readable description
        message: String,
    },

    /// Configuration could not be read, parsed or validated
    #[error("Configuration error: {message}")]
    Config {
        /// Human-readable description
        message: String,
    },

    /// Error returned by an application action
    #[error("Action failed: {message}")]
    Action {
        /// Display form of the source error
        message: String,
        /// The application error
        #[source]
        source: Option<BoxError>,
    },
}

impl TxError {
    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        TxError::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(
        instance_id: InstanceId,
        status: TransactionStatus,
        operation: &'static str,
    ) -> Self {
        TxError::InvalidState {
            instance_id,
            status,
            operation,
        }
    }

    /// Create a database error without a source
    pub fn database(operation: &'static str, message: impl Into<String>) -> Self {
        TxError::Database {
            operation,
            message: message.into(),
            source: None,
        }
    }

    /// Create a database error wrapping a driver error
    pub fn database_with_source<E>(operation: &'static str, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        TxError::Database {
            operation,
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        TxError::Config {
            message: message.into(),
        }
    }

    /// Wrap an application error so it can travel through a propagation call
    pub fn action<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        TxError::Action {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an action error from a plain message
    pub fn action_message(message: impl Into<String>) -> Self {
        TxError::Action {
            message: message.into(),
            source: None,
        }
    }

    /// True if the caller violated the begin/end contract
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            TxError::InvalidArgument { .. }
                | TxError::InvalidState { .. }
                | TxError::ScopeEnded { .. }
                | TxError::TransactionLeaked { .. }
        )
    }

    /// True if the physical connection or its provider failed
    pub fn is_database_error(&self) -> bool {
        matches!(
            self,
            TxError::Database { .. }
                | TxError::CommitFailed { .. }
                | TxError::ConnectionAcquisition { .. }
                | TxError::ConnectionRelease { .. }
        )
    }

    /// Stable error code, used in log fields
    pub fn error_code(&self) -> &'static str {
        match self {
            TxError::InvalidArgument { .. } => "InvalidArgument",
            TxError::InvalidState { .. } => "InvalidState",
            TxError::ScopeEnded { .. } => "ScopeEnded",
            TxError::TransactionLeaked { .. } => "TransactionLeaked",
            TxError::Database { .. } => "Database",
            TxError::CommitFailed { .. } => "CommitFailed",
            TxError::ConnectionAcquisition { .. } => "ConnectionAcquisition",
            TxError::ConnectionRelease { .. } => "ConnectionRelease",
            TxError::Config { .. } => "Config",
            TxError::Action { .. } => "Action",
        }
    }
}
