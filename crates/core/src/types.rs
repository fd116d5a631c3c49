//! Core identifier types for txscope
//!
//! This module defines the foundational types:
//! - ResourceId: Token minted when a resource is registered with a coordinator
//! - CreatorTag: Names an independent propagation domain
//! - ContextKey: Registry slot (resource + thread + creator)
//! - InstanceId: Globally unique identity of one transaction object
//! - IsolationLevel: Connection isolation levels

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{SystemTime, UNIX_EPOCH};

/// Process-wide source of resource tokens
static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide source of transaction sequence numbers
static NEXT_INSTANCE_SEQ: AtomicU64 = AtomicU64::new(1);

/// Token identifying a registered resource
///
/// ResourceIds are minted from a process-wide counter, so two coordinators
/// never hand out the same token. Registry keys are built from this token
/// instead of the identity of any external object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(u64);

impl ResourceId {
    /// Mint a fresh, never-before-used token
    pub fn mint() -> Self {
        ResourceId(NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap a raw value (tests and diagnostics only; not guaranteed unique)
    pub const fn from_raw(raw: u64) -> Self {
        ResourceId(raw)
    }

    /// Raw token value
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "res-{}", self.0)
    }
}

/// Tag naming an independent propagation domain
///
/// Transactions begun through coordinators with different tags never share a
/// registry slot, even for the same resource on the same thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CreatorTag(Arc<str>);

impl CreatorTag {
    /// Tag used when none is configured
    pub const DEFAULT: &'static str = "txscope";

    /// Create a tag from a name
    pub fn new(name: impl AsRef<str>) -> Self {
        CreatorTag(Arc::from(name.as_ref()))
    }

    /// Tag name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CreatorTag {
    fn default() -> Self {
        CreatorTag::new(Self::DEFAULT)
    }
}

impl fmt::Display for CreatorTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registry slot for one transaction
///
/// Encodes resource identity, calling-thread identity and creator tag, so the
/// same thread asking for the same resource in the same domain always lands on
/// the same slot, and nothing else does.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextKey {
    resource: ResourceId,
    thread: ThreadId,
    creator: CreatorTag,
}

impl ContextKey {
    /// Build a key for an explicit thread
    pub fn new(resource: ResourceId, thread: ThreadId, creator: CreatorTag) -> Self {
        Self {
            resource,
            thread,
            creator,
        }
    }

    /// Build a key for the calling thread
    pub fn for_current_thread(resource: ResourceId, creator: CreatorTag) -> Self {
        Self::new(resource, std::thread::current().id(), creator)
    }

    /// Resource part of the key
    pub fn resource(&self) -> ResourceId {
        self.resource
    }

    /// Thread part of the key
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// Creator part of the key
    pub fn creator(&self) -> &CreatorTag {
        &self.creator
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:?}/{}", self.resource, self.thread, self.creator)
    }
}

/// Microseconds since Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Current wall-clock time
    ///
    /// Returns epoch (0) if the system clock is before Unix epoch.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as u64)
    }

    /// Create from raw microseconds
    pub const fn from_micros(micros: u64) -> Self {
        Timestamp(micros)
    }

    /// Raw microseconds
    pub const fn as_micros(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique identity of one transaction object
///
/// Combines the context key with the creation time and a process-wide
/// sequence number. Two transactions are the same object iff their
/// InstanceIds are equal, even when they share a context key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceId {
    key: ContextKey,
    created_at: Timestamp,
    sequence: u64,
}

impl InstanceId {
    /// Allocate a new identity for a transaction on `key`
    pub fn allocate(key: ContextKey) -> Self {
        Self {
            key,
            created_at: Timestamp::now(),
            sequence: NEXT_INSTANCE_SEQ.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Build an identity with an explicit sequence number
    pub fn new(key: ContextKey, sequence: u64) -> Self {
        Self {
            key,
            created_at: Timestamp::now(),
            sequence,
        }
    }

    /// Registry slot of the transaction
    pub fn context_key(&self) -> &ContextKey {
        &self.key
    }

    /// Creation time
    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Process-wide sequence number
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}.{}", self.key, self.created_at, self.sequence)
    }
}

/// Transaction isolation level
///
/// `Default` means "whatever the connection already uses": a scope begun with
/// `Default` never changes the physical isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Leave the connection's level untouched
    #[default]
    Default,
    /// Allows dirty reads, non-repeatable reads and phantom reads
    ReadUncommitted,
    /// Prevents dirty reads
    ReadCommitted,
    /// Prevents dirty and non-repeatable reads
    RepeatableRead,
    /// Full isolation
    Serializable,
}

impl IsolationLevel {
    /// Config/display name
    pub fn name(&self) -> &'static str {
        match self {
            IsolationLevel::Default => "default",
            IsolationLevel::ReadUncommitted => "read_uncommitted",
            IsolationLevel::ReadCommitted => "read_committed",
            IsolationLevel::RepeatableRead => "repeatable_read",
            IsolationLevel::Serializable => "serializable",
        }
    }

    /// True for `Default`
    pub fn is_default(&self) -> bool {
        matches!(self, IsolationLevel::Default)
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "default" => Ok(IsolationLevel::Default),
            "read_uncommitted" => Ok(IsolationLevel::ReadUncommitted),
            "read_committed" => Ok(IsolationLevel::ReadCommitted),
            "repeatable_read" => Ok(IsolationLevel::RepeatableRead),
            "serializable" => Ok(IsolationLevel::Serializable),
            other => Err(format!("unknown isolation level '{}'", other)),
        }
    }
}
