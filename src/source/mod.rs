//! Feed source traits — the boundary to the watched database
//!
//! Backends (MongoDB, in-memory, ...) implement `FeedSource` to hand out
//! connections, `FeedConnection` for the administrative commands the
//! supervisor issues, and `ChangeFeed` for the event stream itself.

use crate::config::ConnectTarget;
use crate::error::Result;
use crate::sink::AuditSink;
use crate::types::{RawChangeEvent, ReadyState};
use async_trait::async_trait;
use std::sync::Arc;

pub mod memory;
pub mod mongo;

/// Outcome of asking the store to become a replica set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaSetInit {
    /// The store accepted the initiation
    Initiated,
    /// The store was already a replica set member
    AlreadyInitialized,
}

/// Factory for connections to a change-feed capable store
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Open a connection to `target`
    async fn connect(&self, target: &ConnectTarget) -> Result<Arc<dyn FeedConnection>>;

    /// Source name (e.g., "mongodb", "memory")
    fn name(&self) -> &str;
}

/// An open connection owned by the supervisor
#[async_trait]
pub trait FeedConnection: Send + Sync {
    /// Whether the store runs as a replica set able to emit change feeds
    async fn is_replica_set(&self) -> Result<bool>;

    /// Ask the store to initiate a replica set
    async fn initiate_replica_set(&self) -> Result<ReplicaSetInit>;

    /// Names of every collection in the watched database
    async fn list_collections(&self) -> Result<Vec<String>>;

    /// Enable pre/post-image capture on one collection
    async fn enable_change_capture(&self, collection: &str) -> Result<()>;

    /// Open a database-wide change feed with post-image lookup and
    /// pre-images when available
    async fn watch(&self) -> Result<Box<dyn ChangeFeed>>;

    /// Current connection readiness
    async fn ready_state(&self) -> ReadyState;

    /// Audit sink writing through this connection
    fn audit_sink(&self, collection: &str) -> Arc<dyn AuditSink>;

    /// Release the connection
    async fn close(&self) -> Result<()>;
}

/// Push-based change event stream
#[async_trait]
pub trait ChangeFeed: Send {
    /// Next event; `Ok(None)` when the feed ended, `Err` on feed failure
    async fn next(&mut self) -> Result<Option<RawChangeEvent>>;

    /// Stop the feed and release its cursor; the handle is dropped afterwards
    async fn close(&mut self) -> Result<()>;
}
