//! # a3s-audit
//!
//! Change-feed audit trail for document databases.
//!
//! ## Overview
//!
//! `a3s-audit` subscribes to a database-wide change feed and turns every
//! insert, update and delete into a tamper-evident audit record. Records keep
//! only the fields you choose to track, replace sensitive values with SHA-256
//! digests, and carry a checksum over their own content.
//!
//! ## Quick Start
//!
//! ```rust
//! use a3s_audit::{AuditSettings, AuditTrail, ConnectTarget, TrackingConfig};
//! use a3s_audit::source::memory::MemorySource;
//! use std::sync::Arc;
//!
//! # async fn example() -> a3s_audit::Result<()> {
//! let settings = AuditSettings::new(ConnectTarget::new("mongodb://127.0.0.1:27017", "app"))
//!     .with_tracking(TrackingConfig::track_everything().with_collection("users", ["name", "email"]));
//!
//! let trail = AuditTrail::start(Arc::new(MemorySource::new()), settings).await?;
//! println!("{:?}", trail.stats());
//! trail.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Sources
//!
//! - **memory** — scriptable in-memory feed for testing
//! - **mongo** — MongoDB change streams with pre/post images
//!
//! ## Architecture
//!
//! - **FeedSource** / **FeedConnection** / **ChangeFeed** — backend boundary
//! - **Supervisor** — connection, topology, subscription and recovery
//! - **EventProcessor** — screening, redaction, checksum, sink write
//! - **AuditSink** — where records are stored
//! - **AuditTrail** — the lifecycle handle applications hold

pub mod capture;
pub mod checksum;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod processor;
pub mod redact;
pub mod sink;
pub mod source;
pub mod stats;
pub mod supervisor;
pub mod types;

// Re-export core types
pub use capture::{CaptureOutcome, CaptureReport, CollectionCapture};
pub use checksum::ChecksumBuilder;
pub use config::{
    AuditSettings, ConnectTarget, ManagerOptions, SensitiveFieldMatchers, TrackingConfig,
    DEFAULT_AUDIT_COLLECTION,
};
pub use error::{AuditError, Result};
pub use lifecycle::AuditTrail;
pub use processor::{EventProcessor, ProcessOutcome, SkipReason};
pub use redact::Redactor;
pub use sink::{AuditSink, MemoryAuditSink};
pub use source::{ChangeFeed, FeedConnection, FeedSource, ReplicaSetInit};
pub use stats::{AuditStats, StatsSnapshot};
pub use supervisor::{Supervisor, SupervisorState};
pub use types::{
    AuditRecord, ChangeKind, Namespace, OperationType, RawChangeEvent, ReadyState,
};

// Re-export sources for convenience
pub use source::memory::MemorySource;
pub use source::mongo::{MongoAuditSink, MongoSource};
