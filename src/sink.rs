//! Audit sink — durable storage boundary for audit records
//!
//! The pipeline hands each finished record to an `AuditSink` exactly once.
//! Storage, indexing and querying live behind this trait.

use crate::error::{AuditError, Result};
use crate::types::AuditRecord;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Storage backend for audit records
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Validate and store a single record
    async fn create(&self, record: &AuditRecord) -> Result<()>;

    /// Sink name (e.g., "mongodb", "memory")
    fn name(&self) -> &str;
}

/// In-memory audit sink for development and testing
///
/// Stores records in insertion order. Failures can be injected with
/// [`MemoryAuditSink::fail_next`].
#[derive(Clone, Default)]
pub struct MemoryAuditSink {
    records: Arc<RwLock<Vec<AuditRecord>>>,
    failures: Arc<AtomicUsize>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub async fn count(&self) -> usize {
        self.records.read().await.len()
    }

    /// All stored records, oldest first
    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.read().await.clone()
    }

    /// Wait until at least `count` records are stored
    ///
    /// Returns false if `timeout` elapses first.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.count().await >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn create(&self, record: &AuditRecord) -> Result<()> {
        if self.take_failure() {
            return Err(AuditError::Sink(format!(
                "Injected failure for {} on '{}'",
                record.operation_type, record.collection_name
            )));
        }

        self.records.write().await.push(record.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
