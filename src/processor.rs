//! Event processor — one raw change event in, at most one audit record out

use crate::checksum::ChecksumBuilder;
use crate::error::Result;
use crate::redact::Redactor;
use crate::sink::AuditSink;
use crate::stats::AuditStats;
use crate::types::{AuditRecord, OperationType, RawChangeEvent};
use chrono::{SubsecRound, Utc};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Why an event produced no record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The event targets the audit sink's own collection
    AuditCollection,
    /// Database-level event with no collection
    NoCollection,
    /// Not an insert, update or delete
    UnsupportedOperation(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::AuditCollection => f.write_str("audit collection"),
            SkipReason::NoCollection => f.write_str("no collection"),
            SkipReason::UnsupportedOperation(op) => write!(f, "unsupported operation '{}'", op),
        }
    }
}

/// Result of processing one raw event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The record reached the sink
    Persisted,
    /// The event is not auditable
    Skipped(SkipReason),
    /// The record was built but lost; the feed keeps going
    Dropped(String),
}

/// Turns raw change events into audit records
///
/// Each event gets a single sink attempt. A failed write is logged and the
/// record dropped so the live feed is never held up.
pub struct EventProcessor {
    redactor: Redactor,
    checksum: ChecksumBuilder,
    sink: Arc<dyn AuditSink>,
    audit_collection: String,
    stats: Arc<AuditStats>,
}

impl EventProcessor {
    pub fn new(
        redactor: Redactor,
        checksum: ChecksumBuilder,
        sink: Arc<dyn AuditSink>,
        audit_collection: impl Into<String>,
    ) -> Self {
        Self {
            redactor,
            checksum,
            sink,
            audit_collection: audit_collection.into(),
            stats: Arc::new(AuditStats::new()),
        }
    }

    /// Share counters with the owning supervisor
    pub fn with_stats(mut self, stats: Arc<AuditStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn audit_collection(&self) -> &str {
        &self.audit_collection
    }

    pub fn checksum_builder(&self) -> &ChecksumBuilder {
        &self.checksum
    }

    /// Decide whether an event is auditable
    pub fn screen<'a>(
        &self,
        raw: &'a RawChangeEvent,
    ) -> std::result::Result<(OperationType, &'a str), SkipReason> {
        let collection = raw.collection().ok_or(SkipReason::NoCollection)?;
        if collection == self.audit_collection {
            return Err(SkipReason::AuditCollection);
        }
        let operation = OperationType::from_change(&raw.operation)
            .ok_or_else(|| SkipReason::UnsupportedOperation(raw.operation.to_string()))?;
        Ok((operation, collection))
    }

    /// Assemble a checksummed record for an auditable event
    pub fn build_record(
        &self,
        operation: OperationType,
        collection: &str,
        raw: &RawChangeEvent,
    ) -> Result<AuditRecord> {
        let (old_value, new_value, update_description) = match operation {
            OperationType::Insert => (
                None,
                Some(self.redactor.redact(raw.post_image.as_ref(), collection)),
                None,
            ),
            OperationType::Update => (
                Some(self.redactor.redact(raw.pre_image.as_ref(), collection)),
                Some(self.redactor.redact(raw.post_image.as_ref(), collection)),
                Some(raw.update_description.clone().unwrap_or(Value::Null)),
            ),
            OperationType::Delete => (
                Some(self.redactor.redact(raw.pre_image.as_ref(), collection)),
                None,
                None,
            ),
        };

        // Millisecond precision matches the stored BSON date
        let mut record = AuditRecord {
            timestamp: Utc::now().trunc_subsecs(3),
            operation_type: operation,
            collection_name: collection.to_string(),
            document_key: raw.document_key.clone().unwrap_or(Value::Null),
            old_value,
            new_value,
            update_description,
            checksum: String::new(),
        };
        record.checksum = self.checksum.record_checksum(&record)?;
        Ok(record)
    }

    /// Process one event end to end
    pub async fn process_change(&self, raw: RawChangeEvent) -> ProcessOutcome {
        let (operation, collection) = match self.screen(&raw) {
            Ok(accepted) => accepted,
            Err(reason) => {
                tracing::trace!(
                    namespace = %raw.namespace.database,
                    operation = %raw.operation,
                    reason = %reason,
                    "Change event skipped"
                );
                self.stats.record_skipped();
                return ProcessOutcome::Skipped(reason);
            }
        };

        let record = match self.build_record(operation, collection, &raw) {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(
                    collection = %collection,
                    operation = %operation,
                    error = %e,
                    "Failed to build audit record, dropping"
                );
                self.stats.record_dropped();
                return ProcessOutcome::Dropped(e.to_string());
            }
        };

        match self.sink.create(&record).await {
            Ok(()) => {
                tracing::debug!(
                    collection = %record.collection_name,
                    operation = %record.operation_type,
                    checksum = %record.checksum,
                    "Audit record persisted"
                );
                self.stats.record_persisted();
                ProcessOutcome::Persisted
            }
            Err(e) => {
                tracing::error!(
                    collection = %record.collection_name,
                    operation = %record.operation_type,
                    sink = self.sink.name(),
                    error = %e,
                    "Failed to persist audit record, dropping"
                );
                self.stats.record_dropped();
                ProcessOutcome::Dropped(e.to_string())
            }
        }
    }
}
