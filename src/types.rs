//! Core types for the a3s-audit pipeline
//!
//! All serialized types use camelCase JSON. Document values are carried as
//! `serde_json::Value` in relaxed extended-JSON form, so identifiers appear
//! as `{"$oid": "<24 hex>"}`.

use crate::checksum::ChecksumBuilder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Database and collection a change event belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Namespace {
    /// Database name
    pub database: String,

    /// Collection name; absent for database-level events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: Some(collection.into()),
        }
    }
}

/// Operation kind as reported by the change feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    Insert,
    Update,
    Replace,
    Delete,
    /// Any other feed notification (drop, rename, invalidate, ...)
    Other(String),
}

impl From<&str> for ChangeKind {
    fn from(value: &str) -> Self {
        match value {
            "insert" => ChangeKind::Insert,
            "update" => ChangeKind::Update,
            "replace" => ChangeKind::Replace,
            "delete" => ChangeKind::Delete,
            other => ChangeKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Insert => f.write_str("insert"),
            ChangeKind::Update => f.write_str("update"),
            ChangeKind::Replace => f.write_str("replace"),
            ChangeKind::Delete => f.write_str("delete"),
            ChangeKind::Other(name) => f.write_str(name),
        }
    }
}

/// A change notification supplied by the feed source
///
/// Lives only for the duration of one processing step.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChangeEvent {
    /// Where the change happened
    pub namespace: Namespace,

    /// What kind of change it was
    pub operation: ChangeKind,

    /// Identity of the mutated document
    pub document_key: Option<Value>,

    /// Document state before the change, when the store retains it
    pub pre_image: Option<Value>,

    /// Document state after the change (looked up for updates)
    pub post_image: Option<Value>,

    /// Update delta metadata (updated / removed fields)
    pub update_description: Option<Value>,
}

impl RawChangeEvent {
    /// Build an insert notification
    pub fn insert(namespace: Namespace, document_key: Value, document: Value) -> Self {
        Self {
            namespace,
            operation: ChangeKind::Insert,
            document_key: Some(document_key),
            pre_image: None,
            post_image: Some(document),
            update_description: None,
        }
    }

    /// Build an update notification
    pub fn update(
        namespace: Namespace,
        document_key: Value,
        pre_image: Option<Value>,
        post_image: Option<Value>,
        update_description: Value,
    ) -> Self {
        Self {
            namespace,
            operation: ChangeKind::Update,
            document_key: Some(document_key),
            pre_image,
            post_image,
            update_description: Some(update_description),
        }
    }

    /// Build a delete notification
    pub fn delete(namespace: Namespace, document_key: Value, pre_image: Option<Value>) -> Self {
        Self {
            namespace,
            operation: ChangeKind::Delete,
            document_key: Some(document_key),
            pre_image,
            post_image: None,
            update_description: None,
        }
    }

    /// Collection name, if the event targets one
    pub fn collection(&self) -> Option<&str> {
        self.namespace.collection.as_deref()
    }
}

/// Operation kinds recorded in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Insert,
    Update,
    Delete,
}

impl OperationType {
    /// All accepted values, in the order the sink schema lists them
    pub const ALL: [OperationType; 3] = [
        OperationType::Insert,
        OperationType::Update,
        OperationType::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
        }
    }

    /// Map a feed operation to an auditable one, if it is auditable
    pub fn from_change(kind: &ChangeKind) -> Option<Self> {
        match kind {
            ChangeKind::Insert => Some(OperationType::Insert),
            ChangeKind::Update => Some(OperationType::Update),
            ChangeKind::Delete => Some(OperationType::Delete),
            ChangeKind::Replace | ChangeKind::Other(_) => None,
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single entry in the audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    /// When the record was created by the processor
    pub timestamp: DateTime<Utc>,

    /// Kind of write that was audited
    pub operation_type: OperationType,

    /// Source collection
    pub collection_name: String,

    /// Identity of the mutated document, unfiltered
    pub document_key: Value,

    /// Filtered, sensitive-hashed snapshot before the change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,

    /// Filtered, sensitive-hashed snapshot after the change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,

    /// Raw update delta, present only for updates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_description: Option<Value>,

    /// Integrity digest over every other field
    #[serde(default)]
    pub checksum: String,
}

impl AuditRecord {
    /// JSON view of the record without its checksum
    ///
    /// This is the exact input the checksum is computed over.
    pub fn content(&self) -> serde_json::Result<Value> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.remove("checksum");
        }
        Ok(value)
    }

    /// Recompute the digest and compare it with the stored checksum
    pub fn verify_checksum(&self, builder: &ChecksumBuilder) -> bool {
        match self.content() {
            Ok(content) => builder.compute_checksum(&content) == self.checksum,
            Err(_) => false,
        }
    }
}

/// Connection readiness as reported by the feed source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadyState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReadyState::Disconnected => "disconnected",
            ReadyState::Connecting => "connecting",
            ReadyState::Connected => "connected",
            ReadyState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}
