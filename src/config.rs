//! Audit pipeline configuration
//!
//! Everything here is constructor-time configuration and immutable once the
//! pipeline is running. Every struct deserializes from camelCase JSON; missing
//! keys fall back to defaults and unknown keys are ignored.

use crate::error::{AuditError, Result};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default name of the collection audit records are written to
pub const DEFAULT_AUDIT_COLLECTION: &str = "auditlogs";

/// Which fields of which collections end up in audit snapshots
///
/// - empty mapping: every field of every collection is tracked
/// - collection mapped to an empty set: every field of that collection
/// - collection absent from a non-empty mapping: nothing from it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackingConfig {
    collections: IndexMap<String, IndexSet<String>>,
}

impl TrackingConfig {
    /// Track every field of every collection
    pub fn track_everything() -> Self {
        Self::default()
    }

    /// Build from `(collection, fields)` pairs
    pub fn new<C, F, S>(collections: C) -> Self
    where
        C: IntoIterator<Item = (S, F)>,
        F: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let collections = collections
            .into_iter()
            .map(|(name, fields)| (name.into(), fields.into_iter().map(Into::into).collect()))
            .collect();
        Self { collections }
    }

    /// Add a collection with its tracked fields (empty = all fields)
    pub fn with_collection<S: Into<String>>(
        mut self,
        collection: impl Into<String>,
        fields: impl IntoIterator<Item = S>,
    ) -> Self {
        self.collections.insert(
            collection.into(),
            fields.into_iter().map(Into::into).collect(),
        );
        self
    }

    /// True when no collection is configured (track everything)
    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    /// Tracked fields for a collection, in configured order
    pub fn fields(&self, collection: &str) -> Option<&IndexSet<String>> {
        self.collections.get(collection)
    }

    /// Configured collection names, in configured order
    pub fn collections(&self) -> impl Iterator<Item = &str> {
        self.collections.keys().map(String::as_str)
    }

    /// Whether `field` of `collection` belongs in audit snapshots
    pub fn should_track(&self, collection: &str, field: &str) -> bool {
        if self.collections.is_empty() {
            return true;
        }
        match self.collections.get(collection) {
            Some(fields) => fields.is_empty() || fields.contains(field),
            None => false,
        }
    }
}

/// Lowercase substrings that mark a field name as sensitive
///
/// Matching is a case-insensitive substring test, so `password` also
/// matches `passwordHash` and `oldPassword`. Over-matching is intended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct SensitiveFieldMatchers {
    matchers: Vec<String>,
}

impl SensitiveFieldMatchers {
    pub fn new<S: AsRef<str>>(matchers: impl IntoIterator<Item = S>) -> Self {
        let mut normalized: Vec<String> = Vec::new();
        for matcher in matchers {
            let matcher = matcher.as_ref().trim().to_lowercase();
            if !matcher.is_empty() && !normalized.contains(&matcher) {
                normalized.push(matcher);
            }
        }
        Self {
            matchers: normalized,
        }
    }

    /// No field is sensitive
    pub fn none() -> Self {
        Self {
            matchers: Vec::new(),
        }
    }

    pub fn is_sensitive(&self, field: &str) -> bool {
        if self.matchers.is_empty() {
            return false;
        }
        let field = field.to_lowercase();
        self.matchers.iter().any(|m| field.contains(m.as_str()))
    }

    pub fn matchers(&self) -> &[String] {
        &self.matchers
    }
}

impl Default for SensitiveFieldMatchers {
    fn default() -> Self {
        Self::new(["password", "secret", "token", "ssn", "credit"])
    }
}

impl From<Vec<String>> for SensitiveFieldMatchers {
    fn from(value: Vec<String>) -> Self {
        Self::new(value)
    }
}

impl From<SensitiveFieldMatchers> for Vec<String> {
    fn from(value: SensitiveFieldMatchers) -> Self {
        value.matchers
    }
}

/// Retry, traversal and health-check tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManagerOptions {
    /// Connection attempts before startup fails (minimum 1)
    pub max_reconnect_attempts: u32,

    /// Delay between connection attempts and before re-subscribing
    pub reconnect_delay_ms: u64,

    /// Nesting bound for redaction and checksum traversal
    pub max_object_depth: usize,

    /// Interval between connection readiness checks
    pub health_check_interval_ms: u64,

    /// Pause after initiating a replica set, before opening the feed
    pub replica_set_settle_ms: u64,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 5_000,
            max_object_depth: 10,
            health_check_interval_ms: 30_000,
            replica_set_settle_ms: 2_000,
        }
    }
}

impl ManagerOptions {
    /// Merge a partial JSON object over the defaults
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn replica_set_settle(&self) -> Duration {
        Duration::from_millis(self.replica_set_settle_ms)
    }
}

/// Where and how to connect to the feed source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTarget {
    /// Connection string
    #[serde(default = "default_uri")]
    pub uri: String,

    /// Database to watch
    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: u32,

    #[serde(default = "default_min_pool_size")]
    pub min_pool_size: u32,

    #[serde(default = "default_server_selection_timeout_ms")]
    pub server_selection_timeout_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Application name reported to the server
    #[serde(default = "default_app_name")]
    pub app_name: String,
}

fn default_uri() -> String {
    "mongodb://127.0.0.1:27017".to_string()
}

fn default_database() -> String {
    "test".to_string()
}

fn default_max_pool_size() -> u32 {
    10
}

fn default_min_pool_size() -> u32 {
    2
}

fn default_server_selection_timeout_ms() -> u64 {
    5_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_app_name() -> String {
    "a3s-audit".to_string()
}

impl Default for ConnectTarget {
    fn default() -> Self {
        Self {
            uri: default_uri(),
            database: default_database(),
            max_pool_size: default_max_pool_size(),
            min_pool_size: default_min_pool_size(),
            server_selection_timeout_ms: default_server_selection_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            app_name: default_app_name(),
        }
    }
}

impl ConnectTarget {
    pub fn new(uri: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            database: database.into(),
            ..Default::default()
        }
    }

    pub fn server_selection_timeout(&self) -> Duration {
        Duration::from_millis(self.server_selection_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Full constructor-time configuration of an audit trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditSettings {
    #[serde(default)]
    pub target: ConnectTarget,

    #[serde(default)]
    pub tracking: TrackingConfig,

    #[serde(default)]
    pub sensitive_fields: SensitiveFieldMatchers,

    #[serde(default)]
    pub options: ManagerOptions,

    /// Collection the audit sink writes to; never audited itself
    #[serde(default = "default_audit_collection")]
    pub audit_collection: String,
}

fn default_audit_collection() -> String {
    DEFAULT_AUDIT_COLLECTION.to_string()
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self::new(ConnectTarget::default())
    }
}

impl AuditSettings {
    pub fn new(target: ConnectTarget) -> Self {
        Self {
            target,
            tracking: TrackingConfig::default(),
            sensitive_fields: SensitiveFieldMatchers::default(),
            options: ManagerOptions::default(),
            audit_collection: default_audit_collection(),
        }
    }

    pub fn with_tracking(mut self, tracking: TrackingConfig) -> Self {
        self.tracking = tracking;
        self
    }

    pub fn with_sensitive_fields(mut self, matchers: SensitiveFieldMatchers) -> Self {
        self.sensitive_fields = matchers;
        self
    }

    pub fn with_options(mut self, options: ManagerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_audit_collection(mut self, collection: impl Into<String>) -> Self {
        self.audit_collection = collection.into();
        self
    }

    /// Load settings from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            AuditError::Config(format!(
                "Failed to read settings file {}: {}",
                path.display(),
                e
            ))
        })?;

        serde_json::from_str(&json).map_err(|e| {
            AuditError::Config(format!(
                "Failed to parse settings file {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.target.uri.trim().is_empty() {
            return Err(AuditError::Config("Connection URI cannot be empty".to_string()));
        }
        if self.target.database.trim().is_empty() {
            return Err(AuditError::Config("Database name cannot be empty".to_string()));
        }
        if self.audit_collection.trim().is_empty() {
            return Err(AuditError::Config(
                "Audit collection name cannot be empty".to_string(),
            ));
        }
        if self.options.health_check_interval_ms == 0 {
            return Err(AuditError::Config(
                "healthCheckIntervalMs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
