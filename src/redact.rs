//! Field filtering and sensitive-value hashing
//!
//! Pure transformations applied to document snapshots before they enter an
//! audit record. Field selection is shallow (top-level keys only); hashing
//! walks the whole structure up to the configured depth bound.

use crate::checksum::canonical_json;
use crate::config::{SensitiveFieldMatchers, TrackingConfig};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Filters tracked fields and hashes sensitive values
///
/// Cheap to clone; configuration is shared behind `Arc`.
#[derive(Debug, Clone)]
pub struct Redactor {
    tracking: Arc<TrackingConfig>,
    sensitive: Arc<SensitiveFieldMatchers>,
    max_depth: usize,
}

impl Redactor {
    pub fn new(
        tracking: TrackingConfig,
        sensitive: SensitiveFieldMatchers,
        max_depth: usize,
    ) -> Self {
        Self {
            tracking: Arc::new(tracking),
            sensitive: Arc::new(sensitive),
            max_depth,
        }
    }

    pub fn tracking(&self) -> &TrackingConfig {
        &self.tracking
    }

    pub fn sensitive_fields(&self) -> &SensitiveFieldMatchers {
        &self.sensitive
    }

    /// Keep only the tracked top-level fields of `document`
    ///
    /// Absent, null or non-object input yields an empty object. Nested values
    /// under a tracked field are kept whole.
    pub fn filter_tracked_fields(&self, document: Option<&Value>, collection: &str) -> Value {
        let Some(Value::Object(fields)) = document else {
            return Value::Object(Map::new());
        };

        let filtered = fields
            .iter()
            .filter(|(field, _)| self.tracking.should_track(collection, field))
            .map(|(field, value)| (field.clone(), value.clone()))
            .collect();

        Value::Object(filtered)
    }

    /// Replace every leaf under a sensitive key with its SHA-256 digest
    ///
    /// Document identifiers (`{"$oid": ...}`) pass through untouched. Past the
    /// depth bound a subtree is hashed whole when it sits under a sensitive
    /// key or still contains one anywhere below; otherwise it is kept as-is.
    pub fn sanitize_and_hash_sensitive_data(&self, value: &Value) -> Value {
        self.sanitize(value, false, 0)
    }

    /// Filter then sanitize; the snapshot that goes into an audit record
    pub fn redact(&self, document: Option<&Value>, collection: &str) -> Value {
        let filtered = self.filter_tracked_fields(document, collection);
        self.sanitize_and_hash_sensitive_data(&filtered)
    }

    fn sanitize(&self, value: &Value, sensitive: bool, depth: usize) -> Value {
        if is_identifier(value) {
            return value.clone();
        }

        if depth >= self.max_depth {
            return if sensitive || self.contains_sensitive_key(value) {
                Value::String(hash_value(value))
            } else {
                value.clone()
            };
        }

        match value {
            Value::Object(map) if !is_extended_scalar(map) => {
                let sanitized = map
                    .iter()
                    .map(|(key, child)| {
                        let child_sensitive = sensitive || self.sensitive.is_sensitive(key);
                        (key.clone(), self.sanitize(child, child_sensitive, depth + 1))
                    })
                    .collect();
                Value::Object(sanitized)
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.sanitize(item, sensitive, depth + 1))
                    .collect(),
            ),
            leaf if sensitive => Value::String(hash_value(leaf)),
            leaf => leaf.clone(),
        }
    }

    /// Scan a subtree of any depth for a sensitive key, without recursion
    fn contains_sensitive_key(&self, value: &Value) -> bool {
        let mut pending = vec![value];
        while let Some(current) = pending.pop() {
            match current {
                Value::Object(map) if !is_extended_scalar(map) => {
                    for (key, child) in map {
                        if self.sensitive.is_sensitive(key) {
                            return true;
                        }
                        pending.push(child);
                    }
                }
                Value::Array(items) => pending.extend(items),
                _ => {}
            }
        }
        false
    }
}

/// Hex SHA-256 digest of a value's string representation
///
/// Strings hash their raw text; everything else hashes its canonical JSON.
pub fn hash_value(value: &Value) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => canonical_json(other),
    };
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Whether `value` is a well-formed document identifier in extended JSON
pub fn is_identifier(value: &Value) -> bool {
    let Value::Object(map) = value else {
        return false;
    };
    if map.len() != 1 {
        return false;
    }
    match map.get("$oid") {
        Some(Value::String(hex)) => hex.len() == 24 && hex.chars().all(|c| c.is_ascii_hexdigit()),
        _ => false,
    }
}

/// Extended-JSON wrappers (`{"$date": ...}`, `{"$numberDecimal": ...}`) are leaves
fn is_extended_scalar(map: &Map<String, Value>) -> bool {
    !map.is_empty() && map.keys().all(|k| k.starts_with('$'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const OID: &str = "65a1f0c2e4b0a1b2c3d4e5f6";

    fn users_redactor() -> Redactor {
        Redactor::new(
            TrackingConfig::new([("users", vec!["name", "email"])]),
            SensitiveFieldMatchers::new(["password"]),
            10,
        )
    }

    fn sha(text: &str) -> String {
        hex::encode(Sha256::digest(text.as_bytes()))
    }

    #[test]
    fn test_untracked_fields_are_dropped() {
        let redactor = users_redactor();
        let doc = json!({"name": "Ann", "email": "a@x.com", "password": "p1", "age": 30});

        let result = redactor.redact(Some(&doc), "users");
        assert_eq!(result, json!({"name": "Ann", "email": "a@x.com"}));
    }

    #[test]
    fn test_tracked_sensitive_field_is_hashed() {
        let redactor = Redactor::new(
            TrackingConfig::new([("users", vec!["name", "password"])]),
            SensitiveFieldMatchers::new(["password"]),
            10,
        );
        let doc = json!({"name": "Ann", "password": "p1", "age": 30});

        let result = redactor.redact(Some(&doc), "users");
        assert_eq!(result["name"], "Ann");
        assert_eq!(result["password"], sha("p1"));
        assert_eq!(result["password"].as_str().unwrap().len(), 64);
        assert!(result.get("age").is_none());
    }

    #[test]
    fn test_absent_or_null_document_yields_empty_object() {
        let redactor = users_redactor();
        assert_eq!(redactor.filter_tracked_fields(None, "users"), json!({}));
        assert_eq!(redactor.filter_tracked_fields(Some(&Value::Null), "users"), json!({}));
        assert_eq!(redactor.filter_tracked_fields(Some(&json!(42)), "users"), json!({}));
    }

    #[test]
    fn test_untracked_collection_yields_empty_object() {
        let redactor = users_redactor();
        let doc = json!({"total": 10});
        assert_eq!(redactor.filter_tracked_fields(Some(&doc), "orders"), json!({}));
    }

    #[test]
    fn test_filtering_is_shallow() {
        let redactor = Redactor::new(
            TrackingConfig::new([("users", vec!["profile"])]),
            SensitiveFieldMatchers::none(),
            10,
        );
        let doc = json!({"profile": {"city": "Oslo", "zip": "0150"}, "age": 3});

        let filtered = redactor.filter_tracked_fields(Some(&doc), "users");
        assert_eq!(filtered, json!({"profile": {"city": "Oslo", "zip": "0150"}}));
    }

    #[test]
    fn test_nested_sensitive_keys_are_hashed() {
        let redactor = Redactor::new(
            TrackingConfig::default(),
            SensitiveFieldMatchers::new(["token", "password"]),
            10,
        );
        let doc = json!({
            "user": {"name": "Bob", "apiToken": "t-1"},
            "sessions": [{"refreshToken": "r-1", "device": "phone"}],
            "passwords": ["old-1", 7]
        });

        let result = redactor.sanitize_and_hash_sensitive_data(&doc);
        assert_eq!(result["user"]["name"], "Bob");
        assert_eq!(result["user"]["apiToken"], sha("t-1"));
        assert_eq!(result["sessions"][0]["refreshToken"], sha("r-1"));
        assert_eq!(result["sessions"][0]["device"], "phone");
        assert_eq!(result["passwords"][0], sha("old-1"));
        assert_eq!(result["passwords"][1], sha("7"));
    }

    #[test]
    fn test_identifier_passes_through_unchanged() {
        let redactor = Redactor::new(
            TrackingConfig::default(),
            SensitiveFieldMatchers::new(["id"]),
            10,
        );
        let doc = json!({"_id": {"$oid": OID}, "userId": {"$oid": OID}, "paidAt": 1});

        let result = redactor.sanitize_and_hash_sensitive_data(&doc);
        assert_eq!(result["_id"], json!({"$oid": OID}));
        assert_eq!(result["userId"], json!({"$oid": OID}));
        // "paidAt" contains "id" and is hashed like any other match
        assert_eq!(result["paidAt"], sha("1"));
    }

    #[test]
    fn test_malformed_identifier_is_not_exempt() {
        assert!(is_identifier(&json!({"$oid": OID})));
        assert!(!is_identifier(&json!({"$oid": "xyz"})));
        assert!(!is_identifier(&json!({"$oid": OID, "extra": 1})));
        assert!(!is_identifier(&json!(OID)));
    }

    #[test]
    fn test_extended_scalar_under_sensitive_key_is_hashed_whole() {
        let redactor = Redactor::new(
            TrackingConfig::default(),
            SensitiveFieldMatchers::new(["secret"]),
            10,
        );
        let date = json!({"$date": "2024-01-01T00:00:00Z"});
        let doc = json!({"secretDate": date.clone(), "createdAt": date.clone()});

        let result = redactor.sanitize_and_hash_sensitive_data(&doc);
        assert_eq!(result["secretDate"], hash_value(&date));
        assert_eq!(result["createdAt"], date);
    }

    #[test]
    fn test_hash_is_deterministic() {
        let redactor = users_redactor();
        let doc = json!({"password": "same"});

        let first = redactor.sanitize_and_hash_sensitive_data(&doc);
        let second = redactor.sanitize_and_hash_sensitive_data(&doc);
        assert_eq!(first, second);
        assert_ne!(first["password"], "same");
    }

    #[test]
    fn test_depth_bound_keeps_plain_subtrees() {
        let redactor = Redactor::new(
            TrackingConfig::default(),
            SensitiveFieldMatchers::new(["password"]),
            2,
        );
        let doc = json!({"a": {"b": {"c": [1, {"d": "plain"}]}}});

        let result = redactor.sanitize_and_hash_sensitive_data(&doc);
        assert_eq!(result, doc);
    }

    #[test]
    fn test_depth_bound_hashes_subtree_hiding_sensitive_key() {
        let redactor = Redactor::new(
            TrackingConfig::default(),
            SensitiveFieldMatchers::new(["password"]),
            2,
        );
        let hidden = json!({"password": "deep"});
        let doc = json!({"a": {"b": hidden.clone()}, "name": "Ann"});

        let result = redactor.sanitize_and_hash_sensitive_data(&doc);
        assert_eq!(result["a"]["b"], hash_value(&hidden));
        assert_eq!(result["name"], "Ann");
        assert!(!result.to_string().contains("deep"));
    }

    #[test]
    fn test_depth_bound_scans_arrays_and_very_deep_nesting() {
        let redactor = Redactor::new(
            TrackingConfig::default(),
            SensitiveFieldMatchers::new(["password"]),
            3,
        );
        let mut doc = json!({"password": "hunter2"});
        for _ in 0..500 {
            doc = json!({"n": [doc]});
        }

        let result = redactor.sanitize_and_hash_sensitive_data(&doc);
        assert!(!result.to_string().contains("hunter2"));
    }

    #[test]
    fn test_depth_bound_ignores_extended_scalar_keys() {
        let redactor = Redactor::new(
            TrackingConfig::default(),
            SensitiveFieldMatchers::new(["oid"]),
            1,
        );
        let doc = json!({"ref": {"owner": {"$oid": OID}}});

        let result = redactor.sanitize_and_hash_sensitive_data(&doc);
        assert_eq!(result, doc);
    }

    #[test]
    fn test_depth_bound_hashes_sensitive_subtrees() {
        let redactor = Redactor::new(
            TrackingConfig::default(),
            SensitiveFieldMatchers::new(["password"]),
            2,
        );
        let inner = json!({"c": {"d": "deep"}});
        let doc = json!({"password": {"b": inner.clone()}});

        let result = redactor.sanitize_and_hash_sensitive_data(&doc);
        assert_eq!(result["password"]["b"], hash_value(&inner));
    }
}
