//! Deterministic integrity digests for audit records

use crate::error::Result;
use crate::types::AuditRecord;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Computes SHA-256 checksums over depth-bounded, canonically serialized content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumBuilder {
    max_depth: usize,
}

impl ChecksumBuilder {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Hex digest of `candidate`
    ///
    /// Equal content always produces the same digest regardless of the key
    /// order it was built with. Content below the depth bound still counts.
    pub fn compute_checksum(&self, candidate: &Value) -> String {
        let bounded = limit_object_depth(candidate, 0, self.max_depth);
        let canonical = canonical_json(&bounded);
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }

    /// Digest of a record's content (everything except its checksum)
    pub fn record_checksum(&self, record: &AuditRecord) -> Result<String> {
        let content = record.content()?;
        Ok(self.compute_checksum(&content))
    }
}

/// Copy of `value` traversed down to `max_depth`
///
/// Behavior-preserving: the result always equals the input. Once `depth`
/// reaches the bound the remaining subtree is cloned whole instead of being
/// walked, so deep values never truncate or change the digest.
pub fn limit_object_depth(value: &Value, depth: usize, max_depth: usize) -> Value {
    if depth >= max_depth {
        return value.clone();
    }

    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), limit_object_depth(v, depth + 1, max_depth)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| limit_object_depth(item, depth + 1, max_depth))
                .collect(),
        ),
        scalar => scalar.clone(),
    }
}

/// Compact JSON with object keys sorted at every level
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
