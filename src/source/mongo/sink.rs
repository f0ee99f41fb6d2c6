//! Audit sink writing records into a MongoDB collection

use super::json_to_bson;
use crate::error::{AuditError, Result};
use crate::sink::AuditSink;
use crate::types::{AuditRecord, OperationType};
use async_trait::async_trait;
use mongodb::bson::{doc, Bson, DateTime, Document};
use mongodb::error::ErrorKind;
use mongodb::{Collection, Database, IndexModel};

const NAMESPACE_EXISTS: i32 = 48;

/// Audit sink backed by a MongoDB collection
///
/// Records are stored with camelCase field names and a BSON date timestamp.
pub struct MongoAuditSink {
    database: Database,
    collection: Collection<Document>,
}

impl MongoAuditSink {
    pub fn new(database: &Database, collection: &str) -> Self {
        Self {
            database: database.clone(),
            collection: database.collection(collection),
        }
    }

    /// Create the audit collection with a schema validator and its indexes
    ///
    /// Safe to call repeatedly; an existing collection keeps its validator.
    pub async fn ensure_schema(&self) -> Result<()> {
        let name = self.collection.name().to_string();
        let operations: Vec<&str> = OperationType::ALL.iter().map(|op| op.as_str()).collect();

        let created = self
            .database
            .create_collection(&name)
            .validator(doc! {
                "$jsonSchema": {
                    "bsonType": "object",
                    "required": ["timestamp", "operationType", "collectionName", "documentKey", "checksum"],
                    "properties": {
                        "timestamp": { "bsonType": "date" },
                        "operationType": { "enum": operations },
                        "collectionName": { "bsonType": "string" },
                        "checksum": { "bsonType": "string" },
                    },
                },
            })
            .await;

        match created {
            Ok(()) => tracing::info!(collection = %name, "Audit collection created"),
            Err(e) if matches!(e.kind.as_ref(), ErrorKind::Command(c) if c.code == NAMESPACE_EXISTS) => {
                tracing::debug!(collection = %name, "Audit collection already exists");
            }
            Err(e) => {
                return Err(AuditError::Command {
                    command: "create".to_string(),
                    reason: format!("{}: {}", name, e),
                })
            }
        }

        let indexes = [
            doc! { "collectionName": 1, "timestamp": -1 },
            doc! { "timestamp": 1 },
        ];
        for keys in indexes {
            self.collection
                .create_index(IndexModel::builder().keys(keys).build())
                .await
                .map_err(|e| AuditError::Command {
                    command: "createIndexes".to_string(),
                    reason: format!("{}: {}", name, e),
                })?;
        }

        Ok(())
    }
}

/// Map a record onto the stored document layout
pub fn record_to_document(record: &AuditRecord) -> Result<Document> {
    let mut document = doc! {
        "timestamp": DateTime::from_millis(record.timestamp.timestamp_millis()),
        "operationType": record.operation_type.as_str(),
        "collectionName": record.collection_name.as_str(),
        "documentKey": json_to_bson(&record.document_key)?,
    };

    if let Some(old) = &record.old_value {
        document.insert("oldValue", json_to_bson(old)?);
    }
    if let Some(new) = &record.new_value {
        document.insert("newValue", json_to_bson(new)?);
    }
    if let Some(description) = &record.update_description {
        document.insert("updateDescription", json_to_bson(description)?);
    }
    document.insert("checksum", Bson::String(record.checksum.clone()));

    Ok(document)
}

#[async_trait]
impl AuditSink for MongoAuditSink {
    async fn create(&self, record: &AuditRecord) -> Result<()> {
        let document = record_to_document(record)?;
        self.collection
            .insert_one(document)
            .await
            .map_err(|e| AuditError::Sink(format!("{}: {}", self.collection.name(), e)))?;
        Ok(())
    }

    fn name(&self) -> &str {
        "mongodb"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn record() -> AuditRecord {
        AuditRecord {
            timestamp: Utc.timestamp_millis_opt(1_700_000_000_123).unwrap(),
            operation_type: OperationType::Update,
            collection_name: "users".to_string(),
            document_key: json!({ "_id": { "$oid": "65a1b2c3d4e5f60718293a4b" } }),
            old_value: Some(json!({ "status": "new" })),
            new_value: Some(json!({ "status": "active" })),
            update_description: Some(json!({ "updatedFields": { "status": "active" } })),
            checksum: "abc".to_string(),
        }
    }

    #[test]
    fn test_record_layout() {
        let document = record_to_document(&record()).unwrap();

        assert_eq!(
            document.get_datetime("timestamp").unwrap().timestamp_millis(),
            1_700_000_000_123
        );
        assert_eq!(document.get_str("operationType").unwrap(), "update");
        assert_eq!(document.get_str("collectionName").unwrap(), "users");
        assert!(document.get_document("documentKey").unwrap().get_object_id("_id").is_ok());
        assert_eq!(
            document.get_document("newValue").unwrap().get_str("status").unwrap(),
            "active"
        );
        assert_eq!(document.get_str("checksum").unwrap(), "abc");
    }

    #[test]
    fn test_absent_values_are_omitted() {
        let mut insert = record();
        insert.operation_type = OperationType::Insert;
        insert.old_value = None;
        insert.update_description = None;

        let document = record_to_document(&insert).unwrap();
        assert!(!document.contains_key("oldValue"));
        assert!(!document.contains_key("updateDescription"));
        assert!(document.contains_key("newValue"));
    }
}
