//! MongoDB change-stream source
//!
//! Implements `FeedSource` on top of the official `mongodb` driver. Documents
//! cross into the pipeline as relaxed extended JSON, so identifiers arrive as
//! `{"$oid": "..."}` and dates as `{"$date": ...}`.

mod sink;

pub use sink::MongoAuditSink;

use super::{ChangeFeed, FeedConnection, FeedSource, ReplicaSetInit};
use crate::config::ConnectTarget;
use crate::error::{AuditError, Result};
use crate::sink::AuditSink;
use crate::types::{ChangeKind, Namespace, RawChangeEvent, ReadyState};
use async_trait::async_trait;
use futures::StreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType as MongoOperation};
use mongodb::change_stream::ChangeStream;
use mongodb::error::ErrorKind;
use mongodb::options::{ClientOptions, FullDocumentBeforeChangeType, FullDocumentType};
use mongodb::{Client, Database};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const ALREADY_INITIALIZED: i32 = 23;

/// Connects to MongoDB deployments
#[derive(Debug, Clone, Default)]
pub struct MongoSource {
    audit_schema: Option<String>,
}

impl MongoSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure the audit collection's validator and indexes on every connect
    pub fn with_audit_schema(mut self, collection: impl Into<String>) -> Self {
        self.audit_schema = Some(collection.into());
        self
    }
}

#[async_trait]
impl FeedSource for MongoSource {
    async fn connect(&self, target: &ConnectTarget) -> Result<Arc<dyn FeedConnection>> {
        let conn = MongoConnection::connect(target).await?;

        if let Some(collection) = &self.audit_schema {
            let sink = MongoAuditSink::new(conn.database(), collection);
            if let Err(e) = sink.ensure_schema().await {
                tracing::warn!(collection = %collection, error = %e, "Audit schema not applied");
            }
        }

        Ok(Arc::new(conn))
    }

    fn name(&self) -> &str {
        "mongodb"
    }
}

/// One driver client bound to the watched database
pub struct MongoConnection {
    client: Client,
    database: Database,
    closed: AtomicBool,
}

impl MongoConnection {
    /// Build the client and confirm the server answers
    pub async fn connect(target: &ConnectTarget) -> Result<Self> {
        let mut options = ClientOptions::parse(&target.uri)
            .await
            .map_err(|e| AuditError::Connection(format!("invalid uri: {}", e)))?;

        options.max_pool_size = Some(target.max_pool_size);
        options.min_pool_size = Some(target.min_pool_size);
        options.server_selection_timeout = Some(target.server_selection_timeout());
        options.connect_timeout = Some(target.connect_timeout());
        options.app_name = Some(target.app_name.clone());

        let client = Client::with_options(options)
            .map_err(|e| AuditError::Connection(e.to_string()))?;
        let database = client.database(&target.database);

        // The driver connects lazily; force server selection now
        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| AuditError::Connection(format!("{}: {}", target.database, e)))?;

        tracing::info!(
            database = %target.database,
            max_pool_size = target.max_pool_size,
            "Connected to MongoDB"
        );

        Ok(Self {
            client,
            database,
            closed: AtomicBool::new(false),
        })
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    async fn admin_command(&self, name: &str, command: Document) -> Result<Document> {
        self.client
            .database("admin")
            .run_command(command)
            .await
            .map_err(|e| AuditError::Command {
                command: name.to_string(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl FeedConnection for MongoConnection {
    async fn is_replica_set(&self) -> Result<bool> {
        let hello = self
            .admin_command("hello", doc! { "hello": 1 })
            .await
            .map_err(|e| AuditError::Topology(e.to_string()))?;
        Ok(hello.contains_key("setName"))
    }

    async fn initiate_replica_set(&self) -> Result<ReplicaSetInit> {
        let result = self
            .client
            .database("admin")
            .run_command(doc! { "replSetInitiate": {} })
            .await;

        match result {
            Ok(_) => Ok(ReplicaSetInit::Initiated),
            Err(e) if command_code(&e) == Some(ALREADY_INITIALIZED) => {
                Ok(ReplicaSetInit::AlreadyInitialized)
            }
            Err(e) => Err(AuditError::Topology(format!("replSetInitiate: {}", e))),
        }
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        self.database
            .list_collection_names()
            .await
            .map_err(|e| AuditError::Command {
                command: "listCollections".to_string(),
                reason: e.to_string(),
            })
    }

    async fn enable_change_capture(&self, collection: &str) -> Result<()> {
        self.database
            .run_command(doc! {
                "collMod": collection,
                "changeStreamPreAndPostImages": { "enabled": true },
            })
            .await
            .map_err(|e| AuditError::Command {
                command: "collMod".to_string(),
                reason: format!("{}: {}", collection, e),
            })?;

        tracing::debug!(collection, "Pre/post images enabled");
        Ok(())
    }

    async fn watch(&self) -> Result<Box<dyn ChangeFeed>> {
        let stream = self
            .database
            .watch()
            .full_document(FullDocumentType::UpdateLookup)
            .full_document_before_change(FullDocumentBeforeChangeType::WhenAvailable)
            .await
            .map_err(|e| AuditError::Subscribe(e.to_string()))?;

        Ok(Box::new(MongoChangeFeed {
            stream: Some(stream),
        }))
    }

    async fn ready_state(&self) -> ReadyState {
        if self.closed.load(Ordering::SeqCst) {
            return ReadyState::Disconnected;
        }
        match self.database.run_command(doc! { "ping": 1 }).await {
            Ok(_) => ReadyState::Connected,
            Err(e) => {
                tracing::debug!(error = %e, "Ping failed");
                ReadyState::Disconnected
            }
        }
    }

    fn audit_sink(&self, collection: &str) -> Arc<dyn AuditSink> {
        Arc::new(MongoAuditSink::new(&self.database, collection))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.client.clone().shutdown().await;
        tracing::info!(database = %self.database.name(), "MongoDB connection closed");
        Ok(())
    }
}

/// Database-wide change stream
pub struct MongoChangeFeed {
    stream: Option<ChangeStream<ChangeStreamEvent<Document>>>,
}

#[async_trait]
impl ChangeFeed for MongoChangeFeed {
    async fn next(&mut self) -> Result<Option<RawChangeEvent>> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };

        match stream.next().await {
            Some(Ok(event)) => convert_event(event).map(Some),
            Some(Err(e)) => Err(AuditError::Feed(e.to_string())),
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<()> {
        // Dropping the stream kills the server cursor
        self.stream.take();
        Ok(())
    }
}

fn command_code(error: &mongodb::error::Error) -> Option<i32> {
    match error.kind.as_ref() {
        ErrorKind::Command(command) => Some(command.code),
        _ => None,
    }
}

fn change_kind(operation: &MongoOperation) -> ChangeKind {
    match operation {
        MongoOperation::Insert => ChangeKind::Insert,
        MongoOperation::Update => ChangeKind::Update,
        MongoOperation::Replace => ChangeKind::Replace,
        MongoOperation::Delete => ChangeKind::Delete,
        MongoOperation::Other(name) => ChangeKind::from(name.as_str()),
        other => ChangeKind::Other(format!("{:?}", other).to_lowercase()),
    }
}

/// BSON document to relaxed extended JSON
pub fn document_to_json(document: Document) -> Value {
    Bson::Document(document).into_relaxed_extjson()
}

/// Relaxed extended JSON back to BSON
pub fn json_to_bson(value: &Value) -> Result<Bson> {
    Bson::try_from(value.clone()).map_err(|e| AuditError::Sink(format!("invalid value: {}", e)))
}

fn convert_event(event: ChangeStreamEvent<Document>) -> Result<RawChangeEvent> {
    let namespace = match event.ns {
        Some(ns) => Namespace {
            database: ns.db,
            collection: ns.coll,
        },
        None => Namespace {
            database: String::new(),
            collection: None,
        },
    };

    let update_description = match event.update_description {
        Some(description) => {
            let bson = mongodb::bson::to_bson(&description)
                .map_err(|e| AuditError::Feed(format!("update description: {}", e)))?;
            Some(bson.into_relaxed_extjson())
        }
        None => None,
    };

    Ok(RawChangeEvent {
        namespace,
        operation: change_kind(&event.operation_type),
        document_key: event.document_key.map(document_to_json),
        pre_image: event.full_document_before_change.map(document_to_json),
        post_image: event.full_document.map(document_to_json),
        update_description,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::oid::ObjectId;
    use serde_json::json;

    #[test]
    fn test_change_kind_mapping() {
        assert_eq!(change_kind(&MongoOperation::Insert), ChangeKind::Insert);
        assert_eq!(change_kind(&MongoOperation::Update), ChangeKind::Update);
        assert_eq!(change_kind(&MongoOperation::Replace), ChangeKind::Replace);
        assert_eq!(change_kind(&MongoOperation::Delete), ChangeKind::Delete);
        assert!(matches!(
            change_kind(&MongoOperation::Drop),
            ChangeKind::Other(_)
        ));
    }

    #[test]
    fn test_object_id_becomes_oid_wrapper() {
        let id = ObjectId::new();
        let value = document_to_json(doc! { "_id": id, "name": "ann" });

        assert_eq!(value["_id"], json!({ "$oid": id.to_hex() }));
        assert_eq!(value["name"], json!("ann"));
        assert!(crate::redact::is_identifier(&value["_id"]));
    }

    #[test]
    fn test_json_to_bson_restores_object_id() {
        let id = ObjectId::new();
        let bson = json_to_bson(&json!({ "_id": { "$oid": id.to_hex() }, "n": 1 })).unwrap();

        let document = bson.as_document().unwrap();
        assert_eq!(document.get_object_id("_id").unwrap(), id);
    }

    #[test]
    fn test_relaxed_numbers_stay_plain() {
        let value = document_to_json(doc! { "count": 3_i32, "ratio": 0.5 });
        assert_eq!(value, json!({ "count": 3, "ratio": 0.5 }));
    }
}
