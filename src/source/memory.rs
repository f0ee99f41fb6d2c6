//! In-memory feed source for testing and single-process use
//!
//! Behaves like a replica set with a database-wide change feed. Events,
//! feed errors and connection faults are injected from the test side.

use super::{ChangeFeed, FeedConnection, FeedSource, ReplicaSetInit};
use crate::config::ConnectTarget;
use crate::error::{AuditError, Result};
use crate::sink::{AuditSink, MemoryAuditSink};
use crate::types::{RawChangeEvent, ReadyState};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

enum FeedItem {
    Event(RawChangeEvent),
    Error(String),
}

struct MemoryState {
    sink: MemoryAuditSink,
    collections: Mutex<Vec<String>>,
    failing_capture: Mutex<HashSet<String>>,
    capture_enabled: Mutex<HashSet<String>>,
    replica_set: AtomicBool,
    initiations: AtomicU32,
    connect_failures: AtomicU32,
    connect_attempts: AtomicU32,
    connections: AtomicU32,
    watch_failures: AtomicU32,
    ready: Mutex<ReadyState>,
    feed: Mutex<Option<mpsc::UnboundedSender<FeedItem>>>,
    subscriptions: watch::Sender<u32>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Scriptable in-memory change feed
///
/// Clones share the same underlying state.
#[derive(Clone)]
pub struct MemorySource {
    state: Arc<MemoryState>,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource {
    pub fn new() -> Self {
        let (subscriptions, _) = watch::channel(0);
        Self {
            state: Arc::new(MemoryState {
                sink: MemoryAuditSink::new(),
                collections: Mutex::new(Vec::new()),
                failing_capture: Mutex::new(HashSet::new()),
                capture_enabled: Mutex::new(HashSet::new()),
                replica_set: AtomicBool::new(true),
                initiations: AtomicU32::new(0),
                connect_failures: AtomicU32::new(0),
                connect_attempts: AtomicU32::new(0),
                connections: AtomicU32::new(0),
                watch_failures: AtomicU32::new(0),
                ready: Mutex::new(ReadyState::Disconnected),
                feed: Mutex::new(None),
                subscriptions,
            }),
        }
    }

    /// Seed the collections the connection reports
    pub fn with_collections<S: Into<String>>(self, collections: impl IntoIterator<Item = S>) -> Self {
        lock(&self.state.collections).extend(collections.into_iter().map(Into::into));
        self
    }

    /// Start as a standalone server that still needs replica set initiation
    pub fn standalone(self) -> Self {
        self.state.replica_set.store(false, Ordering::SeqCst);
        self
    }

    /// Make the next `count` connection attempts fail
    pub fn fail_connects(&self, count: u32) {
        self.state.connect_failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` feed openings fail
    pub fn fail_watches(&self, count: u32) {
        self.state.watch_failures.store(count, Ordering::SeqCst);
    }

    /// Make enabling change capture fail for one collection
    pub fn fail_capture_for(&self, collection: impl Into<String>) {
        lock(&self.state.failing_capture).insert(collection.into());
    }

    /// Override the readiness reported by open connections
    pub fn set_ready(&self, state: ReadyState) {
        *lock(&self.state.ready) = state;
    }

    /// Push an event into the active feed; false if no feed is open
    pub fn emit(&self, event: RawChangeEvent) -> bool {
        self.send(FeedItem::Event(event))
    }

    /// Push an error into the active feed; false if no feed is open
    pub fn fail_feed(&self, reason: impl Into<String>) -> bool {
        self.send(FeedItem::Error(reason.into()))
    }

    /// End the active feed as if the server closed the cursor
    pub fn end_feed(&self) -> bool {
        lock(&self.state.feed).take().is_some()
    }

    fn send(&self, item: FeedItem) -> bool {
        match lock(&self.state.feed).as_ref() {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }

    /// Sink shared by every connection of this source
    pub fn sink(&self) -> MemoryAuditSink {
        self.state.sink.clone()
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> u32 {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn initiations(&self) -> u32 {
        self.state.initiations.load(Ordering::SeqCst)
    }

    /// Number of feeds opened so far
    pub fn subscriptions(&self) -> u32 {
        *self.state.subscriptions.borrow()
    }

    /// Wait until at least `count` feeds have been opened
    pub async fn wait_for_subscriptions(&self, count: u32, timeout: Duration) -> bool {
        let mut rx = self.state.subscriptions.subscribe();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|n| *n >= count)).await;
        matches!(waited, Ok(Ok(_)))
    }

    /// Whether change capture was enabled on `collection`
    pub fn capture_enabled(&self, collection: &str) -> bool {
        lock(&self.state.capture_enabled).contains(collection)
    }
}

#[async_trait]
impl FeedSource for MemorySource {
    async fn connect(&self, target: &ConnectTarget) -> Result<Arc<dyn FeedConnection>> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);

        if take_one(&self.state.connect_failures) {
            return Err(AuditError::Connection(format!(
                "{}: injected connection failure",
                target.uri
            )));
        }

        *lock(&self.state.ready) = ReadyState::Connected;
        self.state.connections.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(MemoryConnection {
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

struct MemoryConnection {
    state: Arc<MemoryState>,
    closed: AtomicBool,
}

#[async_trait]
impl FeedConnection for MemoryConnection {
    async fn is_replica_set(&self) -> Result<bool> {
        Ok(self.state.replica_set.load(Ordering::SeqCst))
    }

    async fn initiate_replica_set(&self) -> Result<ReplicaSetInit> {
        self.state.initiations.fetch_add(1, Ordering::SeqCst);
        if self.state.replica_set.swap(true, Ordering::SeqCst) {
            Ok(ReplicaSetInit::AlreadyInitialized)
        } else {
            Ok(ReplicaSetInit::Initiated)
        }
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        Ok(lock(&self.state.collections).clone())
    }

    async fn enable_change_capture(&self, collection: &str) -> Result<()> {
        if lock(&self.state.failing_capture).contains(collection) {
            return Err(AuditError::Command {
                command: "collMod".to_string(),
                reason: format!("injected failure for '{}'", collection),
            });
        }
        lock(&self.state.capture_enabled).insert(collection.to_string());
        Ok(())
    }

    async fn watch(&self) -> Result<Box<dyn ChangeFeed>> {
        if take_one(&self.state.watch_failures) {
            return Err(AuditError::Subscribe("injected watch failure".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.state.feed) = Some(tx);
        self.state.subscriptions.send_modify(|n| *n += 1);

        Ok(Box::new(MemoryFeed { rx }))
    }

    async fn ready_state(&self) -> ReadyState {
        if self.closed.load(Ordering::SeqCst) {
            ReadyState::Disconnected
        } else {
            *lock(&self.state.ready)
        }
    }

    fn audit_sink(&self, _collection: &str) -> Arc<dyn AuditSink> {
        Arc::new(self.state.sink.clone())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryFeed {
    rx: mpsc::UnboundedReceiver<FeedItem>,
}

#[async_trait]
impl ChangeFeed for MemoryFeed {
    async fn next(&mut self) -> Result<Option<RawChangeEvent>> {
        match self.rx.recv().await {
            Some(FeedItem::Event(event)) => Ok(Some(event)),
            Some(FeedItem::Error(reason)) => Err(AuditError::Feed(reason)),
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.rx.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Namespace;
    use serde_json::json;

    fn insert() -> RawChangeEvent {
        RawChangeEvent::insert(Namespace::new("app", "users"), json!({"_id": 1}), json!({}))
    }

    #[tokio::test]
    async fn test_connect_failures_are_consumed() {
        let source = MemorySource::new();
        source.fail_connects(2);
        let target = ConnectTarget::default();

        assert!(source.connect(&target).await.is_err());
        assert!(source.connect(&target).await.is_err());
        assert!(source.connect(&target).await.is_ok());
        assert_eq!(source.connect_attempts(), 3);
        assert_eq!(source.connections(), 1);
    }

    #[tokio::test]
    async fn test_feed_delivers_events_and_errors() {
        let source = MemorySource::new();
        let conn = source.connect(&ConnectTarget::default()).await.unwrap();
        assert!(!source.emit(insert()));

        let mut feed = conn.watch().await.unwrap();
        assert_eq!(source.subscriptions(), 1);

        assert!(source.emit(insert()));
        assert!(source.fail_feed("boom"));

        assert!(feed.next().await.unwrap().is_some());
        assert!(matches!(feed.next().await, Err(AuditError::Feed(_))));

        assert!(source.end_feed());
        assert!(feed.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_closed_feed_rejects_events() {
        let source = MemorySource::new();
        let conn = source.connect(&ConnectTarget::default()).await.unwrap();
        let mut feed = conn.watch().await.unwrap();

        feed.close().await.unwrap();
        assert!(!source.emit(insert()));
    }

    #[tokio::test]
    async fn test_replica_set_initiation() {
        let source = MemorySource::new().standalone();
        let conn = source.connect(&ConnectTarget::default()).await.unwrap();

        assert!(!conn.is_replica_set().await.unwrap());
        assert_eq!(conn.initiate_replica_set().await.unwrap(), ReplicaSetInit::Initiated);
        assert!(conn.is_replica_set().await.unwrap());
        assert_eq!(
            conn.initiate_replica_set().await.unwrap(),
            ReplicaSetInit::AlreadyInitialized
        );
    }

    #[tokio::test]
    async fn test_ready_state_follows_close() {
        let source = MemorySource::new();
        let conn = source.connect(&ConnectTarget::default()).await.unwrap();
        assert_eq!(conn.ready_state().await, ReadyState::Connected);

        source.set_ready(ReadyState::Disconnected);
        assert_eq!(conn.ready_state().await, ReadyState::Disconnected);

        source.set_ready(ReadyState::Connected);
        conn.close().await.unwrap();
        assert_eq!(conn.ready_state().await, ReadyState::Disconnected);
    }
}
