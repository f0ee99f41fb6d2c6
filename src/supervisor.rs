//! Subscription supervisor — owns the change-feed lifecycle
//!
//! The supervisor is an explicit state machine:
//!
//! ```text
//! Disconnected → Connecting → VerifyingTopology → EnablingFeedMetadata → Subscribed
//!                    ↑                                                       │
//!                    └──────────────── feed error / failed health check ─────┘
//! ```
//!
//! `ShuttingDown` is terminal. Startup connection attempts are bounded by
//! `maxReconnectAttempts`; once started, recovery retries forever. All state
//! is owned by the single task running [`Supervisor::run`]; raw events are
//! processed on spawned tasks so several records may be in flight at once.

use crate::capture;
use crate::checksum::ChecksumBuilder;
use crate::config::{AuditSettings, ConnectTarget, ManagerOptions};
use crate::error::{AuditError, Result};
use crate::processor::{EventProcessor, ProcessOutcome};
use crate::redact::Redactor;
use crate::source::{ChangeFeed, FeedConnection, FeedSource, ReplicaSetInit};
use crate::stats::AuditStats;
use crate::types::{RawChangeEvent, ReadyState};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Lifecycle states of the change-feed subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Disconnected,
    Connecting,
    VerifyingTopology,
    EnablingFeedMetadata,
    Subscribed,
    ShuttingDown,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Disconnected => "disconnected",
            SupervisorState::Connecting => "connecting",
            SupervisorState::VerifyingTopology => "verifying-topology",
            SupervisorState::EnablingFeedMetadata => "enabling-feed-metadata",
            SupervisorState::Subscribed => "subscribed",
            SupervisorState::ShuttingDown => "shutting-down",
        };
        f.write_str(name)
    }
}

enum Wake {
    Shutdown,
    Reaped(std::result::Result<ProcessOutcome, JoinError>),
    HealthCheck,
    Feed(Result<Option<RawChangeEvent>>),
}

/// Keeps one change feed open against a feed source
pub struct Supervisor {
    source: Arc<dyn FeedSource>,
    target: ConnectTarget,
    options: ManagerOptions,
    redactor: Redactor,
    checksum: ChecksumBuilder,
    audit_collection: String,
    connection: Option<Arc<dyn FeedConnection>>,
    processor: Option<Arc<EventProcessor>>,
    feed: Option<Box<dyn ChangeFeed>>,
    in_flight: JoinSet<ProcessOutcome>,
    stats: Arc<AuditStats>,
    state: watch::Sender<SupervisorState>,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(
        source: Arc<dyn FeedSource>,
        settings: AuditSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let depth = settings.options.max_object_depth;
        let (state, _) = watch::channel(SupervisorState::Disconnected);

        Self {
            source,
            target: settings.target,
            redactor: Redactor::new(settings.tracking, settings.sensitive_fields, depth),
            checksum: ChecksumBuilder::new(depth),
            options: settings.options,
            audit_collection: settings.audit_collection,
            connection: None,
            processor: None,
            feed: None,
            in_flight: JoinSet::new(),
            stats: Arc::new(AuditStats::new()),
            state,
            shutdown,
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition
    pub fn subscribe_state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> Arc<AuditStats> {
        self.stats.clone()
    }

    /// Number of events still being processed
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Connect (bounded retries) and try to open the feed once
    ///
    /// Only exhausted connection attempts are returned as an error. Topology,
    /// capture or subscription failures are logged and left to [`Self::run`]
    /// to recover.
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!(
            source = self.source.name(),
            database = %self.target.database,
            audit_collection = %self.audit_collection,
            "Starting audit trail"
        );

        self.connect_with_retry().await?;

        if let Err(e) = self.establish().await {
            tracing::warn!(error = %e, "Initial subscription failed, will recover");
            self.close_feed().await;
        }

        Ok(())
    }

    /// Consume the feed until shutdown is requested, then tear down
    pub async fn run(mut self) -> Result<()> {
        let period = self.options.health_check_interval();
        let mut health = tokio::time::interval_at(Instant::now() + period, period);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.feed.is_none() && !self.shutdown.is_cancelled() {
                self.recover("no active change feed").await;
            }

            let wake = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => Wake::Shutdown,
                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    Wake::Reaped(joined)
                }
                _ = health.tick() => Wake::HealthCheck,
                item = next_event(&mut self.feed) => Wake::Feed(item),
            };

            match wake {
                Wake::Shutdown => break,
                Wake::Reaped(joined) => log_task_result(joined),
                Wake::HealthCheck => {
                    let ready = match &self.connection {
                        Some(conn) => conn.ready_state().await,
                        None => ReadyState::Disconnected,
                    };
                    if ready == ReadyState::Connected {
                        tracing::trace!("Health check passed");
                    } else {
                        tracing::warn!(ready_state = %ready, "Health check failed, recovering");
                        self.recover("health check").await;
                    }
                }
                Wake::Feed(Ok(Some(event))) => self.dispatch(event),
                Wake::Feed(Ok(None)) => {
                    tracing::warn!("Change feed ended, recovering");
                    self.stats.record_feed_error();
                    self.recover("feed ended").await;
                }
                Wake::Feed(Err(e)) => {
                    tracing::warn!(error = %e, "Change feed error, recovering");
                    self.stats.record_feed_error();
                    self.recover("feed error").await;
                }
            }
        }

        self.shutdown().await
    }

    /// Ordered teardown: close the feed, drain in-flight writes, close the connection
    pub async fn shutdown(mut self) -> Result<()> {
        self.set_state(SupervisorState::ShuttingDown);
        tracing::info!("Shutting down audit trail");

        let mut failure: Option<AuditError> = None;

        if let Some(mut feed) = self.feed.take() {
            if let Err(e) = feed.close().await {
                tracing::error!(error = %e, "Failed to close change feed");
                failure.get_or_insert(AuditError::Shutdown(format!(
                    "closing change feed: {}",
                    e
                )));
            }
        }

        let pending = self.in_flight.len();
        if pending > 0 {
            tracing::info!(pending, "Draining in-flight audit writes");
        }
        while let Some(joined) = self.in_flight.join_next().await {
            log_task_result(joined);
        }

        if let Some(conn) = self.connection.take() {
            if let Err(e) = conn.close().await {
                tracing::error!(error = %e, "Failed to close connection");
                failure.get_or_insert(AuditError::Shutdown(format!(
                    "closing connection: {}",
                    e
                )));
            }
        }

        match failure {
            Some(e) => Err(e),
            None => {
                tracing::info!("Audit trail stopped");
                Ok(())
            }
        }
    }

    async fn connect_with_retry(&mut self) -> Result<()> {
        let max_attempts = self.options.max_reconnect_attempts.max(1);
        let delay = self.options.reconnect_delay();
        let mut attempts = 0;

        loop {
            self.set_state(SupervisorState::Connecting);

            let attempt = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => None,
                result = self.source.connect(&self.target) => Some(result),
            };
            let Some(attempt) = attempt else {
                self.set_state(SupervisorState::Disconnected);
                return Err(AuditError::Shutdown(
                    "shutdown requested while connecting".to_string(),
                ));
            };

            match attempt {
                Ok(conn) => {
                    tracing::info!(
                        database = %self.target.database,
                        attempts = attempts + 1,
                        "Connected to feed source"
                    );
                    self.bind(conn);
                    return Ok(());
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= max_attempts {
                        self.set_state(SupervisorState::Disconnected);
                        tracing::error!(attempts, error = %e, "Giving up on connection");
                        return Err(AuditError::ConnectionExhausted {
                            attempts,
                            reason: e.to_string(),
                        });
                    }

                    tracing::warn!(
                        attempt = attempts,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Connection failed, retrying"
                    );
                    if !pause(&self.shutdown, delay).await {
                        self.set_state(SupervisorState::Disconnected);
                        return Err(AuditError::Shutdown(
                            "shutdown requested while connecting".to_string(),
                        ));
                    }
                }
            }
        }
    }

    /// Reuse a ready connection or replace it with a fresh one
    async fn reconnect(&mut self) -> Result<()> {
        self.set_state(SupervisorState::Connecting);

        if let Some(conn) = &self.connection {
            if conn.ready_state().await == ReadyState::Connected {
                return Ok(());
            }
        }

        if let Some(stale) = self.connection.take() {
            if let Err(e) = stale.close().await {
                tracing::warn!(error = %e, "Failed to close stale connection");
            }
        }

        let conn = self.source.connect(&self.target).await?;
        tracing::info!(database = %self.target.database, "Reconnected to feed source");
        self.bind(conn);
        Ok(())
    }

    fn bind(&mut self, conn: Arc<dyn FeedConnection>) {
        let sink = conn.audit_sink(&self.audit_collection);
        let processor = EventProcessor::new(
            self.redactor.clone(),
            self.checksum,
            sink,
            self.audit_collection.clone(),
        )
        .with_stats(self.stats.clone());

        self.processor = Some(Arc::new(processor));
        self.connection = Some(conn);
    }

    /// Topology → capture metadata → subscription, on the current connection
    async fn establish(&mut self) -> Result<()> {
        let conn = self
            .connection
            .clone()
            .ok_or_else(|| AuditError::Connection("no open connection".to_string()))?;

        self.set_state(SupervisorState::VerifyingTopology);
        verify_topology(
            conn.as_ref(),
            &self.shutdown,
            self.options.replica_set_settle(),
        )
        .await?;

        self.set_state(SupervisorState::EnablingFeedMetadata);
        match capture::enable_change_capture(conn.as_ref()).await {
            Ok(report) => tracing::info!(
                applied = report.applied(),
                skipped = report.skipped(),
                failed = report.failed(),
                "Change capture configured"
            ),
            Err(e) => tracing::warn!(
                error = %e,
                "Could not list collections, change capture left unchanged"
            ),
        }

        self.close_feed().await;
        let feed = conn.watch().await?;
        self.feed = Some(feed);
        self.stats.record_subscription();
        self.set_state(SupervisorState::Subscribed);
        tracing::info!(database = %self.target.database, "Change feed open");

        Ok(())
    }

    /// Close the feed and loop until a new one is open or shutdown is requested
    async fn recover(&mut self, reason: &str) {
        self.close_feed().await;
        self.stats.record_recovery();
        let delay = self.options.reconnect_delay();
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;
            if !pause(&self.shutdown, delay).await {
                return;
            }

            if let Err(e) = self.reconnect().await {
                tracing::warn!(attempt, reason, error = %e, "Reconnect failed, retrying");
                continue;
            }

            match self.establish().await {
                Ok(()) => {
                    tracing::info!(attempt, reason, "Change feed recovered");
                    return;
                }
                Err(e) => {
                    tracing::warn!(attempt, reason, error = %e, "Re-subscription failed, retrying");
                    self.close_feed().await;
                }
            }
        }
    }

    async fn close_feed(&mut self) {
        if let Some(mut feed) = self.feed.take() {
            if let Err(e) = feed.close().await {
                tracing::warn!(error = %e, "Failed to close change feed");
            }
        }
    }

    fn dispatch(&mut self, event: RawChangeEvent) {
        self.stats.record_received();

        let Some(processor) = self.processor.clone() else {
            tracing::error!("Change event received without a processor, dropping");
            self.stats.record_dropped();
            return;
        };

        self.in_flight
            .spawn(async move { processor.process_change(event).await });
    }

    fn set_state(&self, next: SupervisorState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = %previous, to = %next, "Supervisor state changed");
        }
    }
}

/// Make sure the store can emit change feeds
async fn verify_topology(
    conn: &dyn FeedConnection,
    shutdown: &CancellationToken,
    settle: Duration,
) -> Result<()> {
    if conn.is_replica_set().await? {
        tracing::debug!("Replica set verified");
        return Ok(());
    }

    tracing::info!("Store is not a replica set, initiating");
    match conn.initiate_replica_set().await? {
        ReplicaSetInit::Initiated => tracing::info!("Replica set initiated"),
        ReplicaSetInit::AlreadyInitialized => tracing::info!("Replica set already initialized"),
    }

    if !pause(shutdown, settle).await {
        return Err(AuditError::Shutdown(
            "shutdown requested while waiting for replica set".to_string(),
        ));
    }
    Ok(())
}

/// Sleep unless shutdown is requested first; false means cancelled
async fn pause(shutdown: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn next_event(feed: &mut Option<Box<dyn ChangeFeed>>) -> Result<Option<RawChangeEvent>> {
    match feed {
        Some(feed) => feed.next().await,
        None => std::future::pending().await,
    }
}

fn log_task_result(joined: std::result::Result<ProcessOutcome, JoinError>) {
    match joined {
        Ok(outcome) => tracing::trace!(?outcome, "Audit task finished"),
        Err(e) if e.is_panic() => tracing::error!(error = %e, "Audit task panicked"),
        Err(e) => tracing::debug!(error = %e, "Audit task cancelled"),
    }
}
