//! Audit trail lifecycle — start, observe, shut down

use crate::config::AuditSettings;
use crate::error::{AuditError, Result};
use crate::source::FeedSource;
use crate::stats::{AuditStats, StatsSnapshot};
use crate::supervisor::{Supervisor, SupervisorState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A running audit trail
///
/// Holds a background supervisor task that keeps the change feed open and
/// writes audit records. Dropping the handle does not stop the task; call
/// [`AuditTrail::shutdown`] or cancel the token from
/// [`AuditTrail::shutdown_token`].
pub struct AuditTrail {
    shutdown: CancellationToken,
    task: JoinHandle<Result<()>>,
    stats: Arc<AuditStats>,
    state: watch::Receiver<SupervisorState>,
}

impl AuditTrail {
    /// Validate settings, connect, open the feed and spawn the supervisor
    ///
    /// Fails only when the settings are invalid or every initial
    /// connection attempt failed.
    pub async fn start(source: Arc<dyn FeedSource>, settings: AuditSettings) -> Result<Self> {
        Self::start_with_token(source, settings, CancellationToken::new()).await
    }

    /// Like [`AuditTrail::start`], stopped by a caller-owned token
    ///
    /// Cancelling `shutdown` while startup is still connecting aborts it with
    /// [`AuditError::Shutdown`]; cancelling later stops the running trail.
    pub async fn start_with_token(
        source: Arc<dyn FeedSource>,
        settings: AuditSettings,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        settings.validate()?;

        let mut supervisor = Supervisor::new(source, settings, shutdown.clone());
        let stats = supervisor.stats();
        let state = supervisor.subscribe_state();

        if let Err(e) = supervisor.start().await {
            if let Err(teardown) = supervisor.shutdown().await {
                tracing::warn!(error = %teardown, "Teardown after failed start also failed");
            }
            return Err(e);
        }

        let task = tokio::spawn(supervisor.run());

        Ok(Self {
            shutdown,
            task,
            stats,
            state,
        })
    }

    /// Token that stops the trail when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SupervisorState> {
        self.state.clone()
    }

    /// Wait until the supervisor reaches `target`; false on timeout
    pub async fn wait_for_state(&self, target: SupervisorState, timeout: Duration) -> bool {
        let mut rx = self.state.clone();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|s| *s == target)).await;
        matches!(waited, Ok(Ok(_)))
    }

    /// Whether the supervisor task has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the trail and wait for teardown to complete
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(AuditError::Shutdown(format!("supervisor task failed: {}", e))),
        }
    }
}
