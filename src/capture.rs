//! Best-effort pre/post-image capture enabling
//!
//! Every collection is attempted independently and every outcome is kept,
//! so one collection refusing the change never blocks the rest.

use crate::error::Result;
use crate::source::FeedConnection;
use futures::future::join_all;
use std::fmt;

/// What happened to one collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// Capture is now enabled
    Applied,
    /// Not attempted
    Skipped { reason: String },
    /// The store refused; logged and ignored
    Failed { reason: String },
}

/// Outcome for a named collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionCapture {
    pub collection: String,
    pub outcome: CaptureOutcome,
}

/// All outcomes of one enabling pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureReport {
    pub collections: Vec<CollectionCapture>,
}

impl CaptureReport {
    pub fn applied(&self) -> usize {
        self.count(|o| matches!(o, CaptureOutcome::Applied))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, CaptureOutcome::Skipped { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, CaptureOutcome::Failed { .. }))
    }

    /// Outcome for one collection, if it was part of the pass
    pub fn outcome(&self, collection: &str) -> Option<&CaptureOutcome> {
        self.collections
            .iter()
            .find(|c| c.collection == collection)
            .map(|c| &c.outcome)
    }

    fn count(&self, pred: impl Fn(&CaptureOutcome) -> bool) -> usize {
        self.collections.iter().filter(|c| pred(&c.outcome)).count()
    }
}

impl fmt::Display for CaptureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} applied, {} skipped, {} failed",
            self.applied(),
            self.skipped(),
            self.failed()
        )
    }
}

/// Enable change capture on every existing collection
///
/// Only listing the collections can fail; per-collection failures end up in
/// the report.
pub async fn enable_change_capture(conn: &dyn FeedConnection) -> Result<CaptureReport> {
    let names = conn.list_collections().await?;

    let attempts = names.into_iter().map(|collection| async move {
        let outcome = if collection.starts_with("system.") {
            CaptureOutcome::Skipped {
                reason: "system collection".to_string(),
            }
        } else {
            match conn.enable_change_capture(&collection).await {
                Ok(()) => CaptureOutcome::Applied,
                Err(e) => {
                    tracing::warn!(
                        collection = %collection,
                        error = %e,
                        "Failed to enable change capture, skipping collection"
                    );
                    CaptureOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
            }
        };
        CollectionCapture {
            collection,
            outcome,
        }
    });

    Ok(CaptureReport {
        collections: join_all(attempts).await,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectTarget;
    use crate::source::memory::MemorySource;
    use crate::source::FeedSource;

    #[tokio::test]
    async fn test_one_failure_does_not_block_the_rest() {
        let source = MemorySource::new().with_collections(["users", "orders", "broken"]);
        source.fail_capture_for("broken");
        let conn = source.connect(&ConnectTarget::default()).await.unwrap();

        let report = enable_change_capture(conn.as_ref()).await.unwrap();
        assert_eq!(report.applied(), 2);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.outcome("users"), Some(&CaptureOutcome::Applied));
        assert!(matches!(
            report.outcome("broken"),
            Some(CaptureOutcome::Failed { .. })
        ));
        assert!(source.capture_enabled("users"));
        assert!(source.capture_enabled("orders"));
        assert!(!source.capture_enabled("broken"));
    }

    #[tokio::test]
    async fn test_system_collections_are_skipped() {
        let source = MemorySource::new().with_collections(["system.views", "users"]);
        let conn = source.connect(&ConnectTarget::default()).await.unwrap();

        let report = enable_change_capture(conn.as_ref()).await.unwrap();
        assert_eq!(report.skipped(), 1);
        assert_eq!(report.applied(), 1);
        assert!(!source.capture_enabled("system.views"));
        assert_eq!(report.to_string(), "1 applied, 1 skipped, 0 failed");
    }

    #[tokio::test]
    async fn test_empty_database_yields_empty_report() {
        let source = MemorySource::new();
        let conn = source.connect(&ConnectTarget::default()).await.unwrap();

        let report = enable_change_capture(conn.as_ref()).await.unwrap();
        assert!(report.collections.is_empty());
    }
}
