//! High-water mark detection.
//!
//! The agent polls the store for the highest contiguous sequence and publishes
//! it through the tracker under [`ShardName::HIGH_WATER_MARK`]. A gap that
//! holds the mark back for longer than the stale threshold is assumed to be a
//! rolled-back writer and is skipped.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::DaemonError;
use crate::settings::DaemonSettings;
use crate::shard::{ShardName, ShardState};
use crate::store::EventDatabase;
use crate::tracker::ShardStateTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HighWaterStatus {
    /// Nothing new since the previous poll.
    CaughtUp,
    /// The contiguous sequence advanced.
    Changed,
    /// A stale gap was skipped.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighWaterStatistics {
    pub mark: u64,
    pub highest_sequence: u64,
    pub last_changed: DateTime<Utc>,
    pub status: HighWaterStatus,
}

struct Detector {
    mark: u64,
    highest: u64,
    /// When the mark last moved or last had nothing pending behind it.
    since: Instant,
    last_changed: DateTime<Utc>,
    status: HighWaterStatus,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct HighWaterAgent {
    db: Arc<dyn EventDatabase>,
    tracker: Arc<ShardStateTracker>,
    polling: Duration,
    stale_threshold: Duration,
    parent: CancellationToken,
    detector: Mutex<Detector>,
    running: Mutex<Option<Running>>,
}

impl HighWaterAgent {
    pub fn new(
        db: Arc<dyn EventDatabase>,
        tracker: Arc<ShardStateTracker>,
        settings: &DaemonSettings,
        parent: CancellationToken,
    ) -> Arc<Self> {
        let mark = tracker.high_water_mark();
        Arc::new(Self {
            db,
            tracker,
            polling: settings.high_water_polling,
            stale_threshold: settings.stale_sequence_threshold,
            parent,
            detector: Mutex::new(Detector {
                mark,
                highest: mark,
                since: Instant::now(),
                last_changed: Utc::now(),
                status: HighWaterStatus::CaughtUp,
            }),
            running: Mutex::new(None),
        })
    }

    /// Start polling. Starting a running agent is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return;
        }

        let cancel = self.parent.child_token();
        let agent = self.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { agent.run(token).await });

        *running = Some(Running { cancel, handle });
        info!(store = self.db.identifier(), interval = ?self.polling, "high-water agent started");
    }

    /// Stop polling and wait for the loop to exit. Stopping a stopped agent is a no-op.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        running.cancel.cancel();
        if let Err(err) = running.handle.await {
            warn!(error = %err, "high-water loop ended abnormally");
        }
        info!(store = self.db.identifier(), "high-water agent stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Poll once out of band and publish the result, changed or not.
    pub async fn check_now(&self) -> Result<u64, DaemonError> {
        let (mark, _) = self.poll().await?;
        self.tracker.publish(ShardState::high_water(mark));
        Ok(mark)
    }

    pub async fn statistics(&self) -> HighWaterStatistics {
        let detector = self.detector.lock().await;
        HighWaterStatistics {
            mark: detector.mark,
            highest_sequence: detector.highest,
            last_changed: detector.last_changed,
            status: detector.status,
        }
    }

    async fn run(&self, cancel: CancellationToken) {
        loop {
            match self.poll().await {
                Ok((mark, HighWaterStatus::CaughtUp)) => debug!(mark, "high-water mark unchanged"),
                Ok((mark, _)) => self.tracker.publish(ShardState::high_water(mark)),
                Err(err) => warn!(error = %err, "high-water poll failed"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.polling) => {}
            }
        }
    }

    async fn poll(&self) -> Result<(u64, HighWaterStatus), DaemonError> {
        let contiguous = self.db.fetch_highest_contiguous_sequence().await?;
        let highest = self.db.fetch_highest_sequence().await?;

        let mut detector = self.detector.lock().await;
        let now = Instant::now();
        detector.highest = highest.max(detector.highest);

        let status = if contiguous > detector.mark {
            debug!(from = detector.mark, to = contiguous, "high-water mark advanced");
            detector.mark = contiguous;
            HighWaterStatus::Changed
        } else if highest > detector.mark && now.duration_since(detector.since) >= self.stale_threshold {
            warn!(
                from = detector.mark,
                to = highest,
                threshold = ?self.stale_threshold,
                "skipping stale sequence gap"
            );
            detector.mark = highest;
            HighWaterStatus::Stale
        } else {
            HighWaterStatus::CaughtUp
        };

        if status != HighWaterStatus::CaughtUp {
            detector.last_changed = Utc::now();
        }
        if status != HighWaterStatus::CaughtUp || detector.mark >= highest {
            detector.since = now;
        }
        detector.status = status;

        Ok((detector.mark, status))
    }
}

impl std::fmt::Debug for HighWaterAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HighWaterAgent")
            .field("store", &self.db.identifier())
            .field("shard", &ShardName::HIGH_WATER_MARK)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryEventDatabase;
    use serde_json::json;
    use skein_core::TenantId;
    use skein_events::{PendingEvent, StreamAction, StreamIdentity};

    fn append(db: &InMemoryEventDatabase, stream: &str) {
        db.append(StreamAction::append(
            TenantId::default_tenant(),
            StreamIdentity::key(stream),
            vec![PendingEvent::new("order.placed", json!({}))],
        ))
        .unwrap();
    }

    fn agent(db: Arc<InMemoryEventDatabase>, stale: Duration) -> (Arc<HighWaterAgent>, Arc<ShardStateTracker>) {
        let tracker = ShardStateTracker::new();
        let settings = DaemonSettings::default()
            .with_high_water_polling(Duration::from_millis(10))
            .with_stale_sequence_threshold(stale);
        let agent = HighWaterAgent::new(db, tracker.clone(), &settings, CancellationToken::new());
        (agent, tracker)
    }

    #[tokio::test]
    async fn check_now_publishes_the_contiguous_mark() {
        let db = Arc::new(InMemoryEventDatabase::new());
        append(&db, "a");
        append(&db, "b");
        let (agent, tracker) = agent(db, Duration::from_secs(60));

        assert_eq!(agent.check_now().await.unwrap(), 2);
        assert_eq!(tracker.high_water_mark(), 2);
        assert_eq!(agent.statistics().await.status, HighWaterStatus::Changed);

        assert_eq!(agent.check_now().await.unwrap(), 2);
        assert_eq!(agent.statistics().await.status, HighWaterStatus::CaughtUp);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_gaps_are_skipped_after_the_threshold() {
        let db = Arc::new(InMemoryEventDatabase::new());
        append(&db, "a");
        db.reserve_sequence().unwrap();
        append(&db, "b");
        let (agent, _tracker) = agent(db, Duration::from_secs(3));

        assert_eq!(agent.check_now().await.unwrap(), 1);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(agent.check_now().await.unwrap(), 1);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(agent.check_now().await.unwrap(), 3);
        let stats = agent.statistics().await;
        assert_eq!(stats.status, HighWaterStatus::Stale);
        assert_eq!(stats.highest_sequence, 3);
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let db = Arc::new(InMemoryEventDatabase::new());
        append(&db, "a");
        let (agent, tracker) = agent(db, Duration::from_secs(60));

        agent.start().await;
        agent.start().await;
        assert!(agent.is_running().await);

        tracker
            .wait_for_shard_state(&ShardName::high_water_mark(), 1, Duration::from_secs(2))
            .await
            .unwrap();

        agent.stop().await;
        agent.stop().await;
        assert!(!agent.is_running().await);
    }
}
