//! Broadcast hub for shard progress.
//!
//! The observer list is copy-on-write: `publish` clones an `Arc` of the current
//! list and notifies without holding any lock, so publishers never contend with
//! each other or with (un)subscription. Observers are invoked inline and in
//! publish order; an observer that errors or panics is logged and skipped.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;

use crate::error::DaemonError;
use crate::shard::{ShardName, ShardState};

/// Receives every published [`ShardState`].
pub trait ShardObserver: Send + Sync {
    fn on_state(&self, state: &ShardState) -> anyhow::Result<()>;
}

impl<F> ShardObserver for F
where
    F: Fn(&ShardState) -> anyhow::Result<()> + Send + Sync,
{
    fn on_state(&self, state: &ShardState) -> anyhow::Result<()> {
        self(state)
    }
}

type ObserverList = Arc<Vec<(u64, Arc<dyn ShardObserver>)>>;

/// Unsubscribes its observer when dropped.
#[must_use = "dropping the subscription unsubscribes the observer"]
pub struct ObserverSubscription {
    tracker: Weak<ShardStateTracker>,
    id: u64,
}

impl ObserverSubscription {
    pub fn unsubscribe(self) {}
}

impl Drop for ObserverSubscription {
    fn drop(&mut self) {
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.remove(self.id);
        }
    }
}

#[derive(Default)]
pub struct ShardStateTracker {
    observers: RwLock<ObserverList>,
    next_id: AtomicU64,
    latest: RwLock<HashMap<String, ShardState>>,
    high_water: AtomicU64,
}

impl ShardStateTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(self: &Arc<Self>, observer: Arc<dyn ShardObserver>) -> ObserverSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.observers.write().unwrap_or_else(PoisonError::into_inner);
        let mut next: Vec<_> = guard.iter().cloned().collect();
        next.push((id, observer));
        *guard = Arc::new(next);

        ObserverSubscription {
            tracker: Arc::downgrade(self),
            id,
        }
    }

    /// Subscribe with a channel instead of a callback.
    pub fn subscribe_channel(self: &Arc<Self>) -> (ObserverSubscription, mpsc::UnboundedReceiver<ShardState>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let observer = move |state: &ShardState| -> anyhow::Result<()> {
            // A closed receiver means the listener is going away; nothing to report.
            let _ = tx.send(state.clone());
            Ok(())
        };
        (self.subscribe(Arc::new(observer)), rx)
    }

    fn remove(&self, id: u64) {
        let mut guard = self.observers.write().unwrap_or_else(PoisonError::into_inner);
        let next: Vec<_> = guard.iter().filter(|(oid, _)| *oid != id).cloned().collect();
        *guard = Arc::new(next);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn publish(&self, state: ShardState) {
        if state.is_high_water() {
            self.high_water.fetch_max(state.sequence, Ordering::SeqCst);
        }

        self.latest
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(state.shard.identity().to_string(), state.clone());

        let observers = self.observers.read().unwrap_or_else(PoisonError::into_inner).clone();
        for (id, observer) in observers.iter() {
            match catch_unwind(AssertUnwindSafe(|| observer.on_state(&state))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(observer = id, shard = %state.shard, error = %err, "shard observer failed");
                }
                Err(_) => {
                    warn!(observer = id, shard = %state.shard, "shard observer panicked");
                }
            }
        }
    }

    /// Last state published for `shard`.
    pub fn latest(&self, shard: &ShardName) -> Option<ShardState> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(shard.identity())
            .cloned()
    }

    /// Highest high-water mark published so far.
    pub fn high_water_mark(&self) -> u64 {
        self.high_water.load(Ordering::SeqCst)
    }

    /// Resolve with the first state matching `predicate`, including the latest
    /// state already cached for each shard.
    pub async fn wait_for_condition<P>(self: &Arc<Self>, predicate: P, timeout: Duration) -> Result<ShardState, DaemonError>
    where
        P: Fn(&ShardState) -> bool + Send + Sync,
    {
        // Subscribe before checking the cache so nothing published in between is missed.
        let (_subscription, mut rx) = self.subscribe_channel();

        let cached = self
            .latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|s| predicate(s))
            .cloned();
        if let Some(state) = cached {
            return Ok(state);
        }

        let wait = async {
            while let Some(state) = rx.recv().await {
                if predicate(&state) {
                    return Some(state);
                }
            }
            None
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Some(state)) => Ok(state),
            Ok(None) => Err(DaemonError::Cancelled),
            Err(_) => Err(DaemonError::timeout("waiting for shard state", timeout)),
        }
    }

    /// Wait until `shard` has reported a position at or beyond `sequence`.
    pub async fn wait_for_shard_state(
        self: &Arc<Self>,
        shard: &ShardName,
        sequence: u64,
        timeout: Duration,
    ) -> Result<ShardState, DaemonError> {
        let identity = shard.identity().to_string();
        self.wait_for_condition(move |s| s.shard.identity() == identity && s.sequence >= sequence, timeout)
            .await
    }
}
