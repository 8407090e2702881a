//! The daemon: registry and lifecycle of every agent on one event database.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use skein_core::DomainError;

use crate::agent::{AgentSnapshot, AgentStartRequest, StartFloor, SubscriptionAgent};
use crate::dead_letter::{DeadLetterEvent, DeadLetterSink};
use crate::error::{DaemonError, RebuildFailure};
use crate::high_water::{HighWaterAgent, HighWaterStatistics};
use crate::projection::ProjectionSource;
use crate::settings::DaemonSettings;
use crate::shard::{AsyncShard, ShardName, ShardState};
use crate::store::EventDatabase;
use crate::tracker::{ObserverSubscription, ShardStateTracker};

type AgentMap = RwLock<HashMap<String, Arc<SubscriptionAgent>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildOutcome {
    /// The store holds no events; nothing was touched.
    NoData,
    Completed { ceiling: u64, shards: usize },
}

/// Rebuild agents that must leave the registry however the rebuild ends.
///
/// Dropping the guard without [`RebuildAgents::release`] (the rebuild future
/// was dropped) abandons the agents as well.
struct RebuildAgents {
    registry: Arc<AgentMap>,
    agents: Vec<Arc<SubscriptionAgent>>,
}

impl RebuildAgents {
    fn release(mut self) -> Vec<Arc<SubscriptionAgent>> {
        self.unregister();
        std::mem::take(&mut self.agents)
    }

    fn unregister(&self) {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        for agent in &self.agents {
            let identity = agent.shard().identity();
            if registry.get(identity).is_some_and(|current| Arc::ptr_eq(current, agent)) {
                registry.remove(identity);
            }
        }
    }
}

impl Drop for RebuildAgents {
    fn drop(&mut self) {
        if self.agents.is_empty() {
            return;
        }
        for agent in &self.agents {
            agent.abandon();
        }
        self.unregister();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewindTarget {
    Sequence(u64),
    /// Rewind to the last event committed before this instant.
    Timestamp(DateTime<Utc>),
}

struct DaemonInner {
    db: Arc<dyn EventDatabase>,
    tracker: Arc<ShardStateTracker>,
    settings: DaemonSettings,
    projections: RwLock<BTreeMap<String, Arc<dyn ProjectionSource>>>,
    agents: Arc<AgentMap>,
    /// Serializes registry mutations.
    registry: tokio::sync::Mutex<()>,
    high_water: Arc<HighWaterAgent>,
    dead_letters: Arc<DeadLetterSink>,
    cancel: CancellationToken,
    _high_water_forwarding: ObserverSubscription,
}

impl Drop for DaemonInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Runs projections against one event database.
#[derive(Clone)]
pub struct AsyncDaemon {
    inner: Arc<DaemonInner>,
}

impl AsyncDaemon {
    /// Must be called inside a tokio runtime.
    pub fn new(db: Arc<dyn EventDatabase>, settings: DaemonSettings) -> Self {
        let tracker = ShardStateTracker::new();
        let cancel = CancellationToken::new();
        let agents: Arc<AgentMap> = Arc::default();

        let forwarding = {
            let agents: Weak<AgentMap> = Arc::downgrade(&agents);
            tracker.subscribe(Arc::new(move |state: &ShardState| -> anyhow::Result<()> {
                if !state.is_high_water() {
                    return Ok(());
                }
                if let Some(agents) = agents.upgrade() {
                    for agent in agents.read().unwrap_or_else(PoisonError::into_inner).values() {
                        agent.mark_high_water(state.sequence);
                    }
                }
                Ok(())
            }))
        };

        let high_water = HighWaterAgent::new(db.clone(), tracker.clone(), &settings, cancel.clone());
        let dead_letters = Arc::new(DeadLetterSink::spawn(
            db.clone(),
            settings.dead_letter_capacity,
            settings.dead_letter_retry.clone(),
        ));

        Self {
            inner: Arc::new(DaemonInner {
                db,
                tracker,
                settings,
                projections: RwLock::default(),
                agents,
                registry: tokio::sync::Mutex::new(()),
                high_water,
                dead_letters,
                cancel,
                _high_water_forwarding: forwarding,
            }),
        }
    }

    pub fn tracker(&self) -> &Arc<ShardStateTracker> {
        &self.inner.tracker
    }

    pub fn settings(&self) -> &DaemonSettings {
        &self.inner.settings
    }

    /// Add a projection. Names must be unique.
    pub fn register(&self, projection: Arc<dyn ProjectionSource>) -> Result<(), DaemonError> {
        projection.shards()?;
        let mut projections = self.inner.projections.write().unwrap_or_else(PoisonError::into_inner);
        let name = projection.name().to_string();
        if projections.contains_key(&name) {
            return Err(DomainError::conflict(format!("projection '{name}' is already registered")).into());
        }
        projections.insert(name, projection);
        Ok(())
    }

    pub fn projection_names(&self) -> Vec<String> {
        self.inner
            .projections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn projection(&self, name: &str) -> Result<Arc<dyn ProjectionSource>, DaemonError> {
        self.inner
            .projections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| DaemonError::UnknownProjection(name.to_string()))
    }

    fn find_shard(&self, name: &ShardName) -> Result<(Arc<dyn ProjectionSource>, AsyncShard), DaemonError> {
        let source = self
            .projection(name.projection_name())
            .map_err(|_| DaemonError::UnknownShard(name.to_string()))?;
        let shard = source
            .shards()?
            .into_iter()
            .find(|s| s.name.identity() == name.identity())
            .ok_or_else(|| DaemonError::UnknownShard(name.to_string()))?;
        Ok((source, shard))
    }

    fn new_agent(&self, shard: AsyncShard, source: Arc<dyn ProjectionSource>) -> Arc<SubscriptionAgent> {
        SubscriptionAgent::new(
            shard,
            source,
            self.inner.db.clone(),
            self.inner.tracker.clone(),
            self.inner.dead_letters.clone(),
            self.inner.settings.clone(),
            self.inner.cancel.clone(),
        )
    }

    fn agent(&self, identity: &str) -> Option<Arc<SubscriptionAgent>> {
        self.inner
            .agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
            .cloned()
    }

    /// Publishes reaching the registry before the insert are caught up here.
    fn insert_agent(&self, agent: Arc<SubscriptionAgent>) -> Option<Arc<SubscriptionAgent>> {
        let previous = self
            .inner
            .agents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(agent.shard().identity().to_string(), agent.clone());
        agent.mark_high_water(self.inner.tracker.high_water_mark());
        previous
    }

    fn remove_agent(&self, identity: &str) -> Option<Arc<SubscriptionAgent>> {
        self.inner
            .agents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(identity)
    }

    pub fn is_running(&self, identity: &str) -> bool {
        self.agent(identity).is_some_and(|a| a.is_running())
    }

    fn any_running(&self) -> bool {
        self.inner
            .agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|a| a.is_running())
    }

    async fn stop_high_water_if_idle(&self) {
        if !self.any_running() {
            self.inner.high_water.stop().await;
        }
    }

    /// Start one shard in continuous mode.
    ///
    /// Returns `Ok(false)` when the agent failed to start; the failure is logged
    /// and the caller may retry. Starting a running shard is a no-op.
    pub async fn start_agent(&self, shard: &ShardName) -> Result<bool, DaemonError> {
        if self.is_running(shard.identity()) {
            return Ok(true);
        }

        let _registry = self.inner.registry.lock().await;
        if self.is_running(shard.identity()) {
            return Ok(true);
        }
        self.start_agent_locked(shard).await
    }

    async fn start_agent_locked(&self, shard: &ShardName) -> Result<bool, DaemonError> {
        let (source, shard) = self.find_shard(shard)?;
        self.inner.high_water.start().await;

        let agent = self.new_agent(shard, source);
        let timeout = self.inner.settings.agent_start_timeout;
        let failure = match tokio::time::timeout(timeout, agent.start(AgentStartRequest::continuous())).await {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err),
            Err(_) => Some(DaemonError::timeout(format!("starting {}", agent.shard()), timeout)),
        };

        if let Some(err) = failure {
            warn!(shard = %agent.shard(), error = %err, "agent failed to start");
            agent.hard_stop().await;
            self.stop_high_water_if_idle().await;
            return Ok(false);
        }

        if let Some(previous) = self.insert_agent(agent) {
            previous.hard_stop().await;
        }
        Ok(true)
    }

    /// Drain and remove one shard's agent. Returns `false` if the drain timed out.
    pub async fn stop_agent(&self, shard: &ShardName) -> bool {
        let _registry = self.inner.registry.lock().await;
        let Some(agent) = self.remove_agent(shard.identity()) else {
            return true;
        };

        let drained = agent.stop_and_drain(self.inner.settings.drain_timeout).await;
        self.stop_high_water_if_idle().await;
        drained
    }

    /// Start every shard of every registered projection.
    ///
    /// Returns the number of shards running afterwards.
    pub async fn start_all(&self) -> Result<usize, DaemonError> {
        let shards: Vec<ShardName> = {
            let projections = self.inner.projections.read().unwrap_or_else(PoisonError::into_inner);
            let mut shards = Vec::new();
            for projection in projections.values() {
                shards.extend(projection.shards()?.into_iter().map(|s| s.name));
            }
            shards
        };

        info!(shards = shards.len(), store = self.inner.db.identifier(), "starting all shards");
        let _registry = self.inner.registry.lock().await;
        let mut running = 0;
        for shard in &shards {
            if self.is_running(shard.identity()) || self.start_agent_locked(shard).await? {
                running += 1;
            }
        }
        Ok(running)
    }

    /// Drain and remove every agent, then stop the high-water agent.
    pub async fn stop_all(&self) {
        let _registry = self.inner.registry.lock().await;
        let agents: Vec<Arc<SubscriptionAgent>> = self
            .inner
            .agents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, agent)| agent)
            .collect();

        let timeout = self.inner.settings.drain_timeout;
        join_all(agents.iter().map(|a| a.stop_and_drain(timeout))).await;
        self.inner.high_water.stop().await;
        info!(stopped = agents.len(), "all shards stopped");
    }

    /// Rebuild a projection from scratch up to the current high-water mark.
    ///
    /// Every shard replays in parallel with its own `timeout`. Shard failures
    /// are collected and returned together once all shards have finished.
    /// Firing `cancel` hard stops every replay and yields `Cancelled`; the
    /// rebuild agents leave the registry on every exit path, including when
    /// this future is dropped.
    pub async fn rebuild_projection(
        &self,
        name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<RebuildOutcome, DaemonError> {
        let source = self.projection(name)?;
        let shards = source.shards()?;

        let (ceiling, guard) = {
            let _registry = self.inner.registry.lock().await;
            for shard in &shards {
                if let Some(agent) = self.remove_agent(shard.name.identity()) {
                    agent.stop_and_drain(self.inner.settings.drain_timeout).await;
                }
            }

            let ceiling = self.inner.high_water.check_now().await?;
            if ceiling == 0 {
                self.stop_high_water_if_idle().await;
                info!(projection = name, "nothing to rebuild, the store is empty");
                return Ok(RebuildOutcome::NoData);
            }
            if cancel.is_cancelled() {
                self.stop_high_water_if_idle().await;
                return Err(DaemonError::Cancelled);
            }

            self.inner.db.teardown_progress(name).await?;
            self.inner.db.teardown_projection_data(name).await?;

            let guard = RebuildAgents {
                registry: self.inner.agents.clone(),
                agents: shards
                    .into_iter()
                    .map(|shard| self.new_agent(shard, source.clone()))
                    .collect(),
            };
            for agent in &guard.agents {
                self.insert_agent(agent.clone());
            }
            (ceiling, guard)
        };

        info!(projection = name, ceiling, shards = guard.agents.len(), "rebuild started");
        let results = join_all(
            guard
                .agents
                .iter()
                .map(|agent| agent.replay(StartFloor::FromProgress, ceiling, timeout, cancel)),
        )
        .await;

        let agents = {
            let _registry = self.inner.registry.lock().await;
            guard.release()
        };
        self.stop_high_water_if_idle().await;

        if results.iter().any(|r| matches!(r, Err(DaemonError::Cancelled))) {
            warn!(projection = name, "rebuild cancelled");
            return Err(DaemonError::Cancelled);
        }

        let failures: Vec<(String, String)> = agents
            .iter()
            .zip(results)
            .filter_map(|(agent, result)| {
                result
                    .err()
                    .map(|err| (agent.shard().identity().to_string(), err.to_string()))
            })
            .collect();

        if failures.is_empty() {
            info!(projection = name, ceiling, "rebuild completed");
            Ok(RebuildOutcome::Completed {
                ceiling,
                shards: agents.len(),
            })
        } else {
            warn!(projection = name, failed = failures.len(), "rebuild failed");
            Err(RebuildFailure {
                projection: name.to_string(),
                failures,
            }
            .into())
        }
    }

    /// Move every shard of a subscription back to `target` and resume continuous
    /// processing from there.
    ///
    /// Documents are kept: events after the new floor are applied again.
    pub async fn rewind_subscription(&self, name: &str, target: RewindTarget) -> Result<u64, DaemonError> {
        let source = self.projection(name)?;
        let floor = match target {
            RewindTarget::Sequence(sequence) => sequence,
            RewindTarget::Timestamp(timestamp) => self.inner.db.find_floor_sequence_at_timestamp(timestamp).await?,
        };
        info!(projection = name, floor, "rewinding subscription");

        let _registry = self.inner.registry.lock().await;
        self.inner.high_water.start().await;
        for shard in source.shards()? {
            if let Some(agent) = self.remove_agent(shard.name.identity()) {
                agent.stop_and_drain(self.inner.settings.drain_timeout).await;
            }

            let agent = self.new_agent(shard, source.clone());
            let timeout = self.inner.settings.agent_start_timeout;
            let failure = match tokio::time::timeout(timeout, agent.start(AgentStartRequest::rewind_to(floor))).await {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err.to_string()),
                Err(_) => Some(format!("start timed out after {timeout:?}")),
            };
            if let Some(reason) = failure {
                agent.hard_stop().await;
                self.stop_high_water_if_idle().await;
                return Err(DaemonError::ShardFailed {
                    shard: agent.shard().to_string(),
                    reason,
                });
            }
            self.insert_agent(agent);
        }
        Ok(floor)
    }

    /// Force a high-water check, then wait until every running shard has
    /// caught up with it.
    pub async fn wait_for_non_stale_data(&self, timeout: Duration) -> Result<(), DaemonError> {
        let mark = self.inner.high_water.check_now().await?;
        let agents: Vec<Arc<SubscriptionAgent>> = self
            .inner
            .agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|a| a.is_running())
            .cloned()
            .collect();

        let waits = join_all(agents.iter().map(|a| a.wait_for_position(mark, timeout)));
        let results = tokio::time::timeout(timeout, waits)
            .await
            .map_err(|_| DaemonError::timeout(format!("waiting for shards to reach {mark}"), timeout))?;
        results.into_iter().collect()
    }

    pub fn agents(&self) -> BTreeMap<String, AgentSnapshot> {
        self.inner
            .agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(identity, agent)| (identity.clone(), agent.snapshot()))
            .collect()
    }

    pub fn status_for(&self, identity: &str) -> Option<AgentSnapshot> {
        self.agent(identity).map(|a| a.snapshot())
    }

    /// Whether the high-water agent is polling; it only runs while some agent does.
    pub async fn is_high_water_running(&self) -> bool {
        self.inner.high_water.is_running().await
    }

    pub async fn high_water_statistics(&self) -> HighWaterStatistics {
        self.inner.high_water.statistics().await
    }

    pub async fn dead_letters(&self, shard: &ShardName) -> Result<Vec<DeadLetterEvent>, DaemonError> {
        Ok(self.inner.db.load_dead_letter_events(shard).await?)
    }

    /// Stop everything and flush queued dead letters.
    pub async fn shutdown(&self) {
        info!(store = self.inner.db.identifier(), "daemon shutting down");
        self.stop_all().await;
        if !self.inner.dead_letters.drain(self.inner.settings.drain_timeout).await {
            warn!("dead letters still queued at shutdown");
        }
        self.inner.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::{Projection, SliceWriter};
    use crate::slicing::{ByStream, EventSlicer};
    use crate::store::InMemoryEventDatabase;
    use skein_events::Event;

    fn noop(name: &str) -> Arc<dyn ProjectionSource> {
        Arc::new(
            Projection::new(name, "noop", EventSlicer::new().group_by(ByStream))
                .on("anything", |_: &Event, _: &mut SliceWriter<'_>| Ok(())),
        )
    }

    #[tokio::test]
    async fn duplicate_projection_names_are_rejected() {
        let daemon = AsyncDaemon::new(Arc::new(InMemoryEventDatabase::new()), DaemonSettings::default());
        daemon.register(noop("Orders")).unwrap();
        let err = daemon.register(noop("Orders")).unwrap_err();
        assert!(matches!(err, DaemonError::Domain(DomainError::Conflict(_))));
        assert_eq!(daemon.projection_names(), vec!["Orders".to_string()]);
    }

    #[tokio::test]
    async fn projections_without_a_valid_shard_identity_are_rejected() {
        let daemon = AsyncDaemon::new(Arc::new(InMemoryEventDatabase::new()), DaemonSettings::default());
        let err = daemon.register(noop("Orders:V2")).unwrap_err();
        assert!(matches!(err, DaemonError::Domain(DomainError::InvalidId(_))));
        assert!(daemon.projection_names().is_empty());
    }

    #[tokio::test]
    async fn unknown_shards_and_projections_are_errors() {
        let daemon = AsyncDaemon::new(Arc::new(InMemoryEventDatabase::new()), DaemonSettings::default());
        daemon.register(noop("Orders")).unwrap();

        let err = daemon.start_agent(&ShardName::new("Missing").unwrap()).await.unwrap_err();
        assert!(matches!(err, DaemonError::UnknownShard(_)));
        let err = daemon.start_agent(&ShardName::with_key("Orders", "Other").unwrap()).await.unwrap_err();
        assert!(matches!(err, DaemonError::UnknownShard(_)));
        let err = daemon
            .rebuild_projection("Missing", Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::UnknownProjection(_)));
    }

    #[tokio::test]
    async fn stopping_an_unknown_agent_is_a_no_op() {
        let daemon = AsyncDaemon::new(Arc::new(InMemoryEventDatabase::new()), DaemonSettings::default());
        assert!(daemon.stop_agent(&ShardName::new("Orders").unwrap()).await);
        assert!(daemon.agents().is_empty());
    }
}
