//! Subscription agents: one shard's lifecycle.
//!
//! An agent owns a pump task that loads pages bounded by the high-water mark
//! (and, when replaying, a fixed ceiling) and feeds them into the shard's
//! pipeline. Status and position are exposed through a watch channel so
//! callers can wait on them.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dead_letter::DeadLetterSink;
use crate::error::DaemonError;
use crate::loader::{EventLoader, EventRange};
use crate::pipeline::{ExecutionContext, ExecutionListener, ShardExecution};
use crate::projection::ProjectionSource;
use crate::retry::RetryPolicy;
use crate::settings::DaemonSettings;
use crate::shard::{AsyncShard, ShardAction, ShardExecutionMode, ShardName, ShardState};
use crate::store::EventDatabase;
use crate::tracker::ShardStateTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Stopped,
    Starting,
    Running,
    /// Stopped by a critical failure; see [`AgentSnapshot::error`].
    Paused,
    Stopping,
}

/// Point-in-time view of an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub shard: ShardName,
    pub status: AgentStatus,
    /// Ceiling of the last committed range.
    pub position: u64,
    pub high_water: u64,
    pub mode: ShardExecutionMode,
    pub error: Option<String>,
}

/// Where an agent starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFloor {
    /// Resume from persisted progress.
    FromProgress,
    /// Start right after this sequence, rewriting persisted progress if it differs.
    At(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentStartRequest {
    pub mode: ShardExecutionMode,
    pub floor: StartFloor,
    /// Stop enqueuing once this sequence is reached.
    pub ceiling: Option<u64>,
}

impl AgentStartRequest {
    pub fn continuous() -> Self {
        Self {
            mode: ShardExecutionMode::Continuous,
            floor: StartFloor::FromProgress,
            ceiling: None,
        }
    }

    pub fn rewind_to(floor: u64) -> Self {
        Self {
            floor: StartFloor::At(floor),
            ..Self::continuous()
        }
    }

    pub fn rebuild(ceiling: u64) -> Self {
        Self {
            mode: ShardExecutionMode::Rebuild,
            floor: StartFloor::FromProgress,
            ceiling: Some(ceiling),
        }
    }
}

/// State shared between the agent, its pump and its pipeline.
struct AgentShared {
    shard: ShardName,
    tracker: Arc<ShardStateTracker>,
    snapshot: watch::Sender<AgentSnapshot>,
    high_water: watch::Sender<u64>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl AgentShared {
    fn set_status(&self, status: AgentStatus) {
        self.snapshot.send_modify(|s| s.status = status);
    }
}

impl ExecutionListener for AgentShared {
    fn mark_success(&self, range: &EventRange) {
        self.snapshot.send_modify(|s| s.position = s.position.max(range.ceiling));
    }

    fn report_critical_failure(&self, error: DaemonError) {
        error!(shard = %self.shard, error = %error, "shard paused after critical failure");
        let position = self.snapshot.borrow().position;
        self.snapshot.send_modify(|s| {
            s.status = AgentStatus::Paused;
            s.error = Some(error.to_string());
        });
        if let Some(cancel) = self.cancel.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            cancel.cancel();
        }
        self.tracker
            .publish(ShardState::new(self.shard.clone(), position, ShardAction::Paused));
    }
}

struct AgentRun {
    cancel: CancellationToken,
    pump_cancel: CancellationToken,
    execution: Arc<dyn ShardExecution>,
    pump: JoinHandle<()>,
}

pub struct SubscriptionAgent {
    shard: AsyncShard,
    source: Arc<dyn ProjectionSource>,
    db: Arc<dyn EventDatabase>,
    dead_letters: Arc<DeadLetterSink>,
    settings: DaemonSettings,
    parent: CancellationToken,
    shared: Arc<AgentShared>,
    run: tokio::sync::Mutex<Option<AgentRun>>,
}

impl SubscriptionAgent {
    pub fn new(
        shard: AsyncShard,
        source: Arc<dyn ProjectionSource>,
        db: Arc<dyn EventDatabase>,
        tracker: Arc<ShardStateTracker>,
        dead_letters: Arc<DeadLetterSink>,
        settings: DaemonSettings,
        parent: CancellationToken,
    ) -> Arc<Self> {
        let high_water = tracker.high_water_mark();
        let (snapshot, _) = watch::channel(AgentSnapshot {
            shard: shard.name.clone(),
            status: AgentStatus::Stopped,
            position: 0,
            high_water,
            mode: ShardExecutionMode::Continuous,
            error: None,
        });
        let (high_water, _) = watch::channel(high_water);

        Arc::new(Self {
            shared: Arc::new(AgentShared {
                shard: shard.name.clone(),
                tracker,
                snapshot,
                high_water,
                cancel: Mutex::new(None),
            }),
            shard,
            source,
            db,
            dead_letters,
            settings,
            parent,
            run: tokio::sync::Mutex::new(None),
        })
    }

    pub fn shard(&self) -> &ShardName {
        &self.shard.name
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        self.shared.snapshot.borrow().clone()
    }

    pub fn status(&self) -> AgentStatus {
        self.shared.snapshot.borrow().status
    }

    pub fn is_running(&self) -> bool {
        matches!(self.status(), AgentStatus::Starting | AgentStatus::Running)
    }

    /// Raise the read bound; wakes a pump waiting for data.
    pub fn mark_high_water(&self, sequence: u64) {
        let raised = self.shared.high_water.send_if_modified(|current| {
            if sequence > *current {
                *current = sequence;
                true
            } else {
                false
            }
        });
        if raised {
            self.shared.snapshot.send_modify(|s| s.high_water = sequence);
        }
    }

    /// Start processing. Starting a running agent is a no-op.
    pub async fn start(&self, request: AgentStartRequest) -> Result<(), DaemonError> {
        let mut run = self.run.lock().await;
        if run.is_some() && self.is_running() {
            return Ok(());
        }
        if let Some(stale) = run.take() {
            stale.cancel.cancel();
            stale.pump.abort();
            stale.execution.hard_stop().await;
        }

        let shard = self.shard.name.clone();
        self.shared.set_status(AgentStatus::Starting);

        let floor = match self.resolve_floor(request.floor).await {
            Ok(floor) => floor,
            Err(err) => {
                self.shared.set_status(AgentStatus::Stopped);
                return Err(err);
            }
        };

        let cancel = self.parent.child_token();
        let pump_cancel = cancel.child_token();
        *self.shared.cancel.lock().unwrap_or_else(PoisonError::into_inner) = Some(cancel.clone());

        let errors = match request.mode {
            ShardExecutionMode::Continuous => self.settings.continuous_errors,
            ShardExecutionMode::Rebuild => self.settings.rebuild_errors,
        };
        let context = ExecutionContext {
            db: self.db.clone(),
            tracker: self.shared.tracker.clone(),
            dead_letters: self.dead_letters.clone(),
            errors,
            capacity: self.settings.pipeline_capacity,
            listener: self.shared.clone(),
            cancel: cancel.clone(),
        };
        let execution = self.source.clone().build_execution(&self.shard, context);

        self.shared.snapshot.send_modify(|s| {
            s.status = AgentStatus::Running;
            s.position = floor;
            s.mode = request.mode;
            s.error = None;
        });
        self.shared
            .tracker
            .publish(ShardState::new(shard.clone(), floor, ShardAction::Started));

        let pump = Pump {
            shard: shard.clone(),
            loader: EventLoader::new(
                self.db.clone(),
                self.shard.filter.clone(),
                self.shard.batch_size.unwrap_or(self.settings.batch_size),
            ),
            execution: execution.clone(),
            shared: self.shared.clone(),
            load_retry: self.settings.load_retry.clone(),
            ceiling: request.ceiling,
            cancel: pump_cancel.clone(),
        };
        let handle = tokio::spawn(pump.run(floor));

        *run = Some(AgentRun {
            cancel,
            pump_cancel,
            execution,
            pump: handle,
        });
        info!(%shard, floor, mode = ?request.mode, ceiling = ?request.ceiling, "agent started");
        Ok(())
    }

    async fn resolve_floor(&self, floor: StartFloor) -> Result<u64, DaemonError> {
        let progress = self.db.read_progress(&self.shard.name).await?.unwrap_or(0);
        match floor {
            StartFloor::FromProgress => Ok(progress),
            StartFloor::At(floor) => {
                if floor != progress {
                    info!(shard = %self.shard.name, from = progress, to = floor, "rewriting shard progress");
                    self.db.rewind_progress(&self.shard.name, floor).await?;
                }
                Ok(floor)
            }
        }
    }

    /// Stop loading new pages and let in-flight ranges finish within `timeout`.
    ///
    /// Returns `false` when the pipeline had to be aborted.
    pub async fn stop_and_drain(&self, timeout: Duration) -> bool {
        let Some(run) = self.run.lock().await.take() else {
            return true;
        };

        let paused = self.status() == AgentStatus::Paused;
        if !paused {
            self.shared.set_status(AgentStatus::Stopping);
        }

        run.pump_cancel.cancel();
        let _ = run.pump.await;
        let drained = run.execution.stop_and_drain(timeout).await;
        if !drained {
            warn!(shard = %self.shard.name, ?timeout, "agent did not drain in time");
        }
        run.cancel.cancel();

        self.finish_stop(paused);
        drained
    }

    /// Cancel everything immediately.
    pub async fn hard_stop(&self) {
        let Some(run) = self.run.lock().await.take() else {
            return;
        };

        let paused = self.status() == AgentStatus::Paused;
        run.cancel.cancel();
        run.pump.abort();
        run.execution.hard_stop().await;
        self.finish_stop(paused);
    }

    fn finish_stop(&self, paused: bool) {
        if !paused {
            self.shared.set_status(AgentStatus::Stopped);
        }
        let position = self.shared.snapshot.borrow().position;
        self.shared
            .tracker
            .publish(ShardState::new(self.shard.name.clone(), position, ShardAction::Stopped));
        info!(shard = %self.shard.name, position, "agent stopped");
    }

    /// Cancel the current run without waiting for it to wind down.
    ///
    /// Leaves the agent stopped (or paused) so a later start is not mistaken
    /// for a no-op.
    pub fn abandon(&self) {
        if let Some(cancel) = self.shared.cancel.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            cancel.cancel();
        }
        if self.is_running() {
            self.shared.set_status(AgentStatus::Stopped);
        }
    }

    /// Process up to a fixed `ceiling`, then stop.
    ///
    /// Fails with the shard's error if it pauses, with a timeout if the
    /// ceiling is not reached within `timeout`, or with `Cancelled` once
    /// `cancel` fires. Both of the latter hard stop the agent first.
    pub async fn replay(
        &self,
        floor: StartFloor,
        ceiling: u64,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), DaemonError> {
        if cancel.is_cancelled() {
            return Err(DaemonError::Cancelled);
        }
        let mut snapshots = self.shared.snapshot.subscribe();
        self.start(AgentStartRequest {
            floor,
            ..AgentStartRequest::rebuild(ceiling)
        })
        .await?;

        let reached = async {
            loop {
                {
                    let snapshot = snapshots.borrow_and_update();
                    if snapshot.status == AgentStatus::Paused {
                        return Err(DaemonError::ShardFailed {
                            shard: snapshot.shard.to_string(),
                            reason: snapshot.error.clone().unwrap_or_default(),
                        });
                    }
                    if snapshot.position >= ceiling {
                        return Ok(());
                    }
                }
                if snapshots.changed().await.is_err() {
                    return Err(DaemonError::Cancelled);
                }
            }
        };
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Ok(Err(DaemonError::Cancelled)),
            outcome = tokio::time::timeout(timeout, reached) => outcome,
        };

        match outcome {
            Ok(Ok(())) => {
                self.stop_and_drain(self.settings.drain_timeout).await;
                Ok(())
            }
            Ok(Err(err)) => {
                self.hard_stop().await;
                Err(err)
            }
            Err(_) => {
                self.hard_stop().await;
                Err(DaemonError::timeout(format!("replay of {}", self.shard.name), timeout))
            }
        }
    }

    /// Wait until the agent has committed through `sequence`.
    pub async fn wait_for_position(&self, sequence: u64, timeout: Duration) -> Result<(), DaemonError> {
        let mut snapshots = self.shared.snapshot.subscribe();
        let wait = async {
            loop {
                {
                    let snapshot = snapshots.borrow_and_update();
                    if snapshot.position >= sequence {
                        return Ok(());
                    }
                    if snapshot.status == AgentStatus::Paused {
                        return Err(DaemonError::ShardFailed {
                            shard: snapshot.shard.to_string(),
                            reason: snapshot.error.clone().unwrap_or_default(),
                        });
                    }
                }
                if snapshots.changed().await.is_err() {
                    return Err(DaemonError::Cancelled);
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| DaemonError::timeout(format!("waiting for {} to reach {sequence}", self.shard.name), timeout))?
    }
}

/// The page loop of one agent run.
struct Pump {
    shard: ShardName,
    loader: EventLoader,
    execution: Arc<dyn ShardExecution>,
    shared: Arc<AgentShared>,
    load_retry: RetryPolicy,
    ceiling: Option<u64>,
    cancel: CancellationToken,
}

impl Pump {
    async fn run(self, mut floor: u64) {
        let mut high_water = self.shared.high_water.subscribe();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            if self.ceiling.is_some_and(|ceiling| floor >= ceiling) {
                debug!(shard = %self.shard, floor, "replay ceiling reached");
                break;
            }

            let mark = *high_water.borrow_and_update();
            let target = self.ceiling.map_or(mark, |ceiling| ceiling.min(mark));
            if floor >= target {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    changed = high_water.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            }

            let range = match self.load(floor, target).await {
                Some(range) => range,
                None => break,
            };
            let next = range.ceiling;

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                queued = self.execution.enqueue(range) => {
                    if queued.is_err() {
                        break;
                    }
                }
            }
            floor = next;
        }
    }

    async fn load(&self, floor: u64, ceiling: u64) -> Option<EventRange> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.loader.load(&self.shard, floor, ceiling).await {
                Ok(range) => return Some(range),
                Err(err) if self.load_retry.should_retry(attempt) => {
                    let delay = self.load_retry.delay_for_attempt(attempt);
                    warn!(shard = %self.shard, floor, attempt, error = %err, ?delay, "page load failed, retrying");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => {
                    self.shared.report_critical_failure(err.into());
                    return None;
                }
            }
        }
    }
}
