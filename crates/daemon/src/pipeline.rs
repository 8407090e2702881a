//! Per-shard grouped execution pipeline.
//!
//! Two tasks joined by bounded channels:
//!
//! ```text
//! enqueue(range) ──▶ [group] ──(range, slice groups)──▶ [build + execute] ──▶ store
//! ```
//!
//! Each stage handles one item at a time in arrival order, so ranges reach the
//! store strictly in sequence order while range N+1 is grouped during the
//! execution of range N. Producers wait when a channel is full.

use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::dead_letter::{DeadLetterEvent, DeadLetterSink};
use crate::error::DaemonError;
use crate::loader::EventRange;
use crate::projection::GroupedProjection;
use crate::settings::ErrorHandlingOptions;
use crate::shard::{ShardName, ShardState};
use crate::slicing::{SliceGroup, SliceIdentity};
use crate::store::{EventDatabase, ProjectionBatch};
use crate::tracker::ShardStateTracker;

/// Receives the outcome of each range.
///
/// Called from inside the pipeline tasks: implementations must not wait on the
/// pipeline (no drain, no join), only record state or cancel tokens.
pub trait ExecutionListener: Send + Sync {
    fn mark_success(&self, range: &EventRange);

    fn report_critical_failure(&self, error: DaemonError);
}

/// Everything a shard execution needs from its owner.
#[derive(Clone)]
pub struct ExecutionContext {
    pub db: Arc<dyn EventDatabase>,
    pub tracker: Arc<ShardStateTracker>,
    pub dead_letters: Arc<DeadLetterSink>,
    pub errors: ErrorHandlingOptions,
    /// Ranges in flight between stages.
    pub capacity: usize,
    pub listener: Arc<dyn ExecutionListener>,
    pub cancel: CancellationToken,
}

/// A running pipeline for one shard.
#[async_trait]
pub trait ShardExecution: Send + Sync {
    fn shard(&self) -> &ShardName;

    /// Queue a range, waiting while the pipeline is full.
    async fn enqueue(&self, range: EventRange) -> Result<(), DaemonError>;

    /// Accept no more ranges and finish the queued ones within `timeout`.
    ///
    /// Returns `false` when the pipeline had to be aborted.
    async fn stop_and_drain(&self, timeout: Duration) -> bool;

    /// Signal cancellation without waiting.
    fn cancel(&self);

    /// Cancel and abort both stages immediately.
    async fn hard_stop(&self);
}

/// Two-stage pipeline over a [`GroupedProjection`].
pub struct GroupedExecution<Id> {
    shard: ShardName,
    sender: Mutex<Option<mpsc::Sender<EventRange>>>,
    cancel: CancellationToken,
    stages: Mutex<Vec<JoinHandle<()>>>,
    _id: PhantomData<fn() -> Id>,
}

impl<Id: SliceIdentity> GroupedExecution<Id> {
    /// Spawn both stages. Must be called inside a tokio runtime.
    pub fn start(
        projection: Arc<dyn GroupedProjection<Id>>,
        shard: ShardName,
        context: ExecutionContext,
    ) -> Arc<dyn ShardExecution> {
        let capacity = context.capacity.max(1);
        let cancel = context.cancel.child_token();
        let (range_tx, range_rx) = mpsc::channel::<EventRange>(capacity);
        let (group_tx, group_rx) = mpsc::channel::<(EventRange, Vec<SliceGroup<Id>>)>(capacity);

        let grouping = tokio::spawn(group_stage(
            projection.clone(),
            shard.clone(),
            range_rx,
            group_tx,
            context.listener.clone(),
            cancel.clone(),
        ));
        let executing = tokio::spawn(execute_stage(projection, shard.clone(), group_rx, context, cancel.clone()));

        Arc::new(Self {
            shard,
            sender: Mutex::new(Some(range_tx)),
            cancel,
            stages: Mutex::new(vec![grouping, executing]),
            _id: PhantomData,
        })
    }

    fn take_stages(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.stages.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl<Id: SliceIdentity> ShardExecution for GroupedExecution<Id> {
    fn shard(&self) -> &ShardName {
        &self.shard
    }

    async fn enqueue(&self, range: EventRange) -> Result<(), DaemonError> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(DaemonError::Cancelled)?;

        tokio::select! {
            _ = self.cancel.cancelled() => Err(DaemonError::Cancelled),
            sent = sender.send(range) => sent.map_err(|_| DaemonError::Cancelled),
        }
    }

    async fn stop_and_drain(&self, timeout: Duration) -> bool {
        drop(self.sender.lock().unwrap_or_else(PoisonError::into_inner).take());

        let mut stages = self.take_stages();
        let drained = tokio::time::timeout(timeout, async {
            for stage in stages.iter_mut() {
                let _ = stage.await;
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!(shard = %self.shard, ?timeout, "pipeline did not drain in time, aborting");
            self.cancel.cancel();
            for stage in &stages {
                stage.abort();
            }
        }
        drained
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }

    async fn hard_stop(&self) {
        self.cancel.cancel();
        drop(self.sender.lock().unwrap_or_else(PoisonError::into_inner).take());
        for stage in self.take_stages() {
            stage.abort();
            let _ = stage.await;
        }
    }
}

async fn group_stage<Id: SliceIdentity>(
    projection: Arc<dyn GroupedProjection<Id>>,
    shard: ShardName,
    mut ranges: mpsc::Receiver<EventRange>,
    groups: mpsc::Sender<(EventRange, Vec<SliceGroup<Id>>)>,
    listener: Arc<dyn ExecutionListener>,
    cancel: CancellationToken,
) {
    loop {
        let range = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = ranges.recv() => match next {
                Some(range) => range,
                None => break,
            },
        };

        match projection.group(&range).await {
            Ok(sliced) => {
                debug!(%range, slices = sliced.iter().map(SliceGroup::len).sum::<usize>(), "range grouped");
                if groups.send((range, sliced)).await.is_err() {
                    break;
                }
            }
            Err(source) => {
                error!(%range, error = %source, "grouping failed, shard cannot continue");
                listener.report_critical_failure(DaemonError::Grouping {
                    shard: shard.to_string(),
                    source,
                });
                break;
            }
        }
    }
}

async fn execute_stage<Id: SliceIdentity>(
    projection: Arc<dyn GroupedProjection<Id>>,
    shard: ShardName,
    mut groups: mpsc::Receiver<(EventRange, Vec<SliceGroup<Id>>)>,
    context: ExecutionContext,
    cancel: CancellationToken,
) {
    loop {
        let (mut range, mut sliced) = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = groups.recv() => match next {
                Some(item) => item,
                None => break,
            },
        };

        match execute_range(projection.as_ref(), &context, &cancel, &mut range, &mut sliced).await {
            Ok(()) => {
                context.tracker.publish(ShardState::updated(shard.clone(), range.ceiling));
                context.listener.mark_success(&range);
            }
            Err(DaemonError::Cancelled) => break,
            Err(err) => {
                error!(%range, error = %err, "batch failed, shard cannot continue");
                context.listener.report_critical_failure(err);
                break;
            }
        }
    }
}

/// Build the batch for one range and commit it.
///
/// With `skip_apply_errors`, a failing event is dead-lettered, removed from
/// the range and the slice groups, and the batch is rebuilt from what is left.
/// Fan-out children share their source's sequence, so a failing child skips
/// the source and all of its children.
async fn execute_range<Id: SliceIdentity>(
    projection: &dyn GroupedProjection<Id>,
    context: &ExecutionContext,
    cancel: &CancellationToken,
    range: &mut EventRange,
    sliced: &mut [SliceGroup<Id>],
) -> Result<(), DaemonError> {
    let batch = loop {
        if cancel.is_cancelled() {
            return Err(DaemonError::Cancelled);
        }

        let mut batch = ProjectionBatch::new(&range.shard, range.floor, range.ceiling);
        match projection.build_batch(sliced, &mut batch) {
            Ok(()) => break batch,
            Err(failure) if context.errors.skip_apply_errors => {
                let sequence = failure.sequence();
                let removed: usize = sliced.iter_mut().map(|g| g.remove_sequence(sequence)).sum();
                if removed == 0 {
                    return Err(failure.into());
                }

                warn!(%range, sequence, error = %failure.message, "skipping event that failed to apply");
                let mut dead_letter = DeadLetterEvent::new(&range.shard, &failure);
                if let Some(source) = range.events.iter().find(|e| e.sequence == sequence) {
                    dead_letter = dead_letter.with_source(source);
                }
                range.skip_event_sequence(sequence);
                context.dead_letters.record(dead_letter).await;
            }
            Err(failure) => return Err(failure.into()),
        }
    };

    let operations = batch.operations.len();
    context.db.persist_batch(batch).await?;
    debug!(%range, operations, skipped = range.skipped.len(), "batch executed");
    Ok(())
}
