//! Retry policies and the serialized retry block.
//!
//! A [`RetryBlock`] is a bounded, single-consumer work queue: producers await
//! `post` (blocking, never dropping, when the queue is full) and one worker
//! task handles items in arrival order, retrying each according to a
//! [`RetryPolicy`]. Items that exhaust their retries are logged and dropped so
//! a failing sink never stalls its producers for longer than the queue allows.

use std::fmt::Display;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::settings::duration_ms;

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^attempt
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first one).
    pub max_attempts: u32,
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(attempt - 1);
                self.base_delay.saturating_mul(factor)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
        };

        delay.min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempt` failed attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// The block no longer accepts items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("retry block '{0}' is closed")]
pub struct RetryBlockClosed(pub &'static str);

/// Bounded, serialized work queue with per-item retries.
pub struct RetryBlock<T> {
    name: &'static str,
    sender: Mutex<Option<mpsc::Sender<T>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T> RetryBlock<T>
where
    T: Clone + Send + 'static,
{
    /// Spawn the worker task. Must be called inside a tokio runtime.
    pub fn spawn<H, Fut, E>(name: &'static str, capacity: usize, policy: RetryPolicy, handler: H) -> Self
    where
        H: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<T>(capacity.max(1));

        let worker = tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                let mut attempt = 0u32;
                loop {
                    attempt += 1;
                    match handler(item.clone()).await {
                        Ok(()) => {
                            debug!(block = name, attempt, "retry block item handled");
                            break;
                        }
                        Err(err) if policy.should_retry(attempt) => {
                            let delay = policy.delay_for_attempt(attempt);
                            warn!(block = name, attempt, error = %err, ?delay, "retry block item failed, retrying");
                            tokio::time::sleep(delay).await;
                        }
                        Err(err) => {
                            error!(block = name, attempt, error = %err, "retry block item failed, giving up");
                            break;
                        }
                    }
                }
            }
            debug!(block = name, "retry block drained");
        });

        Self {
            name,
            sender: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue an item, waiting while the block is at capacity.
    pub async fn post(&self, item: T) -> Result<(), RetryBlockClosed> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(RetryBlockClosed(self.name))?;

        sender.send(item).await.map_err(|_| RetryBlockClosed(self.name))
    }

    /// Stop accepting items and wait up to `timeout` for queued items to finish.
    ///
    /// Returns `false` when the worker had to be aborted.
    pub async fn complete(&self, timeout: Duration) -> bool {
        drop(self.sender.lock().unwrap_or_else(PoisonError::into_inner).take());

        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(mut worker) = worker else {
            return true;
        };

        match tokio::time::timeout(timeout, &mut worker).await {
            Ok(_) => true,
            Err(_) => {
                warn!(block = self.name, ?timeout, "retry block did not drain in time, aborting");
                worker.abort();
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn exponential_delay_is_capped() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
    }

    #[test]
    fn linear_and_fixed_delays() {
        let linear = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            ..RetryPolicy::fixed(3, Duration::from_millis(10))
        };
        assert_eq!(linear.delay_for_attempt(3), Duration::from_millis(10));

        let fixed = RetryPolicy::fixed(3, Duration::from_millis(10));
        assert!(fixed.should_retry(2));
        assert!(!fixed.should_retry(3));
    }

    #[tokio::test]
    async fn failing_items_are_retried_until_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = attempts.clone();

        let block = RetryBlock::spawn(
            "test",
            4,
            RetryPolicy::fixed(3, Duration::from_millis(1)),
            move |_item: u32| {
                let seen = seen.clone();
                async move {
                    if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("not yet")
                    } else {
                        Ok(())
                    }
                }
            },
        );

        block.post(7).await.unwrap();
        assert!(block.complete(Duration::from_secs(1)).await);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_items_do_not_block_later_items() {
        let handled = Arc::new(AtomicU32::new(0));
        let seen = handled.clone();

        let block = RetryBlock::spawn(
            "test",
            1,
            RetryPolicy::fixed(2, Duration::from_millis(1)),
            move |item: u32| {
                let seen = seen.clone();
                async move {
                    if item == 0 {
                        return Err("poison");
                    }
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        );

        block.post(0).await.unwrap();
        block.post(1).await.unwrap();
        block.post(2).await.unwrap();
        assert!(block.complete(Duration::from_secs(1)).await);
        assert_eq!(handled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn post_after_complete_is_rejected() {
        let block = RetryBlock::spawn("test", 1, RetryPolicy::no_retry(), |_item: u32| async {
            Ok::<(), String>(())
        });
        assert!(block.complete(Duration::from_secs(1)).await);
        assert!(block.is_closed());
        assert_eq!(block.post(1).await, Err(RetryBlockClosed("test")));
    }
}
