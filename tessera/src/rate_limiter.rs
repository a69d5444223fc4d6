//! Token-bucket admission gate for starting new load work.
//!
//! The limiter bounds how fast new underlying work (network requests) may
//! begin, absorbing bursts such as rapid scrolling. It only gates *starting*
//! work; tasks already in flight and shared through deduplication are never
//! affected.
//!
//! # Design
//!
//! ```text
//! execute(work) ──► queue empty && token available? ──yes──► run work now
//!                                   │
//!                                   no
//!                                   ▼
//!                         FIFO pending queue ──tick()──► run while tokens last
//! ```
//!
//! Tokens are replenished in discrete ticks: every `tick_interval` the
//! bucket gains `tokens_per_tick`, capped at `capacity`. A background ticker
//! drives this on a tokio runtime; tests call [`RateLimiter::tick`] directly.
//!
//! Work items return `false` when they had nothing to do (their task was
//! cancelled while queued), in which case the token is refunded.

use crate::config::RateLimiterConfig;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Shortest tick interval the ticker accepts.
pub const MIN_TICK_INTERVAL: Duration = Duration::from_millis(1);

type Work = Box<dyn FnOnce() -> bool + Send>;

struct Bucket {
    tokens: u32,
    suspended: bool,
    pending: VecDeque<Work>,
}

/// Token-bucket admission gate with a FIFO retry queue.
pub struct RateLimiter {
    config: RateLimiterConfig,
    bucket: Mutex<Bucket>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bucket = self.bucket.lock();
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("tokens", &bucket.tokens)
            .field("suspended", &bucket.suspended)
            .field("pending", &bucket.pending.len())
            .finish()
    }
}

impl RateLimiter {
    /// Creates a limiter with a full bucket.
    ///
    /// A tick interval below [`MIN_TICK_INTERVAL`] is raised to it.
    pub fn new(mut config: RateLimiterConfig) -> Self {
        if config.tick_interval < MIN_TICK_INTERVAL {
            warn!(
                tick_us = config.tick_interval.as_micros() as u64,
                "Rate limiter tick interval too short, using 1ms"
            );
            config.tick_interval = MIN_TICK_INTERVAL;
        }
        info!(
            capacity = config.capacity,
            tokens_per_tick = config.tokens_per_tick,
            tick_ms = config.tick_interval.as_millis() as u64,
            "Created rate limiter"
        );
        Self {
            bucket: Mutex::new(Bucket {
                tokens: config.capacity,
                suspended: false,
                pending: VecDeque::new(),
            }),
            config,
        }
    }

    /// Returns the limiter configuration.
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Consumes one token if available.
    ///
    /// Always denies while suspended.
    pub fn try_admit(&self) -> bool {
        let mut bucket = self.bucket.lock();
        Self::take_token(&mut bucket)
    }

    fn take_token(bucket: &mut Bucket) -> bool {
        if bucket.suspended || bucket.tokens == 0 {
            return false;
        }
        bucket.tokens -= 1;
        true
    }

    fn refund(&self) {
        let mut bucket = self.bucket.lock();
        bucket.tokens = (bucket.tokens + 1).min(self.config.capacity);
    }

    /// Runs `work` now if admitted, otherwise queues it behind earlier work.
    ///
    /// `work` returns whether it actually started something; `false`
    /// refunds the token.
    pub fn execute(&self, work: impl FnOnce() -> bool + Send + 'static) {
        {
            let mut bucket = self.bucket.lock();
            if !bucket.pending.is_empty() || !Self::take_token(&mut bucket) {
                bucket.pending.push_back(Box::new(work));
                trace!(pending = bucket.pending.len(), "Rate limiter queued work");
                return;
            }
        }
        if !work() {
            self.refund();
        }
    }

    /// Adds one tick's worth of tokens and drains queued work.
    pub fn tick(&self) {
        {
            let mut bucket = self.bucket.lock();
            bucket.tokens = bucket
                .tokens
                .saturating_add(self.config.tokens_per_tick)
                .min(self.config.capacity);
        }
        self.drain();
    }

    /// Runs queued work in FIFO order while tokens are available.
    ///
    /// Work runs with the internal lock released.
    fn drain(&self) {
        loop {
            let work = {
                let mut bucket = self.bucket.lock();
                if bucket.pending.is_empty() || !Self::take_token(&mut bucket) {
                    return;
                }
                bucket.pending.pop_front()
            };
            if let Some(work) = work {
                if !work() {
                    self.refund();
                }
            }
        }
    }

    /// Stops admitting work; everything is queued until [`resume`](Self::resume).
    pub fn suspend(&self) {
        self.bucket.lock().suspended = true;
        debug!("Rate limiter suspended");
    }

    /// Resumes admission and drains the queue as tokens allow.
    pub fn resume(&self) {
        self.bucket.lock().suspended = false;
        debug!("Rate limiter resumed");
        self.drain();
    }

    /// Returns true while suspended.
    pub fn is_suspended(&self) -> bool {
        self.bucket.lock().suspended
    }

    /// Returns the number of tokens currently in the bucket.
    pub fn available_tokens(&self) -> u32 {
        self.bucket.lock().tokens
    }

    /// Returns the number of queued work items.
    pub fn pending_count(&self) -> usize {
        self.bucket.lock().pending.len()
    }

    /// Spawns a ticker on `handle` that calls [`tick`](Self::tick) every
    /// `tick_interval`.
    ///
    /// The ticker stops when `cancel` fires or the limiter is dropped.
    pub fn spawn_ticker(
        self: &Arc<Self>,
        handle: &Handle,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let limiter: Weak<RateLimiter> = Arc::downgrade(self);
        let period = self.config.tick_interval;
        handle.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(limiter) = limiter.upgrade() else { break };
                        limiter.tick();
                    }
                }
            }
            trace!("Rate limiter ticker stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn limiter(capacity: u32, tokens_per_tick: u32) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig {
            capacity,
            tokens_per_tick,
            tick_interval: Duration::from_millis(10),
        })
    }

    #[test]
    fn test_capacity_admissions_then_denied() {
        let limiter = limiter(3, 1);
        assert!(limiter.try_admit());
        assert!(limiter.try_admit());
        assert!(limiter.try_admit());
        assert!(!limiter.try_admit());

        limiter.tick();
        assert!(limiter.try_admit());
        assert!(!limiter.try_admit());
    }

    #[test]
    fn test_tick_never_exceeds_capacity() {
        let limiter = limiter(2, 5);
        limiter.tick();
        assert_eq!(limiter.available_tokens(), 2);
    }

    #[test]
    fn test_denied_work_runs_in_fifo_order_on_tick() {
        let limiter = limiter(1, 1);
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..4 {
            let order = Arc::clone(&order);
            limiter.execute(move || {
                order.lock().push(i);
                true
            });
        }
        assert_eq!(*order.lock(), vec![0]);
        assert_eq!(limiter.pending_count(), 3);

        limiter.tick();
        limiter.tick();
        limiter.tick();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
        assert_eq!(limiter.pending_count(), 0);
    }

    #[test]
    fn test_new_work_waits_behind_queue() {
        let limiter = limiter(1, 1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let push = |i: u32| {
            let order = Arc::clone(&order);
            move || {
                order.lock().push(i);
                true
            }
        };

        limiter.execute(push(0));
        limiter.execute(push(1));
        // A token became available, but work 1 is still ahead of work 2.
        limiter.refund();
        limiter.execute(push(2));
        assert_eq!(*order.lock(), vec![0]);

        limiter.tick();
        assert_eq!(*order.lock(), vec![0, 1]);
    }

    #[test]
    fn test_cancelled_work_refunds_token() {
        let limiter = limiter(1, 1);
        let ran = Arc::new(AtomicUsize::new(0));

        limiter.execute(|| false);
        assert_eq!(limiter.available_tokens(), 1);

        let counter = Arc::clone(&ran);
        limiter.execute(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_suspended_limiter_queues_everything() {
        let limiter = limiter(10, 1);
        let ran = Arc::new(AtomicUsize::new(0));
        limiter.suspend();

        for _ in 0..5 {
            let counter = Arc::clone(&ran);
            limiter.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            });
        }
        assert!(!limiter.try_admit());
        limiter.tick();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(limiter.pending_count(), 5);

        limiter.resume();
        assert_eq!(ran.load(Ordering::SeqCst), 5);
        assert!(!limiter.is_suspended());
    }

    #[tokio::test]
    async fn test_ticker_drains_queue() {
        let limiter = Arc::new(limiter(1, 1));
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = Arc::clone(&ran);
            limiter.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            });
        }

        let cancel = CancellationToken::new();
        let ticker = limiter.spawn_ticker(&Handle::current(), cancel.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        ticker.await.unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_zero_tick_interval_is_raised() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            capacity: 1,
            tokens_per_tick: 1,
            tick_interval: Duration::ZERO,
        });
        assert_eq!(limiter.config().tick_interval, MIN_TICK_INTERVAL);
    }

    #[tokio::test]
    async fn test_ticker_runs_with_zero_interval_config() {
        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
            capacity: 1,
            tokens_per_tick: 1,
            tick_interval: Duration::ZERO,
        }));
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let counter = Arc::clone(&ran);
            limiter.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            });
        }

        let cancel = CancellationToken::new();
        let ticker = limiter.spawn_ticker(&Handle::current(), cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        ticker.await.unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }
}
