use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use crate::{
    semaphore::Semaphore,
    timer::{DelayTimer, Token},
};

/// A leaky-bucket limiter: at most `capacity` acquisitions per rolling
/// `period`, with bursts smoothed by a steady refill.
///
/// The bucket starts full. A refill step runs every `period / capacity` on
/// the delay timer and returns one permit while the pool is below capacity;
/// callers only ever acquire, never release. When the pool has stayed full
/// for a whole `period` an expiry step stops the refill treadmill, the
/// timer drops its references to the bucket, and a weakly-keyed holder can
/// reclaim it; a bucket rebuilt later starts full, which is exactly the
/// idle state.
///
/// The refill step reads the pool level without fencing against concurrent
/// acquisition, so over any window of `period` up to `capacity + 1`
/// acquisitions may succeed. That slack is documented looseness, not a bug.
///
/// # Test
///
/// ```
/// use std::time::Duration;
/// use firewall::bucket::LeakyBucket;
///
/// let bucket = LeakyBucket::new(3, Duration::from_secs(60));
///
/// assert!(bucket.try_acquire());
/// assert!(bucket.try_acquire());
/// assert!(bucket.try_acquire());
/// assert!(!bucket.try_acquire());
/// ```
pub struct LeakyBucket {
    pool: Semaphore,
    capacity: usize,
    period: Duration,
    frequency: Duration,
    release_token: Token,
    expire_token: Token,
    expire_armed: AtomicBool,
    timer: DelayTimer,
}

impl LeakyBucket {
    /// Build a limiter ticking on the process-wide timer.
    pub fn new(capacity: usize, period: Duration) -> Arc<Self> {
        Self::with_timer(capacity, period, DelayTimer::global())
    }

    /// Build a limiter ticking on the given timer.
    pub fn with_timer(capacity: usize, period: Duration, timer: DelayTimer) -> Arc<Self> {
        assert!(capacity > 0);

        let bucket = Arc::new(Self {
            pool: Semaphore::new(capacity),
            frequency: period / capacity as u32,
            release_token: Token::generate(),
            expire_token: Token::generate(),
            expire_armed: AtomicBool::new(false),
            capacity,
            period,
            timer,
        });

        // The first refill step runs synchronously; it finds the bucket
        // full, arms expiry and enqueues the treadmill.
        Self::release_step(&bucket);
        bucket
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn available(&self) -> usize {
        self.pool.available()
    }

    /// Block until the bucket grants a permit.
    pub fn acquire(&self) {
        self.pool.acquire();
    }

    /// Take a permit without blocking.
    pub fn try_acquire(&self) -> bool {
        self.pool.try_acquire()
    }

    /// Block at most `timeout` for a permit.
    pub fn try_acquire_for(&self, timeout: Duration) -> bool {
        self.pool.try_acquire_for(timeout)
    }

    /// One refill step.
    ///
    /// Runs on the timer worker (and once synchronously at construction);
    /// the worker serializes it against the expiry step.
    fn release_step(this: &Arc<Self>) {
        let now = Instant::now();

        {
            let next = this.clone();
            this.timer
                .schedule(now + this.frequency, this.release_token, move || {
                    Self::release_step(&next);
                });
        }

        if this.pool.available() < this.capacity {
            // Activity is ongoing; a pending expiry no longer applies.
            if this.expire_armed.swap(false, Ordering::AcqRel) {
                this.timer.unschedule(this.expire_token);
            }

            this.pool.release();
        } else if !this.expire_armed.swap(true, Ordering::AcqRel) {
            let bucket = this.clone();
            this.timer
                .schedule(now + this.period, this.expire_token, move || {
                    bucket.expire_step();
                });
        }
    }

    /// The expiry step: a full period passed with the bucket full, so stop
    /// the refill treadmill until a fresh bucket is built.
    fn expire_step(&self) {
        self.expire_armed.store(false, Ordering::Release);
        self.timer.unschedule(self.release_token);
    }
}
