use std::{sync::Arc, time::Duration};

use anyhow::Result;

use crate::{
    bucket::LeakyBucket,
    http::{Handler, Ident, Raise, Request, Respond, Response},
    keyed::WeakTable,
    middleware::{Admission, IdentFn, guarded, world_ident},
    statistics::{COUNTS, Outcome},
};

fn deny(_: Request) -> Result<Response> {
    Ok(Response::limit_exceeded())
}

/// Options for [`wrap_rate_throttle`].
pub struct RateThrottleOptions {
    pub max_requests: usize,
    pub period: Duration,
    pub ident_fn: IdentFn,
}

impl Default for RateThrottleOptions {
    fn default() -> Self {
        Self {
            max_requests: 100,
            period: Duration::from_secs(60),
            ident_fn: world_ident(),
        }
    }
}

/// Options for [`wrap_rate_limit`].
///
/// The default deny handler responds 429 after at most `max_wait` spent
/// waiting for the bucket.
pub struct RateLimitOptions {
    pub max_requests: usize,
    pub period: Duration,
    pub max_wait: Duration,
    pub deny_handler: Arc<dyn Handler>,
    pub ident_fn: IdentFn,
}

impl RateLimitOptions {
    fn max_wait() -> Duration {
        Duration::from_millis(50)
    }

    fn deny_handler() -> Arc<dyn Handler> {
        Arc::new(deny)
    }
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            max_requests: 500,
            period: Duration::from_secs(60),
            max_wait: Self::max_wait(),
            deny_handler: Self::deny_handler(),
            ident_fn: world_ident(),
        }
    }
}

struct RateThrottle {
    inner: Arc<dyn Handler>,
    buckets: WeakTable<Ident, LeakyBucket>,
    ident_fn: IdentFn,
}

impl RateThrottle {
    /// Block until the identity's bucket grants a permit.
    ///
    /// Permits are never returned by the request; the bucket refills on the
    /// timer. The scope keeps the bucket referenced until the request
    /// completes so the weak table cannot drop it mid-flight.
    fn admit(&self, request: &Request) -> Admission {
        let ident = (self.ident_fn)(request);
        let bucket = self.buckets.get(&ident);

        bucket.acquire();
        COUNTS.add(Outcome::Admitted);
        Admission::new(move || drop(bucket))
    }
}

impl Handler for RateThrottle {
    fn call(&self, request: Request) -> Result<Response> {
        let _admission = self.admit(&request);
        self.inner.call(request)
    }

    fn call_async(&self, request: Request, respond: Respond, raise: Raise) {
        let admission = self.admit(&request);
        let (respond, raise) = guarded(admission, respond, raise);
        self.inner.call_async(request, respond, raise);
    }
}

struct RateLimit {
    inner: Arc<dyn Handler>,
    deny_handler: Arc<dyn Handler>,
    buckets: WeakTable<Ident, LeakyBucket>,
    max_wait: Duration,
    ident_fn: IdentFn,
}

impl RateLimit {
    fn admit(&self, request: &Request) -> Option<Admission> {
        let ident = (self.ident_fn)(request);
        let bucket = self.buckets.get(&ident);

        if bucket.try_acquire_for(self.max_wait) {
            COUNTS.add(Outcome::Admitted);
            Some(Admission::new(move || drop(bucket)))
        } else {
            COUNTS.add(Outcome::DeniedLimit);
            None
        }
    }
}

impl Handler for RateLimit {
    fn call(&self, request: Request) -> Result<Response> {
        match self.admit(&request) {
            Some(_admission) => self.inner.call(request),
            None => self.deny_handler.call(request),
        }
    }

    fn call_async(&self, request: Request, respond: Respond, raise: Raise) {
        match self.admit(&request) {
            Some(admission) => {
                let (respond, raise) = guarded(admission, respond, raise);
                self.inner.call_async(request, respond, raise);
            }
            None => self.deny_handler.call_async(request, respond, raise),
        }
    }
}

/// Shape request rate per identity, blocking until the bucket refills.
///
/// Under saturated load admissions follow the FIFO order of arrival at the
/// bucket.
pub fn wrap_rate_throttle(
    inner: Arc<dyn Handler>,
    options: RateThrottleOptions,
) -> Arc<dyn Handler> {
    let max_requests = options.max_requests;
    let period = options.period;

    Arc::new(RateThrottle {
        buckets: WeakTable::new(move |_| LeakyBucket::new(max_requests, period)),
        ident_fn: options.ident_fn,
        inner,
    })
}

/// Bound request rate per identity, denying after `max_wait`.
pub fn wrap_rate_limit(inner: Arc<dyn Handler>, options: RateLimitOptions) -> Arc<dyn Handler> {
    let max_requests = options.max_requests;
    let period = options.period;

    Arc::new(RateLimit {
        buckets: WeakTable::new(move |_| LeakyBucket::new(max_requests, period)),
        deny_handler: options.deny_handler,
        max_wait: options.max_wait,
        ident_fn: options.ident_fn,
        inner,
    })
}
