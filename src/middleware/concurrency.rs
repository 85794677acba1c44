use std::{sync::Arc, time::Duration};

use anyhow::Result;

use crate::{
    http::{Handler, Ident, Raise, Request, Respond, Response},
    keyed::WeakTable,
    middleware::{Admission, IdentFn, guarded, world_ident},
    semaphore::Semaphore,
    statistics::{COUNTS, Outcome},
};

fn deny(_: Request) -> Result<Response> {
    Ok(Response::limit_exceeded())
}

/// Options for [`wrap_concurrency_throttle`].
pub struct ConcurrencyThrottleOptions {
    pub max_concurrent: usize,
    pub ident_fn: IdentFn,
}

impl Default for ConcurrencyThrottleOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            ident_fn: world_ident(),
        }
    }
}

/// Options for [`wrap_concurrency_limit`].
///
/// The default deny handler responds 429 after at most `max_wait` spent
/// waiting for a permit.
pub struct ConcurrencyLimitOptions {
    pub max_concurrent: usize,
    pub max_wait: Duration,
    pub deny_handler: Arc<dyn Handler>,
    pub ident_fn: IdentFn,
}

impl ConcurrencyLimitOptions {
    fn max_wait() -> Duration {
        Duration::from_millis(50)
    }

    fn deny_handler() -> Arc<dyn Handler> {
        Arc::new(deny)
    }
}

impl Default for ConcurrencyLimitOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            max_wait: Self::max_wait(),
            deny_handler: Self::deny_handler(),
            ident_fn: world_ident(),
        }
    }
}

struct ConcurrencyThrottle {
    inner: Arc<dyn Handler>,
    pools: WeakTable<Ident, Semaphore>,
    ident_fn: IdentFn,
}

impl ConcurrencyThrottle {
    /// Block until the identity's pool grants a permit.
    ///
    /// The returned scope holds the pool alive for the lifetime of the
    /// request and returns the permit when it drops.
    fn admit(&self, request: &Request) -> Admission {
        let ident = (self.ident_fn)(request);
        let pool = self.pools.get(&ident);

        pool.acquire();
        COUNTS.add(Outcome::Admitted);
        Admission::new(move || pool.release())
    }
}

impl Handler for ConcurrencyThrottle {
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

struct ConcurrencyLimit {
    inner: Arc<dyn Handler>,
    deny_handler: Arc<dyn Handler>,
    pools: WeakTable<Ident, Semaphore>,
    max_wait: Duration,
    ident_fn: IdentFn,
}

impl ConcurrencyLimit {
    fn admit(&self, request: &Request) -> Option<Admission> {
        let ident = (self.ident_fn)(request);
        let pool = self.pools.get(&ident);

        if pool.try_acquire_for(self.max_wait) {
            COUNTS.add(Outcome::Admitted);
            Some(Admission::new(move || pool.release()))
        } else {
            COUNTS.add(Outcome::DeniedLimit);
            None
        }
    }
}

impl Handler for ConcurrencyLimit {
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

/// Bound in-flight requests per identity, blocking until a slot frees up.
///
/// Waiters are served in FIFO order. The per-identity pool exists only
/// while requests reference it; an identity with nothing in flight costs
/// nothing.
pub fn wrap_concurrency_throttle(
    inner: Arc<dyn Handler>,
    options: ConcurrencyThrottleOptions,
) -> Arc<dyn Handler> {
    let max_concurrent = options.max_concurrent;

    Arc::new(ConcurrencyThrottle {
        pools: WeakTable::new(move |_| Arc::new(Semaphore::new(max_concurrent))),
        ident_fn: options.ident_fn,
        inner,
    })
}

/// Bound in-flight requests per identity, denying after `max_wait`.
pub fn wrap_concurrency_limit(
    inner: Arc<dyn Handler>,
    options: ConcurrencyLimitOptions,
) -> Arc<dyn Handler> {
    let max_concurrent = options.max_concurrent;

    Arc::new(ConcurrencyLimit {
        pools: WeakTable::new(move |_| Arc::new(Semaphore::new(max_concurrent))),
        deny_handler: options.deny_handler,
        max_wait: options.max_wait,
        ident_fn: options.ident_fn,
        inner,
    })
}
