pub mod access;
pub mod concurrency;
pub mod maintenance;
pub mod rate;

use std::sync::Arc;

use parking_lot::RwLock;

use crate::{
    cidr::Cidr,
    http::{Ident, Raise, Request, Respond},
};

pub use self::{
    access::{AllowIpsOptions, DenyIpsOptions, wrap_allow_ips, wrap_deny_ips},
    concurrency::{
        ConcurrencyLimitOptions, ConcurrencyThrottleOptions, wrap_concurrency_limit,
        wrap_concurrency_throttle,
    },
    maintenance::{
        MaintenanceLimitOptions, MaintenanceThrottleOptions, wrap_maintenance_limit,
        wrap_maintenance_throttle, with_maintenance,
    },
    rate::{RateLimitOptions, RateThrottleOptions, wrap_rate_limit, wrap_rate_throttle},
};

/// A caller-supplied projection from request to grouping key; requests that
/// map to the same identity share one synchronization primitive.
pub type IdentFn = Arc<dyn Fn(&Request) -> Ident + Send + Sync>;

/// The default identity: every request shares a single global primitive.
pub fn world_ident() -> IdentFn {
    Arc::new(|_| Ident::World)
}

/// Per-client identity: requests group by their client chain.
pub fn chain_ident() -> IdentFn {
    Arc::new(Ident::chain)
}

/// A range list read once per request.
///
/// Callers hand a filter either a literal collection or a holder whose
/// current value the filter re-reads on every request, without this library
/// imposing a mutation discipline.
pub trait RuleSource: Send + Sync {
    fn load(&self) -> Arc<Vec<Cidr>>;
}

impl RuleSource for Vec<Cidr> {
    fn load(&self) -> Arc<Vec<Cidr>> {
        Arc::new(self.clone())
    }
}

impl RuleSource for Arc<Vec<Cidr>> {
    fn load(&self) -> Arc<Vec<Cidr>> {
        self.clone()
    }
}

impl RuleSource for RwLock<Vec<Cidr>> {
    fn load(&self) -> Arc<Vec<Cidr>> {
        Arc::new(self.read().clone())
    }
}

/// A range list computed per request.
///
/// # Example
///
/// ```
/// use firewall::cidr::compile;
/// use firewall::middleware::{Dynamic, RuleSource};
///
/// let source = Dynamic(|| compile(["10.0.0.0/8"]));
///
/// assert_eq!(source.load().len(), 1);
/// ```
pub struct Dynamic<F>(pub F);

impl<F> RuleSource for Dynamic<F>
where
    F: Fn() -> Vec<Cidr> + Send + Sync,
{
    fn load(&self) -> Arc<Vec<Cidr>> {
        Arc::new((self.0)())
    }
}

/// A resource admission scope.
///
/// Whatever was acquired on the admit path is released exactly once when
/// the scope drops: on the synchronous return path, on either asynchronous
/// continuation, and on unwind.
pub(crate) struct Admission(Option<Box<dyn FnOnce() + Send + Sync>>);

impl Admission {
    pub(crate) fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self(Some(Box::new(release)))
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if let Some(release) = self.0.take() {
            release();
        }
    }
}

/// Thread one admission scope through both asynchronous continuations.
///
/// The scope is shared, so whichever continuation runs (or is dropped
/// unconsumed) last performs the release, and it happens once.
pub(crate) fn guarded(admission: Admission, respond: Respond, raise: Raise) -> (Respond, Raise) {
    let admission = Arc::new(admission);

    let respond = {
        let admission = admission.clone();
        Box::new(move |response| {
            respond(response);
            drop(admission);
        }) as Respond
    };

    let raise = Box::new(move |error| {
        raise(error);
        drop(admission);
    }) as Raise;

    (respond, raise)
}
