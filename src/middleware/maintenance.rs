use std::{
    sync::{Arc, LazyLock},
    time::Duration,
};

use anyhow::Result;

use crate::{
    cidr,
    http::{Handler, Ident, Raise, Request, Respond, Response},
    keyed::WeakTable,
    maintenance::{Latch, Maintenance},
    middleware::{Admission, IdentFn, RuleSource, guarded, world_ident},
    statistics::{COUNTS, Outcome},
};

fn deny(_: Request) -> Result<Response> {
    Ok(Response::under_maintenance())
}

/// The maintenance states, shared between the filters and the operator
/// entry point.
///
/// The table is process-wide so that [`with_maintenance`] reaches the very
/// gate a filter admits through. A state lives as long as an operator or an
/// admitted request holds it; a forgotten identity reconstructs as an open
/// gate with nothing in flight, which is exactly the idle state.
fn states() -> &'static WeakTable<Ident, Maintenance> {
    static STATES: LazyLock<WeakTable<Ident, Maintenance>> =
        LazyLock::new(|| WeakTable::new(|_| Arc::new(Maintenance::default())));

    &STATES
}

/// Options for [`wrap_maintenance_throttle`].
///
/// Requests whose whole client chain lies inside `bypass_list` skip the
/// gate entirely; the default bypass list is empty.
pub struct MaintenanceThrottleOptions {
    pub ident_fn: IdentFn,
    pub bypass_list: Arc<dyn RuleSource>,
}

impl MaintenanceThrottleOptions {
    fn bypass_list() -> Arc<dyn RuleSource> {
        Arc::new(Vec::new())
    }
}

impl Default for MaintenanceThrottleOptions {
    fn default() -> Self {
        Self {
            ident_fn: world_ident(),
            bypass_list: Self::bypass_list(),
        }
    }
}

/// Options for [`wrap_maintenance_limit`].
///
/// The default deny handler responds 503 after at most `max_wait` spent
/// waiting for the gate.
pub struct MaintenanceLimitOptions {
    pub ident_fn: IdentFn,
    pub bypass_list: Arc<dyn RuleSource>,
    pub max_wait: Duration,
    pub deny_handler: Arc<dyn Handler>,
}

impl MaintenanceLimitOptions {
    fn max_wait() -> Duration {
        Duration::from_millis(50)
    }

    fn deny_handler() -> Arc<dyn Handler> {
        Arc::new(deny)
    }
}

impl Default for MaintenanceLimitOptions {
    fn default() -> Self {
        Self {
            ident_fn: world_ident(),
            bypass_list: MaintenanceThrottleOptions::bypass_list(),
            max_wait: Self::max_wait(),
            deny_handler: Self::deny_handler(),
        }
    }
}

enum Admitted {
    /// The chain is bypass-listed or this request already sits in the
    /// drain for the identity; pass straight through.
    Through,
    Entered(Admission),
    Denied,
}

struct Gatekeeper {
    bypass_list: Arc<dyn RuleSource>,
    ident_fn: IdentFn,
    /// `None` waits indefinitely (throttle); `Some` gives up (limit).
    max_wait: Option<Duration>,
}

impl Gatekeeper {
    fn admit(&self, request: &mut Request) -> Admitted {
        let chain = request.client_chain();
        let bypass = self.bypass_list.load();
        if cidr::allowed(chain.iter().map(String::as_str), &bypass) {
            COUNTS.add(Outcome::Admitted);
            return Admitted::Through;
        }

        let ident = (self.ident_fn)(request);
        if request.is_admitted(&ident) {
            return Admitted::Through;
        }

        let state = states().get(&ident);
        if state.admit(self.max_wait) {
            COUNTS.add(Outcome::Admitted);
            request.mark_admitted(ident);
            Admitted::Entered(Admission::new(move || state.leave()))
        } else {
            COUNTS.add(Outcome::DeniedMaintenance);
            Admitted::Denied
        }
    }
}

struct MaintenanceThrottle {
    inner: Arc<dyn Handler>,
    gatekeeper: Gatekeeper,
}

impl Handler for MaintenanceThrottle {
    fn call(&self, mut request: Request) -> Result<Response> {
        match self.gatekeeper.admit(&mut request) {
            Admitted::Through => self.inner.call(request),
            Admitted::Entered(_admission) => self.inner.call(request),
            // Unreachable without a timeout, the throttle waits forever.
            Admitted::Denied => Ok(Response::under_maintenance()),
        }
    }

    fn call_async(&self, mut request: Request, respond: Respond, raise: Raise) {
        match self.gatekeeper.admit(&mut request) {
            Admitted::Through => self.inner.call_async(request, respond, raise),
            Admitted::Entered(admission) => {
                let (respond, raise) = guarded(admission, respond, raise);
                self.inner.call_async(request, respond, raise);
            }
            Admitted::Denied => respond(Response::under_maintenance()),
        }
    }
}

struct MaintenanceLimit {
    inner: Arc<dyn Handler>,
    deny_handler: Arc<dyn Handler>,
    gatekeeper: Gatekeeper,
}

impl Handler for MaintenanceLimit {
    fn call(&self, mut request: Request) -> Result<Response> {
        match self.gatekeeper.admit(&mut request) {
            Admitted::Through => self.inner.call(request),
            Admitted::Entered(_admission) => self.inner.call(request),
            Admitted::Denied => self.deny_handler.call(request),
        }
    }

    fn call_async(&self, mut request: Request, respond: Respond, raise: Raise) {
        match self.gatekeeper.admit(&mut request) {
            Admitted::Through => self.inner.call_async(request, respond, raise),
            Admitted::Entered(admission) => {
                let (respond, raise) = guarded(admission, respond, raise);
                self.inner.call_async(request, respond, raise);
            }
            Admitted::Denied => self.deny_handler.call_async(request, respond, raise),
        }
    }
}

/// Hold requests at the gate while their identity is under maintenance.
///
/// Admitted requests register with the identity's drain barrier so an
/// operator can wait for them to finish; waiters block indefinitely while
/// the gate is closed and re-contend when it reopens.
pub fn wrap_maintenance_throttle(
    inner: Arc<dyn Handler>,
    options: MaintenanceThrottleOptions,
) -> Arc<dyn Handler> {
    Arc::new(MaintenanceThrottle {
        gatekeeper: Gatekeeper {
            bypass_list: options.bypass_list,
            ident_fn: options.ident_fn,
            max_wait: None,
        },
        inner,
    })
}

/// Like [`wrap_maintenance_throttle`], but give up after `max_wait` and
/// hand the request to the deny handler.
pub fn wrap_maintenance_limit(
    inner: Arc<dyn Handler>,
    options: MaintenanceLimitOptions,
) -> Arc<dyn Handler> {
    Arc::new(MaintenanceLimit {
        gatekeeper: Gatekeeper {
            bypass_list: options.bypass_list,
            ident_fn: options.ident_fn,
            max_wait: Some(options.max_wait),
        },
        deny_handler: options.deny_handler,
        inner,
    })
}

struct Reopen(Arc<Latch>);

impl Drop for Reopen {
    fn drop(&mut self) {
        self.0.open();
    }
}

/// Run an operator body with the identity fully drained.
///
/// On entry the identity's gate is closed, so new requests wait (throttle)
/// or are denied (limit), and the call blocks until every admitted request
/// has left the drain. The gate reopens on every exit path, including
/// unwind.
///
/// Distinct identities are independent: maintenance on one identity never
/// affects requests grouped under another.
///
/// # Test
///
/// ```
/// use firewall::http::Ident;
/// use firewall::middleware::with_maintenance;
///
/// let out = with_maintenance(Ident::World, || 42);
///
/// assert_eq!(out, 42);
/// ```
pub fn with_maintenance<R>(ident: Ident, body: impl FnOnce() -> R) -> R {
    let state = states().get(&ident);

    let latch = state.gate().close();
    state.drain().await_drained();

    let _reopen = Reopen(latch);
    body()
}
