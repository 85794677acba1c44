//! Composable HTTP request filters that protect an upstream handler along
//! four axes: source-address access control, concurrency bounding, rate
//! shaping, and maintenance coordination.
//!
//! Each filter wraps an inner [`http::Handler`] and composes freely with
//! the others. Per-identity synchronization primitives are built on demand
//! and reclaimed once nothing references them, so ephemeral identities cost
//! nothing. Transport, routing and server lifecycle live outside this
//! crate.

pub mod bucket;
pub mod cidr;
pub mod http;
pub mod keyed;
pub mod maintenance;
pub mod middleware;
pub mod semaphore;
pub mod statistics;
pub mod timer;

pub use self::{
    bucket::LeakyBucket,
    cidr::Cidr,
    http::{Handler, Ident, Request, Response},
    keyed::WeakTable,
    middleware::{
        AllowIpsOptions, ConcurrencyLimitOptions, ConcurrencyThrottleOptions, DenyIpsOptions,
        MaintenanceLimitOptions, MaintenanceThrottleOptions, RateLimitOptions,
        RateThrottleOptions, with_maintenance, wrap_allow_ips, wrap_concurrency_limit,
        wrap_concurrency_throttle, wrap_deny_ips, wrap_maintenance_limit,
        wrap_maintenance_throttle, wrap_rate_limit, wrap_rate_throttle,
    },
    semaphore::Semaphore,
    timer::DelayTimer,
};
