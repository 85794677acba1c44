use std::sync::Arc;

use anyhow::Result;

use crate::{
    cidr,
    http::{Handler, Raise, Request, Respond, Response},
    middleware::RuleSource,
    statistics::{COUNTS, Outcome},
};

fn deny(_: Request) -> Result<Response> {
    Ok(Response::access_denied())
}

/// Options for [`wrap_allow_ips`].
///
/// The default allow list is the private address space (RFC 1918 plus
/// RFC 4193); the default deny handler responds 403.
pub struct AllowIpsOptions {
    pub allow_list: Arc<dyn RuleSource>,
    pub deny_handler: Arc<dyn Handler>,
}

impl AllowIpsOptions {
    fn allow_list() -> Arc<dyn RuleSource> {
        Arc::new(cidr::private_ranges().to_vec())
    }

    fn deny_handler() -> Arc<dyn Handler> {
        Arc::new(deny)
    }
}

impl Default for AllowIpsOptions {
    fn default() -> Self {
        Self {
            allow_list: Self::allow_list(),
            deny_handler: Self::deny_handler(),
        }
    }
}

/// Options for [`wrap_deny_ips`].
///
/// The default deny list is the public address space partition; the default
/// deny handler responds 403.
pub struct DenyIpsOptions {
    pub deny_list: Arc<dyn RuleSource>,
    pub deny_handler: Arc<dyn Handler>,
}

impl DenyIpsOptions {
    fn deny_list() -> Arc<dyn RuleSource> {
        Arc::new(cidr::public_ranges().to_vec())
    }

    fn deny_handler() -> Arc<dyn Handler> {
        Arc::new(deny)
    }
}

impl Default for DenyIpsOptions {
    fn default() -> Self {
        Self {
            deny_list: Self::deny_list(),
            deny_handler: Self::deny_handler(),
        }
    }
}

struct AllowIps {
    inner: Arc<dyn Handler>,
    allow_list: Arc<dyn RuleSource>,
    deny_handler: Arc<dyn Handler>,
}

impl AllowIps {
    fn permitted(&self, request: &Request) -> bool {
        let chain = request.client_chain();
        let ranges = self.allow_list.load();

        cidr::allowed(chain.iter().map(String::as_str), &ranges)
    }
}

impl Handler for AllowIps {
    fn call(&self, request: Request) -> Result<Response> {
        if self.permitted(&request) {
            COUNTS.add(Outcome::Admitted);
            self.inner.call(request)
        } else {
            COUNTS.add(Outcome::DeniedAccess);
            self.deny_handler.call(request)
        }
    }

    fn call_async(&self, request: Request, respond: Respond, raise: Raise) {
        if self.permitted(&request) {
            COUNTS.add(Outcome::Admitted);
            self.inner.call_async(request, respond, raise);
        } else {
            COUNTS.add(Outcome::DeniedAccess);
            self.deny_handler.call_async(request, respond, raise);
        }
    }
}

struct DenyIps {
    inner: Arc<dyn Handler>,
    deny_list: Arc<dyn RuleSource>,
    deny_handler: Arc<dyn Handler>,
}

impl DenyIps {
    fn rejected(&self, request: &Request) -> bool {
        let chain = request.client_chain();
        let ranges = self.deny_list.load();

        cidr::denied(chain.iter().map(String::as_str), &ranges)
    }
}

impl Handler for DenyIps {
    fn call(&self, request: Request) -> Result<Response> {
        if self.rejected(&request) {
            COUNTS.add(Outcome::DeniedAccess);
            self.deny_handler.call(request)
        } else {
            COUNTS.add(Outcome::Admitted);
            self.inner.call(request)
        }
    }

    fn call_async(&self, request: Request, respond: Respond, raise: Raise) {
        if self.rejected(&request) {
            COUNTS.add(Outcome::DeniedAccess);
            self.deny_handler.call_async(request, respond, raise);
        } else {
            COUNTS.add(Outcome::Admitted);
            self.inner.call_async(request, respond, raise);
        }
    }
}

/// Admit only requests whose entire client chain lies inside the allow
/// list.
///
/// A request must have reached the server through permitted intermediaries
/// only; one uncovered hop sends it to the deny handler. Access control
/// never suspends.
pub fn wrap_allow_ips(inner: Arc<dyn Handler>, options: AllowIpsOptions) -> Arc<dyn Handler> {
    Arc::new(AllowIps {
        allow_list: options.allow_list,
        deny_handler: options.deny_handler,
        inner,
    })
}

/// Reject requests with any client-chain address inside the deny list.
///
/// One bad hop poisons the chain and sends the request to the deny handler.
pub fn wrap_deny_ips(inner: Arc<dyn Handler>, options: DenyIpsOptions) -> Arc<dyn Handler> {
    Arc::new(DenyIps {
        deny_list: options.deny_list,
        deny_handler: options.deny_handler,
        inner,
    })
}
