use std::collections::BTreeSet;

use ahash::{HashMap, HashSet};
use anyhow::Result;

/// Forwarded headers honored when building the client chain, in lookup
/// order. Header name matching is case-insensitive.
pub const FORWARDED_HEADERS: [&str; 2] = ["True-Client-IP", "X-Forwarded-For"];

/// The identity of a group of requests sharing one synchronization
/// primitive.
///
/// Produced by a caller-supplied identity function; `World` is the default
/// and maps every request onto a single global primitive, while
/// [`Ident::chain`] yields per-client primitives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Ident {
    World,
    Text(String),
    Chain(Vec<String>),
}

impl Ident {
    /// The identity of the request's client chain.
    pub fn chain(request: &Request) -> Self {
        Self::Chain(request.client_chain().into_iter().collect())
    }
}

/// The inbound request shape consumed by the filters.
///
/// Transport, routing and body handling live outside this library; a filter
/// only ever reads the source address, the headers and the parsed query
/// parameters, and threads the rest through untouched.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub remote_addr: Option<String>,
    pub headers: Vec<(String, String)>,
    pub query: HashMap<String, String>,
    admissions: HashSet<Ident>,
}

impl Request {
    pub fn new(remote_addr: &str) -> Self {
        Self {
            remote_addr: Some(remote_addr.to_string()),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// All values of a header, name compared case-insensitively.
    pub fn header_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.headers
            .iter()
            .filter(move |(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// The set of client-associated addresses for this request: the source
    /// address plus every hop found in the forwarded headers.
    ///
    /// Header values are comma-separated; each element is trimmed, empties
    /// are dropped, and a trailing `:port` suffix is stripped.
    ///
    /// # Test
    ///
    /// ```
    /// use firewall::http::Request;
    ///
    /// let request = Request::new("10.20.206.46")
    ///     .with_header("x-forwarded-for", "10.20.205.24,192.10.1.1:8080");
    ///
    /// let chain = request.client_chain();
    ///
    /// assert!(chain.contains("10.20.206.46"));
    /// assert!(chain.contains("10.20.205.24"));
    /// assert!(chain.contains("192.10.1.1"));
    /// ```
    pub fn client_chain(&self) -> BTreeSet<String> {
        let mut chain = BTreeSet::new();

        if let Some(addr) = &self.remote_addr {
            chain.insert(addr.clone());
        }

        for name in FORWARDED_HEADERS {
            for value in self.header_all(name) {
                for element in value.split(',') {
                    let element = element.trim();
                    if !element.is_empty() {
                        chain.insert(strip_port(element).to_string());
                    }
                }
            }
        }

        chain
    }

    /// Whether this request already entered the drain barrier for the
    /// identity; nested maintenance filters must not re-enter.
    pub(crate) fn is_admitted(&self, ident: &Ident) -> bool {
        self.admissions.contains(ident)
    }

    pub(crate) fn mark_admitted(&mut self, ident: Ident) {
        self.admissions.insert(ident);
    }
}

/// Strip a trailing `:port` suffix from a forwarded element.
///
/// Bare IPv6 literals contain colons of their own and carry no port, so only
/// single-colon forms are stripped.
fn strip_port(element: &str) -> &str {
    if let Some((head, tail)) = element.rsplit_once(':') {
        if !head.contains(':') && !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()) {
            return head;
        }
    }

    element
}

/// The outbound response shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// A plain-text response.
    pub fn plain(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), "text/plain".to_string())],
            body: body.to_string(),
        }
    }

    /// Stock deny response for access-control filters.
    pub fn access_denied() -> Self {
        Self::plain(403, "Access denied")
    }

    /// Stock deny response for concurrency and rate filters.
    pub fn limit_exceeded() -> Self {
        Self::plain(429, "Limit exceeded")
    }

    /// Stock deny response for maintenance filters.
    pub fn under_maintenance() -> Self {
        Self::plain(503, "Undergoing maintenance")
    }
}

/// Success continuation of the asynchronous handler shape.
pub type Respond = Box<dyn FnOnce(Response) + Send>;

/// Error continuation of the asynchronous handler shape.
pub type Raise = Box<dyn FnOnce(anyhow::Error) + Send>;

/// A request handler, callable in a synchronous or a continuation-passing
/// shape.
///
/// Filters wrap both shapes: whatever a filter acquires before delegating is
/// released exactly once whether the inner handler returns, responds through
/// the success continuation, raises through the error continuation, or
/// unwinds.
///
/// Plain functions are handlers:
///
/// ```
/// use anyhow::Result;
/// use firewall::http::{Handler, Request, Response};
///
/// fn handle(_request: Request) -> Result<Response> {
///     Ok(Response::plain(200, "ok"))
/// }
///
/// assert_eq!(handle.call(Request::new("10.0.0.1")).unwrap().status, 200);
/// ```
pub trait Handler: Send + Sync {
    fn call(&self, request: Request) -> Result<Response>;

    /// Asynchronous shape; the default bridges to the synchronous one and
    /// invokes exactly one continuation.
    fn call_async(&self, request: Request, respond: Respond, raise: Raise) {
        match self.call(request) {
            Ok(response) => respond(response),
            Err(error) => raise(error),
        }
    }
}

impl<F> Handler for F
where
    F: Fn(Request) -> Result<Response> + Send + Sync,
{
    fn call(&self, request: Request) -> Result<Response> {
        (self)(request)
    }
}
