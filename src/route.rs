//! Route modules and route-match descriptors.
//!
//! A [`RouteModule`] is what one route file exports: at most one entry per
//! HTTP method, each either a handler or an explicit "unsupported" marker.
//! A [`RouteMatch`] turns a request target into route parameters when the
//! route was resolved by something upstream of the bridge.

use std::collections::HashMap;
use std::fmt;

use regex::Regex;

use crate::error::Error;
use crate::event::Params;
use crate::handler::{BoxedHandler, Handler};
use crate::method::Method;

/// A single method export of a route module.
#[derive(Clone)]
pub enum Export {
    Handler(BoxedHandler),
    /// The module declares the method and refuses it.
    Unsupported,
}

impl fmt::Debug for Export {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handler(_) => f.write_str("Handler"),
            Self::Unsupported => f.write_str("Unsupported"),
        }
    }
}

/// The exports of one route, keyed by method.
///
/// ```rust
/// use ferry::{ApiEvent, Method, RouteModule, Status};
///
/// async fn show(_: ApiEvent) -> Status { Status::Ok }
/// async fn create(_: ApiEvent) -> &'static str { "John Doe" }
///
/// let module = RouteModule::new()
///     .get(show)
///     .post(create)
///     .unsupported(Method::Delete);
/// assert_eq!(module.allowed(), vec![Method::Get, Method::Post]);
/// ```
#[derive(Clone, Debug, Default)]
pub struct RouteModule {
    exports: HashMap<Method, Export>,
}

impl RouteModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Export `handler` for `method`, replacing any earlier export.
    pub fn on(mut self, method: Method, handler: impl Handler) -> Self {
        self.exports.insert(method, Export::Handler(handler.into_boxed_handler()));
        self
    }

    pub fn get(self, handler: impl Handler) -> Self { self.on(Method::Get, handler) }
    pub fn post(self, handler: impl Handler) -> Self { self.on(Method::Post, handler) }
    pub fn put(self, handler: impl Handler) -> Self { self.on(Method::Put, handler) }
    pub fn patch(self, handler: impl Handler) -> Self { self.on(Method::Patch, handler) }
    pub fn delete(self, handler: impl Handler) -> Self { self.on(Method::Delete, handler) }

    /// Mark `method` as explicitly unsupported.
    pub fn unsupported(mut self, method: Method) -> Self {
        self.exports.insert(method, Export::Unsupported);
        self
    }

    pub fn export(&self, method: Method) -> Option<&Export> {
        self.exports.get(&method)
    }

    /// Methods with a handler export, in [`Method::ALL`] order.
    pub fn allowed(&self) -> Vec<Method> {
        Method::ALL.into_iter()
            .filter(|m| matches!(self.exports.get(m), Some(Export::Handler(_))))
            .collect()
    }
}

/// A compiled route-match descriptor: a regex whose named groups become
/// route parameters.
///
/// Matching is unanchored, so a descriptor for `/api/name/(?P<last>[^/]+)`
/// also matches `/api/name/doe?x=1`.
#[derive(Clone, Debug)]
pub struct RouteMatch {
    regex: Regex,
}

impl RouteMatch {
    pub fn new(pattern: &str) -> Result<Self, Error> {
        Regex::new(pattern)
            .map(|regex| Self { regex })
            .map_err(|e| Error::InvalidRequest(format!("invalid route match `{pattern}`: {e}")))
    }

    /// Compiles a route path such as `/api/:name/*rest`.
    ///
    /// `:name` captures one segment, `*name` captures the remainder (slashes
    /// included). Other segments match literally.
    pub fn from_route_path(path: &str) -> Result<Self, Error> {
        let pattern = path.split('/')
            .map(|segment| {
                if let Some(name) = segment.strip_prefix(':') {
                    format!("(?P<{name}>[^/]+)")
                } else if let Some(name) = segment.strip_prefix('*') {
                    format!("(?P<{name}>.*)")
                } else {
                    regex::escape(segment)
                }
            })
            .collect::<Vec<_>>()
            .join("/");
        Self::new(&pattern)
    }

    /// Route parameters for `target`. Empty when nothing matches; groups
    /// that did not take part in the match are left out.
    pub fn params(&self, target: &str) -> Params {
        let Some(caps) = self.regex.captures(target) else {
            return Params::new();
        };
        self.regex.capture_names()
            .flatten()
            .filter_map(|name| caps.name(name).map(|m| (name.to_owned(), m.as_str().to_owned())))
            .collect()
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }
}
