//! The value a handler is invoked with.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::request::Request;

/// Type tag carried by every event built by the dispatcher.
pub const FETCH_EVENT: &str = "$FETCH";

/// Route parameters: capture name to matched segment.
pub type Params = BTreeMap<String, String>;

/// Environment bag handed to handlers.
pub type Env = BTreeMap<String, String>;

/// A server-side fetch event: the adapted request, the route parameters it
/// matched, and the environment bag.
///
/// Built once per request and moved into the handler. There are no setters;
/// the handler can only read it or take it apart.
#[derive(Debug)]
pub struct ApiEvent {
    request: Request,
    params: Params,
    env: Arc<Env>,
}

impl ApiEvent {
    pub(crate) fn new(request: Request, params: Params, env: Arc<Env>) -> Self {
        Self { request, params, env }
    }

    pub fn kind(&self) -> &'static str { FETCH_EVENT }
    pub fn request(&self) -> &Request { &self.request }
    pub fn params(&self) -> &Params { &self.params }
    pub fn env(&self) -> &Env { &self.env }

    /// A named route parameter.
    ///
    /// For a route `/users/{id}`, `event.param("id")` on `/users/42` returns `Some("42")`.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Gives up the event for its request, e.g. to read the body.
    pub fn into_request(self) -> Request {
        self.request
    }

    pub fn into_parts(self) -> (Request, Params) {
        (self.request, self.params)
    }
}
