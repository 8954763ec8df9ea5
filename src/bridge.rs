//! The entry adapter: one transport request in, one response written out.

use std::sync::Arc;

use tracing::{Instrument, debug, debug_span, warn};

use crate::config::Config;
use crate::dispatch::{dispatch, rejection};
use crate::error::Error;
use crate::event::Params;
use crate::request::Request;
use crate::response::Response;
use crate::route::{RouteMatch, RouteModule};
use crate::router::Router;
use crate::transport::{IncomingTransport, ResponseSink};
use crate::writer::WriteState;

enum Resolver {
    /// Path table, params from the matched pattern.
    Table(Router),
    /// One module per deployment, params from the route-match header.
    Function(Arc<RouteModule>),
}

/// Adapts transport requests to handler calls and writes the results back.
///
/// A `Bridge` holds no per-request state. Share one across connections
/// behind an `Arc`.
pub struct Bridge {
    config: Config,
    resolver: Resolver,
}

impl Bridge {
    /// Resolves requests through `router`.
    pub fn new(router: Router) -> Self {
        Self { config: Config::default(), resolver: Resolver::Table(router) }
    }

    /// Serves `module` for every request. Route parameters come from the
    /// route-match descriptor in [`Config::match_header`]; without one the
    /// handler sees no parameters.
    ///
    /// ```rust
    /// use ferry::{ApiEvent, Bridge, Json, RouteModule};
    ///
    /// async fn nested(event: ApiEvent) -> Json<ferry::Params> {
    ///     Json(event.params().clone())
    /// }
    ///
    /// let bridge = Bridge::function(RouteModule::new().get(nested));
    /// ```
    pub fn function(module: RouteModule) -> Self {
        Self { config: Config::default(), resolver: Resolver::Function(Arc::new(module)) }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Handles one request end to end: adapt, resolve, dispatch, and write
    /// the response to `sink`. Returns the final state of the body write.
    pub async fn handle<T, S>(&self, transport: &mut T, sink: &mut S) -> WriteState
    where
        T: IncomingTransport + ?Sized,
        S: ResponseSink + ?Sized,
    {
        let head = transport.head();
        let span = debug_span!("request", method = %head.method, target = %head.target);

        async move {
            let response = match Request::from_transport(transport, &self.config) {
                Ok(request) => self.route(request).await,
                Err(err) => {
                    warn!(%err, "request rejected");
                    rejection(&err)
                }
            };
            let state = response.send(sink).await;
            debug!(?state, "response written");
            state
        }
        .instrument(span)
        .await
    }

    async fn route(&self, request: Request) -> Response {
        match &self.resolver {
            Resolver::Table(router) => match router.resolve(request.path()) {
                Some((module, params)) => dispatch(&module, request, params, self.config.env()).await,
                None => {
                    let err = Error::NoHandler {
                        method: request.method().to_owned(),
                        path: request.path().to_owned(),
                    };
                    warn!(%err, "no route");
                    rejection(&err)
                }
            },
            Resolver::Function(module) => match self.header_params(&request) {
                Ok(params) => dispatch(module, request, params, self.config.env()).await,
                Err(err) => {
                    warn!(%err, "request rejected");
                    rejection(&err)
                }
            },
        }
    }

    fn header_params(&self, request: &Request) -> Result<Params, Error> {
        let Some(pattern) = request.header(self.config.match_header()) else {
            return Ok(Params::new());
        };
        let target = request.url().path_and_query().map_or("/", |pq| pq.as_str());
        Ok(RouteMatch::new(pattern)?.params(target))
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.resolver {
            Resolver::Table(_) => "table",
            Resolver::Function(_) => "function",
        };
        f.debug_struct("Bridge")
            .field("mode", &mode)
            .field("config", &self.config)
            .finish()
    }
}
