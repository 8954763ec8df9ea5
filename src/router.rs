//! Radix-tree route table.
//!
//! Maps a request path to the [`RouteModule`] serving it. O(path-length)
//! lookup. Method selection happens afterwards, in dispatch, so a path that
//! exists but lacks the method is reported as "no handler" rather than as an
//! unknown route.

use std::sync::Arc;

use matchit::Router as MatchitRouter;

use crate::event::Params;
use crate::route::RouteModule;

/// The application route table.
///
/// Build it once at startup and hand it to [`Bridge::new`](crate::Bridge::new).
/// Each [`Router::route`] call returns `self` so registrations chain naturally.
pub struct Router {
    tree: MatchitRouter<Arc<RouteModule>>,
}

impl Router {
    pub fn new() -> Self {
        Self { tree: MatchitRouter::new() }
    }

    /// Register a route module under `path`. Returns `self` for chaining.
    ///
    /// `{name}` captures one segment, `{*rest}` captures the remainder:
    ///
    /// ```rust
    /// # use ferry::{ApiEvent, RouteModule, Router};
    /// # async fn last(_: ApiEvent) {}
    /// # async fn nested(_: ApiEvent) {}
    /// Router::new()
    ///     .route("/api/name/{last}",  RouteModule::new().get(last))
    ///     .route("/api/test/{*nested}", RouteModule::new().get(nested));
    /// ```
    ///
    /// # Panics
    ///
    /// On a malformed or conflicting path. Routes are fixed at startup.
    pub fn route(mut self, path: &str, module: RouteModule) -> Self {
        self.tree
            .insert(path, Arc::new(module))
            .unwrap_or_else(|e| panic!("invalid route `{path}`: {e}"));
        self
    }

    pub(crate) fn resolve(&self, path: &str) -> Option<(Arc<RouteModule>, Params)> {
        let matched = self.tree.at(path).ok()?;
        let module = Arc::clone(matched.value);
        let params = matched.params.iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        Some((module, params))
    }
}

impl Default for Router {
    fn default() -> Self { Self::new() }
}
