//! Handler dispatch: pick the method export, build the event, run it, and
//! turn whatever comes back into a [`Response`].

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tracing::{error, warn};

use crate::error::{Error, HandlerError};
use crate::event::{ApiEvent, Env, Params};
use crate::method::Method;
use crate::request::Request;
use crate::response::Response;
use crate::route::{Export, RouteModule};
use crate::status::Status;

/// Body of a handler failure that carried no message.
pub const FALLBACK_ERROR_MESSAGE: &str = "Unexpected error";

/// Runs the `module` export matching the request method.
///
/// Never fails: a missing or refused export, a handler error, and a handler
/// panic all become error responses here.
pub async fn dispatch(module: &RouteModule, request: Request, params: Params, env: Arc<Env>) -> Response {
    let export = request.method().parse::<Method>().ok().and_then(|m| module.export(m));

    let handler = match export {
        Some(Export::Handler(handler)) => Arc::clone(handler),
        Some(Export::Unsupported) => {
            let err = Error::MethodNotAllowed {
                method: request.method().to_owned(),
                path: request.path().to_owned(),
            };
            warn!(%err, "method refused by route module");
            return method_not_allowed(err, module);
        }
        None => {
            let err = Error::NoHandler {
                method: request.method().to_owned(),
                path: request.path().to_owned(),
            };
            warn!(%err, "no export for method");
            return rejection(&err);
        }
    };

    let event = ApiEvent::new(request, params, env);
    let outcome = AssertUnwindSafe(handler.call(event))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(HandlerError::new(panic_message(panic.as_ref()))));

    match outcome {
        Ok(Some(response)) => response,
        Ok(None) => Response::empty(),
        Err(e) => {
            let status = e.status().unwrap_or_else(|| Status::InternalServerError.into());
            error!(status, error = %e, "handler failed");
            let message = match e.message() {
                "" => FALLBACK_ERROR_MESSAGE,
                m => m,
            };
            Response::error(status, message)
        }
    }
}

/// The plain-text response for a request-time failure.
pub(crate) fn rejection(err: &Error) -> Response {
    Response::error(err.status(), err.to_string())
}

fn method_not_allowed(err: Error, module: &RouteModule) -> Response {
    let allow = module.allowed().iter()
        .map(|m| m.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    let mut response = rejection(&err);
    response.headers.push(("allow".to_owned(), allow));
    response
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::memory::MemoryTransport;
    use crate::response::Json;

    fn request(method: &str, target: &str) -> Request {
        let mut transport = MemoryTransport::new(method, target);
        Request::from_transport(&mut transport, &Config::default()).unwrap()
    }

    async fn body(response: Response) -> String {
        let mut body = response.into_body().unwrap();
        String::from_utf8(body.bytes().await.unwrap().to_vec()).unwrap()
    }

    async fn post(_: ApiEvent) -> &'static str { "John Doe" }

    async fn show(event: ApiEvent) -> Json<serde_json::Value> {
        Json(serde_json::json!({ "kind": event.kind(), "id": event.param("id") }))
    }

    #[tokio::test]
    async fn missing_export_is_404() {
        let module = RouteModule::new().post(post);
        let res = dispatch(&module, request("GET", "/api/name"), Params::new(), Arc::default()).await;
        assert_eq!(res.status_code(), 404);
        assert_eq!(res.header("content-type"), Some("text/plain; charset=utf-8"));
        assert_eq!(body(res).await, "No handler found for GET /api/name");
    }

    #[tokio::test]
    async fn unknown_method_is_404() {
        let module = RouteModule::new().post(post);
        let res = dispatch(&module, request("BREW", "/pot"), Params::new(), Arc::default()).await;
        assert_eq!(res.status_code(), 404);
    }

    #[tokio::test]
    async fn unsupported_marker_is_405_with_allow() {
        let module = RouteModule::new().get(show).post(post).unsupported(Method::Delete);
        let res = dispatch(&module, request("DELETE", "/x"), Params::new(), Arc::default()).await;
        assert_eq!(res.status_code(), 405);
        assert_eq!(res.header("allow"), Some("GET, POST"));
    }

    #[tokio::test]
    async fn event_carries_params_and_tag() {
        let module = RouteModule::new().get(show);
        let params = Params::from([("id".to_owned(), "7".to_owned())]);
        let res = dispatch(&module, request("GET", "/users/7"), params, Arc::default()).await;
        assert_eq!(res.status_code(), 200);
        assert_eq!(body(res).await, r#"{"id":"7","kind":"$FETCH"}"#);
    }

    #[tokio::test]
    async fn env_reaches_handler() {
        async fn region(event: ApiEvent) -> String {
            event.env().get("REGION").cloned().unwrap_or_default()
        }
        let module = RouteModule::new().get(region);
        let env = Arc::new(Env::from([("REGION".to_owned(), "fra1".to_owned())]));
        let res = dispatch(&module, request("GET", "/"), Params::new(), env).await;
        assert_eq!(body(res).await, "fra1");
    }

    #[tokio::test]
    async fn handler_error_status_and_fallback_message() {
        async fn teapot(_: ApiEvent) -> Result<Response, HandlerError> {
            Err(HandlerError::new("short and stout").with_status(Status::ImATeapot))
        }
        async fn silent(_: ApiEvent) -> Result<Response, HandlerError> {
            Err(HandlerError::new(""))
        }

        let res = dispatch(&RouteModule::new().get(teapot), request("GET", "/"), Params::new(), Arc::default()).await;
        assert_eq!(res.status_code(), 418);
        assert_eq!(body(res).await, "short and stout");

        let res = dispatch(&RouteModule::new().get(silent), request("GET", "/"), Params::new(), Arc::default()).await;
        assert_eq!(res.status_code(), 500);
        assert_eq!(body(res).await, FALLBACK_ERROR_MESSAGE);
    }

    #[tokio::test]
    async fn panic_becomes_500() {
        async fn boom(_: ApiEvent) -> Response {
            panic!("kaboom")
        }
        let res = dispatch(&RouteModule::new().get(boom), request("GET", "/"), Params::new(), Arc::default()).await;
        assert_eq!(res.status_code(), 500);
        assert_eq!(body(res).await, "kaboom");
    }
}
