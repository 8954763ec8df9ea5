//! # ferry
//!
//! Carries HTTP requests between a push-style transport and pull-style
//! handlers, and carries the responses back.
//!
//! A socket server delivers a request as events: a parsed head, then body
//! chunks whenever they arrive. Handlers want values: a [`Request`] whose
//! body they read when they are ready, returning a [`Response`] whose body
//! they produce when they are ready. ferry sits in between.
//!
//! - **Inbound**: body chunks are queued for the handler. When the queue is
//!   full the transport is paused; when the handler catches up it resumes.
//!   The body is capped at `content-length` (or the configured limit) and
//!   fails with `413` instead of truncating.
//! - **Dispatch**: the request is routed to a [`RouteModule`], the export for
//!   its method is called with an [`ApiEvent`], and errors, panics and empty
//!   returns all become well-formed responses.
//! - **Outbound**: status and headers are written first, then the body is
//!   streamed chunk by chunk, waiting whenever the transport's write buffer
//!   is full. A client that goes away cancels the handler's body.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use ferry::{ApiEvent, Bridge, Config, HandlerResult, Json, Response, RouteModule, Router, Server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let app = Router::new()
//!         .route("/api/name/{last}", RouteModule::new().get(by_last).post(create));
//!
//!     let bridge = Bridge::new(app).with_config(Config::from_env());
//!     Server::bind("0.0.0.0:3000").serve(bridge).await.unwrap();
//! }
//!
//! async fn by_last(event: ApiEvent) -> Json<ferry::Params> {
//!     Json(event.params().clone())
//! }
//!
//! async fn create(event: ApiEvent) -> HandlerResult<Response> {
//!     let name = event.into_request().text().await?;
//!     Ok(Response::text(format!("created {name}")))
//! }
//! ```
//!
//! Any other transport plugs in through [`IncomingTransport`] and
//! [`ResponseSink`]; see [`memory`] for an in-process pair.

mod body;
mod bridge;
mod config;
mod dispatch;
mod error;
mod event;
mod handler;
mod method;
mod reader;
mod request;
mod response;
mod route;
mod router;
mod server;
mod status;
mod transport;
mod writer;

pub mod conn;
pub mod memory;

pub use body::{BodySender, ResponseBody};
pub use bridge::Bridge;
pub use config::{Config, DEFAULT_BODY_SIZE_LIMIT, DEFAULT_WRITE_HIGH_WATER_MARK, ROUTE_MATCH_HEADER};
pub use dispatch::{FALLBACK_ERROR_MESSAGE, dispatch};
pub use error::{BoxError, Error, HandlerError};
pub use event::{ApiEvent, Env, FETCH_EVENT, Params};
pub use handler::{Handler, HandlerResult};
pub use method::Method;
pub use reader::{BodyFeed, IncomingBody, ReadState, read_body};
pub use request::Request;
pub use response::{ContentType, DEFAULT_CONTENT_TYPE, IntoOutcome, Json, Outcome, Response, ResponseBuilder};
pub use route::{Export, RouteMatch, RouteModule};
pub use router::Router;
pub use server::Server;
pub use status::Status;
pub use transport::{
    EventHub, IncomingTransport, ReadControl, RequestHead, ResponseSink, SinkEvent, Subscription,
    WriteStatus,
};
pub use writer::{BodyWriter, LOCKED_BODY_MESSAGE, WriteState};
