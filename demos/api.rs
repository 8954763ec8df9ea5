//! A small API served through the bridge.
//!
//! Run with:
//!   RUST_LOG=debug cargo run --example api
//!
//! Try:
//!   curl http://localhost:3000/api/name/john
//!   curl http://localhost:3000/api/name/doe
//!   curl http://localhost:3000/api/school/math
//!   curl http://localhost:3000/api/test/a/b/c
//!   curl -X POST http://localhost:3000/api/name/doe
//!   curl -X POST http://localhost:3000/api/echo -H 'content-type: text/plain' -d 'hello'
//!   curl -N http://localhost:3000/api/ticks

use std::time::Duration;

use ferry::{
    ApiEvent, Bridge, Config, HandlerError, HandlerResult, Json, Response, ResponseBody,
    RouteModule, Router, Server, Status,
};
use serde_json::{Value, json};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let app = Router::new()
        .route("/api/name/john", RouteModule::new().get(john).post(john_doe))
        .route("/api/name/{last}", RouteModule::new().get(last_name).post(john_doe))
        .route("/api/{name}/{nested}", RouteModule::new().get(nested).post(john_doe))
        .route("/api/test/{*nested}", RouteModule::new().get(catch_all).post(john_doe))
        .route("/api/echo", RouteModule::new().post(echo))
        .route("/api/ticks", RouteModule::new().get(ticks));

    let bridge = Bridge::new(app).with_config(Config::from_env().scheme("http"));

    if let Err(e) = Server::bind("0.0.0.0:3000").serve(bridge).await {
        eprintln!("server error: {e}");
    }
}

// GET /api/name/john
async fn john(_event: ApiEvent) -> Json<Value> {
    Json(json!({ "message": "John Doe" }))
}

// POST on every name route
async fn john_doe(_event: ApiEvent) -> &'static str {
    "John Doe"
}

// GET /api/name/{last}
async fn last_name(event: ApiEvent) -> Json<Value> {
    Json(json!({ "path": "/api/name/[last]", "params": event.params() }))
}

// GET /api/{name}/{nested}
async fn nested(event: ApiEvent) -> Json<Value> {
    Json(json!({ "path": "/api/[name]/[nested]", "params": event.params() }))
}

// GET /api/test/{*nested}
async fn catch_all(event: ApiEvent) -> Json<Value> {
    Json(json!({ "path": "/api/test/[...nested]", "params": event.params() }))
}

// POST /api/echo
//
// Reading past the size limit fails with 413; `?` keeps that status.
async fn echo(event: ApiEvent) -> HandlerResult<Response> {
    let body = event.into_request().bytes().await?;
    if body.is_empty() {
        return Err(HandlerError::new("empty body").with_status(Status::BadRequest));
    }
    Ok(Response::builder()
        .header("x-echo-length", &body.len().to_string())
        .bytes(ferry::ContentType::OctetStream, body))
}

// GET /api/ticks
//
// Streams until the client disconnects.
async fn ticks(_event: ApiEvent) -> Response {
    let (tx, body) = ResponseBody::channel(1);
    tokio::spawn(async move {
        let mut n = 0u64;
        loop {
            tokio::select! {
                () = tx.cancelled() => break,
                () = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
            if tx.send(format!("tick {n}\n")).await.is_err() {
                break;
            }
            n += 1;
        }
    });
    Response::builder().stream("text/plain; charset=utf-8", body)
}
