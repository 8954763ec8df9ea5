use std::net::SocketAddr;
use std::sync::Arc;

use ferry::{ApiEvent, Bridge, Config, HandlerResult, Json, Response, RouteModule, Router, Server};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

async fn last(event: ApiEvent) -> Json<Value> {
    Json(json!({ "path": "/api/name/[last]", "params": event.params() }))
}

async fn john_doe(_: ApiEvent) -> &'static str {
    "John Doe"
}

async fn echo(event: ApiEvent) -> HandlerResult<Response> {
    let body = event.into_request().bytes().await?;
    Ok(Response::builder().bytes(ferry::ContentType::OctetStream, body))
}

struct Running {
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
    task: JoinHandle<Result<(), ferry::Error>>,
}

async fn start(config: Config) -> Running {
    let app = Router::new()
        .route("/api/name/{last}", RouteModule::new().get(last).post(john_doe))
        .route("/echo", RouteModule::new().post(echo));
    let bridge = Arc::new(Bridge::new(app).with_config(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(Server::serve_on(listener, bridge, async {
        let _ = stopped.await;
    }));
    Running { addr, stop, task }
}

/// Sends one request on a fresh connection and reads until the server
/// closes it.
async fn exchange(addr: SocketAddr, request: &str) -> (u16, String, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();

    let split = raw.windows(4).position(|w| w == b"\r\n\r\n").expect("no header terminator");
    let head = String::from_utf8(raw[..split].to_vec()).unwrap();
    let body = raw[split + 4..].to_vec();
    let status = head.split(' ').nth(1).unwrap().parse().unwrap();
    (status, head.to_ascii_lowercase(), body)
}

/// Undoes `transfer-encoding: chunked`.
fn dechunk(mut body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let line_end = body.windows(2).position(|w| w == b"\r\n").unwrap();
        let size = usize::from_str_radix(std::str::from_utf8(&body[..line_end]).unwrap().trim(), 16).unwrap();
        body = &body[line_end + 2..];
        if size == 0 {
            return out;
        }
        out.extend_from_slice(&body[..size]);
        body = &body[size + 2..];
    }
}

fn payload(head: &str, body: Vec<u8>) -> Vec<u8> {
    if head.contains("transfer-encoding: chunked") { dechunk(&body) } else { body }
}

#[tokio::test]
async fn serves_json_with_params_over_http1() {
    let server = start(Config::default()).await;

    let (status, head, body) = exchange(
        server.addr,
        "GET /api/name/doe HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n",
    ).await;

    assert_eq!(status, 200);
    assert!(head.contains("content-type: application/json"));
    let value: Value = serde_json::from_slice(&payload(&head, body)).unwrap();
    assert_eq!(value, json!({ "path": "/api/name/[last]", "params": { "last": "doe" } }));

    server.stop.send(()).unwrap();
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn missing_export_and_unknown_route() {
    let server = start(Config::default()).await;

    let (status, head, body) = exchange(
        server.addr,
        "PUT /api/name/doe HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n",
    ).await;
    assert_eq!(status, 404);
    assert_eq!(payload(&head, body), b"No handler found for PUT /api/name/doe");

    let (status, _, _) = exchange(
        server.addr,
        "GET /nowhere HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n",
    ).await;
    assert_eq!(status, 404);

    server.stop.send(()).unwrap();
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn echoes_a_chunked_upload() {
    let server = start(Config::default()).await;

    let request = "POST /echo HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\
                   content-type: text/plain\r\ntransfer-encoding: chunked\r\n\r\n\
                   5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
    let (status, head, body) = exchange(server.addr, request).await;

    assert_eq!(status, 200);
    assert_eq!(payload(&head, body), b"hello world");

    server.stop.send(()).unwrap();
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn declared_length_over_limit_is_413() {
    let server = start(Config::default().body_size_limit(Some(4))).await;

    let request = "POST /echo HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\
                   content-type: text/plain\r\ncontent-length: 5\r\n\r\nhello";
    let (status, head, body) = exchange(server.addr, request).await;

    assert_eq!(status, 413);
    assert_eq!(
        payload(&head, body),
        b"Received content-length of 5, but only accept up to 4 bytes."
    );

    server.stop.send(()).unwrap();
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_waits_for_idle_keep_alive_connections() {
    let server = start(Config::default()).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream
        .write_all(b"POST /api/name/doe HTTP/1.1\r\nhost: localhost\r\n\r\n")
        .await
        .unwrap();

    // One response on a connection that stays open.
    let mut buf = vec![0u8; 1024];
    let mut raw = Vec::new();
    while !raw.windows(8).any(|w| w == b"John Doe") {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed early");
        raw.extend_from_slice(&buf[..n]);
    }
    assert!(raw.starts_with(b"HTTP/1.1 200"));

    server.stop.send(()).unwrap();
    server.task.await.unwrap().unwrap();

    // The server closed the connection on its way out.
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
}
