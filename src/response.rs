//! Outgoing HTTP response type and the [`IntoOutcome`] conversion trait.
//!
//! Build a [`Response`] in your handler and return it. The bridge writes the
//! status and headers first, then streams the body.

use bytes::Bytes;
use serde::Serialize;
use tracing::debug;

use crate::body::ResponseBody;
use crate::error::HandlerError;
use crate::status::Status;
use crate::transport::ResponseSink;
use crate::writer::{BodyWriter, WriteState};

/// Content type of the response substituted when a handler returns nothing.
pub const DEFAULT_CONTENT_TYPE: &str = "text/html; charset=UTF-8";

// ── ContentType ───────────────────────────────────────────────────────────────

/// Common content-type values for use with [`ResponseBuilder::bytes`].
pub enum ContentType {
    Csv,          // text/csv
    EventStream,  // text/event-stream  (SSE)
    Html,         // text/html; charset=utf-8
    Json,         // application/json
    OctetStream,  // application/octet-stream
    Text,         // text/plain; charset=utf-8
}

impl ContentType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Csv         => "text/csv",
            Self::EventStream => "text/event-stream",
            Self::Html        => "text/html; charset=utf-8",
            Self::Json        => "application/json",
            Self::OctetStream => "application/octet-stream",
            Self::Text        => "text/plain; charset=utf-8",
        }
    }
}

// ── Response ─────────────────────────────────────────────────────────────────

/// An outgoing HTTP response: status, headers, and an optional body.
///
/// # Shortcuts (200 OK)
///
/// ```rust
/// use ferry::{Response, Status};
///
/// Response::json(br#"{"id":1}"#.to_vec());
/// Response::text("hello");
/// Response::status(Status::NoContent);
/// ```
///
/// # Builder (custom status or headers)
///
/// ```rust
/// use ferry::{ContentType, Response, Status};
///
/// Response::builder()
///     .status(Status::Created)
///     .header("location", "/users/42")
///     .json(br#"{"id":42}"#.to_vec());
///
/// Response::builder()
///     .status(202u16)
///     .bytes(ContentType::Csv, b"a,b\n1,2\n".to_vec());
/// ```
#[derive(Debug)]
pub struct Response {
    pub(crate) status: u16,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: Option<ResponseBody>,
}

impl Response {
    /// `200 OK`, `application/json`.
    pub fn json(body: impl Into<Bytes>) -> Self {
        Self::builder().json(body)
    }

    /// `200 OK`, `text/plain; charset=utf-8`.
    pub fn text(body: impl Into<String>) -> Self {
        Self::builder().text(body)
    }

    /// Response with no body.
    pub fn status(code: impl Into<u16>) -> Self {
        Self { status: code.into(), headers: Vec::new(), body: None }
    }

    /// Builder for responses that need a custom status or extra headers.
    pub fn builder() -> ResponseBuilder {
        ResponseBuilder { headers: Vec::new(), status: Status::Ok.into() }
    }

    /// `200 OK`, empty body, [`DEFAULT_CONTENT_TYPE`]. Sent when a handler
    /// returns no response at all.
    pub fn empty() -> Self {
        Self::builder().finish(DEFAULT_CONTENT_TYPE, ResponseBody::from(Bytes::new()))
    }

    /// A short plain-text error response.
    pub fn error(code: impl Into<u16>, message: impl Into<String>) -> Self {
        Self::builder().status(code).text(message)
    }

    pub fn status_code(&self) -> u16 { self.status }
    pub fn headers(&self) -> &[(String, String)] { &self.headers }
    pub fn body(&self) -> Option<&ResponseBody> { self.body.as_ref() }
    pub fn body_mut(&mut self) -> Option<&mut ResponseBody> { self.body.as_mut() }
    pub fn into_body(self) -> Option<ResponseBody> { self.body }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Writes this response to `sink`: status and headers first, then the
    /// body through a [`BodyWriter`].
    pub async fn send<S: ResponseSink + ?Sized>(self, sink: &mut S) -> WriteState {
        let Self { status, headers, mut body } = self;

        if let Err(error) = sink.write_head(status, &headers) {
            debug!(%error, status, "failed to write response head");
            if let Some(body) = body.as_mut() {
                body.cancel(Some(&error));
            }
            sink.destroy(Some(&error));
            return WriteState::Errored;
        }

        BodyWriter::new(sink).write(body).await
    }
}

// ── ResponseBuilder ───────────────────────────────────────────────────────────

/// Fluent builder for [`Response`].
///
/// Obtain via [`Response::builder()`]. Defaults to `200 OK`.
/// Terminated by a typed body method.
pub struct ResponseBuilder {
    headers: Vec<(String, String)>,
    status: u16,
}

impl ResponseBuilder {
    pub fn status(mut self, code: impl Into<u16>) -> Self {
        self.status = code.into();
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    /// Terminate with a JSON body (`application/json`).
    pub fn json(self, body: impl Into<Bytes>) -> Response {
        self.finish("application/json", ResponseBody::from(body.into()))
    }

    /// Terminate with a plain-text body (`text/plain; charset=utf-8`).
    pub fn text(self, body: impl Into<String>) -> Response {
        self.finish(ContentType::Text.as_str(), ResponseBody::from(body.into()))
    }

    /// Terminate with a typed body.
    pub fn bytes(self, content_type: ContentType, body: impl Into<Bytes>) -> Response {
        self.finish(content_type.as_str(), ResponseBody::from(body.into()))
    }

    /// Terminate with a streamed body.
    pub fn stream(self, content_type: &str, body: ResponseBody) -> Response {
        self.finish(content_type, body)
    }

    /// Terminate with no body (e.g. `Status::NoContent`).
    pub fn no_body(self) -> Response {
        Response { status: self.status, headers: self.headers, body: None }
    }

    fn finish(self, content_type: &str, body: ResponseBody) -> Response {
        let mut headers = vec![("content-type".to_owned(), content_type.to_owned())];
        headers.extend(self.headers);
        Response { status: self.status, headers, body: Some(body) }
    }
}

// ── Json ──────────────────────────────────────────────────────────────────────

/// Serializes `T` as the `application/json` body of a `200 OK`.
///
/// ```rust
/// use ferry::{ApiEvent, Json};
/// use serde_json::json;
///
/// async fn show(event: ApiEvent) -> Json<serde_json::Value> {
///     Json(json!({ "path": event.request().path(), "params": event.params() }))
/// }
/// ```
pub struct Json<T: Serialize>(pub T);

// ── IntoOutcome ───────────────────────────────────────────────────────────────

/// What a handler produced: a response, nothing at all, or an error.
pub type Outcome = Result<Option<Response>, HandlerError>;

/// Conversion of handler return values into an [`Outcome`].
///
/// Implement on your own types to return them directly from handlers.
pub trait IntoOutcome {
    fn into_outcome(self) -> Outcome;
}

impl IntoOutcome for Response {
    fn into_outcome(self) -> Outcome { Ok(Some(self)) }
}

impl IntoOutcome for Option<Response> {
    fn into_outcome(self) -> Outcome { Ok(self) }
}

/// No response at all. The dispatcher substitutes [`Response::empty`].
impl IntoOutcome for () {
    fn into_outcome(self) -> Outcome { Ok(None) }
}

impl IntoOutcome for &'static str {
    fn into_outcome(self) -> Outcome { Ok(Some(Response::text(self))) }
}

impl IntoOutcome for String {
    fn into_outcome(self) -> Outcome { Ok(Some(Response::text(self))) }
}

/// Return a [`Status`] directly from a handler: `return Status::NotFound`
impl IntoOutcome for Status {
    fn into_outcome(self) -> Outcome { Ok(Some(Response::status(self))) }
}

impl<T: Serialize> IntoOutcome for Json<T> {
    fn into_outcome(self) -> Outcome {
        let bytes = serde_json::to_vec(&self.0)?;
        Ok(Some(Response::json(bytes)))
    }
}

impl<T, E> IntoOutcome for Result<T, E>
where
    T: IntoOutcome,
    E: Into<HandlerError>,
{
    fn into_outcome(self) -> Outcome {
        match self {
            Ok(value) => value.into_outcome(),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemorySink, SinkOp};

    #[test]
    fn builder_puts_content_type_first() {
        let res = Response::builder()
            .status(Status::Created)
            .header("location", "/users/42")
            .json(b"{}".to_vec());
        assert_eq!(res.status_code(), 201);
        assert_eq!(res.headers()[0], ("content-type".to_owned(), "application/json".to_owned()));
        assert_eq!(res.header("Location"), Some("/users/42"));
    }

    #[test]
    fn outcomes() {
        assert!(matches!(().into_outcome(), Ok(None)));
        assert!(matches!(Status::NoContent.into_outcome(), Ok(Some(r)) if r.status_code() == 204));

        let failed: Result<Response, &str> = Err("nope");
        let err = failed.into_outcome().unwrap_err();
        assert_eq!(err.message(), "nope");
        assert_eq!(err.status(), None);
    }

    #[tokio::test]
    async fn json_wrapper_serializes() {
        let mut res = Json(serde_json::json!({"a": 1})).into_outcome().unwrap().unwrap();
        assert_eq!(res.header("content-type"), Some("application/json"));
        let body = res.body_mut().unwrap().bytes().await.unwrap();
        assert_eq!(&body[..], br#"{"a":1}"#);
    }

    #[tokio::test]
    async fn send_writes_head_before_body() {
        let mut sink = MemorySink::new();
        let state = Response::builder()
            .status(Status::Accepted)
            .header("x-request-id", "abc")
            .text("queued")
            .send(&mut sink)
            .await;

        let sent = sink.handle();
        assert_eq!(state, WriteState::Completed);
        assert_eq!(sent.status(), Some(202));
        assert_eq!(sent.header("x-request-id").as_deref(), Some("abc"));
        assert_eq!(sent.ops(), vec![SinkOp::Head(202), SinkOp::Write(6), SinkOp::End]);
    }

    #[tokio::test]
    async fn rejected_head_destroys_and_cancels() {
        let mut sink = MemorySink::new();
        sink.write_head(200, &[]).unwrap();

        let (tx, body) = ResponseBody::channel(1);
        let state = Response::builder().stream("text/plain", body).send(&mut sink).await;
        assert_eq!(state, WriteState::Errored);
        assert!(tx.is_cancelled());
        assert!(sink.handle().destroyed());
    }

    #[tokio::test]
    async fn empty_response_has_minimal_content_type() {
        let mut sink = MemorySink::new();
        Response::empty().send(&mut sink).await;
        let sent = sink.handle();
        assert_eq!(sent.status(), Some(200));
        assert_eq!(sent.header("content-type").as_deref(), Some(DEFAULT_CONTENT_TYPE));
        assert!(sent.body().is_empty());
        assert!(sent.ended());
    }
}
