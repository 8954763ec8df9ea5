//! Unified error type.
//!
//! Every failure the bridge can observe maps onto one HTTP status through
//! [`Error::status`]. Request-time failures become a short plain-text error
//! response; transport failures while a response is in flight tear the
//! connection down instead, since the head may already be on the wire.

use thiserror::Error;

use crate::status::Status;

/// A boxed error type for body sources with foreign error types.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The error type returned by ferry's fallible operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket or listener failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// The request could not be adapted (bad framing, missing host, bad route descriptor).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Declared or actual body size is over the effective limit.
    #[error("{0}")]
    PayloadTooLarge(String),

    /// The resolved route module exports nothing for the method.
    #[error("No handler found for {method} {path}")]
    NoHandler { method: String, path: String },

    /// The resolved route module explicitly marks the method as unsupported.
    #[error("Method {method} is not supported for {path}")]
    MethodNotAllowed { method: String, path: String },

    /// A handler failed.
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// The transport reported a failure while reading or writing.
    #[error("transport error: {0}")]
    Transport(String),

    /// A response body source failed mid-stream.
    #[error("response body stream failed: {0}")]
    Stream(String),

    /// The byte sequence was cancelled by its consumer.
    #[error("stream cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    /// The HTTP status a request-time failure is reported with.
    pub fn status(&self) -> u16 {
        match self {
            Self::InvalidRequest(_) => Status::BadRequest.into(),
            Self::PayloadTooLarge(_) => Status::ContentTooLarge.into(),
            Self::NoHandler { .. } => Status::NotFound.into(),
            Self::MethodNotAllowed { .. } => Status::MethodNotAllowed.into(),
            Self::Handler(e) => e.status().unwrap_or_else(|| Status::InternalServerError.into()),
            Self::Io(_) | Self::Transport(_) | Self::Stream(_) | Self::Cancelled(_) => {
                Status::InternalServerError.into()
            }
        }
    }
}

/// The error a handler returns.
///
/// Carries an optional status code. Without one, the dispatcher answers
/// `500 Internal Server Error`. The message becomes the response body.
///
/// ```rust
/// use ferry::{HandlerError, Status};
///
/// let err = HandlerError::new("user not found").with_status(Status::NotFound);
/// assert_eq!(err.status(), Some(404));
/// ```
#[derive(Clone, Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    status: Option<u16>,
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { status: None, message: message.into() }
    }

    pub fn with_status(mut self, status: impl Into<u16>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn status(&self) -> Option<u16> { self.status }
    pub fn message(&self) -> &str { &self.message }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self { Self::new(message) }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self { Self::new(message) }
}

/// Keeps the status the bridge would have used, so `?` on a body read that
/// hit the size limit still answers 413.
impl From<Error> for HandlerError {
    fn from(e: Error) -> Self {
        match e {
            Error::Handler(inner) => inner,
            other => Self { status: Some(other.status()), message: other.to_string() },
        }
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(e: std::io::Error) -> Self { Self::new(e.to_string()) }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self { Self::new(e.to_string()) }
}
