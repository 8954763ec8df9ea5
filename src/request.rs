//! Incoming request value and the adapter that builds it from a transport.

use bytes::Bytes;
use http::Uri;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::config::Config;
use crate::error::Error;
use crate::reader::{self, IncomingBody};
use crate::transport::IncomingTransport;

/// An incoming HTTP request: method, absolute URL, headers, and a body read
/// at most once.
///
/// Headers are kept exactly as the transport delivered them, in order.
#[derive(Debug)]
pub struct Request {
    method: String,
    url: Uri,
    headers: Vec<(String, String)>,
    body: Option<IncomingBody>,
}

impl Request {
    /// Adapts the transport's request.
    ///
    /// The URL is `{scheme}://{host}{target}`, with the host taken from the
    /// `host` header (or the request-line authority). When the request has a
    /// body, the push side of the body bridge is attached to the transport
    /// before this returns.
    ///
    /// Fails with [`Error::PayloadTooLarge`] when the declared length is over
    /// the limit, and with [`Error::InvalidRequest`] for anything else that
    /// keeps the request from being built.
    pub fn from_transport<T: IncomingTransport + ?Sized>(
        transport: &mut T,
        config: &Config,
    ) -> Result<Self, Error> {
        let head = transport.head();

        let host = head.header("host")
            .or(head.authority.as_deref())
            .ok_or_else(|| Error::InvalidRequest("missing host".into()))?;
        let url = Uri::builder()
            .scheme(config.url_scheme())
            .authority(host)
            .path_and_query(head.target.as_str())
            .build()
            .map_err(|e| Error::InvalidRequest(format!("bad request url: {e}")))?;

        let method = head.method.clone();
        let headers = head.headers.clone();

        let body = match reader::read_body(head, transport.control(), config) {
            Ok(Some((feed, body))) => {
                transport.attach(feed);
                Some(body)
            }
            Ok(None) => None,
            Err(e @ Error::PayloadTooLarge(_)) => return Err(e),
            Err(Error::InvalidRequest(msg)) => return Err(Error::InvalidRequest(msg)),
            Err(other) => return Err(Error::InvalidRequest(other.to_string())),
        };

        debug!(%method, %url, has_body = body.is_some(), "request adapted");
        Ok(Self { method, url, headers, body })
    }

    pub fn method(&self) -> &str { &self.method }
    pub fn url(&self) -> &Uri { &self.url }
    pub fn path(&self) -> &str { self.url.path() }
    pub fn query(&self) -> Option<&str> { self.url.query() }
    pub fn headers(&self) -> &[(String, String)] { &self.headers }
    pub fn has_body(&self) -> bool { self.body.is_some() }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn into_body(self) -> Option<IncomingBody> {
        self.body
    }

    /// The whole body. Empty when the request has none.
    pub async fn bytes(self) -> Result<Bytes, Error> {
        match self.body {
            Some(body) => body.into_bytes().await,
            None => Ok(Bytes::new()),
        }
    }

    pub async fn text(self) -> Result<String, Error> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::InvalidRequest("body is not valid UTF-8".into()))
    }

    pub async fn json<T: DeserializeOwned>(self) -> Result<T, Error> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::InvalidRequest(format!("invalid JSON body: {e}")))
    }
}
