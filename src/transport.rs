//! The transport side of the bridge.
//!
//! A transport is socket-shaped: it parses a request head, then *pushes*
//! body chunks at its own pace, and it accepts writes that may report a full
//! buffer. ferry never owns a transport. It borrows one for the span of a
//! single request and only touches it through these traits:
//!
//! ```text
//!  IncomingTransport ── head()/attach(feed) ──▶ reader::BodyFeed ──▶ IncomingBody (pull)
//!        ▲                                                                  │
//!        └──── ReadControl::pause/resume/destroy ◀───────────────────────────┘
//!
//!  ResponseBody (pull) ──▶ writer::BodyWriter ── write/end/destroy ──▶ ResponseSink
//!        ▲                                                              │
//!        └──────────── cancel ◀── SinkEvent::{Drain, Close, Error} ◀─────┘
//! ```

use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use http::Version;
use tokio::sync::mpsc;

use crate::error::Error;
use crate::reader::BodyFeed;

// ── Request head ──────────────────────────────────────────────────────────────

/// Transport-level request metadata, already parsed.
#[derive(Clone, Debug)]
pub struct RequestHead {
    /// Method exactly as received.
    pub method: String,
    /// Request target: path plus optional query.
    pub target: String,
    pub version: Version,
    /// Headers in arrival order, names and values untouched.
    pub headers: Vec<(String, String)>,
    /// Authority from the request line (HTTP/2 `:authority`), if any.
    pub authority: Option<String>,
}

impl RequestHead {
    pub fn new(method: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            target: target.into(),
            version: Version::HTTP_11,
            headers: Vec::new(),
            authority: None,
        }
    }

    /// Case-insensitive header lookup. First match wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

// ── Inbound ───────────────────────────────────────────────────────────────────

/// Flow control over the transport's read side.
///
/// All methods take `&self`: the control is shared between the transport and
/// the [`IncomingBody`](crate::IncomingBody) consuming it.
pub trait ReadControl: Send + Sync + 'static {
    /// Stop delivering chunks until [`resume`](ReadControl::resume).
    fn pause(&self);
    fn resume(&self);
    /// Abort the read for good. `reason` is `None` for a plain cancellation.
    fn destroy(&self, reason: Option<&Error>);
    fn is_destroyed(&self) -> bool;
}

/// A transport that has parsed a request head and can push its body.
pub trait IncomingTransport: Send {
    fn head(&self) -> &RequestHead;

    fn control(&self) -> Arc<dyn ReadControl>;

    /// Hands the transport the push side of the body bridge. The transport
    /// delivers its data, end, and error events through `feed` from now on.
    /// Never called when the request has no body.
    fn attach(&mut self, feed: BodyFeed);
}

// ── Outbound ──────────────────────────────────────────────────────────────────

/// Outcome of a single [`ResponseSink::write`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteStatus {
    Accepted,
    /// The chunk was taken but the write buffer is now full. Wait for
    /// [`SinkEvent::Drain`] before writing more.
    Full,
}

/// Events a sink emits to whoever is listening on its [`EventHub`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SinkEvent {
    /// The write buffer emptied after a [`WriteStatus::Full`].
    Drain,
    /// The connection closed (client went away, or the response finished).
    Close,
    /// The connection failed.
    Error(String),
}

/// The transport's response writer.
pub trait ResponseSink: Send {
    /// Status line and headers. Must be called once, before any body byte.
    fn write_head(&mut self, status: u16, headers: &[(String, String)]) -> Result<(), Error>;

    fn write(&mut self, chunk: Bytes) -> WriteStatus;

    /// Finalizes the response.
    fn end(&mut self);

    /// Tears the connection down without finalizing.
    fn destroy(&mut self, reason: Option<&Error>);

    fn is_destroyed(&self) -> bool;

    fn events(&self) -> &EventHub;
}

// ── Event hub ─────────────────────────────────────────────────────────────────

/// Listener registry for [`SinkEvent`]s.
///
/// [`subscribe`](EventHub::subscribe) registers a listener and the returned
/// [`Subscription`] deregisters it on drop, so a finished stream never leaves
/// a listener behind. Events emitted before anyone subscribed are dropped.
#[derive(Clone, Default)]
pub struct EventHub {
    inner: Arc<Mutex<Listeners>>,
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(u64, mpsc::UnboundedSender<SinkEvent>)>,
}

impl EventHub {
    pub fn new() -> Self { Self::default() }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listeners = self.lock();
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.entries.push((id, tx));
        Subscription { id, hub: self.clone(), rx }
    }

    pub fn emit(&self, event: SinkEvent) {
        self.lock().entries.retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    pub fn listener_count(&self) -> usize {
        self.lock().entries.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Listeners> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub").field("listeners", &self.listener_count()).finish()
    }
}

/// A registered listener. Deregisters on drop.
pub struct Subscription {
    id: u64,
    hub: EventHub,
    rx: mpsc::UnboundedReceiver<SinkEvent>,
}

impl Subscription {
    /// Next event, in emission order. Cancel-safe.
    pub async fn recv(&mut self) -> Option<SinkEvent> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let id = self.id;
        self.hub.lock().entries.retain(|(entry, _)| *entry != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_ignores_case_and_keeps_values() {
        let mut head = RequestHead::new("GET", "/");
        head.headers.push(("Content-Type".into(), "Text/Plain".into()));
        assert_eq!(head.header("content-type"), Some("Text/Plain"));
        assert_eq!(head.header("host"), None);
    }

    #[tokio::test]
    async fn subscriptions_deregister_on_drop() {
        let hub = EventHub::new();
        let mut first = hub.subscribe();
        let second = hub.subscribe();
        assert_eq!(hub.listener_count(), 2);

        hub.emit(SinkEvent::Drain);
        assert_eq!(first.recv().await, Some(SinkEvent::Drain));

        drop(second);
        assert_eq!(hub.listener_count(), 1);
        drop(first);
        assert_eq!(hub.listener_count(), 0);

        // nobody listening: dropped, not queued
        hub.emit(SinkEvent::Close);
        let mut late = hub.subscribe();
        hub.emit(SinkEvent::Error("reset".into()));
        assert_eq!(late.recv().await, Some(SinkEvent::Error("reset".into())));
    }
}
