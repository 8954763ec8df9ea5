//! In-memory transport.
//!
//! [`MemoryTransport`] and [`MemorySink`] implement the transport traits
//! without a socket. The transport replays a scripted body and honours
//! pause/resume the way a socket would; the sink records everything written
//! to it. Both hand out cloneable handles so a test or an embedding host
//! can observe and steer them while a [`Bridge`](crate::Bridge) holds the
//! transport itself.
//!
//! This is a supported transport, not only a test double: a host that
//! already has the request in hand (a serverless runtime, a test harness)
//! can feed it through here and read the response back from the handle.
//!
//! ```rust
//! use ferry::memory::{MemorySink, MemoryTransport};
//! use ferry::{ApiEvent, Bridge, Response, RouteModule, Router};
//!
//! async fn hello(_event: ApiEvent) -> Response {
//!     Response::text("hi")
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let bridge = Bridge::new(Router::new().route("/hello", RouteModule::new().get(hello)));
//! let mut transport = MemoryTransport::new("GET", "/hello");
//! let mut sink = MemorySink::new();
//! bridge.handle(&mut transport, &mut sink).await;
//!
//! let sent = sink.handle();
//! assert_eq!(sent.status(), Some(200));
//! assert_eq!(sent.body(), b"hi");
//! # }
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use http::Version;
use tokio::sync::Notify;

use crate::error::Error;
use crate::reader::BodyFeed;
use crate::transport::{
    EventHub, IncomingTransport, ReadControl, RequestHead, ResponseSink, SinkEvent, WriteStatus,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Read control ──────────────────────────────────────────────────────────────

/// A [`ReadControl`] that records every call.
#[derive(Default)]
pub struct MemoryControl {
    paused: AtomicBool,
    destroyed: AtomicBool,
    pauses: AtomicUsize,
    resumes: AtomicUsize,
    destroys: AtomicUsize,
    reason: Mutex<Option<String>>,
    wake: Notify,
}

impl MemoryControl {
    pub fn new() -> Self { Self::default() }

    pub fn is_paused(&self) -> bool { self.paused.load(Ordering::Acquire) }
    pub fn pause_count(&self) -> usize { self.pauses.load(Ordering::Acquire) }
    pub fn resume_count(&self) -> usize { self.resumes.load(Ordering::Acquire) }
    pub fn destroy_count(&self) -> usize { self.destroys.load(Ordering::Acquire) }

    /// Reason passed to the first destroy that carried one.
    pub fn destroy_reason(&self) -> Option<String> {
        lock(&self.reason).clone()
    }

    /// Waits until reading is allowed. `false` once destroyed.
    pub async fn readable(&self) -> bool {
        loop {
            let notified = self.wake.notified();
            if self.is_destroyed() {
                return false;
            }
            if !self.is_paused() {
                return true;
            }
            notified.await;
        }
    }
}

impl ReadControl for MemoryControl {
    fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        self.pauses.fetch_add(1, Ordering::AcqRel);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.resumes.fetch_add(1, Ordering::AcqRel);
        self.wake.notify_waiters();
    }

    fn destroy(&self, reason: Option<&Error>) {
        self.destroys.fetch_add(1, Ordering::AcqRel);
        self.destroyed.store(true, Ordering::Release);
        if let Some(reason) = reason {
            lock(&self.reason).get_or_insert_with(|| reason.to_string());
        }
        self.wake.notify_waiters();
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

// ── Transport ─────────────────────────────────────────────────────────────────

/// One scripted socket event.
#[derive(Clone, Debug)]
pub enum FeedEvent {
    Data(Bytes),
    End,
    Error(String),
}

/// A scripted inbound request.
pub struct MemoryTransport {
    head: RequestHead,
    control: Arc<MemoryControl>,
    script: Option<Vec<FeedEvent>>,
    feed: Arc<Mutex<Option<BodyFeed>>>,
}

impl MemoryTransport {
    /// An HTTP/1.1 request with `host: localhost` and no body.
    pub fn new(method: &str, target: &str) -> Self {
        let mut head = RequestHead::new(method, target);
        head.headers.push(("host".to_owned(), "localhost".to_owned()));
        Self {
            head,
            control: Arc::new(MemoryControl::new()),
            script: None,
            feed: Arc::new(Mutex::new(None)),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.head.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    /// Drops every header named `name`.
    pub fn without_header(mut self, name: &str) -> Self {
        self.head.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.head.version = version;
        self
    }

    /// Body delivered as these chunks, then end.
    pub fn body<I, B>(self, chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let mut script: Vec<FeedEvent> =
            chunks.into_iter().map(|c| FeedEvent::Data(c.into())).collect();
        script.push(FeedEvent::End);
        self.script(script)
    }

    /// Body delivered as exactly these events once the bridge attaches.
    pub fn script(mut self, events: Vec<FeedEvent>) -> Self {
        self.script = Some(events);
        self
    }

    /// The socket is torn down before the bridge starts.
    pub fn destroyed(self) -> Self {
        self.control.destroy(None);
        self
    }

    pub fn handle(&self) -> TransportHandle {
        TransportHandle { control: Arc::clone(&self.control), feed: Arc::clone(&self.feed) }
    }
}

impl IncomingTransport for MemoryTransport {
    fn head(&self) -> &RequestHead { &self.head }

    fn control(&self) -> Arc<dyn ReadControl> {
        self.control.clone()
    }

    fn attach(&mut self, feed: BodyFeed) {
        *lock(&self.feed) = Some(feed.clone());
        if let Some(script) = self.script.take() {
            tokio::spawn(replay(script, feed, Arc::clone(&self.control)));
        }
    }
}

/// Pushes `script` into `feed`, waiting out every pause like a socket would.
async fn replay(script: Vec<FeedEvent>, feed: BodyFeed, control: Arc<MemoryControl>) {
    for event in script {
        if feed.is_closed() || !control.readable().await {
            return;
        }
        match event {
            FeedEvent::Data(chunk) => feed.push(chunk),
            FeedEvent::End => feed.finish(),
            FeedEvent::Error(message) => feed.fail(Error::Transport(message)),
        }
        tokio::task::yield_now().await;
    }
}

/// Observes a [`MemoryTransport`] while the bridge borrows it.
#[derive(Clone)]
pub struct TransportHandle {
    control: Arc<MemoryControl>,
    feed: Arc<Mutex<Option<BodyFeed>>>,
}

impl TransportHandle {
    pub fn control(&self) -> &MemoryControl { &self.control }

    /// The feed the bridge attached, if the request had a body.
    pub fn feed(&self) -> Option<BodyFeed> {
        lock(&self.feed).clone()
    }
}

// ── Sink ──────────────────────────────────────────────────────────────────────

/// One call a [`MemorySink`] received.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SinkOp {
    Head(u16),
    Write(usize),
    End,
    Destroy,
}

#[derive(Default)]
struct Record {
    status: Option<u16>,
    headers: Vec<(String, String)>,
    chunks: Vec<Bytes>,
    ops: Vec<SinkOp>,
    ended: bool,
    destroyed: bool,
    destroy_reason: Option<String>,
    buffered: usize,
    full: bool,
}

/// A [`ResponseSink`] that records the response.
pub struct MemorySink {
    record: Arc<Mutex<Record>>,
    hub: EventHub,
    changed: Arc<Notify>,
    high_water_mark: Option<usize>,
    auto_drain: bool,
}

impl MemorySink {
    /// A sink that never reports a full buffer.
    pub fn new() -> Self {
        Self {
            record: Arc::default(),
            hub: EventHub::new(),
            changed: Arc::new(Notify::new()),
            high_water_mark: None,
            auto_drain: false,
        }
    }

    /// Reports [`WriteStatus::Full`] once `bytes` are buffered. Call
    /// [`SinkHandle::drain`] to flush.
    pub fn high_water_mark(mut self, bytes: usize) -> Self {
        self.high_water_mark = Some(bytes);
        self
    }

    /// Flushes immediately after every full report, emitting a drain.
    pub fn auto_drain(mut self) -> Self {
        self.auto_drain = true;
        self
    }

    pub fn handle(&self) -> SinkHandle {
        SinkHandle {
            record: Arc::clone(&self.record),
            hub: self.hub.clone(),
            changed: Arc::clone(&self.changed),
        }
    }
}

impl Default for MemorySink {
    fn default() -> Self { Self::new() }
}

impl ResponseSink for MemorySink {
    fn write_head(&mut self, status: u16, headers: &[(String, String)]) -> Result<(), Error> {
        let mut record = lock(&self.record);
        if record.status.is_some() {
            return Err(Error::Transport("head already written".into()));
        }
        record.status = Some(status);
        record.headers = headers.to_vec();
        record.ops.push(SinkOp::Head(status));
        drop(record);
        self.changed.notify_waiters();
        Ok(())
    }

    fn write(&mut self, chunk: Bytes) -> WriteStatus {
        let mut record = lock(&self.record);
        record.ops.push(SinkOp::Write(chunk.len()));
        record.buffered += chunk.len();
        record.chunks.push(chunk);

        let full = self.high_water_mark.is_some_and(|hwm| record.buffered >= hwm);
        if full {
            record.full = true;
            if self.auto_drain {
                record.buffered = 0;
                record.full = false;
            }
        }
        drop(record);

        if full && self.auto_drain {
            self.hub.emit(SinkEvent::Drain);
        }
        self.changed.notify_waiters();
        if full { WriteStatus::Full } else { WriteStatus::Accepted }
    }

    fn end(&mut self) {
        let mut record = lock(&self.record);
        record.ended = true;
        record.ops.push(SinkOp::End);
        drop(record);
        self.changed.notify_waiters();
    }

    fn destroy(&mut self, reason: Option<&Error>) {
        let mut record = lock(&self.record);
        record.destroyed = true;
        record.ops.push(SinkOp::Destroy);
        if let Some(reason) = reason {
            record.destroy_reason.get_or_insert_with(|| reason.to_string());
        }
        drop(record);
        self.changed.notify_waiters();
    }

    fn is_destroyed(&self) -> bool {
        lock(&self.record).destroyed
    }

    fn events(&self) -> &EventHub { &self.hub }
}

/// Observes and steers a [`MemorySink`] while a writer borrows it.
#[derive(Clone)]
pub struct SinkHandle {
    record: Arc<Mutex<Record>>,
    hub: EventHub,
    changed: Arc<Notify>,
}

impl SinkHandle {
    pub fn status(&self) -> Option<u16> { lock(&self.record).status }
    pub fn headers(&self) -> Vec<(String, String)> { lock(&self.record).headers.clone() }
    pub fn chunks(&self) -> Vec<Bytes> { lock(&self.record).chunks.clone() }
    pub fn ops(&self) -> Vec<SinkOp> { lock(&self.record).ops.clone() }
    pub fn ended(&self) -> bool { lock(&self.record).ended }
    pub fn destroyed(&self) -> bool { lock(&self.record).destroyed }
    pub fn destroy_reason(&self) -> Option<String> { lock(&self.record).destroy_reason.clone() }
    pub fn listener_count(&self) -> usize { self.hub.listener_count() }

    /// Case-insensitive lookup in the written head.
    pub fn header(&self, name: &str) -> Option<String> {
        lock(&self.record).headers.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    }

    /// Every written chunk, concatenated.
    pub fn body(&self) -> Vec<u8> {
        lock(&self.record).chunks.iter().flat_map(|c| c.iter().copied()).collect()
    }

    /// Flushes the buffer and emits [`SinkEvent::Drain`].
    pub fn drain(&self) {
        let mut record = lock(&self.record);
        record.buffered = 0;
        record.full = false;
        drop(record);
        self.hub.emit(SinkEvent::Drain);
    }

    /// The client went away.
    pub fn close(&self) {
        lock(&self.record).destroyed = true;
        self.hub.emit(SinkEvent::Close);
    }

    /// The connection failed.
    pub fn fail(&self, message: &str) {
        self.hub.emit(SinkEvent::Error(message.to_owned()));
    }

    pub async fn wait_full(&self) {
        self.wait_until(|r| r.full).await;
    }

    pub async fn wait_for_chunks(&self, n: usize) {
        self.wait_until(|r| r.chunks.len() >= n).await;
    }

    pub async fn wait_ended(&self) {
        self.wait_until(|r| r.ended || r.destroyed).await;
    }

    async fn wait_until(&self, done: impl Fn(&Record) -> bool) {
        loop {
            let notified = self.changed.notified();
            if done(&lock(&self.record)) {
                return;
            }
            notified.await;
        }
    }
}
