//! Outbound body bridge: pull-based response body in, push-based writes out.
//!
//! The writer drains a [`ResponseBody`] into a [`ResponseSink`] one chunk at
//! a time. When the sink reports a full buffer it stops pulling until the
//! sink emits [`SinkEvent::Drain`]. For the whole stream it listens for
//! [`SinkEvent::Close`] and [`SinkEvent::Error`]; either cancels the body,
//! and an error also destroys the connection. The listener is deregistered
//! when the stream finishes, whichever way it finishes.
//!
//! ```text
//!   Idle ──▶ Streaming ──── write → Full ────▶ Paused
//!               │   ▲                            │
//!               │   └────────── Drain ───────────┘
//!               ├── body exhausted ──▶ Completed
//!               ├── Close ───────────▶ Cancelled
//!               └── Error / body error ──▶ Errored
//! ```

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::body::ResponseBody;
use crate::error::Error;
use crate::transport::{ResponseSink, SinkEvent, WriteStatus};

/// Written instead of a body that was already read.
pub const LOCKED_BODY_MESSAGE: &str = "Fatal error: Response body is locked. \
    This can happen when the response was already read \
    (for example through `ResponseBody::bytes`).";

/// Lifecycle of one outbound stream.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteState {
    Idle,
    Streaming,
    /// Waiting for the sink to drain.
    Paused,
    /// The sink closed before the body was exhausted.
    Cancelled,
    /// The sink or the body failed. The connection was destroyed.
    Errored,
    Completed,
}

enum Step {
    Event(Option<SinkEvent>),
    Chunk(Option<Result<Bytes, Error>>),
}

pub struct BodyWriter<'a, S: ResponseSink + ?Sized> {
    sink: &'a mut S,
    state: WriteState,
}

impl<'a, S: ResponseSink + ?Sized> BodyWriter<'a, S> {
    pub fn new(sink: &'a mut S) -> Self {
        Self { sink, state: WriteState::Idle }
    }

    pub fn state(&self) -> WriteState { self.state }

    /// Streams `body` into the sink and finalizes the response.
    /// The head must already be written.
    pub async fn write(mut self, body: Option<ResponseBody>) -> WriteState {
        let Some(mut body) = body else {
            self.sink.end();
            return WriteState::Completed;
        };

        if body.is_locked() {
            warn!("response body is locked, writing diagnostic instead");
            self.sink.write(Bytes::from_static(LOCKED_BODY_MESSAGE.as_bytes()));
            self.sink.end();
            return WriteState::Completed;
        }

        // Subscribe first: a teardown after the check still reaches us as Close.
        let mut events = self.sink.events().subscribe();
        if self.sink.is_destroyed() {
            debug!("connection destroyed before the body was written");
            body.cancel(None);
            return WriteState::Cancelled;
        }

        self.state = WriteState::Streaming;

        loop {
            let step = tokio::select! {
                biased;
                event = events.recv() => Step::Event(event),
                chunk = body.next_chunk(), if self.state == WriteState::Streaming => Step::Chunk(chunk),
            };

            match step {
                Step::Event(Some(SinkEvent::Drain)) => {
                    if self.state == WriteState::Paused {
                        trace!("sink drained, resuming body");
                        self.state = WriteState::Streaming;
                    }
                }
                Step::Event(Some(SinkEvent::Close) | None) => {
                    debug!("connection closed mid-stream, cancelling body");
                    body.cancel(None);
                    self.state = WriteState::Cancelled;
                    break;
                }
                Step::Event(Some(SinkEvent::Error(message))) => {
                    self.fail(&mut body, Error::Transport(message));
                    break;
                }
                Step::Chunk(Some(Ok(chunk))) => {
                    if self.sink.write(chunk) == WriteStatus::Full {
                        trace!("sink full, pausing body");
                        self.state = WriteState::Paused;
                    }
                }
                Step::Chunk(Some(Err(error))) => {
                    self.fail(&mut body, error);
                    break;
                }
                Step::Chunk(None) => {
                    self.sink.end();
                    self.state = WriteState::Completed;
                    break;
                }
            }
        }

        drop(events);
        self.state
    }

    fn fail(&mut self, body: &mut ResponseBody, error: Error) {
        debug!(%error, "response stream failed, destroying connection");
        body.cancel(Some(&error));
        self.sink.destroy(Some(&error));
        self.state = WriteState::Errored;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemorySink, SinkOp};
    use crate::transport::EventHub;

    async fn written(body: Option<ResponseBody>, mut sink: MemorySink) -> (WriteState, MemorySink) {
        sink.write_head(200, &[]).unwrap();
        let state = BodyWriter::new(&mut sink).write(body).await;
        (state, sink)
    }

    #[tokio::test]
    async fn absent_body_just_ends() {
        let (state, sink) = written(None, MemorySink::new()).await;
        let record = sink.handle();
        assert_eq!(state, WriteState::Completed);
        assert!(record.ended());
        assert!(record.body().is_empty());
    }

    #[tokio::test]
    async fn locked_body_writes_diagnostic() {
        let mut body = ResponseBody::from("already read");
        body.bytes().await.unwrap();

        let (state, sink) = written(Some(body), MemorySink::new()).await;
        assert_eq!(state, WriteState::Completed);
        assert_eq!(sink.handle().body(), LOCKED_BODY_MESSAGE.as_bytes());
        assert!(sink.handle().ended());
    }

    #[tokio::test]
    async fn destroyed_sink_cancels_without_writing() {
        let (tx, body) = ResponseBody::channel(1);
        let mut sink = MemorySink::new();
        sink.destroy(None);

        let state = BodyWriter::new(&mut sink).write(Some(body)).await;
        assert_eq!(state, WriteState::Cancelled);
        assert!(tx.is_cancelled());
        assert!(sink.handle().chunks().is_empty());
    }

    /// A sink torn down right after the writer looks at it.
    struct ClosingSink {
        hub: EventHub,
        written: usize,
    }

    impl ResponseSink for ClosingSink {
        fn write_head(&mut self, _: u16, _: &[(String, String)]) -> Result<(), Error> { Ok(()) }

        fn write(&mut self, _: Bytes) -> WriteStatus {
            self.written += 1;
            WriteStatus::Full
        }

        fn end(&mut self) {}

        fn destroy(&mut self, _: Option<&Error>) {}

        fn is_destroyed(&self) -> bool {
            self.hub.emit(SinkEvent::Close);
            false
        }

        fn events(&self) -> &EventHub { &self.hub }
    }

    #[tokio::test]
    async fn close_during_the_destroyed_check_still_cancels() {
        let (tx, body) = ResponseBody::channel(1);
        tx.send("never written").await.unwrap();
        let mut sink = ClosingSink { hub: EventHub::new(), written: 0 };

        let state = BodyWriter::new(&mut sink).write(Some(body)).await;
        assert_eq!(state, WriteState::Cancelled);
        assert!(tx.is_cancelled());
        assert_eq!(sink.written, 0);
        assert_eq!(sink.hub.listener_count(), 0);
    }

    #[tokio::test]
    async fn pauses_on_full_and_resumes_on_drain() {
        let mut sink = MemorySink::new().high_water_mark(4);
        let handle = sink.handle();
        let (tx, body) = ResponseBody::channel(8);
        for chunk in ["abcd", "ef", "g"] {
            tx.send(chunk).await.unwrap();
        }
        drop(tx);

        let writer = tokio::spawn(async move {
            sink.write_head(200, &[]).unwrap();
            BodyWriter::new(&mut sink).write(Some(body)).await
        });

        handle.wait_full().await;
        // nothing more is pulled until the sink drains
        tokio::task::yield_now().await;
        assert_eq!(handle.chunks().len(), 1);

        handle.drain();
        let state = writer.await.unwrap();
        assert_eq!(state, WriteState::Completed);
        assert_eq!(handle.body(), b"abcdefg");
        assert_eq!(handle.listener_count(), 0);
    }

    #[tokio::test]
    async fn close_cancels_the_body_and_deregisters() {
        let sink = MemorySink::new();
        let handle = sink.handle();
        let (tx, body) = ResponseBody::channel(1);

        let writer = tokio::spawn(async move {
            let mut sink = sink;
            BodyWriter::new(&mut sink).write(Some(body)).await
        });

        tx.send("first").await.unwrap();
        handle.wait_for_chunks(1).await;
        handle.close();

        tx.cancelled().await;
        assert_eq!(writer.await.unwrap(), WriteState::Cancelled);
        assert_eq!(tx.cancel_reason().as_deref(), Some("cancelled"));
        assert!(!handle.ended());
        assert_eq!(handle.listener_count(), 0);
    }

    #[tokio::test]
    async fn sink_error_cancels_with_reason_and_destroys() {
        let sink = MemorySink::new();
        let handle = sink.handle();
        let (tx, body) = ResponseBody::channel(1);

        let writer = tokio::spawn(async move {
            let mut sink = sink;
            BodyWriter::new(&mut sink).write(Some(body)).await
        });

        tx.send("first").await.unwrap();
        handle.wait_for_chunks(1).await;
        handle.fail("EPIPE");

        assert_eq!(writer.await.unwrap(), WriteState::Errored);
        assert_eq!(tx.cancel_reason().as_deref(), Some("transport error: EPIPE"));
        assert!(handle.destroyed());
        assert_eq!(handle.destroy_reason().as_deref(), Some("transport error: EPIPE"));
        assert_eq!(handle.listener_count(), 0);
    }

    #[tokio::test]
    async fn body_error_tears_the_connection_down() {
        let (tx, body) = ResponseBody::channel(2);
        tx.send("partial").await.unwrap();
        tx.abort(Error::Stream("upstream died".into())).await;

        let (state, sink) = written(Some(body), MemorySink::new()).await;
        let handle = sink.handle();
        assert_eq!(state, WriteState::Errored);
        assert_eq!(handle.body(), b"partial");
        assert!(handle.destroyed());
        assert!(!handle.ended());
    }

    #[tokio::test]
    async fn head_precedes_body() {
        let mut sink = MemorySink::new();
        sink.write_head(201, &[("x-a".into(), "1".into())]).unwrap();
        BodyWriter::new(&mut sink).write(Some(ResponseBody::from("payload"))).await;

        let ops = sink.handle().ops();
        assert!(matches!(ops.first(), Some(SinkOp::Head(201))));
        assert!(matches!(ops.last(), Some(SinkOp::End)));
    }
}
