//! Channels: the seam between the scheduler and a transport.
//!
//! # Purpose
//! A [`Channel`] is one pooled connection to the gateway. The scheduler opens
//! streams on it, pushes requests into them, and learns about responses and
//! failures through tagged [`StreamEvent`]s.
//!
//! # Design notes
//! Streams are driven by tasks the channel owns. The scheduler never awaits
//! transport I/O: writes go through an unbounded request channel (bounded in
//! practice by the batch budgets) and everything coming back is funneled into
//! the executor's single event channel, tagged with the stream that produced it.
use kvproxy_transport::ConnectivityState;
use kvproxy_wire::{CallRequest, CallResponse};
use tokio::sync::{mpsc, watch};

use crate::call::Method;

pub mod loopback;
pub mod quic;

/// Identifies one stream of one worker. `epoch` is unique per executor, so
/// events from a stream the worker already abandoned are recognisable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamTag {
    pub worker: usize,
    pub epoch: u64,
}

#[derive(Debug)]
pub enum StreamEventKind {
    Response(CallResponse),
    /// The stream failed; no further events follow.
    Failed(String),
    /// The peer finished its side of the stream.
    Closed,
}

#[derive(Debug)]
pub struct StreamEvent {
    pub tag: StreamTag,
    pub kind: StreamEventKind,
}

/// Event sender handed to a channel for one stream.
#[derive(Debug, Clone)]
pub struct StreamEvents {
    tag: StreamTag,
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl StreamEvents {
    pub(crate) fn new(tag: StreamTag, tx: mpsc::UnboundedSender<StreamEvent>) -> Self {
        Self { tag, tx }
    }

    pub fn tag(&self) -> StreamTag {
        self.tag
    }

    /// Returns false once the executor is gone.
    pub fn response(&self, response: CallResponse) -> bool {
        self.emit(StreamEventKind::Response(response))
    }

    pub fn failed(&self, reason: impl Into<String>) -> bool {
        self.emit(StreamEventKind::Failed(reason.into()))
    }

    pub fn closed(&self) -> bool {
        self.emit(StreamEventKind::Closed)
    }

    fn emit(&self, kind: StreamEventKind) -> bool {
        self.tx
            .send(StreamEvent {
                tag: self.tag,
                kind,
            })
            .is_ok()
    }
}

#[derive(Debug)]
pub enum Outbound {
    Request(CallRequest),
    /// No more requests; the peer may still answer outstanding ones.
    HalfClose,
}

/// Scheduler side of an open stream.
#[derive(Debug)]
pub struct CallStream {
    requests: mpsc::UnboundedSender<Outbound>,
    cancel: watch::Sender<bool>,
}

/// Transport side of an open stream, consumed by the task driving it.
#[derive(Debug)]
pub struct StreamEnd {
    pub requests: mpsc::UnboundedReceiver<Outbound>,
    pub cancel: watch::Receiver<bool>,
}

impl CallStream {
    pub fn pair() -> (CallStream, StreamEnd) {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        (
            CallStream {
                requests: requests_tx,
                cancel: cancel_tx,
            },
            StreamEnd {
                requests: requests_rx,
                cancel: cancel_rx,
            },
        )
    }

    /// Queue a request for the writer. False means the stream is already gone.
    pub fn send(&self, request: CallRequest) -> bool {
        self.requests.send(Outbound::Request(request)).is_ok()
    }

    pub fn half_close(self) {
        let _ = self.requests.send(Outbound::HalfClose);
    }

    /// Reset the stream without waiting for outstanding responses.
    pub fn abort(self) {
        let _ = self.cancel.send(true);
    }
}

/// Resolves once the stream is aborted. A half-closed stream drops its cancel
/// sender without aborting, so that case stays pending.
pub async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|aborted| *aborted).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// One pooled connection to the gateway.
pub trait Channel: Send + Sync + 'static {
    fn index(&self) -> usize;

    fn state(&self) -> ConnectivityState;

    /// Ask an idle or failed channel to reconnect. Must not block.
    fn probe(&self);

    /// Open a stream for `method`. Every outcome is reported through `events`,
    /// including failure to open.
    fn open_stream(&self, method: &Method, events: StreamEvents) -> CallStream;

    fn shutdown(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    #[tokio::test]
    async fn half_close_does_not_cancel() {
        let (stream, mut end) = CallStream::pair();
        stream.half_close();
        assert!(matches!(end.requests.recv().await, Some(Outbound::HalfClose)));
        let waited = tokio::time::timeout(Duration::from_millis(20), cancelled(&mut end.cancel)).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn abort_cancels() {
        let (stream, mut end) = CallStream::pair();
        assert!(stream.send(CallRequest {
            id: 0,
            iteration: 0,
            policy: Default::default(),
            payload: Bytes::from_static(b"k"),
        }));
        stream.abort();
        cancelled(&mut end.cancel).await;
        assert!(matches!(end.requests.recv().await, Some(Outbound::Request(_))));
    }

    #[tokio::test]
    async fn events_are_tagged() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tag = StreamTag {
            worker: 2,
            epoch: 9,
        };
        let events = StreamEvents::new(tag, tx);
        assert!(events.failed("boom"));
        let event = rx.recv().await.expect("event");
        assert_eq!(event.tag, tag);
        assert!(matches!(event.kind, StreamEventKind::Failed(reason) if reason == "boom"));
        drop(rx);
        assert!(!events.closed());
    }
}
