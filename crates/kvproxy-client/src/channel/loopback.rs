// In-process channel served by a local `LoopbackService`.
//
// Useful for embedding the scheduler next to a gateway in the same process and
// for driving it deterministically in tests: no framing, no sockets, same
// stream/event contract as the QUIC channel.
use async_trait::async_trait;
use bytes::Bytes;
use kvproxy_transport::ConnectivityState;
use kvproxy_wire::{CallRequest, CallResponse};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use super::{CallStream, Channel, Outbound, StreamEnd, StreamEvents, cancelled};
use crate::call::Method;

/// Gateway logic behind a loopback channel. Called once per opened stream, on
/// its own task.
#[async_trait]
pub trait LoopbackService: Send + Sync + 'static {
    async fn serve(&self, stream: LoopbackStream);
}

/// Service side of one stream.
///
/// Dropping it finishes the stream (the executor sees the peer close) unless
/// [`LoopbackStream::fail`] was called.
pub struct LoopbackStream {
    method: Method,
    end: StreamEnd,
    events: StreamEvents,
    finished: bool,
}

impl LoopbackStream {
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Next request, or `None` once the client half-closed or aborted.
    pub async fn next_request(&mut self) -> Option<CallRequest> {
        if self.finished {
            return None;
        }
        let next = tokio::select! {
            biased;
            _ = cancelled(&mut self.end.cancel) => None,
            next = self.end.requests.recv() => next,
        };
        match next {
            Some(Outbound::Request(request)) => Some(request),
            Some(Outbound::HalfClose) | None => None,
        }
    }

    pub fn respond(&self, response: CallResponse) -> bool {
        self.events.response(response)
    }

    pub fn reply(&self, id: i32, payload: Bytes) -> bool {
        self.respond(CallResponse::ok(id, payload))
    }

    /// Fail the stream as a transport error would.
    pub fn fail(mut self, reason: &str) {
        self.finished = true;
        self.events.failed(reason);
    }
}

impl Drop for LoopbackStream {
    fn drop(&mut self) {
        if !self.finished {
            self.events.closed();
        }
    }
}

/// Answers every request with its own payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoService;

#[async_trait]
impl LoopbackService for EchoService {
    async fn serve(&self, mut stream: LoopbackStream) {
        while let Some(request) = stream.next_request().await {
            if !stream.reply(request.id, request.payload) {
                break;
            }
        }
    }
}

struct LoopbackInner {
    index: usize,
    service: Arc<dyn LoopbackService>,
    state: AtomicU8,
    streams_opened: AtomicUsize,
    probes: AtomicUsize,
}

/// Clones share state, so a test can keep one to flip connectivity.
#[derive(Clone)]
pub struct LoopbackChannel {
    inner: Arc<LoopbackInner>,
}

impl LoopbackChannel {
    pub fn new(index: usize, service: impl LoopbackService) -> Self {
        Self::with_state(index, service, ConnectivityState::Ready)
    }

    pub fn with_state(index: usize, service: impl LoopbackService, state: ConnectivityState) -> Self {
        Self {
            inner: Arc::new(LoopbackInner {
                index,
                service: Arc::new(service),
                state: AtomicU8::new(state.as_u8()),
                streams_opened: AtomicUsize::new(0),
                probes: AtomicUsize::new(0),
            }),
        }
    }

    pub fn set_state(&self, state: ConnectivityState) {
        self.inner.state.store(state.as_u8(), Ordering::Release);
    }

    pub fn streams_opened(&self) -> usize {
        self.inner.streams_opened.load(Ordering::Acquire)
    }

    pub fn probes(&self) -> usize {
        self.inner.probes.load(Ordering::Acquire)
    }
}

impl Channel for LoopbackChannel {
    fn index(&self) -> usize {
        self.inner.index
    }

    fn state(&self) -> ConnectivityState {
        ConnectivityState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    // Reconnects instantly; a channel stuck in `Connecting` stays there.
    fn probe(&self) {
        self.inner.probes.fetch_add(1, Ordering::AcqRel);
        let _ = self.inner.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
            ConnectivityState::from_u8(raw)
                .wants_probe()
                .then_some(ConnectivityState::Ready.as_u8())
        });
    }

    fn open_stream(&self, method: &Method, events: StreamEvents) -> CallStream {
        self.inner.streams_opened.fetch_add(1, Ordering::AcqRel);
        let (stream, end) = CallStream::pair();
        let service = Arc::clone(&self.inner.service);
        let stream_end = LoopbackStream {
            method: method.clone(),
            end,
            events,
            finished: false,
        };
        tokio::spawn(async move { service.serve(stream_end).await });
        stream
    }

    fn shutdown(&self) {
        self.set_state(ConnectivityState::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{StreamEventKind, StreamTag};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn echo_round_trip_then_close() {
        let channel = LoopbackChannel::new(0, EchoService);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tag = StreamTag {
            worker: 0,
            epoch: 1,
        };
        let stream = channel.open_stream(&Method::GET, StreamEvents::new(tag, tx));
        assert!(stream.send(CallRequest {
            id: 0,
            iteration: 0,
            policy: Default::default(),
            payload: Bytes::from_static(b"k"),
        }));
        stream.half_close();

        let first = rx.recv().await.expect("response");
        assert_eq!(first.tag, tag);
        assert!(
            matches!(first.kind, StreamEventKind::Response(ref r) if r.id == 0 && r.payload == Bytes::from_static(b"k"))
        );
        let second = rx.recv().await.expect("close");
        assert!(matches!(second.kind, StreamEventKind::Closed));
        assert_eq!(channel.streams_opened(), 1);
    }

    #[test]
    fn probe_only_recovers_idle_or_failed() {
        let channel = LoopbackChannel::with_state(0, EchoService, ConnectivityState::Idle);
        channel.probe();
        assert_eq!(channel.state(), ConnectivityState::Ready);

        channel.set_state(ConnectivityState::Connecting);
        channel.probe();
        assert_eq!(channel.state(), ConnectivityState::Connecting);
        assert_eq!(channel.probes(), 2);

        channel.shutdown();
        assert_eq!(channel.state(), ConnectivityState::Shutdown);
    }
}
