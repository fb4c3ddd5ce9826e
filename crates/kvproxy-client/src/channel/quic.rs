// QUIC-backed channel: one pooled connection, one bidirectional stream per
// worker dispatch.
//
// Each stream gets a single writer (this task) and a single reader (a helper
// task). Quinn send streams serialize concurrent writers internally, so nothing
// else ever writes to them.
use anyhow::{Context, Result};
use bytes::BytesMut;
use kvproxy_transport::{ConnectivityState, QuicClient, QuicConnection};
use kvproxy_wire::Message;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::{CallStream, Channel, Outbound, StreamEnd, StreamEvents, cancelled};
use crate::call::Method;
use crate::wire::{read_message, write_message};

struct QuicShared {
    index: usize,
    client: Arc<QuicClient>,
    addr: SocketAddr,
    server_name: String,
    connect_timeout: Duration,
    max_frame_bytes: usize,
    state: AtomicU8,
    connecting: AtomicBool,
    connection: Mutex<Option<QuicConnection>>,
}

#[derive(Clone)]
pub struct QuicChannel {
    shared: Arc<QuicShared>,
}

impl QuicChannel {
    pub fn new(
        index: usize,
        client: Arc<QuicClient>,
        addr: SocketAddr,
        server_name: impl Into<String>,
        connect_timeout: Duration,
        max_frame_bytes: usize,
    ) -> Self {
        Self {
            shared: Arc::new(QuicShared {
                index,
                client,
                addr,
                server_name: server_name.into(),
                connect_timeout,
                max_frame_bytes,
                state: AtomicU8::new(ConnectivityState::Idle.as_u8()),
                connecting: AtomicBool::new(false),
                connection: Mutex::new(None),
            }),
        }
    }

    /// Establish the connection now. Failures leave the channel in
    /// `TransientFailure` for the next probe.
    pub async fn connect(&self) -> Result<()> {
        self.shared.connect().await
    }
}

impl QuicShared {
    async fn connect(&self) -> Result<()> {
        self.set_state(ConnectivityState::Connecting);
        let result = self
            .client
            .connect_with_timeout(self.addr, &self.server_name, self.connect_timeout)
            .await
            .with_context(|| format!("connect channel {} to {}", self.index, self.addr));
        match result {
            Ok(connection) => {
                tracing::debug!(
                    channel = self.index,
                    connection = connection.info().id.0,
                    peer = %self.addr,
                    "channel connected"
                );
                *self.slot() = Some(connection);
                self.set_state(ConnectivityState::Ready);
                Ok(())
            }
            Err(err) => {
                self.set_state(ConnectivityState::TransientFailure);
                Err(err)
            }
        }
    }

    fn set_state(&self, state: ConnectivityState) {
        // Shutdown is terminal.
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != ConnectivityState::Shutdown.as_u8()).then_some(state.as_u8())
            });
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<QuicConnection>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Channel for QuicChannel {
    fn index(&self) -> usize {
        self.shared.index
    }

    fn state(&self) -> ConnectivityState {
        let state = ConnectivityState::from_u8(self.shared.state.load(Ordering::Acquire));
        if state != ConnectivityState::Ready {
            return state;
        }
        let mut slot = self.shared.slot();
        let live = slot
            .as_ref()
            .map(QuicConnection::state)
            .unwrap_or(ConnectivityState::Idle);
        if live != ConnectivityState::Ready {
            tracing::debug!(channel = self.shared.index, state = ?live, "channel connection lost");
            *slot = None;
            self.shared.set_state(live);
        }
        live
    }

    fn probe(&self) {
        if self.shared.connecting.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            if let Err(err) = shared.connect().await {
                tracing::warn!(channel = shared.index, error = %err, "channel reconnect failed");
            }
            shared.connecting.store(false, Ordering::Release);
        });
    }

    fn open_stream(&self, method: &Method, events: StreamEvents) -> CallStream {
        let (stream, end) = CallStream::pair();
        let connection = self.shared.slot().clone();
        let Some(connection) = connection else {
            events.failed("channel has no connection");
            return stream;
        };
        let method = method.clone();
        let max_frame_bytes = self.shared.max_frame_bytes;
        let channel = self.shared.index;
        tokio::spawn(async move {
            if let Err(err) = run_stream(connection, method, end, events.clone(), max_frame_bytes).await {
                tracing::debug!(channel, worker = events.tag().worker, error = %err, "stream failed");
                events.failed(format!("{err:#}"));
            }
        });
        stream
    }

    fn shutdown(&self) {
        self.shared
            .state
            .store(ConnectivityState::Shutdown.as_u8(), Ordering::Release);
        if let Some(connection) = self.shared.slot().take() {
            connection.close("channel shutdown");
        }
    }
}

async fn run_stream(
    connection: QuicConnection,
    method: Method,
    mut end: StreamEnd,
    events: StreamEvents,
    max_frame_bytes: usize,
) -> Result<()> {
    let (mut send, mut recv) = connection.open_bi().await?;
    write_message(
        &mut send,
        &Message::StreamOpen {
            method: method.as_str().to_string(),
        },
    )
    .await?;

    let reader_events = events.clone();
    let reader = tokio::spawn(async move {
        let mut scratch = BytesMut::new();
        loop {
            match read_message(&mut recv, &mut scratch, max_frame_bytes).await {
                Ok(Some(Message::Response(response))) => {
                    if !reader_events.response(response) {
                        break;
                    }
                }
                Ok(Some(other)) => {
                    reader_events.failed(format!("unexpected frame on call stream: {other:?}"));
                    break;
                }
                Ok(None) => {
                    reader_events.closed();
                    break;
                }
                Err(err) => {
                    reader_events.failed(format!("{err:#}"));
                    break;
                }
            }
        }
    });
    let mut reader = AbortOnDrop(Some(reader));

    loop {
        tokio::select! {
            biased;
            _ = cancelled(&mut end.cancel) => {
                let _ = send.reset(quinn::VarInt::from_u32(1));
                return Ok(());
            }
            next = end.requests.recv() => match next {
                Some(Outbound::Request(request)) => {
                    write_message(&mut send, &Message::Request(request)).await?;
                }
                Some(Outbound::HalfClose) | None => {
                    send.finish().context("finish call stream")?;
                    break;
                }
            }
        }
    }

    // Half-closed: keep reading until the gateway finishes or we are aborted.
    tokio::select! {
        _ = cancelled(&mut end.cancel) => {}
        _ = reader.join() => {}
    }
    Ok(())
}

struct AbortOnDrop(Option<tokio::task::JoinHandle<()>>);

impl AbortOnDrop {
    async fn join(&mut self) {
        if let Some(handle) = self.0.as_mut() {
            let _ = handle.await;
        }
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}
