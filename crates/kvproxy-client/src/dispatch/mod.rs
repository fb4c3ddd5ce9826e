//! Channel executors: the per-connection scheduling loop.
//!
//! # Purpose
//! A `ChannelExecutor` owns one [`Channel`] and a fixed pool of workers. It
//! pulls batches from the shared queue, pushes them onto streams, correlates
//! responses back to calls by id, and enforces per-call deadlines.
//!
//! # Design notes
//! Everything a worker touches (stream handles, the id arena, the deadline
//! set) is owned by a single tokio task, so none of it is locked. The task is
//! woken by a poke, by a stream event, by its earliest deadline, or by close.
//! Transport I/O happens on the channel's stream tasks and only ever reaches
//! this task as a tagged [`StreamEvent`]; events whose tag does not match the
//! worker's current stream are from an abandoned stream and are dropped.
use kvproxy_transport::ConnectivityState;
use kvproxy_wire::CallResponse;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::channel::{Channel, StreamEvent, StreamEventKind, StreamEvents, StreamTag};
use crate::config::ExecutorConfig;
use crate::error::CallError;
use crate::queue::{Batch, CallQueue};
use crate::selector::LoadReport;

mod deadlines;
mod worker;

use deadlines::DeadlineSet;
use worker::{ActiveStream, Resolution, Worker};

/// Budgets a channel executor schedules against.
#[derive(Debug, Clone)]
pub(crate) struct DispatchLimits {
    pub(crate) workers: usize,
    pub(crate) max_batch_calls: usize,
    pub(crate) max_batch_bytes: usize,
    pub(crate) total_requests_per_stream: usize,
    pub(crate) max_bytes_per_stream: usize,
    pub(crate) max_stream_age: Duration,
}

impl From<&ExecutorConfig> for DispatchLimits {
    fn from(config: &ExecutorConfig) -> Self {
        Self {
            workers: config.max_concurrent_streams_per_channel,
            max_batch_calls: config.max_concurrent_requests_per_stream,
            max_batch_bytes: config.max_batch_bytes,
            total_requests_per_stream: config.total_requests_per_stream,
            max_bytes_per_stream: config.max_bytes_per_stream,
            max_stream_age: config.max_stream_age,
        }
    }
}

/// Live counters for one channel, shared with the selector layer.
#[derive(Debug)]
pub(crate) struct ChannelStats {
    in_flight: AtomicUsize,
    busy_workers: AtomicUsize,
    streams_opened: AtomicU64,
    protocol_violations: AtomicU64,
    transport_failures: AtomicU64,
    state: AtomicU8,
}

impl ChannelStats {
    fn new(state: ConnectivityState) -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            busy_workers: AtomicUsize::new(0),
            streams_opened: AtomicU64::new(0),
            protocol_violations: AtomicU64::new(0),
            transport_failures: AtomicU64::new(0),
            state: AtomicU8::new(state.as_u8()),
        }
    }
}

/// Point-in-time view of one channel's load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelLoad {
    pub index: usize,
    pub state: ConnectivityState,
    pub in_flight: usize,
    pub busy_workers: usize,
    pub streams_opened: u64,
    pub protocol_violations: u64,
    pub transport_failures: u64,
}

impl LoadReport for ChannelLoad {
    fn id(&self) -> u64 {
        self.index as u64
    }

    fn load(&self) -> usize {
        self.in_flight
    }
}

/// Owner-side handle to a running channel executor.
pub(crate) struct ChannelExecutorHandle {
    index: usize,
    poke: Arc<Notify>,
    close_tx: watch::Sender<bool>,
    stats: Arc<ChannelStats>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelExecutorHandle {
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn poke(&self) {
        self.poke.notify_one();
    }

    pub(crate) fn poke_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.poke)
    }

    pub(crate) fn close(&self) {
        let _ = self.close_tx.send(true);
    }

    pub(crate) fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    pub(crate) fn snapshot(&self) -> ChannelLoad {
        ChannelLoad {
            index: self.index,
            state: ConnectivityState::from_u8(self.stats.state.load(Ordering::Acquire)),
            in_flight: self.stats.in_flight.load(Ordering::Acquire),
            busy_workers: self.stats.busy_workers.load(Ordering::Acquire),
            streams_opened: self.stats.streams_opened.load(Ordering::Acquire),
            protocol_violations: self.stats.protocol_violations.load(Ordering::Acquire),
            transport_failures: self.stats.transport_failures.load(Ordering::Acquire),
        }
    }
}

pub(crate) struct ChannelExecutor {
    channel: Arc<dyn Channel>,
    queue: Arc<CallQueue>,
    limits: DispatchLimits,
    workers: Vec<Worker>,
    deadlines: DeadlineSet,
    events_tx: mpsc::UnboundedSender<StreamEvent>,
    events_rx: mpsc::UnboundedReceiver<StreamEvent>,
    next_epoch: u64,
    stats: Arc<ChannelStats>,
}

impl ChannelExecutor {
    /// Start the executor task for `channel`. Must be called inside a tokio
    /// runtime.
    pub(crate) fn spawn(
        channel: Arc<dyn Channel>,
        queue: Arc<CallQueue>,
        limits: DispatchLimits,
    ) -> ChannelExecutorHandle {
        let index = channel.index();
        let stats = Arc::new(ChannelStats::new(channel.state()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let poke = Arc::new(Notify::new());
        let (close_tx, close_rx) = watch::channel(false);
        let executor = ChannelExecutor {
            channel,
            queue,
            workers: (0..limits.workers).map(Worker::new).collect(),
            limits,
            deadlines: DeadlineSet::default(),
            events_tx,
            events_rx,
            next_epoch: 0,
            stats: Arc::clone(&stats),
        };
        let task = tokio::spawn(executor.run(Arc::clone(&poke), close_rx));
        ChannelExecutorHandle {
            index,
            poke,
            close_tx,
            stats,
            task: Mutex::new(Some(task)),
        }
    }

    async fn run(mut self, poke: Arc<Notify>, mut close_rx: watch::Receiver<bool>) {
        loop {
            let next_deadline = self.deadlines.next();
            tokio::select! {
                biased;
                // A dropped sender means the owning executor is gone.
                _ = close_rx.wait_for(|closed| *closed) => break,
                Some(event) = self.events_rx.recv() => self.on_event(event),
                _ = poke.notified() => self.poke(),
                _ = sleep_until(next_deadline) => self.expire(Instant::now()),
            }
        }
        self.shutdown();
    }

    fn index(&self) -> usize {
        self.channel.index()
    }

    fn refresh_state(&self) -> ConnectivityState {
        let state = self.channel.state();
        self.stats.state.store(state.as_u8(), Ordering::Release);
        state
    }

    fn poke(&mut self) {
        if self.refresh_state().wants_probe() {
            tracing::debug!(channel = self.index(), "probing channel");
            self.channel.probe();
        }
        if self.refresh_state() != ConnectivityState::Ready {
            return;
        }
        for worker in 0..self.workers.len() {
            if !self.workers[worker].is_busy() && !self.try_dispatch(worker) {
                // Queue is empty; the remaining idle workers would find nothing.
                break;
            }
        }
    }

    /// Idle -> Dispatching. Returns false when nothing was queued.
    fn try_dispatch(&mut self, worker: usize) -> bool {
        let batch = self.queue.dequeue_batch(
            self.limits.max_batch_calls,
            self.limits.max_batch_bytes,
            Instant::now(),
        );
        if batch.is_empty() {
            return false;
        }
        self.start_stream(worker, batch);
        true
    }

    fn start_stream(&mut self, worker: usize, batch: Batch) {
        let now = Instant::now();
        let tag = StreamTag {
            worker,
            epoch: self.next_epoch,
        };
        self.next_epoch += 1;
        let method = batch.method().clone();
        let calls = batch.len();
        let events = StreamEvents::new(tag, self.events_tx.clone());
        let stream = self.channel.open_stream(&method, events);
        self.stats.streams_opened.fetch_add(1, Ordering::Relaxed);
        self.stats.busy_workers.fetch_add(1, Ordering::Relaxed);
        self.stats.in_flight.fetch_add(calls, Ordering::Relaxed);
        t_counter!("kvproxy_streams_opened_total").increment(1);
        tracing::debug!(
            channel = self.index(),
            worker,
            method = %method,
            calls,
            "opening stream"
        );

        let mut active = ActiveStream::new(tag, method, stream, now);
        let sent = active.send_batch(batch, now, &mut self.deadlines);
        self.workers[worker].active = Some(active);
        t_histogram!("kvproxy_batch_calls").record(calls as f64);
        if !sent {
            self.recover(
                worker,
                CallError::Transport("stream closed before requests were written".to_string()),
            );
        }
    }

    fn on_event(&mut self, event: StreamEvent) {
        let worker = event.tag.worker;
        let current = self
            .workers
            .get(worker)
            .and_then(|w| w.active.as_ref())
            .is_some_and(|active| active.tag == event.tag);
        if !current {
            return;
        }
        match event.kind {
            StreamEventKind::Response(response) => self.on_response(worker, response),
            StreamEventKind::Failed(reason) => {
                self.stats.transport_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(channel = self.index(), worker, %reason, "stream failed");
                self.recover(worker, CallError::Transport(reason));
            }
            StreamEventKind::Closed => {
                let outstanding = self.workers[worker]
                    .active
                    .as_ref()
                    .map_or(0, ActiveStream::outstanding);
                if outstanding > 0 {
                    self.stats.transport_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        channel = self.index(),
                        worker,
                        outstanding,
                        "stream closed by gateway with calls outstanding"
                    );
                    self.recover(
                        worker,
                        CallError::Transport(format!(
                            "stream closed with {outstanding} calls outstanding"
                        )),
                    );
                } else {
                    self.release(worker);
                }
            }
        }
    }

    fn on_response(&mut self, worker: usize, response: CallResponse) {
        let Some(active) = self.workers[worker].active.as_mut() else {
            return;
        };
        match active.resolve(response.id) {
            Resolution::Violation { next_id } => {
                self.stats.protocol_violations.fetch_add(1, Ordering::Relaxed);
                t_counter!("kvproxy_protocol_violations_total").increment(1);
                tracing::warn!(
                    channel = self.index(),
                    worker,
                    id = response.id,
                    next_id,
                    "response id was never issued on this stream"
                );
                self.recover(
                    worker,
                    CallError::ProtocolViolation(format!(
                        "response id {} outside issued range [0, {next_id})",
                        response.id
                    )),
                );
            }
            Resolution::Stale => {
                tracing::debug!(
                    channel = self.index(),
                    worker,
                    id = response.id,
                    "ignoring response for resolved call"
                );
            }
            Resolution::Resolved(in_flight) => {
                if let Some(timer) = in_flight.timer {
                    self.deadlines.remove(&timer);
                }
                let cycle_done = active.outstanding() == 0;
                self.stats.in_flight.fetch_sub(1, Ordering::Relaxed);
                if response.is_ok() {
                    in_flight.call.succeed(response.payload);
                } else {
                    in_flight.call.fail(CallError::Remote {
                        status: response.status,
                        payload: response.payload,
                    });
                }
                if cycle_done {
                    self.on_cycle_complete(worker);
                }
            }
        }
    }

    /// Every call sent so far on the worker's stream has resolved: pipeline the
    /// next batch of the same method, or rotate the stream out.
    fn on_cycle_complete(&mut self, worker: usize) {
        let now = Instant::now();
        let ready = self.refresh_state() == ConnectivityState::Ready;
        let Some(active) = self.workers[worker].active.as_mut() else {
            return;
        };
        if ready && active.has_budget(&self.limits, now) {
            let max_calls = self
                .limits
                .max_batch_calls
                .min(active.remaining_calls(&self.limits));
            let batch = self.queue.dequeue_method_batch(
                &active.method,
                max_calls,
                self.limits.max_batch_bytes,
                now,
            );
            if !batch.is_empty() {
                let calls = batch.len();
                self.stats.in_flight.fetch_add(calls, Ordering::Relaxed);
                t_histogram!("kvproxy_batch_calls").record(calls as f64);
                if active.send_batch(batch, now, &mut self.deadlines) {
                    return;
                }
                self.recover(
                    worker,
                    CallError::Transport("stream closed while pipelining".to_string()),
                );
                return;
            }
        }
        if let Some(active) = self.workers[worker].active.take() {
            tracing::debug!(
                channel = self.index(),
                worker,
                sent = active.sent_calls(),
                "half-closing stream"
            );
            active.half_close();
            self.stats.busy_workers.fetch_sub(1, Ordering::Relaxed);
        }
        if ready {
            self.try_dispatch(worker);
        }
    }

    /// The stream ended cleanly with nothing outstanding.
    fn release(&mut self, worker: usize) {
        if self.workers[worker].active.take().is_some() {
            self.stats.busy_workers.fetch_sub(1, Ordering::Relaxed);
        }
        if self.refresh_state() == ConnectivityState::Ready {
            self.try_dispatch(worker);
        }
    }

    /// ErrorRecovery: fail what is outstanding, drop the stream, go idle and
    /// try again.
    fn recover(&mut self, worker: usize, error: CallError) {
        self.abandon(worker, &error);
        if self.refresh_state() == ConnectivityState::Ready {
            self.try_dispatch(worker);
        }
    }

    fn abandon(&mut self, worker: usize, error: &CallError) {
        let Some(mut active) = self.workers[worker].active.take() else {
            return;
        };
        let calls = active.drain(&mut self.deadlines);
        if !calls.is_empty() {
            tracing::debug!(
                channel = self.index(),
                worker = self.workers[worker].index,
                failed = calls.len(),
                error = %error,
                "failing outstanding calls"
            );
        }
        self.stats.in_flight.fetch_sub(calls.len(), Ordering::Relaxed);
        self.stats.busy_workers.fetch_sub(1, Ordering::Relaxed);
        for call in calls {
            call.fail(error.clone());
        }
        active.abort();
    }

    fn expire(&mut self, now: Instant) {
        for key in self.deadlines.pop_expired(now) {
            let Some(active) = self
                .workers
                .get_mut(key.worker)
                .and_then(|w| w.active.as_mut())
                .filter(|active| active.tag.epoch == key.epoch)
            else {
                continue;
            };
            let Resolution::Resolved(in_flight) = active.resolve(key.id) else {
                continue;
            };
            let cycle_done = active.outstanding() == 0;
            self.stats.in_flight.fetch_sub(1, Ordering::Relaxed);
            tracing::debug!(
                channel = self.index(),
                worker = key.worker,
                id = key.id,
                "call timed out on the wire"
            );
            in_flight.call.fail(CallError::Timeout);
            if cycle_done {
                self.on_cycle_complete(key.worker);
            }
        }
    }

    fn shutdown(&mut self) {
        let error = CallError::Transport("channel closed".to_string());
        for worker in 0..self.workers.len() {
            self.abandon(worker, &error);
        }
        self.channel.shutdown();
        self.refresh_state();
        tracing::debug!(channel = self.index(), "channel executor stopped");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::testing::RecordingSink;
    use crate::call::{Method, PendingCall};
    use crate::channel::loopback::{EchoService, LoopbackChannel, LoopbackService, LoopbackStream};
    use async_trait::async_trait;
    use bytes::Bytes;

    fn limits(workers: usize, max_batch_calls: usize) -> DispatchLimits {
        DispatchLimits {
            workers,
            max_batch_calls,
            max_batch_bytes: usize::MAX,
            total_requests_per_stream: 1024,
            max_bytes_per_stream: usize::MAX,
            max_stream_age: Duration::from_secs(60),
        }
    }

    fn call(sink: &RecordingSink, payload: &'static [u8]) -> PendingCall {
        PendingCall::new(Method::GET, Bytes::from_static(payload), sink.clone())
            .timeout(Duration::from_secs(5))
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    /// Waits for every request of the first batch, then answers them in
    /// reverse order and finishes the stream.
    struct Reversing {
        expect: usize,
    }

    #[async_trait]
    impl LoopbackService for Reversing {
        async fn serve(&self, mut stream: LoopbackStream) {
            let mut ids = Vec::new();
            while ids.len() < self.expect {
                match stream.next_request().await {
                    Some(request) => ids.push((request.id, request.payload)),
                    None => return,
                }
            }
            for (id, payload) in ids.into_iter().rev() {
                stream.reply(id, payload);
            }
        }
    }

    #[tokio::test]
    async fn batch_completes_out_of_order() {
        let queue = Arc::new(CallQueue::new(16, 1));
        let payloads: [&'static [u8]; 3] = [b"a", b"b", b"c"];
        let sinks: Vec<RecordingSink> = (0..3).map(|_| RecordingSink::default()).collect();
        for (sink, payload) in sinks.iter().zip(payloads) {
            queue.enqueue(call(sink, payload)).expect("enqueue");
        }
        let channel = LoopbackChannel::new(0, Reversing { expect: 3 });
        let handle = ChannelExecutor::spawn(Arc::new(channel.clone()), queue, limits(1, 8));
        handle.poke();
        for _ in 0..100 {
            if sinks.iter().all(|s| s.count() == 1) {
                break;
            }
            settle().await;
        }
        for (sink, payload) in sinks.iter().zip(payloads) {
            assert_eq!(sink.last(), Some(Ok(Bytes::copy_from_slice(payload))));
        }
        assert_eq!(channel.streams_opened(), 1);
        handle.close();
        handle.take_task().expect("task").await.expect("join");
        assert_eq!(handle.snapshot().state, ConnectivityState::Shutdown);
    }

    #[tokio::test]
    async fn not_ready_channel_dispatches_nothing() {
        let queue = Arc::new(CallQueue::new(16, 1));
        let sink = RecordingSink::default();
        queue.enqueue(call(&sink, b"k")).expect("enqueue");
        let channel =
            LoopbackChannel::with_state(0, EchoService, ConnectivityState::Connecting);
        let handle =
            ChannelExecutor::spawn(Arc::new(channel.clone()), Arc::clone(&queue), limits(2, 8));
        handle.poke();
        settle().await;
        assert_eq!(channel.streams_opened(), 0);
        assert_eq!(queue.len(), 1);

        channel.set_state(ConnectivityState::Ready);
        handle.poke();
        for _ in 0..100 {
            if sink.count() == 1 {
                break;
            }
            settle().await;
        }
        assert_eq!(sink.last(), Some(Ok(Bytes::from_static(b"k"))));
        assert!(queue.is_empty());
        handle.close();
    }

    #[tokio::test]
    async fn idle_channel_is_probed_then_used() {
        let queue = Arc::new(CallQueue::new(16, 1));
        let sink = RecordingSink::default();
        queue.enqueue(call(&sink, b"k")).expect("enqueue");
        let channel = LoopbackChannel::with_state(0, EchoService, ConnectivityState::Idle);
        let handle = ChannelExecutor::spawn(Arc::new(channel.clone()), queue, limits(1, 8));
        handle.poke();
        for _ in 0..100 {
            if sink.count() == 1 {
                break;
            }
            settle().await;
        }
        assert!(channel.probes() >= 1);
        assert_eq!(sink.last(), Some(Ok(Bytes::from_static(b"k"))));
        handle.close();
    }

    #[tokio::test]
    async fn close_fails_in_flight_calls() {
        struct Silent;

        #[async_trait]
        impl LoopbackService for Silent {
            async fn serve(&self, mut stream: LoopbackStream) {
                while stream.next_request().await.is_some() {}
            }
        }

        let queue = Arc::new(CallQueue::new(16, 1));
        let sink = RecordingSink::default();
        queue.enqueue(call(&sink, b"k")).expect("enqueue");
        let channel = LoopbackChannel::new(0, Silent);
        let handle = ChannelExecutor::spawn(Arc::new(channel), queue, limits(1, 8));
        handle.poke();
        for _ in 0..100 {
            if handle.snapshot().in_flight == 1 {
                break;
            }
            settle().await;
        }
        assert_eq!(handle.snapshot().busy_workers, 1);
        handle.close();
        handle.take_task().expect("task").await.expect("join");
        assert_eq!(
            sink.last(),
            Some(Err(CallError::Transport("channel closed".to_string())))
        );
        assert_eq!(sink.count(), 1);
        assert_eq!(handle.snapshot().in_flight, 0);
    }
}
