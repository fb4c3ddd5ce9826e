// The public scheduler: owns the shared queue, one executor task per channel,
// and the periodic poke.
use anyhow::{Context, Result};
use bytes::Bytes;
use futures::future::join_all;
use kvproxy_transport::{QuicClient, TransportConfig};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::call::{CallHandle, Method, PendingCall};
use crate::channel::Channel;
use crate::channel::quic::QuicChannel;
use crate::config::ExecutorConfig;
use crate::dispatch::{ChannelExecutor, ChannelExecutorHandle, ChannelLoad, DispatchLimits};
use crate::error::{CallError, ConfigError};
use crate::queue::CallQueue;
use crate::selector::Selector;

/// Schedules calls over a fixed pool of channels.
///
/// Cloning is cheap and shares the same executor. Construct inside a tokio
/// runtime; channel executors are spawned immediately.
///
/// ```
/// use bytes::Bytes;
/// use kvproxy_client::loopback::{EchoService, LoopbackChannel};
/// use kvproxy_client::{CallExecutor, Channel, ExecutorConfig, Method};
/// use std::sync::Arc;
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let channel: Arc<dyn Channel> = Arc::new(LoopbackChannel::new(0, EchoService));
///     let executor = CallExecutor::new(ExecutorConfig::optimized_defaults(), vec![channel])
///         .expect("executor");
///     let reply = executor
///         .submit(Method::GET, Bytes::from_static(b"key"), None)
///         .await
///         .expect("reply");
///     assert_eq!(reply, Bytes::from_static(b"key"));
///     executor.close().await;
/// });
/// ```
#[derive(Clone)]
pub struct CallExecutor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    config: ExecutorConfig,
    queue: Arc<CallQueue>,
    executors: Vec<ChannelExecutorHandle>,
    selector: Option<Box<dyn Selector<ChannelLoad>>>,
    closed: AtomicBool,
    poke_task: Mutex<Option<JoinHandle<()>>>,
    quic: Option<Arc<QuicClient>>,
}

impl CallExecutor {
    pub fn new(config: ExecutorConfig, channels: Vec<Arc<dyn Channel>>) -> Result<Self, ConfigError> {
        Self::build(config, channels, None)
    }

    /// Connect a pool of `max_channels` QUIC channels to one gateway.
    ///
    /// Channels that fail to connect are left in `TransientFailure` and
    /// reconnected by the poke loop.
    pub async fn connect(
        addr: SocketAddr,
        server_name: &str,
        quinn: quinn::ClientConfig,
        transport: TransportConfig,
        config: ExecutorConfig,
    ) -> Result<Self> {
        config.validate()?;
        let bind_addr: SocketAddr = if addr.is_ipv4() {
            "0.0.0.0:0".parse()?
        } else {
            "[::]:0".parse()?
        };
        let client = Arc::new(QuicClient::bind(bind_addr, quinn, transport).context("bind QUIC client")?);
        let channels: Vec<QuicChannel> = (0..config.max_channels)
            .map(|index| {
                QuicChannel::new(
                    index,
                    Arc::clone(&client),
                    addr,
                    server_name,
                    config.connect_timeout,
                    config.max_frame_bytes,
                )
            })
            .collect();
        let results = join_all(channels.iter().map(|channel| channel.connect())).await;
        for (index, result) in results.into_iter().enumerate() {
            if let Err(err) = result {
                tracing::warn!(channel = index, error = %err, "initial connect failed");
            }
        }
        let channels = channels
            .into_iter()
            .map(|channel| Arc::new(channel) as Arc<dyn Channel>)
            .collect();
        Ok(Self::build(config, channels, Some(client))?)
    }

    fn build(
        config: ExecutorConfig,
        channels: Vec<Arc<dyn Channel>>,
        quic: Option<Arc<QuicClient>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if channels.is_empty() {
            return Err(ConfigError::Zero { field: "channels" });
        }
        if channels.len() > config.max_channels {
            return Err(ConfigError::TooManyChannels {
                count: channels.len(),
                max: config.max_channels,
            });
        }
        let queue = Arc::new(CallQueue::new(config.max_queue_size, config.queue_shards));
        let limits = DispatchLimits::from(&config);
        let executors: Vec<ChannelExecutorHandle> = channels
            .into_iter()
            .map(|channel| ChannelExecutor::spawn(channel, Arc::clone(&queue), limits.clone()))
            .collect();
        let selector = config
            .selector
            .map(|policy| policy.build::<ChannelLoad>(config.low_watermark, config.high_watermark));
        let pokes: Vec<Arc<Notify>> = executors.iter().map(ChannelExecutorHandle::poke_signal).collect();
        let poke_task = tokio::spawn(poke_loop(pokes, config.poke_interval));
        tracing::debug!(
            channels = executors.len(),
            workers_per_channel = limits.workers,
            max_queue_size = config.max_queue_size,
            "call executor started"
        );
        Ok(Self {
            inner: Arc::new(ExecutorInner {
                config,
                queue,
                executors,
                selector,
                closed: AtomicBool::new(false),
                poke_task: Mutex::new(Some(poke_task)),
                quic,
            }),
        })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.inner.config
    }

    /// Accept a call for scheduling. Never blocks.
    ///
    /// On error the call's sink has already been completed with the same error.
    pub fn enqueue(&self, call: PendingCall) -> Result<(), CallError> {
        if self.inner.closed.load(Ordering::Acquire) {
            call.fail(CallError::ExecutorClosed);
            return Err(CallError::ExecutorClosed);
        }
        if let Err(error) = self.check(&call) {
            call.fail(error.clone());
            return Err(error);
        }
        let call = call.with_default_timeout(self.inner.config.default_call_timeout);
        let method = call.method().clone();
        match self.inner.queue.enqueue(call) {
            Ok(()) => {
                t_counter!("kvproxy_calls_enqueued_total").increment(1);
                t_gauge!("kvproxy_queue_depth").set(self.inner.queue.len() as f64);
                self.wake(&method);
                Ok(())
            }
            Err(call) => {
                tracing::debug!(method = %method, "call queue full");
                call.fail(CallError::QueueFull);
                Err(CallError::QueueFull)
            }
        }
    }

    /// Build a call, enqueue it, and return a future for its outcome.
    pub fn submit(&self, method: Method, payload: Bytes, deadline: Option<Instant>) -> CallHandle {
        let (call, handle) = PendingCall::with_handle(method, payload);
        let call = match deadline {
            Some(deadline) => call.deadline_at(deadline),
            None => call,
        };
        // Rejections are delivered through the handle.
        let _ = self.enqueue(call);
        handle
    }

    fn check(&self, call: &PendingCall) -> Result<(), CallError> {
        if call.method().as_str().is_empty() {
            return Err(CallError::InvalidCall("empty method name".to_string()));
        }
        if call.method().as_str().len() > u16::MAX as usize {
            return Err(CallError::InvalidCall("method name too long".to_string()));
        }
        let frame_len = call.payload_len() + kvproxy_wire::CallRequest::FIXED_LEN;
        if frame_len > self.inner.config.max_frame_bytes {
            return Err(CallError::InvalidCall(format!(
                "request of {frame_len} bytes exceeds max_frame_bytes {}",
                self.inner.config.max_frame_bytes
            )));
        }
        Ok(())
    }

    /// Wake channel executors after an enqueue. With a selector configured the
    /// chosen channel is poked first.
    fn wake(&self, method: &Method) {
        let first = self.select_channel(method);
        if let Some(index) = first {
            self.inner.executors[index].poke();
        }
        for (position, executor) in self.inner.executors.iter().enumerate() {
            if Some(position) != first {
                executor.poke();
            }
        }
    }

    /// Pool position of the channel the configured selector would pick for
    /// `method`, if a selector is configured.
    pub fn select_channel(&self, method: &Method) -> Option<usize> {
        let selector = self.inner.selector.as_ref()?;
        let loads = self.channel_stats();
        let picked = selector.select(&loads, method)?;
        self.inner
            .executors
            .iter()
            .position(|executor| executor.index() == picked.index)
    }

    pub fn poke_all(&self) {
        for executor in &self.inner.executors {
            executor.poke();
        }
    }

    pub fn channel_stats(&self) -> Vec<ChannelLoad> {
        self.inner
            .executors
            .iter()
            .map(ChannelExecutorHandle::snapshot)
            .collect()
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop scheduling and fail every call not yet completed.
    ///
    /// In-flight calls fail with `Transport("channel closed")`, queued calls
    /// with `ExecutorClosed`. Calling it again is a no-op.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self
            .inner
            .poke_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        for executor in &self.inner.executors {
            executor.close();
        }
        let drained = self.fail_queued();
        let tasks: Vec<JoinHandle<()>> = self
            .inner
            .executors
            .iter()
            .filter_map(ChannelExecutorHandle::take_task)
            .collect();
        let wait = self.inner.config.termination_wait_timeout;
        match tokio::time::timeout(wait, join_all(tasks)).await {
            Ok(results) => {
                for result in results {
                    if let Err(err) = result {
                        tracing::warn!(error = %err, "channel executor task failed");
                    }
                }
            }
            Err(_) => tracing::warn!(timeout = ?wait, "channel executors did not stop in time"),
        }
        // Enqueues racing the closed flag may have landed after the first drain.
        let late = self.fail_queued();
        if let Some(client) = &self.inner.quic {
            client.close();
        }
        tracing::debug!(queued_failed = drained + late, "call executor closed");
    }

    fn fail_queued(&self) -> usize {
        let calls = self.inner.queue.drain_all();
        let count = calls.len();
        for call in calls {
            call.fail(CallError::ExecutorClosed);
        }
        count
    }
}

impl Drop for ExecutorInner {
    fn drop(&mut self) {
        let task = self
            .poke_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

// Liveness backstop: wakes every channel even when no enqueue happened, so
// probes and freed workers are never left waiting.
async fn poke_loop(pokes: Vec<Arc<Notify>>, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        for poke in &pokes {
            poke.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::loopback::{EchoService, LoopbackChannel};
    use crate::selector::SelectorPolicy;
    use std::time::Duration;

    fn loopback(count: usize) -> Vec<Arc<dyn Channel>> {
        (0..count)
            .map(|index| Arc::new(LoopbackChannel::new(index, EchoService)) as Arc<dyn Channel>)
            .collect()
    }

    fn config() -> ExecutorConfig {
        let mut config = ExecutorConfig::optimized_defaults();
        config.max_channels = 2;
        config.max_concurrent_streams_per_channel = 2;
        config.queue_shards = 2;
        config
    }

    #[tokio::test]
    async fn rejects_bad_channel_counts() {
        assert!(matches!(
            CallExecutor::new(config(), Vec::new()),
            Err(ConfigError::Zero { field: "channels" })
        ));
        assert!(matches!(
            CallExecutor::new(config(), loopback(3)),
            Err(ConfigError::TooManyChannels { count: 3, max: 2 })
        ));
    }

    #[tokio::test]
    async fn invalid_calls_are_rejected_and_completed() {
        let mut config = config();
        config.max_frame_bytes = 64;
        let executor = CallExecutor::new(config, loopback(1)).expect("executor");
        let handle = executor.submit(Method::new(""), Bytes::new(), None);
        assert!(matches!(handle.await, Err(CallError::InvalidCall(_))));
        let handle = executor.submit(Method::PUT, Bytes::from(vec![0u8; 64]), None);
        assert!(matches!(handle.await, Err(CallError::InvalidCall(_))));
        executor.close().await;
    }

    #[tokio::test]
    async fn selector_picks_lowest_loaded_channel() {
        let mut config = config();
        config.selector = Some(SelectorPolicy::Watermark);
        let executor = CallExecutor::new(config, loopback(2)).expect("executor");
        assert_eq!(executor.select_channel(&Method::GET), Some(0));
        let reply = executor
            .submit(Method::GET, Bytes::from_static(b"v"), None)
            .await;
        assert_eq!(reply, Ok(Bytes::from_static(b"v")));
        executor.close().await;
    }

    #[tokio::test]
    async fn enqueue_after_close_fails() {
        let executor = CallExecutor::new(config(), loopback(1)).expect("executor");
        executor.close().await;
        assert!(executor.is_closed());
        let (call, handle) = PendingCall::with_handle(Method::GET, Bytes::new());
        assert_eq!(executor.enqueue(call), Err(CallError::ExecutorClosed));
        assert_eq!(handle.await, Err(CallError::ExecutorClosed));
        assert_eq!(executor.submit(Method::GET, Bytes::new(), None).await, Err(CallError::ExecutorClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_deadline_is_kept() {
        let executor = CallExecutor::new(config(), loopback(1)).expect("executor");
        let deadline = Instant::now() + Duration::from_millis(200);
        let reply = executor
            .submit(Method::GET, Bytes::from_static(b"k"), Some(deadline))
            .await;
        assert_eq!(reply, Ok(Bytes::from_static(b"k")));
        executor.close().await;
    }
}
