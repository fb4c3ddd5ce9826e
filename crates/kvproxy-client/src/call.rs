//! Pending calls, their completion sinks, and the caller-side handle.
//!
//! # Design notes
//! Completing a call consumes it, so a call can be completed at most once. A call
//! dropped before completion (its owning task went away) fails its sink with
//! `ExecutorClosed`, so an accepted call never goes unanswered either.
use bytes::Bytes;
use kvproxy_wire::{CallRequest, InlinePolicy};
use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::CallError;

pub type CallResult = Result<Bytes, CallError>;

/// Name of the streaming RPC endpoint a call targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Method(Cow<'static, str>);

impl Method {
    pub const GET: Method = Method::from_static("Get");
    pub const EXISTS: Method = Method::from_static("Exists");
    pub const PUT: Method = Method::from_static("Put");
    pub const DELETE: Method = Method::from_static("Delete");
    pub const TOUCH: Method = Method::from_static("Touch");
    pub const OPERATE: Method = Method::from_static("Operate");

    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Receiver of a call's single terminal outcome.
pub trait CompletionSink: Send + 'static {
    fn on_success(self: Box<Self>, payload: Bytes);
    fn on_error(self: Box<Self>, error: CallError);
}

impl CompletionSink for oneshot::Sender<CallResult> {
    fn on_success(self: Box<Self>, payload: Bytes) {
        let _ = self.send(Ok(payload));
    }

    fn on_error(self: Box<Self>, error: CallError) {
        let _ = self.send(Err(error));
    }
}

/// One unit of work waiting to be sent to the gateway.
pub struct PendingCall {
    method: Method,
    payload: Bytes,
    deadline: Option<Instant>,
    iteration: i32,
    attrs: u32,
    sink: Option<Box<dyn CompletionSink>>,
}

impl PendingCall {
    pub fn new(method: Method, payload: Bytes, sink: impl CompletionSink) -> Self {
        Self {
            method,
            payload,
            deadline: None,
            iteration: 0,
            attrs: 0,
            sink: Some(Box::new(sink)),
        }
    }

    /// Build a call whose outcome is delivered to the returned handle.
    ///
    /// ```
    /// use bytes::Bytes;
    /// use kvproxy_client::{Method, PendingCall};
    ///
    /// let (call, _handle) = PendingCall::with_handle(Method::GET, Bytes::from_static(b"k"));
    /// assert_eq!(call.method(), &Method::GET);
    /// assert_eq!(call.payload_len(), 1);
    /// ```
    pub fn with_handle(method: Method, payload: Bytes) -> (Self, CallHandle) {
        let (tx, rx) = oneshot::channel();
        (Self::new(method, payload, tx), CallHandle { rx })
    }

    pub fn deadline_at(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn timeout(self, timeout: Duration) -> Self {
        self.deadline_at(Instant::now() + timeout)
    }

    pub fn iteration(mut self, iteration: i32) -> Self {
        self.iteration = iteration;
        self
    }

    pub fn attrs(mut self, attrs: u32) -> Self {
        self.attrs = attrs;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Apply the fallback deadline if the caller did not supply one.
    pub(crate) fn with_default_timeout(mut self, fallback: Duration) -> Self {
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + fallback);
        }
        self
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }

    /// Wire request for this call; `timeout_ms` carries the remaining budget.
    pub(crate) fn to_request(&self, id: i32, now: Instant) -> CallRequest {
        let timeout_ms = self
            .deadline
            .map(|deadline| deadline.saturating_duration_since(now).as_millis())
            .unwrap_or(0)
            .min(u32::MAX as u128) as u32;
        CallRequest {
            id,
            iteration: self.iteration,
            policy: InlinePolicy {
                timeout_ms,
                attrs: self.attrs,
            },
            payload: self.payload.clone(),
        }
    }

    pub(crate) fn succeed(mut self, payload: Bytes) {
        if let Some(sink) = self.sink.take() {
            sink.on_success(payload);
        }
    }

    pub(crate) fn fail(mut self, error: CallError) {
        if let Some(sink) = self.sink.take() {
            t_counter!("kvproxy_calls_failed_total", "kind" => error.kind()).increment(1);
            sink.on_error(error);
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.on_error(CallError::ExecutorClosed);
        }
    }
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("method", &self.method)
            .field("payload_len", &self.payload.len())
            .field("deadline", &self.deadline)
            .field("iteration", &self.iteration)
            .finish()
    }
}

/// Future resolving to the outcome of a submitted call.
#[derive(Debug)]
pub struct CallHandle {
    rx: oneshot::Receiver<CallResult>,
}

impl Future for CallHandle {
    type Output = CallResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(CallError::ExecutorClosed)))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Sink that records every invocation, for exactly-once assertions.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingSink {
        pub(crate) outcomes: Arc<Mutex<Vec<CallResult>>>,
    }

    impl RecordingSink {
        pub(crate) fn count(&self) -> usize {
            self.outcomes.lock().expect("outcomes").len()
        }

        pub(crate) fn last(&self) -> Option<CallResult> {
            self.outcomes.lock().expect("outcomes").last().cloned()
        }
    }

    impl CompletionSink for RecordingSink {
        fn on_success(self: Box<Self>, payload: Bytes) {
            self.outcomes.lock().expect("outcomes").push(Ok(payload));
        }

        fn on_error(self: Box<Self>, error: CallError) {
            self.outcomes.lock().expect("outcomes").push(Err(error));
        }
    }
}
