//! Error types surfaced to callers.
//!
//! `CallError` is what a call's completion sink receives; `ConfigError` is raised
//! once, when an executor is built from an invalid configuration.
use bytes::Bytes;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The queue was at capacity; the call was never queued.
    #[error("call queue is full")]
    QueueFull,
    /// The deadline passed before dispatch or before the response arrived.
    #[error("call deadline exceeded")]
    Timeout,
    /// The stream carrying the call failed or closed early.
    #[error("transport error: {0}")]
    Transport(String),
    /// The gateway sent a response that cannot be correlated with this stream.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// The gateway answered with a non-OK status.
    #[error("gateway returned status {status}")]
    Remote { status: u16, payload: Bytes },
    #[error("invalid call: {0}")]
    InvalidCall(String),
    #[error("call executor is closed")]
    ExecutorClosed,
}

impl CallError {
    /// Short label used for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            CallError::QueueFull => "queue_full",
            CallError::Timeout => "timeout",
            CallError::Transport(_) => "transport",
            CallError::ProtocolViolation(_) => "protocol_violation",
            CallError::Remote { .. } => "remote",
            CallError::InvalidCall(_) => "invalid_call",
            CallError::ExecutorClosed => "executor_closed",
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("{count} channels exceeds max_channels {max}")]
    TooManyChannels { count: usize, max: usize },
    #[error("{field} must not exceed {max}")]
    TooLarge { field: &'static str, max: u64 },
    #[error("low watermark {low} exceeds high watermark {high}")]
    Watermarks { low: usize, high: usize },
    #[error("unknown selector policy {0:?}")]
    UnknownSelector(String),
}
