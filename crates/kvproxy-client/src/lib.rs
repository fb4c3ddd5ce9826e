// Call scheduler for a batching KV proxy client.
//
// Turns a high rate of independent unary calls (get, put, ...) into batched
// streaming RPC traffic over a small pool of multiplexed gateway connections.
//
// IMPORTANT CLIENT-SIDE DESIGN INTENT
// ----------------------------------
// Parallelism comes from more channels (connections) and more workers
// (streams per channel), never from several tasks sharing one stream. Each
// stream has exactly one writer, and all bookkeeping for a channel's streams
// lives on that channel's executor task.
#[macro_use]
mod macros;

mod call;
mod channel;
mod config;
mod dispatch;
mod error;
mod executor;
mod queue;
mod selector;
mod wire;

pub use call::{CallHandle, CallResult, CompletionSink, Method, PendingCall};
pub use channel::quic::QuicChannel;
pub use channel::{
    CallStream, Channel, Outbound, StreamEnd, StreamEvent, StreamEventKind, StreamEvents,
    StreamTag, cancelled,
};
pub use config::ExecutorConfig;
pub use dispatch::ChannelLoad;
pub use error::{CallError, ConfigError};
pub use executor::CallExecutor;
pub use kvproxy_transport::ConnectivityState;
pub use queue::{Batch, CallQueue};
pub use selector::{
    HashMethodSelector, LoadReport, RoundRobinSelector, Selector, SelectorPolicy,
    WatermarkSelector,
};

/// In-process channels for embedding and tests.
pub mod loopback {
    pub use crate::channel::loopback::{
        EchoService, LoopbackChannel, LoopbackService, LoopbackStream,
    };
}

/*
CLIENT DESIGN NOTES (kvproxy-client)

A) Queue
   - One bounded queue shared by every channel, sharded per method so producers
     rarely contend. Capacity is reserved with a CAS on one counter before the
     call is inserted; a full queue rejects synchronously with QueueFull.
   - A batch never mixes methods: a stream is opened for exactly one method.

B) Channel executors
   - One tokio task per channel owns its workers. A worker is busy exactly
     while it owns a stream.
   - Ids are assigned per stream starting at 0 and never reused on that stream.
     A response with an id that was never issued is a protocol violation and
     fails the whole stream; a response for an id that already resolved (it
     timed out) is dropped.
   - When every call sent on a stream has resolved, the worker pipelines the
     next batch of the same method onto it while the stream's call, byte and
     age budgets allow; otherwise it half-closes and goes back to idle.

C) Deadlines
   - Calls carry an absolute deadline (default 30s). Calls found expired when
     draining the queue fail with Timeout and are never sent. Calls on the wire
     are timed by their executor; the remaining budget travels in the request.

D) Completion
   - Completing a call consumes it, so a sink is invoked at most once. A call
     dropped without completion fails its sink with ExecutorClosed, so it is
     invoked at least once too.
*/
