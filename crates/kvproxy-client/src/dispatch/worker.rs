// Per-worker stream state: the id arena for calls in flight on one stream.
use tokio::time::Instant;

use super::DispatchLimits;
use super::deadlines::{DeadlineKey, DeadlineSet, TimerKey};
use crate::call::{Method, PendingCall};
use crate::channel::{CallStream, StreamTag};
use crate::queue::Batch;

/// One consumption slot of a channel. Busy exactly while `active` is set.
#[derive(Debug)]
pub(crate) struct Worker {
    pub(crate) index: usize,
    pub(crate) active: Option<ActiveStream>,
}

impl Worker {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            active: None,
        }
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.active.is_some()
    }
}

#[derive(Debug)]
pub(crate) struct InFlight {
    pub(crate) call: PendingCall,
    pub(crate) timer: Option<TimerKey>,
}

pub(crate) enum Resolution {
    /// Id was never issued on this stream.
    Violation { next_id: i32 },
    /// Id was issued but its call already resolved (timed out, usually).
    Stale,
    Resolved(InFlight),
}

/// A stream owned by a worker.
///
/// Ids increase monotonically over the whole stream and start at 0. Only the
/// current send cycle (`base_id..next_id`) keeps slots; ids from earlier cycles
/// are known to be resolved.
#[derive(Debug)]
pub(crate) struct ActiveStream {
    pub(crate) tag: StreamTag,
    pub(crate) method: Method,
    stream: CallStream,
    opened_at: Instant,
    base_id: i32,
    next_id: i32,
    slots: Vec<Option<InFlight>>,
    outstanding: usize,
    sent_calls: usize,
    sent_bytes: usize,
}

impl ActiveStream {
    pub(crate) fn new(tag: StreamTag, method: Method, stream: CallStream, now: Instant) -> Self {
        Self {
            tag,
            method,
            stream,
            opened_at: now,
            base_id: 0,
            next_id: 0,
            slots: Vec::new(),
            outstanding: 0,
            sent_calls: 0,
            sent_bytes: 0,
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub(crate) fn sent_calls(&self) -> usize {
        self.sent_calls
    }

    /// Start a send cycle. Returns false if the stream refused a request; the
    /// refused call and every call after it stay outstanding so recovery
    /// fails the whole batch with one error.
    pub(crate) fn send_batch(
        &mut self,
        batch: Batch,
        now: Instant,
        deadlines: &mut DeadlineSet,
    ) -> bool {
        debug_assert_eq!(self.outstanding, 0);
        debug_assert_eq!(batch.method(), &self.method);
        self.base_id = self.next_id;
        self.slots.clear();
        self.sent_bytes += batch.bytes();
        let mut accepted = true;
        for call in batch.into_calls() {
            let id = self.next_id;
            self.next_id += 1;
            self.outstanding += 1;
            if !accepted {
                // Never written; no deadline needed, recovery is immediate.
                self.slots.push(Some(InFlight { call, timer: None }));
                continue;
            }
            self.sent_calls += 1;
            let request = call.to_request(id, now);
            let timer = call.deadline().map(|deadline| {
                deadlines.insert(
                    deadline,
                    DeadlineKey {
                        worker: self.tag.worker,
                        epoch: self.tag.epoch,
                        id,
                    },
                )
            });
            self.slots.push(Some(InFlight { call, timer }));
            accepted = self.stream.send(request);
        }
        accepted
    }

    pub(crate) fn resolve(&mut self, id: i32) -> Resolution {
        if id < 0 || id >= self.next_id {
            return Resolution::Violation {
                next_id: self.next_id,
            };
        }
        if id < self.base_id {
            return Resolution::Stale;
        }
        match self.slots[(id - self.base_id) as usize].take() {
            Some(in_flight) => {
                self.outstanding -= 1;
                Resolution::Resolved(in_flight)
            }
            None => Resolution::Stale,
        }
    }

    /// Whether another batch may go out on this stream.
    pub(crate) fn has_budget(&self, limits: &DispatchLimits, now: Instant) -> bool {
        self.sent_calls < limits.total_requests_per_stream
            && self.sent_bytes < limits.max_bytes_per_stream
            && now.saturating_duration_since(self.opened_at) < limits.max_stream_age
    }

    pub(crate) fn remaining_calls(&self, limits: &DispatchLimits) -> usize {
        limits
            .total_requests_per_stream
            .saturating_sub(self.sent_calls)
    }

    /// Take every unresolved call, clearing their deadlines.
    pub(crate) fn drain(&mut self, deadlines: &mut DeadlineSet) -> Vec<PendingCall> {
        self.outstanding = 0;
        self.slots
            .drain(..)
            .flatten()
            .map(|in_flight| {
                if let Some(timer) = in_flight.timer {
                    deadlines.remove(&timer);
                }
                in_flight.call
            })
            .collect()
    }

    pub(crate) fn half_close(self) {
        self.stream.half_close();
    }

    pub(crate) fn abort(self) {
        self.stream.abort();
    }
}
