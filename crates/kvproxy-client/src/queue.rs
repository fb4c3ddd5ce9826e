//! Bounded, sharded holding area for calls that have not been dispatched yet.
//!
//! # Purpose
//! Accepts calls from any number of caller threads and hands out
//! single-method batches to channel executors.
//!
//! # Design notes
//! Each method owns K FIFO shards, each behind its own short-lived mutex, so
//! producers spread across shards instead of contending on one lock. The total
//! size lives in one atomic counter; a slot is reserved with a CAS before the
//! call is inserted, so concurrent producers can never push the queue past
//! `max_size`. The method table is read-mostly and only write-locked the first
//! time a method is seen.
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::time::Instant;

use crate::call::{Method, PendingCall};
use crate::error::CallError;

pub struct CallQueue {
    max_size: usize,
    shards_per_method: usize,
    len: AtomicUsize,
    methods: RwLock<MethodTable>,
    method_cursor: AtomicUsize,
}

#[derive(Default)]
struct MethodTable {
    by_name: HashMap<Method, usize>,
    queues: Vec<Arc<MethodQueue>>,
}

struct MethodQueue {
    method: Method,
    shards: Vec<Mutex<VecDeque<PendingCall>>>,
    push_cursor: AtomicUsize,
    drain_cursor: AtomicUsize,
    len: AtomicUsize,
}

impl MethodQueue {
    fn new(method: Method, shards: usize) -> Self {
        Self {
            method,
            shards: (0..shards).map(|_| Mutex::new(VecDeque::new())).collect(),
            push_cursor: AtomicUsize::new(0),
            drain_cursor: AtomicUsize::new(0),
            len: AtomicUsize::new(0),
        }
    }
}

/// Calls removed together for one send cycle. All share one method.
#[derive(Debug)]
pub struct Batch {
    method: Method,
    calls: Vec<PendingCall>,
    bytes: usize,
}

impl Batch {
    fn empty(method: Method) -> Self {
        Self {
            method,
            calls: Vec::new(),
            bytes: 0,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Sum of payload lengths.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn calls(&self) -> &[PendingCall] {
        &self.calls
    }

    pub fn into_calls(self) -> Vec<PendingCall> {
        self.calls
    }
}

impl CallQueue {
    pub fn new(max_size: usize, shards_per_method: usize) -> Self {
        Self {
            max_size,
            shards_per_method: shards_per_method.max(1),
            len: AtomicUsize::new(0),
            methods: RwLock::new(MethodTable::default()),
            method_cursor: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue a call, or hand it back untouched when the queue is full.
    pub fn enqueue(&self, call: PendingCall) -> Result<(), PendingCall> {
        let reserved = self
            .len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |len| {
                (len < self.max_size).then_some(len + 1)
            });
        if reserved.is_err() {
            return Err(call);
        }
        let queue = self.method_queue(call.method());
        let shard = queue.push_cursor.fetch_add(1, Ordering::Relaxed) % queue.shards.len();
        queue.shards[shard]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(call);
        queue.len.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Remove the next batch, rotating across methods that have queued calls.
    ///
    /// The first live call is always taken even if it alone exceeds `max_bytes`.
    /// Calls already past their deadline are failed with `Timeout` and never
    /// returned.
    pub fn dequeue_batch(&self, max_calls: usize, max_bytes: usize, now: Instant) -> Batch {
        let method_count = self.read_table().queues.len();
        if method_count == 0 || self.is_empty() {
            return Batch::empty(Method::from_static(""));
        }
        let start = self.method_cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..method_count {
            let queue = {
                let table = self.read_table();
                Arc::clone(&table.queues[(start + offset) % method_count])
            };
            if queue.len.load(Ordering::Acquire) == 0 {
                continue;
            }
            let batch = self.drain(&queue, max_calls, max_bytes, now);
            if !batch.is_empty() {
                return batch;
            }
        }
        Batch::empty(Method::from_static(""))
    }

    /// Like `dequeue_batch`, restricted to one method. Used to pipeline onto a
    /// stream that is already open for `method`.
    pub fn dequeue_method_batch(
        &self,
        method: &Method,
        max_calls: usize,
        max_bytes: usize,
        now: Instant,
    ) -> Batch {
        let queue = {
            let table = self.read_table();
            table
                .by_name
                .get(method)
                .map(|index| Arc::clone(&table.queues[*index]))
        };
        match queue {
            Some(queue) if queue.len.load(Ordering::Acquire) > 0 => {
                self.drain(&queue, max_calls, max_bytes, now)
            }
            _ => Batch::empty(method.clone()),
        }
    }

    /// Remove every queued call.
    pub fn drain_all(&self) -> Vec<PendingCall> {
        let queues = self.read_table().queues.clone();
        let mut calls = Vec::new();
        for queue in queues {
            let mut removed = 0;
            for shard in &queue.shards {
                let mut shard = shard.lock().unwrap_or_else(PoisonError::into_inner);
                removed += shard.len();
                calls.extend(shard.drain(..));
            }
            queue.len.fetch_sub(removed, Ordering::AcqRel);
            self.len.fetch_sub(removed, Ordering::AcqRel);
        }
        calls
    }

    fn drain(&self, queue: &MethodQueue, max_calls: usize, max_bytes: usize, now: Instant) -> Batch {
        let max_calls = max_calls.max(1);
        let mut batch = Batch::empty(queue.method.clone());
        let mut expired = Vec::new();
        let shard_count = queue.shards.len();
        let start = queue.drain_cursor.fetch_add(1, Ordering::Relaxed);
        'shards: for offset in 0..shard_count {
            let mut shard = queue.shards[(start + offset) % shard_count]
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            while let Some(front) = shard.front() {
                if front.is_expired(now) {
                    expired.extend(shard.pop_front());
                    continue;
                }
                let size = front.payload_len();
                if !batch.calls.is_empty()
                    && (batch.calls.len() + 1 > max_calls || batch.bytes + size > max_bytes)
                {
                    break 'shards;
                }
                if let Some(call) = shard.pop_front() {
                    batch.bytes += size;
                    batch.calls.push(call);
                }
                if batch.calls.len() >= max_calls {
                    break 'shards;
                }
            }
        }
        let removed = batch.calls.len() + expired.len();
        if removed > 0 {
            queue.len.fetch_sub(removed, Ordering::AcqRel);
            self.len.fetch_sub(removed, Ordering::AcqRel);
        }
        // Complete expired calls outside the shard locks; sinks run caller code.
        if !expired.is_empty() {
            tracing::debug!(
                method = %queue.method,
                expired = expired.len(),
                "dropping calls that expired before dispatch"
            );
            t_counter!("kvproxy_calls_expired_in_queue_total").increment(expired.len() as u64);
        }
        for call in expired {
            call.fail(CallError::Timeout);
        }
        batch
    }

    fn method_queue(&self, method: &Method) -> Arc<MethodQueue> {
        {
            let table = self.read_table();
            if let Some(index) = table.by_name.get(method) {
                return Arc::clone(&table.queues[*index]);
            }
        }
        let mut table = self.methods.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(index) = table.by_name.get(method) {
            return Arc::clone(&table.queues[*index]);
        }
        let queue = Arc::new(MethodQueue::new(method.clone(), self.shards_per_method));
        let index = table.queues.len();
        table.queues.push(Arc::clone(&queue));
        table.by_name.insert(method.clone(), index);
        queue
    }

    fn read_table(&self) -> std::sync::RwLockReadGuard<'_, MethodTable> {
        self.methods.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for CallQueue {
    fn drop(&mut self) {
        for call in self.drain_all() {
            call.fail(CallError::ExecutorClosed);
        }
    }
}
