//! Accumulates pending entries and emits wire batches.

use crate::entry::{Entry, HIGH_TASK_PRIORITY};
use crate::error::Error;
use crate::queue::PriorityQueue;
use crate::transport::BatchRequest;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Builds outgoing batches from queued entries.
///
/// Request IDs are allocated here, monotonically from 0 for the life of
/// the builder, and handed to `collect` *before* the batch reaches the
/// wire so the caller can register them for correlation first.
pub(crate) struct BatchBuilder {
    id_alloc: u64,
    queue: PriorityQueue,
    latest_req_start: Option<Instant>,
}

impl BatchBuilder {
    pub(crate) fn new() -> Self {
        Self {
            id_alloc: 0,
            queue: PriorityQueue::new(),
            latest_req_start: None,
        }
    }

    pub(crate) fn push(&mut self, entry: Arc<Entry>) {
        if self.latest_req_start.map_or(true, |t| entry.start() > t) {
            self.latest_req_start = Some(entry.start());
        }
        self.queue.push(entry);
    }

    /// Arrival time of the latest entry ever pushed.
    pub(crate) fn latest_req_start(&self) -> Option<Instant> {
        self.latest_req_start
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Whether a queued entry is exempt from capacity limits.
    pub(crate) fn has_high_priority_task(&self) -> bool {
        self.queue.highest_priority() >= HIGH_TASK_PRIORITY
    }

    /// Emit batches for up to `limit` normal-priority entries.
    ///
    /// High-priority entries never count against `limit`: as long as one
    /// is queued, taking continues. A `limit` of 0 therefore defers all
    /// normal work while still flushing high-priority entries. Canceled
    /// entries are skipped without consuming an ID.
    ///
    /// Returns the direct batch, if any entries target the endpoint
    /// itself, and one batch per forwarding target.
    pub(crate) fn build_with_limit(
        &mut self,
        limit: u64,
        mut collect: impl FnMut(u64, &Arc<Entry>),
    ) -> (Option<BatchRequest>, HashMap<String, BatchRequest>) {
        let mut direct = BatchRequest::default();
        let mut forwarded: HashMap<String, BatchRequest> = HashMap::new();
        let mut normal: u64 = 0;
        loop {
            if self.queue.highest_priority() < HIGH_TASK_PRIORITY && normal >= limit {
                break;
            }
            let Some(entry) = self.queue.take(1).pop() else {
                break;
            };
            if entry.is_canceled() {
                continue;
            }
            let id = self.id_alloc;
            self.id_alloc += 1;
            collect(id, &entry);
            if !entry.is_high_priority() {
                normal += 1;
            }
            let host = entry.forwarded_host();
            if host.is_empty() {
                direct.push(id, entry.payload());
            } else {
                forwarded
                    .entry(host.to_string())
                    .or_default()
                    .push(id, entry.payload());
            }
        }
        ((!direct.is_empty()).then_some(direct), forwarded)
    }

    /// Terminate every queued entry with `err` and empty the queue.
    pub(crate) fn cancel(&mut self, err: &Error) {
        for entry in self.queue.drain_all() {
            entry.fail(err.clone());
        }
    }

    /// Start-of-round cleanup. Entries still waiting for capacity stay
    /// queued; canceled leftovers and spare buffer capacity are dropped.
    pub(crate) fn reset(&mut self) {
        self.queue.reset();
    }
}
