//! Priority-ordered collection of pending entries.

use crate::entry::Entry;
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;

struct Item {
    entry: Arc<Entry>,
    seq: u64,
}

impl PartialEq for Item {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Item {}

impl PartialOrd for Item {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Item {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority wins, earlier arrival breaks ties.
        self.entry
            .priority()
            .cmp(&other.entry.priority())
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Inner {
    heap: BinaryHeap<Item>,
    next_seq: u64,
}

/// Pending entries ordered by priority, FIFO within equal priority.
///
/// `take` is atomic with respect to concurrent pushes: a push lands
/// either in the current take or in the next one, never torn across.
pub(crate) struct PriorityQueue {
    inner: Mutex<Inner>,
}

impl PriorityQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
        }
    }

    pub(crate) fn push(&self, entry: Arc<Entry>) {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(Item { entry, seq });
    }

    /// Remove and return up to `n` entries, highest priority first.
    pub(crate) fn take(&self, n: usize) -> Vec<Arc<Entry>> {
        let mut inner = self.inner.lock();
        let mut taken = Vec::with_capacity(n.min(inner.heap.len()));
        while taken.len() < n {
            match inner.heap.pop() {
                Some(item) => taken.push(item.entry),
                None => break,
            }
        }
        taken
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Priority of the head entry; 0 when the queue is empty.
    pub(crate) fn highest_priority(&self) -> u64 {
        self.inner
            .lock()
            .heap
            .peek()
            .map_or(0, |item| item.entry.priority())
    }

    /// Remove and return every queued entry.
    pub(crate) fn drain_all(&self) -> Vec<Arc<Entry>> {
        let mut inner = self.inner.lock();
        inner.heap.drain().map(|item| item.entry).collect()
    }

    /// Drop entries whose cancel flag is set. Their submitters have
    /// already left; keeping them would only pad future batches.
    pub(crate) fn clean(&self) {
        let mut inner = self.inner.lock();
        if inner.heap.iter().any(|item| item.entry.is_canceled()) {
            let kept: BinaryHeap<Item> = inner
                .heap
                .drain()
                .filter(|item| !item.entry.is_canceled())
                .collect();
            inner.heap = kept;
        }
    }

    /// Start-of-round cleanup: evict canceled entries and return spare
    /// capacity so burst allocations (and the payloads they referenced)
    /// do not outlive the burst.
    pub(crate) fn reset(&self) {
        self.clean();
        self.inner.lock().heap.shrink_to_fit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn entry(priority: u64) -> Arc<Entry> {
        let (entry, _rx) = Entry::with_channel(Bytes::new(), priority, String::new());
        entry
    }

    #[test]
    fn test_take_orders_by_priority() {
        let queue = PriorityQueue::new();
        queue.push(entry(1));
        queue.push(entry(5));
        queue.push(entry(3));
        let taken = queue.take(3);
        let priorities: Vec<u64> = taken.iter().map(|e| e.priority()).collect();
        assert_eq!(priorities, vec![5, 3, 1]);
    }

    #[test]
    fn test_fifo_within_equal_priority() {
        let queue = PriorityQueue::new();
        let first = entry(2);
        let second = entry(2);
        queue.push(first.clone());
        queue.push(second.clone());
        let taken = queue.take(2);
        assert!(Arc::ptr_eq(&taken[0], &first));
        assert!(Arc::ptr_eq(&taken[1], &second));
    }

    #[test]
    fn test_take_caps_at_n_and_len_tracks() {
        let queue = PriorityQueue::new();
        for _ in 0..4 {
            queue.push(entry(0));
        }
        assert_eq!(queue.take(3).len(), 3);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.take(5).len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_highest_priority_zero_when_empty() {
        let queue = PriorityQueue::new();
        assert_eq!(queue.highest_priority(), 0);
        queue.push(entry(7));
        assert_eq!(queue.highest_priority(), 7);
    }

    #[test]
    fn test_reset_evicts_canceled_entries() {
        let queue = PriorityQueue::new();
        let keep = entry(1);
        let gone = entry(9);
        gone.cancel();
        queue.push(keep.clone());
        queue.push(gone);
        queue.reset();
        assert_eq!(queue.len(), 1);
        assert!(Arc::ptr_eq(&queue.take(1)[0], &keep));
    }
}
