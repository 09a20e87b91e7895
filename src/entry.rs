//! One outstanding submission and its completion surface.

use crate::error::Error;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Priority at or above which an entry bypasses both the batch-size
/// limit and the per-stream concurrency limit.
pub const HIGH_TASK_PRIORITY: u64 = 10;

/// Callback invoked with the terminal result of an asynchronous submission.
pub(crate) type SubmitCallback = Box<dyn FnOnce(Result<Bytes, Error>) + Send + 'static>;

enum Completion {
    Channel(oneshot::Sender<Result<Bytes, Error>>),
    Callback(SubmitCallback),
}

/// One outstanding submission.
///
/// An entry receives exactly one terminal event: delivery, error, or
/// cancellation. The completion surface is taken on first use, so a
/// response arriving after cancellation is dropped silently.
pub(crate) struct Entry {
    payload: Bytes,
    priority: u64,
    /// Empty means the request goes to the endpoint directly; otherwise
    /// it is relayed through this peer, over that peer's own stream.
    forwarded_host: String,
    completion: Mutex<Option<Completion>>,
    canceled: AtomicBool,
    start: Instant,
    send_lat_nanos: AtomicU64,
    recv_lat_nanos: AtomicU64,
}

impl Entry {
    /// Entry for a synchronous submission; the caller awaits the receiver.
    pub(crate) fn with_channel(
        payload: Bytes,
        priority: u64,
        forwarded_host: String,
    ) -> (Arc<Self>, oneshot::Receiver<Result<Bytes, Error>>) {
        let (tx, rx) = oneshot::channel();
        let entry = Arc::new(Self::new(
            payload,
            priority,
            forwarded_host,
            Completion::Channel(tx),
        ));
        (entry, rx)
    }

    /// Entry for an asynchronous submission; the callback receives the
    /// terminal result.
    pub(crate) fn with_callback(
        payload: Bytes,
        priority: u64,
        forwarded_host: String,
        callback: SubmitCallback,
    ) -> Arc<Self> {
        Arc::new(Self::new(
            payload,
            priority,
            forwarded_host,
            Completion::Callback(callback),
        ))
    }

    fn new(payload: Bytes, priority: u64, forwarded_host: String, completion: Completion) -> Self {
        Self {
            payload,
            priority,
            forwarded_host,
            completion: Mutex::new(Some(completion)),
            canceled: AtomicBool::new(false),
            start: Instant::now(),
            send_lat_nanos: AtomicU64::new(0),
            recv_lat_nanos: AtomicU64::new(0),
        }
    }

    pub(crate) fn payload(&self) -> Bytes {
        self.payload.clone()
    }

    pub(crate) fn priority(&self) -> u64 {
        self.priority
    }

    pub(crate) fn is_high_priority(&self) -> bool {
        self.priority >= HIGH_TASK_PRIORITY
    }

    pub(crate) fn forwarded_host(&self) -> &str {
        &self.forwarded_host
    }

    /// Arrival time, recorded at construction.
    pub(crate) fn start(&self) -> Instant {
        self.start
    }

    pub(crate) fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    pub(crate) fn observe_send_latency(&self, lat: Duration) {
        self.send_lat_nanos
            .store(lat.as_nanos() as u64, Ordering::Release);
    }

    pub(crate) fn send_latency(&self) -> Duration {
        Duration::from_nanos(self.send_lat_nanos.load(Ordering::Acquire))
    }

    pub(crate) fn observe_recv_latency(&self, lat: Duration) {
        self.recv_lat_nanos
            .store(lat.as_nanos() as u64, Ordering::Release);
    }

    pub(crate) fn recv_latency(&self) -> Duration {
        Duration::from_nanos(self.recv_lat_nanos.load(Ordering::Acquire))
    }

    /// Deliver the terminal event. At most the first call has any effect.
    pub(crate) fn complete(&self, result: Result<Bytes, Error>) {
        let Some(completion) = self.completion.lock().take() else {
            return;
        };
        match completion {
            Completion::Channel(tx) => {
                // The receiver may already be gone (caller timed out).
                let _ = tx.send(result);
            }
            Completion::Callback(callback) => callback(result),
        }
    }

    pub(crate) fn fail(&self, err: Error) {
        self.complete(Err(err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_channel_completion_delivers_once() {
        let (entry, rx) = Entry::with_channel(Bytes::from_static(b"req"), 0, String::new());
        entry.complete(Ok(Bytes::from_static(b"resp")));
        entry.complete(Ok(Bytes::from_static(b"late")));
        assert_eq!(rx.await.unwrap().unwrap(), Bytes::from_static(b"resp"));
    }

    #[test]
    fn test_callback_invoked_at_most_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let entry = Entry::with_callback(
            Bytes::new(),
            0,
            String::new(),
            Box::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );
        entry.fail(Error::Closed);
        entry.fail(Error::Closed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_high_priority_threshold() {
        let (low, _rx) = Entry::with_channel(Bytes::new(), 9, String::new());
        let (high, _rx) = Entry::with_channel(Bytes::new(), HIGH_TASK_PRIORITY, String::new());
        assert!(!low.is_high_priority());
        assert!(high.is_high_priority());
    }

    #[test]
    fn test_latency_accumulators() {
        let (entry, _rx) = Entry::with_channel(Bytes::new(), 0, String::new());
        entry.observe_send_latency(Duration::from_micros(250));
        entry.observe_recv_latency(Duration::from_millis(3));
        assert_eq!(entry.send_latency(), Duration::from_micros(250));
        assert_eq!(entry.recv_latency(), Duration::from_millis(3));
    }
}
