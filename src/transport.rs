//! Transport contract and wire shapes.
//!
//! The crate does not dial or encode anything itself: the caller supplies
//! a [`Connection`] to the remote endpoint, and the batching layer only
//! asks it to open bidirectional streams and report connectivity state.

use crate::error::Error;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Connectivity state of a transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// No transport activity yet; `connect` kicks it off.
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

/// One outgoing wire message: a parallel vector of opaque payloads and
/// the correlation IDs assigned to them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchRequest {
    pub requests: Vec<Bytes>,
    pub request_ids: Vec<u64>,
}

impl BatchRequest {
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub(crate) fn push(&mut self, id: u64, payload: Bytes) {
        self.requests.push(payload);
        self.request_ids.push(id);
    }
}

/// One incoming wire message answering previously sent requests.
///
/// Responses are matched back to callers by ID; ordering carries no
/// meaning beyond the pairing of `request_ids[i]` with `responses[i]`.
#[derive(Debug, Clone, Default)]
pub struct BatchResponse {
    pub request_ids: Vec<u64>,
    pub responses: Vec<Bytes>,
    /// Load reported by the remote transport layer; 0 when absent.
    pub transport_layer_load: u64,
    /// Opaque health feedback for the registered listener, if any.
    pub health_feedback: Option<Bytes>,
}

/// A long-lived bidirectional stream carrying many batches.
///
/// `send` and `recv` are called concurrently from different tasks, so
/// implementations must be internally synchronized.
#[async_trait]
pub trait BatchStream: Send + Sync + 'static {
    /// Write one batch to the stream.
    async fn send(&self, batch: &BatchRequest) -> Result<(), Error>;

    /// Receive the next response from the stream.
    async fn recv(&self) -> Result<BatchResponse, Error>;
}

/// A transport connection to a single remote endpoint.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    type Stream: BatchStream;

    /// Current connectivity state.
    fn state(&self) -> ConnState;

    /// Kick an idle connection into connecting. Non-blocking.
    fn connect(&self);

    /// Wait until the state leaves `from`, or until `timeout` elapses.
    /// Returns `false` on timeout.
    async fn wait_for_state_change(&self, from: ConnState, timeout: Duration) -> bool;

    /// Open a new stream on this connection.
    ///
    /// A non-empty `forwarded_host` attaches forwarding metadata to the
    /// stream so the remote peer relays its batches to that target.
    async fn open_stream(&self, forwarded_host: Option<&str>) -> Result<Self::Stream, Error>;
}

#[cfg(test)]
pub(crate) mod mock {
    //! Channel-driven in-memory transport for tests.

    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    /// How a mock stream answers writes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum Mode {
        /// Echo every sent batch back as its own response.
        Echo,
        /// Stay silent; the test injects responses by hand.
        Manual,
    }

    pub(crate) struct MockConnection {
        mode: Mode,
        state: Mutex<ConnState>,
        /// Every stream ever opened, in creation order.
        pub(crate) streams: Mutex<Vec<Arc<MockStream>>>,
        /// Fail this many upcoming `open_stream` calls.
        pub(crate) fail_opens: AtomicUsize,
    }

    impl MockConnection {
        pub(crate) fn new(mode: Mode) -> Arc<Self> {
            Arc::new(Self {
                mode,
                state: Mutex::new(ConnState::Ready),
                streams: Mutex::new(Vec::new()),
                fail_opens: AtomicUsize::new(0),
            })
        }

        pub(crate) fn idle(mode: Mode) -> Arc<Self> {
            let conn = Self::new(mode);
            *conn.state.lock() = ConnState::Idle;
            conn
        }

        /// Most recently opened stream for the given forwarding target.
        pub(crate) fn stream_for(&self, forwarded_host: Option<&str>) -> Option<Arc<MockStream>> {
            self.streams
                .lock()
                .iter()
                .rev()
                .find(|s| s.forwarded_host.as_deref() == forwarded_host)
                .cloned()
        }

        pub(crate) fn opened(&self) -> usize {
            self.streams.lock().len()
        }
    }

    #[async_trait]
    impl Connection for MockConnection {
        type Stream = Arc<MockStream>;

        fn state(&self) -> ConnState {
            *self.state.lock()
        }

        fn connect(&self) {
            let mut state = self.state.lock();
            if *state == ConnState::Idle {
                *state = ConnState::Ready;
            }
        }

        async fn wait_for_state_change(&self, from: ConnState, timeout: Duration) -> bool {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                if *self.state.lock() != from {
                    return true;
                }
                if tokio::time::Instant::now() >= deadline {
                    return false;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }

        async fn open_stream(
            &self,
            forwarded_host: Option<&str>,
        ) -> Result<Self::Stream, Error> {
            if self
                .fail_opens
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::Transport("mock open refused".to_string()));
            }
            let (resp_tx, resp_rx) = mpsc::unbounded_channel();
            let stream = Arc::new(MockStream {
                forwarded_host: forwarded_host.map(str::to_string),
                mode: self.mode,
                sent: Mutex::new(Vec::new()),
                fail_sends: AtomicBool::new(false),
                stall_sends: AtomicBool::new(false),
                resp_tx,
                resp_rx: tokio::sync::Mutex::new(resp_rx),
            });
            self.streams.lock().push(stream.clone());
            Ok(stream)
        }
    }

    pub(crate) struct MockStream {
        pub(crate) forwarded_host: Option<String>,
        mode: Mode,
        /// Batches written to this stream, in order.
        pub(crate) sent: Mutex<Vec<BatchRequest>>,
        pub(crate) fail_sends: AtomicBool,
        /// While set, writes block, wedging the sender mid-batch.
        pub(crate) stall_sends: AtomicBool,
        resp_tx: mpsc::UnboundedSender<Result<BatchResponse, Error>>,
        resp_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<BatchResponse, Error>>>,
    }

    impl MockStream {
        /// Inject a response as if the remote peer answered.
        pub(crate) fn reply(&self, resp: BatchResponse) {
            let _ = self.resp_tx.send(Ok(resp));
        }

        /// Inject a receive failure, as if the stream broke.
        pub(crate) fn fail_recv(&self, err: Error) {
            let _ = self.resp_tx.send(Err(err));
        }

        pub(crate) fn sent_batches(&self) -> Vec<BatchRequest> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl BatchStream for Arc<MockStream> {
        async fn send(&self, batch: &BatchRequest) -> Result<(), Error> {
            while self.stall_sends.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(Error::Transport("mock write refused".to_string()));
            }
            self.sent.lock().push(batch.clone());
            if self.mode == Mode::Echo {
                let _ = self.resp_tx.send(Ok(BatchResponse {
                    request_ids: batch.request_ids.clone(),
                    responses: batch.requests.clone(),
                    ..Default::default()
                }));
            }
            Ok(())
        }

        async fn recv(&self) -> Result<BatchResponse, Error> {
            match self.resp_rx.lock().await.recv().await {
                Some(result) => result,
                None => Err(Error::Transport("mock stream dropped".to_string())),
            }
        }
    }
}
