//! One endpoint's stream wrapper: correlation, capacity accounting, and
//! stream recovery.

use crate::backoff::RetryConfig;
use crate::config::{Config, TAIL_LAT_THRESHOLD};
use crate::entry::Entry;
use crate::error::Error;
use crate::metrics::Metrics;
use crate::transport::{BatchRequest, BatchResponse, BatchStream, ConnState, Connection};
use bytes::Bytes;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, error, warn};

/// Callback receiving opaque health feedback piggybacked on responses.
pub type HealthFeedbackCallback = Arc<dyn Fn(Bytes) + Send + Sync>;

pub(crate) fn panic_msg(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic payload"
    }
}

/// Send/recreate exclusion.
///
/// Senders take the mutex only while `re_creating` is unset and hold it
/// for a single write, so writes to one client never interleave. Recovery
/// raises the flag to shut senders out for the whole recreation without
/// holding the mutex itself, and broadcasts when it lowers the flag.
struct RecreateLock {
    re_creating: tokio::sync::Mutex<bool>,
    cond: Notify,
}

/// Holding this permit excludes stream recreation and other senders.
pub(crate) struct SendPermit<'a>(#[allow(dead_code)] tokio::sync::MutexGuard<'a, bool>);

impl RecreateLock {
    fn new() -> Self {
        Self {
            re_creating: tokio::sync::Mutex::new(false),
            cond: Notify::new(),
        }
    }

    async fn try_lock_for_send(&self) -> Option<SendPermit<'_>> {
        let guard = self.re_creating.lock().await;
        if *guard {
            None
        } else {
            Some(SendPermit(guard))
        }
    }

    async fn lock_for_recreate(&self) {
        loop {
            // Register for the broadcast before checking the flag, so an
            // unlock between the check and the await is not lost.
            let notified = self.cond.notified();
            {
                let mut guard = self.re_creating.lock().await;
                if !*guard {
                    *guard = true;
                    return;
                }
            }
            notified.await;
        }
    }

    async fn unlock_for_recreate(&self) {
        *self.re_creating.lock().await = false;
        self.cond.notify_waiters();
    }
}

enum RecvLoopExit {
    /// The client closed; remaining correlated entries must be failed.
    Closed,
    /// Recovery installed a replacement stream with its own loop.
    Replaced,
}

enum RecreateOutcome {
    Stopped,
    Done,
}

/// Wraps the streams of one transport connection to a single endpoint:
/// the direct stream plus one stream per forwarding target, a correlation
/// table matching responses back to waiting entries, and the recovery
/// protocol that replaces broken streams.
pub(crate) struct StreamClient<C: Connection> {
    /// Back-reference to the owning [`Arc`], for spawning receive loops.
    weak: Weak<StreamClient<C>>,
    target: String,
    conn: Arc<C>,
    /// Streams keyed by forwarding target; "" is the direct stream.
    streams: Mutex<HashMap<String, Arc<C::Stream>>>,
    /// Correlation table: request ID to the entry awaiting that response.
    pending: Mutex<HashMap<u64, Arc<Entry>>>,
    /// In-flight count. May dip below zero transiently when recovery
    /// fails entries that a racing response already delivered.
    sent: AtomicI64,
    limit: AtomicU64,
    /// Reconnection generation; bumped once per recovered failure.
    epoch: AtomicU64,
    closed: AtomicBool,
    lock: RecreateLock,
    backoff: RetryConfig,
    dial_timeout: Duration,
    /// Only publish remote load reports when overload waiting can act on them.
    batch_wait_enabled: bool,
    shared_load: Arc<AtomicU64>,
    health_feedback: Arc<RwLock<Option<HealthFeedbackCallback>>>,
}

impl<C: Connection> StreamClient<C> {
    pub(crate) fn new(
        target: &str,
        conn: Arc<C>,
        config: &Config,
        shared_load: Arc<AtomicU64>,
        health_feedback: Arc<RwLock<Option<HealthFeedbackCallback>>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            target: target.to_string(),
            conn,
            streams: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            sent: AtomicI64::new(0),
            limit: AtomicU64::new(config.max_concurrency_request_limit),
            epoch: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            lock: RecreateLock::new(),
            backoff: config.recreate_backoff.clone(),
            dial_timeout: config.dial_timeout,
            batch_wait_enabled: !config.max_batch_wait_time.is_zero(),
            shared_load,
            health_feedback,
        })
    }

    /// Remaining request slots before the concurrency limit bites.
    ///
    /// `sent` can dip below zero during recovery races; treating that as
    /// full availability keeps the hot path lock-free.
    pub(crate) fn available(&self) -> u64 {
        let sent = self.sent.load(Ordering::Acquire);
        let limit = self.limit.load(Ordering::Acquire);
        if sent > 0 {
            limit.saturating_sub(sent as u64)
        } else {
            limit
        }
    }

    pub(crate) async fn try_lock_for_send(&self) -> Option<SendPermit<'_>> {
        self.lock.try_lock_for_send().await
    }

    /// Register an entry under its request ID. Must happen before the
    /// batch carrying the ID reaches the wire.
    pub(crate) fn insert_pending(&self, id: u64, entry: Arc<Entry>) {
        self.pending.lock().insert(id, entry);
        self.sent.fetch_add(1, Ordering::AcqRel);
    }

    fn take_pending(&self, id: u64) -> Option<Arc<Entry>> {
        let entry = self.pending.lock().remove(&id);
        if entry.is_some() {
            self.sent.fetch_sub(1, Ordering::AcqRel);
        }
        entry
    }

    /// Fail exactly the IDs of one batch that never made it out.
    pub(crate) fn fail_requests_in_batch(&self, ids: &[u64], err: &Error) {
        for &id in ids {
            if let Some(entry) = self.take_pending(id) {
                entry.fail(err.clone());
            }
        }
    }

    /// Fail every pending entry whose forwarding target matches
    /// `forwarded_host`. Entries riding other streams are left alone: a
    /// healthy forwarded stream may be about to answer them, and failing
    /// them here would race that delivery.
    fn fail_pending_requests(&self, err: &Error, forwarded_host: &str) {
        let failed: Vec<Arc<Entry>> = {
            let mut pending = self.pending.lock();
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, entry)| entry.forwarded_host() == forwarded_host)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };
        for entry in failed {
            self.sent.fetch_sub(1, Ordering::AcqRel);
            entry.fail(err.clone());
        }
    }

    fn fail_all_pending(&self, err: &Error) {
        let failed: Vec<Arc<Entry>> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(_, entry)| entry).collect()
        };
        for entry in failed {
            self.sent.fetch_sub(1, Ordering::AcqRel);
            entry.fail(err.clone());
        }
    }

    /// Write one batch to the stream serving `forwarded_host`, creating
    /// the stream first if needed. Failures fail the batch's IDs right
    /// here; stream recovery is the receive loop's job.
    pub(crate) async fn send_batch(&self, forwarded_host: &str, batch: &BatchRequest) {
        let stream = match self.init_batch_client(forwarded_host).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(
                    addr = %self.target,
                    host = forwarded_host,
                    error = %err,
                    "failed to create batch stream, failing batch"
                );
                self.fail_requests_in_batch(&batch.request_ids, &err);
                return;
            }
        };
        if let Err(err) = stream.send(batch).await {
            warn!(
                addr = %self.target,
                host = forwarded_host,
                error = %err,
                "batch write failed, failing batch"
            );
            self.fail_requests_in_batch(&batch.request_ids, &err);
        }
    }

    /// Ensure a stream for `forwarded_host` exists, creating it and its
    /// receive loop if not. Idempotent.
    pub(crate) async fn init_batch_client(
        &self,
        forwarded_host: &str,
    ) -> Result<Arc<C::Stream>, Error> {
        let existing = self.streams.lock().get(forwarded_host).cloned();
        if let Some(stream) = existing {
            return Ok(stream);
        }
        self.wait_conn_ready().await?;
        let meta = (!forwarded_host.is_empty()).then_some(forwarded_host);
        let stream = Arc::new(self.conn.open_stream(meta).await?);
        self.streams
            .lock()
            .insert(forwarded_host.to_string(), stream.clone());

        if let Some(client) = self.weak.upgrade() {
            let recv_stream = stream.clone();
            let host = forwarded_host.to_string();
            let epoch = self.epoch.load(Ordering::Acquire);
            tokio::spawn(async move {
                client.batch_recv_loop(recv_stream, host, epoch).await;
            });
        }
        Ok(stream)
    }

    /// Block until the connection reports ready, kicking it out of idle
    /// if necessary, bounded by the dial timeout.
    async fn wait_conn_ready(&self) -> Result<(), Error> {
        let deadline = Instant::now() + self.dial_timeout;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }
            let state = self.conn.state();
            if state == ConnState::Ready {
                return Ok(());
            }
            if state == ConnState::Idle {
                self.conn.connect();
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero()
                || !self.conn.wait_for_state_change(state, remaining).await
            {
                return Err(Error::Transport(format!(
                    "wait connection ready timeout, state {state:?}"
                )));
            }
        }
    }

    fn batch_recv_loop(
        self: Arc<Self>,
        stream: Arc<C::Stream>,
        forwarded_host: String,
        epoch: u64,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
            loop {
                let run = AssertUnwindSafe(self.recv_loop(&stream, &forwarded_host, epoch))
                    .catch_unwind()
                    .await;
                match run {
                    Ok(RecvLoopExit::Replaced) => return,
                    Ok(RecvLoopExit::Closed) => {
                        self.fail_all_pending(&Error::Closed);
                        return;
                    }
                    Err(panic) => {
                        Metrics::get()
                            .loop_panic_total
                            .with_label_values(&["recv"])
                            .inc();
                        error!(
                            addr = %self.target,
                            host = %forwarded_host,
                            panic = panic_msg(panic.as_ref()),
                            "batch recv loop panicked, restarting"
                        );
                    }
                }
            }
        })
    }

    async fn recv_loop(
        &self,
        stream: &Arc<C::Stream>,
        forwarded_host: &str,
        epoch: u64,
    ) -> RecvLoopExit {
        let metrics = Metrics::get();
        loop {
            let recv_start = Instant::now();
            match stream.recv().await {
                Err(err) => {
                    if self.closed.load(Ordering::Acquire) {
                        return RecvLoopExit::Closed;
                    }
                    debug!(
                        addr = %self.target,
                        host = forwarded_host,
                        error = %err,
                        "batch stream receive failed, recovering"
                    );
                    match self
                        .recreate_streaming_client(&err, stream, forwarded_host, epoch)
                        .await
                    {
                        RecreateOutcome::Stopped => return RecvLoopExit::Closed,
                        RecreateOutcome::Done => return RecvLoopExit::Replaced,
                    }
                }
                Ok(resp) => {
                    let recv_dur = recv_start.elapsed();
                    metrics
                        .recv_loop_duration_seconds
                        .with_label_values(&["recv"])
                        .observe(recv_dur.as_secs_f64());
                    if recv_dur > TAIL_LAT_THRESHOLD {
                        metrics
                            .tail_latency_seconds
                            .with_label_values(&["recv"])
                            .observe(recv_dur.as_secs_f64());
                    }
                    let process_start = Instant::now();
                    self.process_response(resp);
                    metrics
                        .recv_loop_duration_seconds
                        .with_label_values(&["process"])
                        .observe(process_start.elapsed().as_secs_f64());
                }
            }
        }
    }

    fn process_response(&self, resp: BatchResponse) {
        if let Some(feedback) = resp.health_feedback {
            if let Some(listener) = self.health_feedback.read().clone() {
                listener(feedback);
            }
        }
        for (&id, payload) in resp.request_ids.iter().zip(resp.responses) {
            match self.take_pending(id) {
                None => {
                    // Already failed or reaped; nobody is waiting.
                    warn!(addr = %self.target, id, "response for untracked request id");
                }
                Some(entry) => {
                    entry.observe_recv_latency(entry.start().elapsed());
                    if !entry.is_canceled() {
                        entry.complete(Ok(payload));
                    }
                }
            }
        }
        if resp.transport_layer_load > 0 && self.batch_wait_enabled {
            self.shared_load
                .store(resp.transport_layer_load, Ordering::Release);
        }
    }

    /// Replace a broken stream. The epoch CAS elects a single winner per
    /// failure: it reaps the pending entries riding the broken stream and
    /// retries recreation until it sticks. Late receivers of the same
    /// failure attempt one recreation and leave.
    async fn recreate_streaming_client(
        &self,
        err: &Error,
        stream: &Arc<C::Stream>,
        forwarded_host: &str,
        epoch: u64,
    ) -> RecreateOutcome {
        self.lock.lock_for_recreate().await;
        let outcome = self.do_recreate(err, stream, forwarded_host, epoch).await;
        self.lock.unlock_for_recreate().await;
        outcome
    }

    async fn do_recreate(
        &self,
        err: &Error,
        stream: &Arc<C::Stream>,
        forwarded_host: &str,
        epoch: u64,
    ) -> RecreateOutcome {
        let won = self
            .epoch
            .compare_exchange(epoch, epoch + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        self.drop_stream_if_current(forwarded_host, stream);

        if !won {
            if self.closed.load(Ordering::Acquire) {
                return RecreateOutcome::Stopped;
            }
            if let Err(create_err) = self.init_batch_client(forwarded_host).await {
                warn!(
                    addr = %self.target,
                    host = forwarded_host,
                    error = %create_err,
                    "batch stream recreation failed"
                );
            }
            return RecreateOutcome::Done;
        }

        warn!(
            addr = %self.target,
            host = forwarded_host,
            error = %err,
            epoch,
            "recreating batch stream"
        );
        self.fail_pending_requests(err, forwarded_host);

        let mut attempt: u32 = 0;
        let mut delay = self.backoff.initial_backoff;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return RecreateOutcome::Stopped;
            }
            match self.init_batch_client(forwarded_host).await {
                Ok(_) => return RecreateOutcome::Done,
                Err(create_err) => {
                    delay = self.backoff.next_backoff(attempt, delay);
                    attempt += 1;
                    debug!(
                        addr = %self.target,
                        host = forwarded_host,
                        error = %create_err,
                        attempt,
                        "batch stream recreation attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Forget the broken stream so the next init opens a fresh one, but
    /// only if nobody has replaced it already.
    fn drop_stream_if_current(&self, forwarded_host: &str, stream: &Arc<C::Stream>) {
        let mut streams = self.streams.lock();
        if let Some(current) = streams.get(forwarded_host) {
            if Arc::ptr_eq(current, stream) {
                streams.remove(forwarded_host);
            }
        }
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.streams.lock().clear();
        self.fail_all_pending(&Error::Closed);
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn pending_entry(&self, id: u64) -> Option<Arc<Entry>> {
        self.pending.lock().get(&id).cloned()
    }

    #[cfg(test)]
    pub(crate) fn sent_count(&self) -> i64 {
        self.sent.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn set_sent(&self, value: i64) {
        self.sent.store(value, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockConnection, Mode};
    use crate::transport::BatchResponse;

    fn client(
        conn: Arc<MockConnection>,
        config: &Config,
    ) -> Arc<StreamClient<MockConnection>> {
        StreamClient::new(
            "node-1:20160",
            conn,
            config,
            Arc::new(AtomicU64::new(0)),
            Arc::new(RwLock::new(None)),
        )
    }

    fn entry_for(host: &str) -> (Arc<Entry>, tokio::sync::oneshot::Receiver<Result<Bytes, Error>>) {
        Entry::with_channel(Bytes::from_static(b"req"), 0, host.to_string())
    }

    async fn wait_until(mut probe: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if probe() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_available_tolerates_negative_sent() {
        let config = Config::default().with_max_concurrency_request_limit(10);
        let client = client(MockConnection::new(Mode::Manual), &config);
        assert_eq!(client.available(), 10);
        client.set_sent(4);
        assert_eq!(client.available(), 6);
        client.set_sent(-3);
        assert_eq!(client.available(), 10);
        client.set_sent(12);
        assert_eq!(client.available(), 0);
    }

    #[tokio::test]
    async fn test_init_batch_client_is_idempotent() {
        let conn = MockConnection::new(Mode::Manual);
        let client = client(conn.clone(), &Config::default());
        let first = client.init_batch_client("").await.unwrap();
        let second = client.init_batch_client("").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(conn.opened(), 1);

        client.init_batch_client("peer-a").await.unwrap();
        assert_eq!(conn.opened(), 2);
    }

    #[tokio::test]
    async fn test_init_connects_idle_connection() {
        let conn = MockConnection::idle(Mode::Manual);
        let client = client(conn.clone(), &Config::default());
        client.init_batch_client("").await.unwrap();
        assert_eq!(conn.state(), ConnState::Ready);
    }

    #[tokio::test]
    async fn test_send_failure_fails_only_that_batch() {
        let conn = MockConnection::new(Mode::Manual);
        let client = client(conn.clone(), &Config::default());

        let (doomed, mut doomed_rx) = entry_for("");
        let (survivor, _survivor_rx) = entry_for("");
        client.insert_pending(0, doomed);
        client.insert_pending(1, survivor);

        let stream = client.init_batch_client("").await.unwrap();
        stream.fail_sends.store(true, Ordering::SeqCst);
        let batch = BatchRequest {
            requests: vec![Bytes::from_static(b"req")],
            request_ids: vec![0],
        };
        client.send_batch("", &batch).await;

        assert!(matches!(
            doomed_rx.try_recv().unwrap(),
            Err(Error::Transport(_))
        ));
        assert_eq!(client.pending_len(), 1);
        assert_eq!(client.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_open_failure_fails_batch_ids() {
        let conn = MockConnection::new(Mode::Manual);
        conn.fail_opens.store(1, Ordering::SeqCst);
        let client = client(conn.clone(), &Config::default());

        let (entry, mut rx) = entry_for("");
        client.insert_pending(0, entry);
        let batch = BatchRequest {
            requests: vec![Bytes::from_static(b"req")],
            request_ids: vec![0],
        };
        client.send_batch("", &batch).await;

        assert!(matches!(rx.try_recv().unwrap(), Err(Error::Transport(_))));
        assert_eq!(client.pending_len(), 0);
        assert_eq!(client.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_response_delivery_and_counters() {
        let conn = MockConnection::new(Mode::Manual);
        let client = client(conn.clone(), &Config::default());
        let stream = client.init_batch_client("").await.unwrap();

        let (entry, rx) = entry_for("");
        client.insert_pending(7, entry);

        stream.reply(BatchResponse {
            request_ids: vec![7],
            responses: vec![Bytes::from_static(b"resp")],
            ..Default::default()
        });

        assert_eq!(rx.await.unwrap().unwrap(), Bytes::from_static(b"resp"));
        wait_until(|| client.sent_count() == 0).await;
        assert_eq!(client.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_canceled_entry_response_dropped_but_reaped() {
        let conn = MockConnection::new(Mode::Manual);
        let client = client(conn.clone(), &Config::default());
        let stream = client.init_batch_client("").await.unwrap();

        let (entry, mut rx) = entry_for("");
        entry.cancel();
        client.insert_pending(3, entry);

        stream.reply(BatchResponse {
            request_ids: vec![3],
            responses: vec![Bytes::from_static(b"late")],
            ..Default::default()
        });

        wait_until(|| client.pending_len() == 0).await;
        assert_eq!(client.sent_count(), 0);
        // The completion surface was never invoked.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_recovery_fails_only_matching_forwarded_host() {
        let conn = MockConnection::new(Mode::Manual);
        let client = client(conn.clone(), &Config::default());
        let direct = client.init_batch_client("").await.unwrap();
        let forwarded = client.init_batch_client("peer-a").await.unwrap();

        let (direct_entry, mut direct_rx) = entry_for("");
        let (fwd_entry, fwd_rx) = entry_for("peer-a");
        client.insert_pending(0, direct_entry);
        client.insert_pending(1, fwd_entry);

        direct.fail_recv(Error::Transport("stream reset".to_string()));

        // The elected recoverer reaps direct entries and replaces the stream.
        wait_until(|| client.current_epoch() == 1).await;
        assert!(matches!(
            direct_rx.try_recv().unwrap(),
            Err(Error::Transport(_))
        ));
        wait_until(|| conn.opened() == 3).await;

        // The forwarded stream was untouched and still answers.
        forwarded.reply(BatchResponse {
            request_ids: vec![1],
            responses: vec![Bytes::from_static(b"fwd-resp")],
            ..Default::default()
        });
        assert_eq!(fwd_rx.await.unwrap().unwrap(), Bytes::from_static(b"fwd-resp"));
        assert_eq!(client.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_try_lock_for_send_refused_during_recreate() {
        let conn = MockConnection::new(Mode::Manual);
        let client = client(conn.clone(), &Config::default());
        client.lock.lock_for_recreate().await;
        assert!(client.try_lock_for_send().await.is_none());
        client.lock.unlock_for_recreate().await;
        assert!(client.try_lock_for_send().await.is_some());
    }

    #[tokio::test]
    async fn test_close_fails_remaining_pending() {
        let conn = MockConnection::new(Mode::Manual);
        let client = client(conn.clone(), &Config::default());
        let (entry, mut rx) = entry_for("");
        client.insert_pending(0, entry);
        client.close();
        assert!(matches!(rx.try_recv().unwrap(), Err(Error::Closed)));
        assert_eq!(client.pending_len(), 0);
    }
}
