//! Batch connection: fan-in channel, send loop, and dispatch.

use crate::builder::BatchBuilder;
use crate::config::{Config, TAIL_LAT_THRESHOLD};
use crate::entry::Entry;
use crate::error::Error;
use crate::metrics::Metrics;
use crate::stream_client::{panic_msg, HealthFeedbackCallback, StreamClient};
use crate::transport::Connection;
use crate::trigger::Trigger;
use bytes::Bytes;
use futures::FutureExt;
use parking_lot::RwLock;
use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error};

/// One-shot idle signal from a batch connection to its owner, so the
/// owner can reclaim connections that stopped carrying traffic.
pub struct IdleNotify {
    flagged: AtomicU32,
    notify: Notify,
}

impl IdleNotify {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            flagged: AtomicU32::new(0),
            notify: Notify::new(),
        })
    }

    pub fn is_flagged(&self) -> bool {
        self.flagged.load(Ordering::Acquire) == 1
    }

    /// Raise the flag. True only for the caller that flips it.
    pub(crate) fn fire(&self) -> bool {
        if self
            .flagged
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.notify.notify_waiters();
            true
        } else {
            false
        }
    }

    /// Wait until some connection reports idle.
    pub async fn notified(&self) {
        loop {
            if self.is_flagged() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_flagged() {
                return;
            }
            notified.await;
        }
    }
}

/// Coalesces concurrent submissions to one endpoint into batches and
/// multiplexes them over a pool of stream clients.
///
/// Cloning is not needed: the connection is shared behind the [`Arc`]
/// returned by [`BatchConn::new`], which also starts the send loop.
pub struct BatchConn<C: Connection> {
    target: String,
    tx: mpsc::Sender<Arc<Entry>>,
    clients: Vec<Arc<StreamClient<C>>>,
    cfg: Config,
    closed: watch::Sender<bool>,
    idle: AtomicBool,
    idle_notify: Arc<IdleNotify>,
    /// Latest load reported by the remote transport layer; shared with
    /// every stream client's receive loop.
    shared_load: Arc<AtomicU64>,
    health_feedback: Arc<RwLock<Option<HealthFeedbackCallback>>>,
}

impl<C: Connection> BatchConn<C> {
    /// Create a connection and start its send loop. Each transport
    /// connection in `conns` backs one stream client in the pool.
    pub fn new(
        target: impl Into<String>,
        conns: Vec<Arc<C>>,
        config: Config,
        idle_notify: Arc<IdleNotify>,
    ) -> Arc<Self> {
        assert!(
            !conns.is_empty(),
            "batch connection needs at least one transport connection"
        );
        let target = target.into();
        let (tx, rx) = mpsc::channel(config.max_batch_size.max(1));
        let shared_load = Arc::new(AtomicU64::new(0));
        let health_feedback: Arc<RwLock<Option<HealthFeedbackCallback>>> =
            Arc::new(RwLock::new(None));
        let clients = conns
            .into_iter()
            .map(|conn| {
                StreamClient::new(
                    &target,
                    conn,
                    &config,
                    shared_load.clone(),
                    health_feedback.clone(),
                )
            })
            .collect();
        let (closed, _) = watch::channel(false);
        let trigger = config.batch_policy.trigger();
        let avg_batch_wait_size = config.batch_wait_size as f64;

        let conn = Arc::new(Self {
            target,
            tx,
            clients,
            cfg: config,
            closed,
            idle: AtomicBool::new(false),
            idle_notify,
            shared_load,
            health_feedback,
        });
        let send_loop = SendLoop {
            conn: conn.clone(),
            rx,
            builder: BatchBuilder::new(),
            trigger,
            avg_batch_wait_size,
            cursor: 0,
        };
        tokio::spawn(send_loop.run());
        conn
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Latest load reported by the remote transport layer.
    pub fn transport_load(&self) -> u64 {
        self.shared_load.load(Ordering::Acquire)
    }

    /// Whether the send loop shut down after the idle window elapsed.
    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    /// Register a listener for opaque health feedback piggybacked on
    /// responses.
    pub fn set_health_feedback_listener<F>(&self, listener: F)
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        *self.health_feedback.write() = Some(Arc::new(listener));
    }

    fn is_shut_down(&self) -> bool {
        *self.closed.borrow() || self.idle.load(Ordering::Acquire)
    }

    /// Submit one request and await its response.
    ///
    /// The deadline covers both phases of the wait; the error reason
    /// reports which phase timed out, and for a dispatched entry the
    /// send/recv latencies observed so far.
    pub async fn submit(
        &self,
        payload: Bytes,
        forwarded_host: impl Into<String>,
        timeout: Duration,
        priority: u64,
    ) -> Result<Bytes, Error> {
        if self.is_shut_down() {
            return Err(Error::Closed);
        }
        let (entry, rx) = Entry::with_channel(payload, priority, forwarded_host.into());
        let guard = CancelOnDrop::new(entry.clone());
        let deadline = tokio::time::Instant::now() + timeout;
        let mut closed = self.closed.subscribe();

        tokio::select! {
            enqueued = self.tx.send(entry.clone()) => {
                if enqueued.is_err() {
                    entry.cancel();
                    guard.disarm();
                    return Err(Error::Closed);
                }
            }
            _ = closed.wait_for(|closed| *closed) => {
                entry.cancel();
                guard.disarm();
                return Err(Error::Closed);
            }
            _ = tokio::time::sleep_until(deadline) => {
                entry.cancel();
                guard.disarm();
                return Err(Error::deadline("wait sendLoop"));
            }
        }

        let result = tokio::select! {
            resp = rx => match resp {
                Ok(result) => result,
                Err(_) => Err(Error::Closed),
            },
            _ = closed.wait_for(|closed| *closed) => {
                entry.cancel();
                Err(Error::Closed)
            }
            _ = tokio::time::sleep_until(deadline) => {
                entry.cancel();
                Err(Error::deadline(format!(
                    "wait recvLoop timeout, timeout={:?}, send={:?}, recv={:?}",
                    timeout,
                    entry.send_latency(),
                    entry.recv_latency(),
                )))
            }
        };
        guard.disarm();
        result
    }

    /// Submit one request; the callback receives the terminal result
    /// once the response or an error arrives.
    ///
    /// The deadline bounds the enqueue phase: an entry that cannot reach
    /// the send loop in time fails with `"wait sendLoop"`. Once enqueued,
    /// delivery is driven entirely through the callback.
    pub async fn submit_with_callback<F>(
        &self,
        payload: Bytes,
        forwarded_host: impl Into<String>,
        timeout: Duration,
        priority: u64,
        callback: F,
    ) where
        F: FnOnce(Result<Bytes, Error>) + Send + 'static,
    {
        let entry = Entry::with_callback(
            payload,
            priority,
            forwarded_host.into(),
            Box::new(callback),
        );
        if self.is_shut_down() {
            entry.fail(Error::Closed);
            return;
        }
        let deadline = tokio::time::Instant::now() + timeout;
        let mut closed = self.closed.subscribe();
        tokio::select! {
            enqueued = self.tx.send(entry.clone()) => {
                if enqueued.is_err() {
                    entry.fail(Error::Closed);
                }
            }
            _ = closed.wait_for(|closed| *closed) => {
                entry.cancel();
                entry.fail(Error::Closed);
            }
            _ = tokio::time::sleep_until(deadline) => {
                entry.cancel();
                entry.fail(Error::deadline("wait sendLoop"));
            }
        }
    }

    /// Close the connection: stop the send loop, close every stream
    /// client, and fail their pending entries.
    pub fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        for client in &self.clients {
            client.close();
        }
    }
}

/// Sets the cancel flag (and delivers the cancellation, if nothing beat
/// it) when a submitter's future is dropped mid-wait.
struct CancelOnDrop {
    entry: Option<Arc<Entry>>,
}

impl CancelOnDrop {
    fn new(entry: Arc<Entry>) -> Self {
        Self { entry: Some(entry) }
    }

    fn disarm(mut self) {
        self.entry = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            entry.cancel();
            entry.fail(Error::Canceled);
        }
    }
}

enum FetchOutcome {
    Closed,
    Idle,
    Head {
        /// Time between the previous round's latest arrival and this head.
        interval: Option<Duration>,
        received_at: Instant,
    },
}

/// State owned by the send-loop task.
struct SendLoop<C: Connection> {
    conn: Arc<BatchConn<C>>,
    rx: mpsc::Receiver<Arc<Entry>>,
    builder: BatchBuilder,
    trigger: Trigger,
    /// EWMA of realised batch sizes, weight 0.2 on the newest round.
    avg_batch_wait_size: f64,
    cursor: usize,
}

impl<C: Connection> SendLoop<C> {
    async fn run(mut self) {
        loop {
            match AssertUnwindSafe(self.round()).catch_unwind().await {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(())) => return,
                Err(panic) => {
                    Metrics::get()
                        .loop_panic_total
                        .with_label_values(&["send"])
                        .inc();
                    error!(
                        addr = %self.conn.target,
                        panic = panic_msg(panic.as_ref()),
                        "batch send loop panicked, restarting"
                    );
                }
            }
        }
    }

    async fn round(&mut self) -> ControlFlow<()> {
        let conn = self.conn.clone();
        let cfg = &conn.cfg;
        let metrics = Metrics::get();
        self.builder.reset();

        let wait_head_start = Instant::now();
        let (interval, head_received_at) = match self.fetch_all_pending_requests().await {
            FetchOutcome::Closed => {
                // Entries still queued or in flight through the channel
                // must see their terminal event.
                while let Ok(entry) = self.rx.try_recv() {
                    self.builder.push(entry);
                }
                self.builder.cancel(&Error::Closed);
                return ControlFlow::Break(());
            }
            FetchOutcome::Idle => {
                self.builder.cancel(&Error::Closed);
                return ControlFlow::Break(());
            }
            FetchOutcome::Head {
                interval,
                received_at,
            } => (interval, received_at),
        };
        metrics
            .send_loop_duration_seconds
            .with_label_values(&["wait-head"])
            .observe(wait_head_start.elapsed().as_secs_f64());
        if self.builder.is_empty() {
            return ControlFlow::Break(());
        }

        let wait_more_start = Instant::now();
        if self.builder.len() < cfg.max_batch_size {
            let load = conn.shared_load.load(Ordering::Acquire);
            if !cfg.max_batch_wait_time.is_zero() && load > cfg.overload_threshold {
                metrics.wait_on_overload_total.inc();
                self.fetch_more(cfg.batch_wait_size, cfg.max_batch_wait_time)
                    .await;
            } else {
                let turbo_wait = self.trigger.turbo_wait();
                if let Some(interval) =
                    interval.filter(|i| !turbo_wait.is_zero() && !i.is_zero())
                {
                    if self.trigger.need_fetch_more(interval) {
                        let want = self
                            .trigger
                            .preferred_batch_wait_size(self.avg_batch_wait_size, cfg.batch_wait_size);
                        let before = self.builder.len();
                        self.fetch_more(want, turbo_wait).await;
                        metrics
                            .best_batch_size
                            .observe((self.builder.len() - before) as f64);
                    }
                }
            }
        }
        metrics
            .send_loop_duration_seconds
            .with_label_values(&["wait-more"])
            .observe(wait_more_start.elapsed().as_secs_f64());

        self.avg_batch_wait_size =
            0.2 * self.builder.len() as f64 + 0.8 * self.avg_batch_wait_size;
        metrics.adaptive_batch_size.observe(self.avg_batch_wait_size);
        metrics.batch_size.observe(self.builder.len() as f64);

        let send_start = Instant::now();
        self.dispatch(&conn).await;
        metrics
            .send_loop_duration_seconds
            .with_label_values(&["send"])
            .observe(send_start.elapsed().as_secs_f64());

        let since_head = head_received_at.elapsed();
        if since_head > TAIL_LAT_THRESHOLD {
            metrics
                .tail_latency_seconds
                .with_label_values(&["send"])
                .observe(since_head.as_secs_f64());
        }
        ControlFlow::Continue(())
    }

    /// Block for the round's head entry, then drain whatever else is
    /// already queued, up to the batch cap. The idle timer spans the
    /// head wait: a window with no arrivals at all retires the loop.
    async fn fetch_all_pending_requests(&mut self) -> FetchOutcome {
        let conn = self.conn.clone();
        let cfg = &conn.cfg;
        let mut closed = conn.closed.subscribe();
        let idle_timer = tokio::time::sleep(cfg.idle_timeout);
        tokio::pin!(idle_timer);

        let head = tokio::select! {
            // An entry that raced the idle timer still wins the round.
            biased;
            entry = self.rx.recv() => match entry {
                Some(entry) => entry,
                None => return FetchOutcome::Closed,
            },
            _ = closed.wait_for(|closed| *closed) => return FetchOutcome::Closed,
            _ = &mut idle_timer => {
                conn.idle.store(true, Ordering::Release);
                if conn.idle_notify.fire() {
                    debug!(addr = %conn.target, "batch connection idle, notifying owner");
                }
                return FetchOutcome::Idle;
            }
        };

        let interval = self.builder.latest_req_start().and_then(|latest| {
            let head_start = head.start();
            (head_start > latest).then(|| head_start - latest)
        });
        if let Some(interval) = interval {
            Metrics::get()
                .head_arrival_interval_seconds
                .observe(interval.as_secs_f64());
        }
        let received_at = Instant::now();

        self.builder.push(head);
        while self.builder.len() < cfg.max_batch_size {
            match self.rx.try_recv() {
                Ok(entry) => self.builder.push(entry),
                Err(_) => break,
            }
        }
        Metrics::get()
            .pending_requests
            .observe((self.builder.len() + self.rx.len()) as f64);
        FetchOutcome::Head {
            interval,
            received_at,
        }
    }

    /// Wait up to `max_wait` for the batch to reach `batch_wait_size`,
    /// then yield exactly once and drain whatever has landed, up to the
    /// batch cap.
    async fn fetch_more(&mut self, batch_wait_size: usize, max_wait: Duration) {
        let max_batch_size = self.conn.cfg.max_batch_size;
        let timer = tokio::time::sleep(max_wait);
        tokio::pin!(timer);
        while self.builder.len() < batch_wait_size {
            tokio::select! {
                entry = self.rx.recv() => match entry {
                    Some(entry) => self.builder.push(entry),
                    None => break,
                },
                _ = &mut timer => break,
            }
        }
        // The yield lets entries submitted during the wait reach the
        // channel before the final drain.
        tokio::task::yield_now().await;
        while self.builder.len() < max_batch_size {
            match self.rx.try_recv() {
                Ok(entry) => self.builder.push(entry),
                Err(_) => break,
            }
        }
    }

    /// Round-robin one stream client with capacity (or a high-priority
    /// task in hand) and flush the builder through it.
    async fn dispatch(&mut self, conn: &Arc<BatchConn<C>>) {
        let metrics = Metrics::get();
        let clients = &conn.clients;
        for i in 0..clients.len() {
            let idx = (self.cursor + i) % clients.len();
            let client = clients[idx].clone();
            if client.available() == 0 && !self.builder.has_high_priority_task() {
                metrics
                    .no_available_connection_total
                    .with_label_values(&["exhausted"])
                    .inc();
                continue;
            }
            let Some(_permit) = client.try_lock_for_send().await else {
                debug!(addr = %conn.target, "stream client is recreating, trying next");
                metrics
                    .no_available_connection_total
                    .with_label_values(&["recreating"])
                    .inc();
                continue;
            };
            self.cursor = idx + 1;

            let available = client.available();
            let collect_client = client.clone();
            let (direct, forwarded) = self.builder.build_with_limit(available, |id, entry| {
                entry.observe_send_latency(entry.start().elapsed());
                collect_client.insert_pending(id, entry.clone());
            });
            if let Some(batch) = direct {
                client.send_batch("", &batch).await;
            }
            for (host, batch) in forwarded {
                client.send_batch(&host, &batch).await;
            }
            return;
        }

        // Nothing was selectable. Without a concurrency limit there is no
        // capacity to wait for, so the queued entries cannot make progress.
        if conn.cfg.max_concurrency_request_limit == u64::MAX && !self.builder.is_empty() {
            self.builder.cancel(&Error::NoAvailableConnections);
        }
    }
}
