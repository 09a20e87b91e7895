//! Configuration for a batch connection.

use crate::backoff::RetryConfig;
use crate::trigger::{Trigger, TriggerOptions, TriggerStrategy};
use serde::Deserialize;
use std::sync::Once;
use std::time::Duration;
use tracing::warn;

/// Window without arrivals after which a connection reports itself idle.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// Bound on waiting for connection readiness when (re)creating streams.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Round durations above this are recorded as tail latency.
pub(crate) const TAIL_LAT_THRESHOLD: Duration = Duration::from_millis(20);

static POLICY_WARN: Once = Once::new();

/// JSON shape of a custom batching policy, e.g.
/// `{"v": "time_based", "t": 0.0001, "n": 5, "w": 0.2, "p": 0.8, "q": 0.8}`.
#[derive(Deserialize)]
struct CustomPolicy {
    v: TriggerStrategy,
    #[serde(flatten)]
    opts: TriggerOptions,
}

/// Batching policy selecting the adaptive trigger.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum BatchPolicy {
    /// Never wait for more requests.
    #[default]
    Basic,
    /// Time-based trigger with a 100 µs wait window.
    Standard,
    /// Always wait, with a 100 µs wait window.
    Positive,
    /// Caller-supplied strategy and tunables.
    Custom {
        strategy: TriggerStrategy,
        options: TriggerOptions,
    },
}

impl BatchPolicy {
    /// Parse a policy from its configuration string: one of the preset
    /// names, or a JSON object for a custom policy. Invalid input falls
    /// back to the default policy and warns once per process.
    pub fn parse(input: &str) -> Self {
        match input.trim() {
            "basic" => BatchPolicy::Basic,
            "standard" => BatchPolicy::Standard,
            "positive" => BatchPolicy::Positive,
            other => match serde_json::from_str::<CustomPolicy>(other) {
                Ok(custom) if (0.0..=1.0).contains(&custom.opts.w) && custom.opts.t >= 0.0 => {
                    BatchPolicy::Custom {
                        strategy: custom.v,
                        options: custom.opts,
                    }
                }
                _ => {
                    POLICY_WARN.call_once(|| {
                        warn!(policy = other, "invalid batch policy, using default");
                    });
                    BatchPolicy::default()
                }
            },
        }
    }

    pub(crate) fn trigger(&self) -> Trigger {
        let (strategy, options) = match self {
            BatchPolicy::Basic => (TriggerStrategy::Always, TriggerOptions::ZERO),
            BatchPolicy::Standard => (
                TriggerStrategy::TimeBased,
                TriggerOptions {
                    t: 1e-4,
                    n: 5,
                    w: 0.2,
                    p: 0.8,
                    q: 0.8,
                },
            ),
            BatchPolicy::Positive => (
                TriggerStrategy::Always,
                TriggerOptions {
                    t: 1e-4,
                    ..TriggerOptions::ZERO
                },
            ),
            BatchPolicy::Custom { strategy, options } => (*strategy, *options),
        };
        Trigger::new(strategy, options)
    }
}

/// Configuration for a [`BatchConn`](crate::BatchConn).
#[derive(Debug, Clone)]
pub struct Config {
    /// Cap on entries per wire batch; also the fan-in channel capacity.
    pub max_batch_size: usize,
    /// Default target size when a round waits for more requests.
    pub batch_wait_size: usize,
    /// How long to wait for more requests while the remote transport
    /// layer is overloaded. Zero disables overload waiting.
    pub max_batch_wait_time: Duration,
    /// Reported transport load above which overload waiting engages.
    pub overload_threshold: u64,
    /// Adaptive batching policy.
    pub batch_policy: BatchPolicy,
    /// Per-stream in-flight request cap. `u64::MAX` disables the limit;
    /// in that legacy mode a round with no selectable stream cancels its
    /// queued entries instead of leaving them waiting for capacity.
    pub max_concurrency_request_limit: u64,
    /// Bound on waiting for connection readiness.
    pub dial_timeout: Duration,
    /// Window without arrivals after which the connection reports idle.
    pub idle_timeout: Duration,
    /// Pacing of stream-recreation attempts after a failure.
    pub recreate_backoff: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_batch_size: 128,
            batch_wait_size: 8,
            max_batch_wait_time: Duration::ZERO,
            overload_threshold: 200,
            batch_policy: BatchPolicy::default(),
            max_concurrency_request_limit: u64::MAX,
            dial_timeout: DIAL_TIMEOUT,
            idle_timeout: IDLE_TIMEOUT,
            recreate_backoff: RetryConfig::default(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn with_batch_wait_size(mut self, size: usize) -> Self {
        self.batch_wait_size = size;
        self
    }

    pub fn with_max_batch_wait_time(mut self, wait: Duration) -> Self {
        self.max_batch_wait_time = wait;
        self
    }

    pub fn with_overload_threshold(mut self, threshold: u64) -> Self {
        self.overload_threshold = threshold;
        self
    }

    pub fn with_batch_policy(mut self, policy: BatchPolicy) -> Self {
        self.batch_policy = policy;
        self
    }

    pub fn with_max_concurrency_request_limit(mut self, limit: u64) -> Self {
        self.max_concurrency_request_limit = limit;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_recreate_backoff(mut self, backoff: RetryConfig) -> Self {
        self.recreate_backoff = backoff;
        self
    }
}
