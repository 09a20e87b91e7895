//! Adaptive decision of whether a batching round should wait for more
//! requests, based on observed arrival intervals.

use serde::Deserialize;
use std::time::Duration;

/// How the trigger decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStrategy {
    /// Always wait for more requests.
    Always,
    /// Wait while the estimated arrival interval stays below a fraction
    /// of the wait window.
    TimeBased,
    /// Wait while the estimated probability of a fast next arrival stays
    /// above a threshold.
    ProbBased,
}

/// Tunables for a trigger strategy.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct TriggerOptions {
    /// Wait window in seconds.
    #[serde(default)]
    pub t: f64,
    /// Cap on an observed arrival interval, as a multiple of `t`.
    #[serde(default)]
    pub n: u32,
    /// EWMA weight in `[0, 1]` given to the newest observation.
    #[serde(default)]
    pub w: f64,
    /// Decision threshold.
    #[serde(default)]
    pub p: f64,
    /// Fractional part at or above which the adaptive wait size rounds up.
    #[serde(default)]
    pub q: f64,
}

impl TriggerOptions {
    pub(crate) const ZERO: TriggerOptions = TriggerOptions {
        t: 0.0,
        n: 0,
        w: 0.0,
        p: 0.0,
        q: 0.0,
    };
}

/// Per-round batching decision state machine.
pub(crate) struct Trigger {
    strategy: TriggerStrategy,
    opts: TriggerOptions,
    est_arrival_interval: Option<f64>,
    est_fetch_more_prob: f64,
}

impl Trigger {
    pub(crate) fn new(strategy: TriggerStrategy, opts: TriggerOptions) -> Self {
        Self {
            strategy,
            opts,
            est_arrival_interval: None,
            est_fetch_more_prob: 0.0,
        }
    }

    /// The turbo-mode wait window; zero disables turbo mode.
    pub(crate) fn turbo_wait(&self) -> Duration {
        Duration::from_secs_f64(self.opts.t)
    }

    /// Decide whether this round should wait for more requests, feeding
    /// the observed head arrival interval into the estimator.
    pub(crate) fn need_fetch_more(&mut self, arrival_interval: Duration) -> bool {
        match self.strategy {
            TriggerStrategy::Always => true,
            TriggerStrategy::TimeBased => {
                let cap = f64::from(self.opts.n) * self.opts.t;
                let x = arrival_interval.as_secs_f64().min(cap);
                let est = match self.est_arrival_interval {
                    None => x,
                    Some(prev) => self.opts.w * x + (1.0 - self.opts.w) * prev,
                };
                self.est_arrival_interval = Some(est);
                est < self.opts.p * self.opts.t
            }
            TriggerStrategy::ProbBased => {
                let this_prob = if arrival_interval.as_secs_f64() < self.opts.t {
                    1.0
                } else {
                    0.0
                };
                self.est_fetch_more_prob =
                    self.opts.w * this_prob + (1.0 - self.opts.w) * self.est_fetch_more_prob;
                self.est_fetch_more_prob > self.opts.p
            }
        }
    }

    /// How many entries a turbo wait should aim for, given the running
    /// average of realised batch sizes.
    pub(crate) fn preferred_batch_wait_size(
        &self,
        avg_batch_wait_size: f64,
        default_wait: usize,
    ) -> usize {
        if self.strategy == TriggerStrategy::Always {
            return default_wait;
        }
        let whole = avg_batch_wait_size.trunc() as usize;
        let fraction = avg_batch_wait_size.fract();
        whole + usize::from(fraction >= self.opts.q)
    }

    #[cfg(test)]
    pub(crate) fn est_arrival_interval(&self) -> Option<f64> {
        self.est_arrival_interval
    }

    #[cfg(test)]
    pub(crate) fn est_fetch_more_prob(&self) -> f64 {
        self.est_fetch_more_prob
    }
}
