//! Latency Model
//!
//! Log-normal latency with a load penalty: real tail latencies are
//! log-normal, and they get worse exactly when the market is bursty. The
//! message rate is estimated over a rolling one-second window of
//! market-update timestamps.

use crate::clock::{Nanos, NANOS_PER_SEC};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::VecDeque;
use std::f64::consts::PI;

/// Hard ceiling: anything above this means the link is down, not slow.
const MAX_LATENCY_SECS: f64 = 1.0;
/// Message rate where congestion starts.
const LOAD_KNEE_PER_SEC: usize = 100;

/// Log-normal latency sampler with load-sensitive scaling.
#[derive(Debug)]
pub struct LatencyModel {
    mu: f64,
    sigma: f64,
    window: VecDeque<Nanos>,
}

impl LatencyModel {
    /// `base_ms` is the median latency in milliseconds; `sigma` the
    /// log-normal shape.
    pub fn new(base_ms: f64, sigma: f64) -> Self {
        Self {
            mu: (base_ms / 1_000.0).max(1e-6).ln(),
            sigma,
            window: VecDeque::new(),
        }
    }

    /// Record a market update for the load estimate.
    pub fn record_message(&mut self, now: Nanos) {
        self.window.push_back(now);
        let cutoff = now - NANOS_PER_SEC;
        while let Some(&front) = self.window.front() {
            if front <= cutoff {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Messages observed in the trailing second.
    pub fn message_rate(&self) -> usize {
        self.window.len()
    }

    /// Sample one latency in nanoseconds.
    pub fn sample(&self, rng: &mut ChaCha8Rng) -> Nanos {
        let base = (self.mu + self.sigma * sample_standard_normal(rng)).exp();

        let rate = self.message_rate();
        let load_penalty = if rate > LOAD_KNEE_PER_SEC {
            (rate - LOAD_KNEE_PER_SEC) as f64 / 1_000.0
        } else {
            0.0
        };

        let secs = (base * (1.0 + load_penalty)).min(MAX_LATENCY_SECS);
        (secs * NANOS_PER_SEC as f64) as Nanos
    }
}

/// Box-Muller transform.
fn sample_standard_normal(rng: &mut ChaCha8Rng) -> f64 {
    let u1: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}
