//! Health evaluation over sliding windows of aggregated traffic samples.
//!
//! Collectors report per-window request counts, error counts, and p99
//! latency for each (operation, target) pair. The evaluator compares the
//! new path against the legacy baseline over a bounded horizon and emits a
//! verdict. All arithmetic is integer-only; rates are expressed in
//! millionths so verdicts are bit-identical across platforms.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::routing_policy::Target;

pub const MILLION: u64 = 1_000_000;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Window geometry and verdict thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Width of one aggregation window.
    pub window_ms: u64,
    /// Retained windows per (operation, target); the evaluation horizon is
    /// `window_count * window_ms` behind the newest window.
    pub window_count: u32,
    /// Error-rate excess of the new path over legacy, in millionths, beyond
    /// which the verdict is `Unsafe`.
    pub error_rate_delta_threshold_millionths: u64,
    /// Latency excess of the new path p99 over legacy, in milliseconds,
    /// beyond which the verdict is `Unsafe`.
    pub latency_delta_threshold_ms: u64,
    /// Below this many new-path requests in the horizon, the verdict is
    /// `Degraded` for lack of evidence rather than `Unsafe`.
    pub min_sample_count: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            window_count: 5,
            error_rate_delta_threshold_millionths: 20_000,
            latency_delta_threshold_ms: 500,
            min_sample_count: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Samples and verdicts
// ---------------------------------------------------------------------------

/// Pre-aggregated traffic observations for one window on one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSample {
    pub operation_id: String,
    pub target: Target,
    /// Window start; aligned down to the configured window grid on ingest.
    pub window_start_ms: u64,
    pub request_count: u64,
    pub error_count: u64,
    pub p99_latency_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unsafe,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => f.write_str("healthy"),
            Self::Degraded => f.write_str("degraded"),
            Self::Unsafe => f.write_str("unsafe"),
        }
    }
}

/// Evaluation outcome for the new path of one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthVerdict {
    pub operation_id: String,
    pub target: Target,
    pub state: HealthState,
    /// Machine-readable diagnostics, e.g.
    /// `error_rate_delta_millionths=180000 above threshold 20000`.
    pub reasons: Vec<String>,
    pub evaluated_at_ms: u64,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthError {
    EmptyOperationId,
    ErrorCountExceedsRequests { error_count: u64, request_count: u64 },
}

impl fmt::Display for HealthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyOperationId => f.write_str("health sample has empty operation id"),
            Self::ErrorCountExceedsRequests {
                error_count,
                request_count,
            } => write!(
                f,
                "error count {error_count} exceeds request count {request_count}"
            ),
        }
    }
}

impl std::error::Error for HealthError {}

// ---------------------------------------------------------------------------
// HealthEvaluator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
struct WindowAggregate {
    request_count: u64,
    error_count: u64,
    p99_latency_ms: u64,
}

/// Accumulates samples into per-target window maps and renders verdicts.
#[derive(Debug, Default)]
pub struct HealthEvaluator {
    config: HealthConfig,
    windows: BTreeMap<(String, Target), BTreeMap<u64, WindowAggregate>>,
    last_verdicts: BTreeMap<String, HealthVerdict>,
}

impl HealthEvaluator {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            windows: BTreeMap::new(),
            last_verdicts: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Ingest one sample. Counts merge additively into the window aligned to
    /// the configured grid; within a window the larger reported p99 wins.
    /// Windows older than the retention horizon behind the newest window are
    /// dropped.
    pub fn report_sample(&mut self, sample: HealthSample) -> Result<(), HealthError> {
        if sample.operation_id.is_empty() {
            return Err(HealthError::EmptyOperationId);
        }
        if sample.error_count > sample.request_count {
            return Err(HealthError::ErrorCountExceedsRequests {
                error_count: sample.error_count,
                request_count: sample.request_count,
            });
        }

        let window_start = sample.window_start_ms - sample.window_start_ms % self.config.window_ms;
        let key = (sample.operation_id.clone(), sample.target);
        let windows = self.windows.entry(key).or_default();
        let aggregate = windows.entry(window_start).or_default();
        aggregate.request_count += sample.request_count;
        aggregate.error_count += sample.error_count;
        aggregate.p99_latency_ms = aggregate.p99_latency_ms.max(sample.p99_latency_ms);

        let horizon = u64::from(self.config.window_count) * self.config.window_ms;
        if let Some(newest) = windows.keys().next_back().copied() {
            let cutoff = newest.saturating_sub(horizon.saturating_sub(self.config.window_ms));
            windows.retain(|start, _| *start >= cutoff);
        }
        Ok(())
    }

    /// Evaluate the new path of one operation against its legacy baseline.
    /// Pure with respect to the accumulated windows; repeated calls with the
    /// same state yield the same verdict (modulo `evaluated_at_ms`).
    pub fn evaluate(&mut self, operation_id: &str, now_ms: u64) -> HealthVerdict {
        let new_stats = self.aggregate(operation_id, Target::New);
        let legacy_stats = self.aggregate(operation_id, Target::Legacy);

        let mut reasons = Vec::new();
        let state = if new_stats.request_count < self.config.min_sample_count {
            reasons.push(format!(
                "insufficient_samples: {} new-path requests, need {}",
                new_stats.request_count, self.config.min_sample_count
            ));
            HealthState::Degraded
        } else {
            let new_error_rate = rate_millionths(new_stats.error_count, new_stats.request_count);
            let legacy_error_rate =
                rate_millionths(legacy_stats.error_count, legacy_stats.request_count);
            let error_delta = new_error_rate.saturating_sub(legacy_error_rate);
            let latency_delta = new_stats
                .p99_latency_ms
                .saturating_sub(legacy_stats.p99_latency_ms);

            let mut unsafe_verdict = false;
            if error_delta > self.config.error_rate_delta_threshold_millionths {
                reasons.push(format!(
                    "error_rate_delta_millionths={error_delta} above threshold {}",
                    self.config.error_rate_delta_threshold_millionths
                ));
                unsafe_verdict = true;
            }
            if latency_delta > self.config.latency_delta_threshold_ms {
                reasons.push(format!(
                    "p99_latency_delta_ms={latency_delta} above threshold {}",
                    self.config.latency_delta_threshold_ms
                ));
                unsafe_verdict = true;
            }

            if unsafe_verdict {
                HealthState::Unsafe
            } else if error_delta > 0 || latency_delta > 0 {
                if error_delta > 0 {
                    reasons.push(format!(
                        "error_rate_delta_millionths={error_delta} within threshold"
                    ));
                }
                if latency_delta > 0 {
                    reasons.push(format!("p99_latency_delta_ms={latency_delta} within threshold"));
                }
                HealthState::Degraded
            } else {
                HealthState::Healthy
            }
        };

        let verdict = HealthVerdict {
            operation_id: operation_id.to_string(),
            target: Target::New,
            state,
            reasons,
            evaluated_at_ms: now_ms,
        };
        self.last_verdicts
            .insert(operation_id.to_string(), verdict.clone());
        verdict
    }

    /// Most recent verdict for an operation, if one was ever rendered.
    pub fn last_verdict(&self, operation_id: &str) -> Option<&HealthVerdict> {
        self.last_verdicts.get(operation_id)
    }

    /// Operations with any retained window data, in deterministic order.
    pub fn observed_operations(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .windows
            .keys()
            .map(|(operation_id, _)| operation_id.clone())
            .collect();
        ids.dedup();
        ids
    }

    /// Combine the retained windows for one (operation, target). Counts sum;
    /// the cross-window p99 is a request-weighted average of window p99s.
    fn aggregate(&self, operation_id: &str, target: Target) -> WindowAggregate {
        let Some(windows) = self.windows.get(&(operation_id.to_string(), target)) else {
            return WindowAggregate::default();
        };
        let mut combined = WindowAggregate::default();
        let mut weighted_latency: u128 = 0;
        for aggregate in windows.values() {
            combined.request_count += aggregate.request_count;
            combined.error_count += aggregate.error_count;
            weighted_latency +=
                u128::from(aggregate.p99_latency_ms) * u128::from(aggregate.request_count);
        }
        if combined.request_count > 0 {
            combined.p99_latency_ms = (weighted_latency / u128::from(combined.request_count)) as u64;
        }
        combined
    }
}

fn rate_millionths(numerator: u64, denominator: u64) -> u64 {
    if denominator == 0 {
        return 0;
    }
    ((u128::from(numerator) * u128::from(MILLION)) / u128::from(denominator)) as u64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
