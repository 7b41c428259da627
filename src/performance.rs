//! Improvement-factor estimation and running pipeline statistics.

use crate::config::PerformanceConfig;
use crate::types::{clamp_unit, lock, Complexity};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Aggregate statistics over every pipeline run recorded so far.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PerformanceSummary {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    /// Mean improvement factor over completed tasks
    pub average_speedup: f64,
    /// Mean phase quality over completed tasks
    pub average_quality: f64,
}

#[derive(Debug)]
pub struct PerformanceEstimator {
    config: PerformanceConfig,
    summary: Mutex<PerformanceSummary>,
}

impl PerformanceEstimator {
    pub fn new(config: PerformanceConfig) -> Self {
        Self {
            config,
            summary: Mutex::new(PerformanceSummary::default()),
        }
    }

    /// Improvement factor for a run that took `execution_time` seconds.
    ///
    /// `baseline / max(time, epsilon)`, clamped to `[0, ceiling]`. Negative or
    /// non-finite times are treated as `epsilon`.
    pub fn estimate(&self, execution_time: f64, complexity: Complexity) -> f64 {
        let time = if execution_time.is_finite() && execution_time >= 0.0 {
            execution_time.max(self.config.epsilon)
        } else {
            self.config.epsilon
        };
        let factor = self.config.baseline(complexity) / time;
        factor.clamp(0.0, self.config.ceiling)
    }

    /// Fold a completed run into the running averages.
    pub fn record(&self, factor: f64, quality: f64) {
        let mut summary = lock(&self.summary);
        let n = summary.tasks_completed as f64;
        summary.average_speedup = (summary.average_speedup * n + factor) / (n + 1.0);
        summary.average_quality = (summary.average_quality * n + clamp_unit(quality)) / (n + 1.0);
        summary.tasks_completed += 1;
    }

    pub fn record_failure(&self) {
        lock(&self.summary).tasks_failed += 1;
    }

    pub fn summary(&self) -> PerformanceSummary {
        lock(&self.summary).clone()
    }
}

impl Default for PerformanceEstimator {
    fn default() -> Self {
        Self::new(PerformanceConfig::default())
    }
}
