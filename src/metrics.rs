//! In-process pipeline counters and timings.
//!
//! Counters are monotonically increasing and named `scribe.<area>.<event>`.
//! Timings keep the most recent samples per name for count/avg/min/max.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;

use crate::config::ExecutionMode;

/// Samples kept per timing name.
const MAX_TIMING_SAMPLES: usize = 1000;

pub const ANALYZE_DURATION: &str = "scribe.analyze.duration";
pub const CACHE_HIT: &str = "scribe.cache.hit";
pub const CACHE_MISS: &str = "scribe.cache.miss";
pub const DRAFTS_CREATED: &str = "scribe.drafts.created";
pub const DRAFTS_UPDATED: &str = "scribe.drafts.updated";
pub const DRAFTS_VALIDATED: &str = "scribe.drafts.validated";
pub const DRAFTS_ALREADY_VALIDATED: &str = "scribe.drafts.already_validated";
pub const VALIDATION_NODES_CREATED: &str = "scribe.validation.nodes_created";
pub const VALIDATION_RELATIONS_PROJECTED: &str = "scribe.validation.relations_projected";
pub const SAFETY_ALERTS: &str = "scribe.safety.alerts";
pub const GRAPH_PROJECTION_ERROR: &str = "scribe.graph.projection_error";
pub const JOB_COMPLETED: &str = "scribe.job.completed";
pub const JOB_FAILED: &str = "scribe.job.failed";
pub const JOB_RETRIED: &str = "scribe.job.retried";
pub const JOB_VALIDATION_ERROR: &str = "scribe.job.validation_error";

/// `scribe.analyze.<mode>`, one per structuring request.
pub fn analyze_counter(mode: ExecutionMode) -> String {
    format!("scribe.analyze.{}", mode.metric_name())
}

/// `scribe.fallback.<mode>`, one per MOCK substitution.
pub fn fallback_counter(mode: ExecutionMode) -> String {
    format!("scribe.fallback.{}", mode.metric_name())
}

/// Aggregate of one timing series, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimingSummary {
    pub count: usize,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub timings: BTreeMap<String, TimingSummary>,
}

#[derive(Default)]
struct MetricsState {
    counters: HashMap<String, u64>,
    timings: HashMap<String, VecDeque<Duration>>,
}

#[derive(Default)]
pub struct PipelineCounters {
    state: Mutex<MetricsState>,
}

impl PipelineCounters {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MetricsState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn increment(&self, name: &str) {
        self.increment_by(name, 1);
    }

    pub fn increment_by(&self, name: &str, amount: u64) {
        if amount == 0 {
            return;
        }
        let mut state = self.state();
        *state.counters.entry(name.to_string()).or_insert(0) += amount;
    }

    pub fn get(&self, name: &str) -> u64 {
        self.state().counters.get(name).copied().unwrap_or(0)
    }

    pub fn record_timing(&self, name: &str, elapsed: Duration) {
        let mut state = self.state();
        let samples = state.timings.entry(name.to_string()).or_default();
        if samples.len() == MAX_TIMING_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(elapsed);
    }

    pub fn timing(&self, name: &str) -> Option<TimingSummary> {
        self.state().timings.get(name).and_then(summarize)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state();
        MetricsSnapshot {
            counters: state
                .counters
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            timings: state
                .timings
                .iter()
                .filter_map(|(k, samples)| summarize(samples).map(|s| (k.clone(), s)))
                .collect(),
        }
    }
}

fn summarize(samples: &VecDeque<Duration>) -> Option<TimingSummary> {
    if samples.is_empty() {
        return None;
    }
    let millis: Vec<f64> = samples.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
    let total: f64 = millis.iter().sum();
    Some(TimingSummary {
        count: millis.len(),
        avg_ms: total / millis.len() as f64,
        min_ms: millis.iter().copied().fold(f64::INFINITY, f64::min),
        max_ms: millis.iter().copied().fold(0.0, f64::max),
    })
}
