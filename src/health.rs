//! Health checks and pipeline statistics.
//!
//! Probes are for reporting only. Nothing here gates a request.

use std::fmt::Display;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::ExecutionMode;
use crate::db::{DatabaseError, DraftCounts, DraftStore};
use crate::graph::{GraphCounts, GraphStore};
use crate::metrics::{MetricsSnapshot, PipelineCounters};
use crate::pipeline::cache::{CacheStats, ResultCache};
use crate::pipeline::jobs::{JobQueue, QueueCounts};
use crate::pipeline::semaphore::ConcurrencySemaphore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Result of one store round-trip.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreProbe {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StoreProbe {
    pub fn from_ping<E: Display>(result: Result<Duration, E>) -> Self {
        match result {
            Ok(latency) => Self {
                connected: true,
                latency_ms: Some(latency.as_secs_f64() * 1000.0),
                error: None,
            },
            Err(e) => Self {
                connected: false,
                latency_ms: None,
                error: Some(e.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub mode: ExecutionMode,
    pub relational: StoreProbe,
    pub graph: StoreProbe,
    pub coordination: StoreProbe,
    /// `redis` or `memory`.
    pub coordination_backend: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Overall status from the three checks.
///
/// The relational store holds the drafts, so losing it is `Unhealthy`.
/// Losing either secondary store is `Degraded`.
pub fn assess(
    relational: &StoreProbe,
    graph: &StoreProbe,
    coordination: &StoreProbe,
) -> (HealthStatus, Option<String>) {
    let down: Vec<&str> = [
        ("relational store", relational),
        ("graph store", graph),
        ("coordination store", coordination),
    ]
    .iter()
    .filter(|(_, check)| !check.connected)
    .map(|(name, _)| *name)
    .collect();

    if down.is_empty() {
        return (HealthStatus::Healthy, None);
    }
    let status = if relational.connected {
        HealthStatus::Degraded
    } else {
        HealthStatus::Unhealthy
    };
    (status, Some(format!("Unavailable: {}", down.join(", "))))
}

pub fn check_health(
    mode: ExecutionMode,
    store: &dyn DraftStore,
    graph: &dyn GraphStore,
    semaphore: &ConcurrencySemaphore,
) -> HealthReport {
    let relational = StoreProbe::from_ping(store.ping());
    let graph = StoreProbe::from_ping(graph.ping());
    let coordination = StoreProbe::from_ping(semaphore.ping());
    let (status, message) = assess(&relational, &graph, &coordination);

    if status != HealthStatus::Healthy {
        tracing::warn!(status = ?status, message = message.as_deref().unwrap_or(""), "Health check");
    }

    HealthReport {
        status,
        mode,
        relational,
        graph,
        coordination,
        coordination_backend: semaphore.store_name(),
        message,
        checked_at: Utc::now(),
    }
}

// ═══════════════════════════════════════════
// Stats
// ═══════════════════════════════════════════

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    pub drafts: DraftCounts,
    pub semantic_nodes: i64,
    /// `None` while the graph store is unreachable.
    pub graph: Option<GraphCounts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueCounts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheStats>,
    pub metrics: MetricsSnapshot,
}

/// Fails only when the relational store cannot be read.
pub fn get_stats(
    store: &dyn DraftStore,
    graph: &dyn GraphStore,
    queue: Option<&JobQueue>,
    cache: Option<&ResultCache>,
    counters: &PipelineCounters,
) -> Result<PipelineStats, DatabaseError> {
    let graph = match graph.counts() {
        Ok(counts) => Some(counts),
        Err(e) => {
            tracing::debug!(error = %e, "Graph counts unavailable");
            None
        }
    };

    Ok(PipelineStats {
        drafts: store.draft_counts()?,
        semantic_nodes: store.semantic_node_count()?,
        graph,
        queue: queue.map(JobQueue::counts),
        cache: cache.map(ResultCache::stats),
        metrics: counters.snapshot(),
    })
}
