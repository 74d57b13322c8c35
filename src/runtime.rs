//! Wiring of stores, backends and the job worker from configuration.

use std::sync::Arc;

use thiserror::Error;

use crate::config::{ConfigError, ExecutionMode, ScribeConfig};
use crate::db::{DatabaseError, DraftStore, SqliteDraftStore};
use crate::graph::{DisconnectedGraphStore, GraphProjector, GraphStore, SqliteGraphStore};
use crate::health::{self, HealthReport, PipelineStats};
use crate::metrics::PipelineCounters;
use crate::pipeline::cache::ResultCache;
use crate::pipeline::jobs::{
    start_structuring_worker, JobOptions, JobQueue, RetentionPolicy, StructuringJobHandler,
    WorkerHandle, DEFAULT_JOB_TIMEOUT,
};
use crate::pipeline::semaphore::{
    ConcurrencySemaphore, CoordinationStore, InMemoryCoordinationStore, RedisCoordinationStore,
    SemaphoreError,
};
use crate::pipeline::structuring::{
    CloudChatClient, ConsultationStructurer, InferenceBackend, LocalSidecarClient,
};

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Cannot create data directory {path}: {source}")]
    DataDir {
        path: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("Coordination store: {0}")]
    Coordination(#[from] SemaphoreError),
}

/// Everything a running pipeline needs, built once at start-up.
pub struct ScribeRuntime {
    config: ScribeConfig,
    store: Arc<dyn DraftStore>,
    graph: Arc<dyn GraphStore>,
    semaphore: Arc<ConcurrencySemaphore>,
    counters: Arc<PipelineCounters>,
    cache: Option<Arc<ResultCache>>,
    queue: Option<JobQueue>,
    structurer: ConsultationStructurer,
    /// Stops and joins the structuring worker on drop.
    _worker: Option<WorkerHandle>,
}

impl ScribeRuntime {
    pub fn from_env() -> Result<Self, BootstrapError> {
        Self::from_config(ScribeConfig::from_env()?)
    }

    pub fn from_config(config: ScribeConfig) -> Result<Self, BootstrapError> {
        std::fs::create_dir_all(&config.data_dir).map_err(|source| BootstrapError::DataDir {
            path: config.data_dir.display().to_string(),
            source,
        })?;

        let store: Arc<dyn DraftStore> = Arc::new(SqliteDraftStore::open(&config.database_path())?);

        // The graph is derived data; run without it rather than refuse to start.
        let graph: Arc<dyn GraphStore> = match SqliteGraphStore::open(&config.graph_path()) {
            Ok(graph) => Arc::new(graph),
            Err(e) => {
                tracing::warn!(error = %e, "Graph store unavailable, projections will be skipped");
                Arc::new(DisconnectedGraphStore::new(e.to_string()))
            }
        };

        let coordination: Arc<dyn CoordinationStore> = match &config.redis_url {
            Some(url) => Arc::new(RedisCoordinationStore::open(url)?),
            None => Arc::new(InMemoryCoordinationStore::new()),
        };
        let semaphore = Arc::new(ConcurrencySemaphore::new(coordination, &config.lock));
        let counters = Arc::new(PipelineCounters::new());
        let cache = config
            .cache
            .enabled
            .then(|| Arc::new(ResultCache::new(config.cache.ttl)));

        let mut structurer = ConsultationStructurer::new(
            config.mode,
            store.clone(),
            Arc::new(GraphProjector::new(graph.clone())),
            semaphore.clone(),
            counters.clone(),
        );
        if let Some(cache) = &cache {
            structurer = structurer.with_cache(cache.clone());
        }

        match CloudChatClient::new(&config.cloud) {
            Ok(client) => structurer = structurer.with_cloud_backend(Arc::new(client)),
            Err(e) if config.mode == ExecutionMode::Cloud => {
                tracing::warn!(error = %e, "CLOUD mode without a usable backend, every call falls back to MOCK");
            }
            Err(_) => {}
        }

        let mut queue = None;
        let mut worker = None;
        match LocalSidecarClient::new(&config.local) {
            Ok(client) => {
                let local: Arc<dyn InferenceBackend> = Arc::new(client);
                structurer = structurer.with_local_backend(local.clone());

                if config.mode == ExecutionMode::Local && config.use_job_queue {
                    let jobs = JobQueue::with_counters(RetentionPolicy::default(), counters.clone());
                    worker = Some(start_structuring_worker(
                        &jobs,
                        StructuringJobHandler::new(local, semaphore.clone(), counters.clone()),
                    ));
                    structurer = structurer.with_job_queue(jobs.clone(), job_options(&config));
                    queue = Some(jobs);
                }
            }
            Err(e) if config.mode == ExecutionMode::Local => {
                tracing::warn!(error = %e, "LOCAL mode without a usable backend, every call falls back to MOCK");
            }
            Err(_) => {}
        }

        tracing::info!(
            mode = %config.mode,
            cache = cache.is_some(),
            job_queue = queue.is_some(),
            coordination = semaphore.store_name(),
            data_dir = %config.data_dir.display(),
            "Scribe runtime ready"
        );

        Ok(Self {
            config,
            store,
            graph,
            semaphore,
            counters,
            cache,
            queue,
            structurer,
            _worker: worker,
        })
    }

    pub fn config(&self) -> &ScribeConfig {
        &self.config
    }

    pub fn structurer(&self) -> &ConsultationStructurer {
        &self.structurer
    }

    pub fn counters(&self) -> &Arc<PipelineCounters> {
        &self.counters
    }

    pub fn queue(&self) -> Option<&JobQueue> {
        self.queue.as_ref()
    }

    pub fn check_health(&self) -> HealthReport {
        health::check_health(
            self.config.mode,
            self.store.as_ref(),
            self.graph.as_ref(),
            &self.semaphore,
        )
    }

    pub fn stats(&self) -> Result<PipelineStats, DatabaseError> {
        health::get_stats(
            self.store.as_ref(),
            self.graph.as_ref(),
            self.queue.as_ref(),
            self.cache.as_deref(),
            &self.counters,
        )
    }
}

/// Attempts must outlive the sidecar's own HTTP timeout plus the lock wait.
fn job_options(config: &ScribeConfig) -> JobOptions {
    let attempt_budget = config.local.timeout.saturating_add(config.lock.max_wait);
    JobOptions {
        timeout: Some(attempt_budget.max(DEFAULT_JOB_TIMEOUT)),
        ..JobOptions::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthStatus;
    use std::collections::HashMap;
    use std::time::Duration;

    fn config(dir: &std::path::Path, vars: &[(&str, &str)]) -> ScribeConfig {
        let mut env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        env.insert("SCRIBE_DATA_DIR".into(), dir.display().to_string());
        ScribeConfig::from_lookup(|key| env.get(key).cloned()).unwrap()
    }

    #[test]
    fn mock_runtime_creates_stores_and_analyzes() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = ScribeRuntime::from_config(config(dir.path(), &[])).unwrap();

        assert!(dir.path().join("scribe.db").exists());
        assert!(dir.path().join("graph.db").exists());
        assert!(runtime.queue().is_none());

        let out = runtime
            .structurer()
            .analyze_consultation("Patient avec fièvre et toux", None)
            .unwrap();
        assert!(!out.consultation.symptoms.is_empty());

        let stats = runtime.stats().unwrap();
        assert_eq!(stats.drafts.total, 1);
        assert!(stats.graph.unwrap().nodes > 0);
        assert_eq!(runtime.check_health().status, HealthStatus::Healthy);
    }

    #[test]
    fn local_mode_starts_job_worker() {
        let dir = tempfile::tempdir().unwrap();
        let runtime =
            ScribeRuntime::from_config(config(dir.path(), &[("AI_MODE", "local")])).unwrap();
        assert_eq!(runtime.structurer().mode(), ExecutionMode::Local);
        assert!(runtime.queue().is_some());
    }

    #[test]
    fn local_mode_without_queue_calls_inline() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = ScribeRuntime::from_config(config(
            dir.path(),
            &[("AI_MODE", "LOCAL"), ("USE_JOB_QUEUE", "false")],
        ))
        .unwrap();
        assert!(runtime.queue().is_none());
    }

    #[test]
    fn disabled_cache_reports_no_entries() {
        let dir = tempfile::tempdir().unwrap();
        let runtime =
            ScribeRuntime::from_config(config(dir.path(), &[("ENABLE_AI_CACHE", "false")]))
                .unwrap();
        assert!(runtime.stats().unwrap().cache.is_none());
    }

    #[test]
    fn malformed_redis_url_fails_bootstrap() {
        let dir = tempfile::tempdir().unwrap();
        let result = ScribeRuntime::from_config(config(dir.path(), &[("REDIS_URL", "not a url")]));
        assert!(matches!(result, Err(BootstrapError::Coordination(_))));
    }

    #[test]
    fn job_timeout_covers_sidecar_timeout_and_lock_wait() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(
            dir.path(),
            &[("AI_CORTEX_TIMEOUT_MS", "300000"), ("GPU_LOCK_MAX_WAIT_MS", "60000")],
        );
        assert_eq!(job_options(&cfg).timeout, Some(Duration::from_secs(360)));
        assert_eq!(job_options(&cfg).attempts, 3);
    }
}
