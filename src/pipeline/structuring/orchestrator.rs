use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use uuid::Uuid;

use super::merge::normalize_candidate;
use super::mock::synthesize;
use super::types::{
    AnalyzedConsultation, DraftUpdate, DraftValidation, InferenceBackend, ResultSource,
};
use super::StructuringError;
use crate::config::ExecutionMode;
use crate::db::DraftStore;
use crate::graph::GraphProjector;
use crate::metrics::{self, PipelineCounters};
use crate::models::Consultation;
use crate::pipeline::cache::ResultCache;
use crate::pipeline::jobs::{JobOptions, JobQueue, StructuringJob, STRUCTURING_JOB};
use crate::pipeline::lifecycle::{DraftLifecycle, PipelineError};
use crate::pipeline::safety::SafetyGuard;
use crate::pipeline::schema::{self, MachineSchema};
use crate::pipeline::semaphore::ConcurrencySemaphore;

/// Fallback when a job has no per-attempt timeout.
const DEFAULT_JOB_WAIT: Duration = Duration::from_secs(600);

/// Orchestrates consultation structuring:
/// cache → backend for the configured mode (MOCK on failure) → safety
/// alerts → draft → graph
///
/// The execution mode is fixed at construction. Structuring never fails
/// from the caller's point of view; only draft persistence can.
pub struct ConsultationStructurer {
    mode: ExecutionMode,
    schema: MachineSchema,
    store: Arc<dyn DraftStore>,
    projector: Arc<GraphProjector>,
    safety: SafetyGuard,
    semaphore: Arc<ConcurrencySemaphore>,
    counters: Arc<PipelineCounters>,
    cache: Option<Arc<ResultCache>>,
    cloud: Option<Arc<dyn InferenceBackend>>,
    local: Option<Arc<dyn InferenceBackend>>,
    queue: Option<(JobQueue, JobOptions)>,
}

impl ConsultationStructurer {
    pub fn new(
        mode: ExecutionMode,
        store: Arc<dyn DraftStore>,
        projector: Arc<GraphProjector>,
        semaphore: Arc<ConcurrencySemaphore>,
        counters: Arc<PipelineCounters>,
    ) -> Self {
        Self {
            mode,
            schema: schema::describe(),
            store,
            safety: SafetyGuard::new(projector.store().clone()),
            projector,
            semaphore,
            counters,
            cache: None,
            cloud: None,
            local: None,
            queue: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_cloud_backend(mut self, backend: Arc<dyn InferenceBackend>) -> Self {
        self.cloud = Some(backend);
        self
    }

    pub fn with_local_backend(mut self, backend: Arc<dyn InferenceBackend>) -> Self {
        self.local = Some(backend);
        self
    }

    /// Route LOCAL calls through the job queue instead of calling inline.
    pub fn with_job_queue(mut self, queue: JobQueue, options: JobOptions) -> Self {
        self.queue = Some((queue, options));
        self
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn cache(&self) -> Option<&Arc<ResultCache>> {
        self.cache.as_ref()
    }

    fn lifecycle(&self) -> DraftLifecycle {
        DraftLifecycle::new(
            self.store.clone(),
            self.projector.clone(),
            self.counters.clone(),
            self.cache.clone(),
        )
    }

    // ═══════════════════════════════════════════════════════════
    // Entry points
    // ═══════════════════════════════════════════════════════════

    /// Structure `text`, save it as a new draft and project it.
    pub fn analyze(
        &self,
        text: &str,
        patient_id: Option<&str>,
    ) -> Result<AnalyzedConsultation, PipelineError> {
        self.run(text, patient_id, false)
    }

    /// Same as `analyze`, checking the result cache first.
    ///
    /// MOCK results are never cached.
    pub fn analyze_consultation(
        &self,
        text: &str,
        patient_id: Option<&str>,
    ) -> Result<AnalyzedConsultation, PipelineError> {
        self.run(text, patient_id, true)
    }

    pub fn update_draft(
        &self,
        id: &Uuid,
        partial: &Value,
        expected_version: Option<i64>,
    ) -> Result<DraftUpdate, PipelineError> {
        self.lifecycle().update_draft(id, partial, expected_version)
    }

    pub fn validate_draft(&self, id: &Uuid) -> Result<DraftValidation, PipelineError> {
        self.lifecycle().validate_draft(id)
    }

    fn run(
        &self,
        text: &str,
        patient_id: Option<&str>,
        use_cache: bool,
    ) -> Result<AnalyzedConsultation, PipelineError> {
        let span = tracing::info_span!("analyze", mode = %self.mode);
        let _enter = span.enter();
        let started = Instant::now();

        let patient_id = patient_id.map(str::trim).filter(|p| !p.is_empty());
        let cache = match self.mode {
            ExecutionMode::Mock => None,
            _ if use_cache => self.cache.as_deref(),
            _ => None,
        };

        let cached = cache.and_then(|c| c.get(text));
        let (mut consultation, source) = match cached {
            Some(mut hit) => {
                self.counters.increment(metrics::CACHE_HIT);
                if let Some(id) = patient_id {
                    hit.patient_id = id.to_string();
                }
                tracing::debug!("Result cache hit");
                (hit, ResultSource::Cache)
            }
            None => {
                if cache.is_some() {
                    self.counters.increment(metrics::CACHE_MISS);
                }
                let (consultation, source) = self.structure(text, patient_id);
                if let Some(cache) = cache {
                    cache.put(text, &consultation);
                }
                (consultation, source)
            }
        };

        // Per-patient; never cached.
        let alerts = self.safety.check(&consultation);
        if !alerts.is_empty() {
            self.counters
                .increment_by(metrics::SAFETY_ALERTS, alerts.len() as u64);
            let existing = consultation.alerts.get_or_insert_with(Vec::new);
            for alert in alerts {
                if !existing.contains(&alert) {
                    existing.push(alert);
                }
            }
        }

        let draft = self.store.create(&consultation.patient_id, &consultation)?;
        self.counters.increment(metrics::DRAFTS_CREATED);

        let warning = match self.projector.project(&draft.patient_id, &consultation) {
            Ok(_) => None,
            Err(e) => {
                self.counters.increment(metrics::GRAPH_PROJECTION_ERROR);
                Some(format!("Graph sync failed: {e}"))
            }
        };

        let elapsed = started.elapsed();
        self.counters.record_timing(metrics::ANALYZE_DURATION, elapsed);
        tracing::info!(
            draft_id = %draft.id,
            source = ?source,
            elapsed_ms = elapsed.as_millis() as u64,
            "Consultation structured"
        );

        Ok(AnalyzedConsultation {
            consultation,
            draft_id: draft.id,
            mode: self.mode,
            source,
            warning,
        })
    }

    // ═══════════════════════════════════════════════════════════
    // Strategies
    // ═══════════════════════════════════════════════════════════

    /// Run the configured strategy, substituting MOCK output on any failure.
    fn structure(&self, text: &str, patient_id: Option<&str>) -> (Consultation, ResultSource) {
        self.counters.increment(&metrics::analyze_counter(self.mode));

        let attempt = match self.mode {
            ExecutionMode::Mock => return (synthesize(text, patient_id), ResultSource::Backend),
            ExecutionMode::Cloud => self.call_cloud(text, patient_id),
            ExecutionMode::Local => self.call_local(text, patient_id),
        };

        match attempt {
            Ok(consultation) => (consultation, ResultSource::Backend),
            Err(e) => {
                self.counters.increment(&metrics::fallback_counter(self.mode));
                tracing::warn!(mode = %self.mode, error = %e, "Structuring failed, falling back to MOCK");
                (synthesize(text, patient_id), ResultSource::Fallback)
            }
        }
    }

    fn call_cloud(
        &self,
        text: &str,
        patient_id: Option<&str>,
    ) -> Result<Consultation, StructuringError> {
        let backend = self
            .cloud
            .as_ref()
            .ok_or_else(|| StructuringError::NotConfigured("CLOUD".into()))?;
        let candidate = backend.structure(text, &self.schema)?;
        Ok(schema::validate(&normalize_candidate(candidate, text, patient_id))?)
    }

    fn call_local(
        &self,
        text: &str,
        patient_id: Option<&str>,
    ) -> Result<Consultation, StructuringError> {
        if let Some((queue, options)) = &self.queue {
            return self.call_local_queued(queue, options, text, patient_id);
        }

        let backend = self
            .local
            .as_ref()
            .ok_or_else(|| StructuringError::NotConfigured("LOCAL".into()))?;
        let candidate = self
            .semaphore
            .run_with_lock(self.semaphore.default_options(), || {
                backend.structure(text, &self.schema)
            })?;
        Ok(schema::validate(&normalize_candidate(candidate, text, patient_id))?)
    }

    /// Hand the call to the single structuring worker and wait for it.
    fn call_local_queued(
        &self,
        queue: &JobQueue,
        options: &JobOptions,
        text: &str,
        patient_id: Option<&str>,
    ) -> Result<Consultation, StructuringError> {
        let job = StructuringJob {
            text: text.to_string(),
            patient_id: patient_id.map(str::to_string),
            schema: self.schema.clone(),
        };
        let payload =
            serde_json::to_value(&job).map_err(|e| StructuringError::JsonParsing(e.to_string()))?;

        let handle = queue.add(STRUCTURING_JOB, payload, *options);
        tracing::debug!(job_id = handle.id(), "Structuring job queued");

        let wait = options
            .worst_case_duration()
            .unwrap_or(DEFAULT_JOB_WAIT)
            .saturating_add(self.semaphore.default_options().max_wait);
        let value = handle
            .finished_timeout(wait)
            .map_err(|e| StructuringError::Queue(e.to_string()))?;

        Ok(schema::validate(&value)?)
    }
}
