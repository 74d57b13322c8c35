//! Structuring jobs for the LOCAL backend.
//!
//! One worker thread drains `analyze-consultation` jobs. Every backend call
//! still goes through the concurrency semaphore so several processes sharing
//! one inference host stay within its permit count.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::queue::{JobContext, JobFailure, JobHandler, JobQueue, WorkerHandle};
use crate::metrics::{self, PipelineCounters};
use crate::pipeline::schema::{self, MachineSchema};
use crate::pipeline::semaphore::ConcurrencySemaphore;
use crate::pipeline::structuring::{normalize_candidate, InferenceBackend, StructuringError};

pub const STRUCTURING_JOB: &str = "analyze-consultation";

/// Job payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuringJob {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
    pub schema: MachineSchema,
}

pub struct StructuringJobHandler {
    backend: Arc<dyn InferenceBackend>,
    semaphore: Arc<ConcurrencySemaphore>,
    counters: Arc<PipelineCounters>,
}

impl StructuringJobHandler {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        semaphore: Arc<ConcurrencySemaphore>,
        counters: Arc<PipelineCounters>,
    ) -> Self {
        Self {
            backend,
            semaphore,
            counters,
        }
    }
}

fn classify(e: StructuringError) -> JobFailure {
    if e.is_permanent() {
        JobFailure::Permanent(e.to_string())
    } else {
        JobFailure::Retryable(e.to_string())
    }
}

impl JobHandler for StructuringJobHandler {
    fn execute(&self, ctx: &JobContext) -> Result<Value, JobFailure> {
        let job: StructuringJob = serde_json::from_value(ctx.payload.clone())
            .map_err(|e| JobFailure::Permanent(format!("invalid job payload: {e}")))?;
        ctx.report_progress(10, "Job admitted");

        ctx.report_progress(30, "Calling inference backend");
        let candidate = self
            .semaphore
            .run_with_lock(self.semaphore.default_options(), || {
                self.backend.structure(&job.text, &job.schema)
            })
            .map_err(classify)?;
        ctx.report_progress(70, "Inference backend returned");

        let candidate = normalize_candidate(candidate, &job.text, job.patient_id.as_deref());
        let consultation = schema::validate(&candidate).map_err(|e| {
            self.counters.increment(metrics::JOB_VALIDATION_ERROR);
            tracing::warn!(job_id = ctx.job_id, error = %e, "Backend output failed validation");
            JobFailure::Permanent(e.to_string())
        })?;
        ctx.report_progress(90, "Result validated");

        let value = serde_json::to_value(&consultation)
            .map_err(|e| JobFailure::Permanent(e.to_string()))?;
        ctx.report_progress(100, "Done");
        Ok(value)
    }
}

/// Start the single structuring worker.
pub fn start_structuring_worker(queue: &JobQueue, handler: StructuringJobHandler) -> WorkerHandle {
    queue.process(STRUCTURING_JOB, 1, Arc::new(handler))
}
