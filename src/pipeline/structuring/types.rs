use serde::Serialize;
use serde_json::Value;

use super::StructuringError;
use crate::config::ExecutionMode;
use crate::models::{Consultation, ConsultationDraft};
use crate::pipeline::schema::MachineSchema;

/// Black-box inference backend returning candidate Consultation JSON.
///
/// Output is unvalidated; callers run it through `schema::validate`.
pub trait InferenceBackend: Send + Sync {
    fn name(&self) -> &str;

    fn structure(&self, text: &str, schema: &MachineSchema) -> Result<Value, StructuringError>;
}

/// Where a returned consultation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    /// Produced by the configured mode's backend.
    Backend,
    /// Synthesized after the configured backend failed.
    Fallback,
    /// Served from the result cache.
    Cache,
}

/// Consultation returned to callers, with its draft.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzedConsultation {
    #[serde(flatten)]
    pub consultation: Consultation,
    pub draft_id: uuid::Uuid,
    pub mode: ExecutionMode,
    pub source: ResultSource,
    /// Set when the graph projection failed; the draft is still saved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Result of `update_draft`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftUpdate {
    pub draft: ConsultationDraft,
    pub consultation: Consultation,
}

/// Result of `validate_draft`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftValidation {
    pub draft: ConsultationDraft,
    pub nodes_created: usize,
    pub relations_projected: usize,
    /// Already-validated no-op, or a failed graph sync.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}
