use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::consultation::Consultation;
use super::enums::{DraftStatus, SemanticNodeType};

/// Persisted record of one structuring result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsultationDraft {
    pub id: Uuid,
    pub patient_id: String,
    pub status: DraftStatus,
    pub structured_data: Consultation,
    /// Bumped on every write; updates must present the version they read.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConsultationDraft {
    pub fn is_validated(&self) -> bool {
        self.status == DraftStatus::Validated
    }
}

/// Relational node materialised when a draft is validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemanticNode {
    pub id: Uuid,
    pub draft_id: Uuid,
    pub patient_id: String,
    pub node_type: SemanticNodeType,
    pub label: String,
    pub code: Option<String>,
    pub confidence: Option<f64>,
    pub created_at: DateTime<Utc>,
}
