//! Draft lifecycle: DRAFT (editable) → VALIDATED (terminal).
//!
//! Edits merge a partial document over the stored consultation and are
//! re-validated before they are written. Validation materialises semantic
//! nodes and flips the status in one relational transaction, then syncs the
//! graph. A graph failure only produces a warning.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::db::{DatabaseError, DraftStore, ValidationCommit};
use crate::graph::GraphProjector;
use crate::metrics::{self, PipelineCounters};
use crate::models::{ConsultationDraft, SemanticNode, SemanticNodeType};
use crate::pipeline::cache::ResultCache;
use crate::pipeline::schema::{self, ValidationError};
use crate::pipeline::structuring::{apply_partial, DraftUpdate, DraftValidation};

pub const ALREADY_VALIDATED_WARNING: &str = "Draft was already validated";

/// Errors surfaced to callers of draft operations.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Draft not found: {0}")]
    NotFound(String),

    #[error("Draft {id} is {status} and can no longer be modified")]
    IllegalState { id: String, status: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Draft {id} changed since it was read (expected version {expected}, found {found})")]
    Conflict { id: String, expected: i64, found: i64 },

    #[error("Database error: {0}")]
    Database(DatabaseError),
}

impl From<DatabaseError> for PipelineError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound { id, .. } => PipelineError::NotFound(id),
            DatabaseError::InvalidTransition { id, status } => {
                PipelineError::IllegalState { id, status }
            }
            DatabaseError::VersionConflict { id, expected, found } => {
                PipelineError::Conflict { id, expected, found }
            }
            other => PipelineError::Database(other),
        }
    }
}

pub struct DraftLifecycle {
    store: Arc<dyn DraftStore>,
    projector: Arc<GraphProjector>,
    counters: Arc<PipelineCounters>,
    cache: Option<Arc<ResultCache>>,
}

impl DraftLifecycle {
    pub fn new(
        store: Arc<dyn DraftStore>,
        projector: Arc<GraphProjector>,
        counters: Arc<PipelineCounters>,
        cache: Option<Arc<ResultCache>>,
    ) -> Self {
        Self {
            store,
            projector,
            counters,
            cache,
        }
    }

    fn load(&self, id: &Uuid) -> Result<ConsultationDraft, PipelineError> {
        self.store
            .find_by_id(id)?
            .ok_or_else(|| PipelineError::NotFound(id.to_string()))
    }

    /// Merge `partial` over the draft's structured data and save it.
    ///
    /// Arrays in `partial` replace the stored ones; blank entries are
    /// dropped. `expected_version` defaults to the version just read, so
    /// only an interleaved write between read and save conflicts.
    pub fn update_draft(
        &self,
        id: &Uuid,
        partial: &Value,
        expected_version: Option<i64>,
    ) -> Result<DraftUpdate, PipelineError> {
        let draft = self.load(id)?;
        if draft.is_validated() {
            return Err(PipelineError::IllegalState {
                id: id.to_string(),
                status: draft.status.to_string(),
            });
        }

        let merged = apply_partial(&draft.structured_data, partial)?;
        let consultation = schema::validate(&merged)?;

        let saved = self.store.update(
            id,
            expected_version.unwrap_or(draft.version),
            &consultation,
        )?;

        // A corrected draft must not be shadowed by the stale cached result.
        if let Some(cache) = &self.cache {
            cache.invalidate(&draft.structured_data.transcript);
            if consultation.transcript != draft.structured_data.transcript {
                cache.invalidate(&consultation.transcript);
            }
        }

        self.counters.increment(metrics::DRAFTS_UPDATED);
        tracing::info!(draft_id = %id, version = saved.version, "Draft updated");

        Ok(DraftUpdate {
            draft: saved,
            consultation,
        })
    }

    /// Promote a draft to VALIDATED.
    ///
    /// Validating twice is not an error: the second call writes nothing and
    /// returns the draft with a warning.
    pub fn validate_draft(&self, id: &Uuid) -> Result<DraftValidation, PipelineError> {
        let draft = self.load(id)?;
        if draft.is_validated() {
            return Ok(self.already_validated(draft));
        }

        schema::revalidate(&draft.structured_data)?;
        let nodes = build_semantic_nodes(&draft);

        let (draft, nodes_created) = match self.store.commit_validation(id, draft.version, &nodes)? {
            ValidationCommit::Committed {
                draft,
                nodes_created,
            } => (draft, nodes_created),
            ValidationCommit::AlreadyValidated(draft) => return Ok(self.already_validated(draft)),
        };

        let (relations_projected, warning) = match self.projector.project_draft(&draft) {
            Ok(report) => (report.relationships_created, None),
            Err(e) => {
                self.counters.increment(metrics::GRAPH_PROJECTION_ERROR);
                (0, Some(format!("Graph sync failed: {e}")))
            }
        };

        self.counters.increment(metrics::DRAFTS_VALIDATED);
        self.counters
            .increment_by(metrics::VALIDATION_NODES_CREATED, nodes_created as u64);
        self.counters
            .increment_by(metrics::VALIDATION_RELATIONS_PROJECTED, relations_projected as u64);

        tracing::info!(
            draft_id = %id,
            nodes_created,
            relations_projected,
            graph_synced = warning.is_none(),
            "Draft validated"
        );

        Ok(DraftValidation {
            draft,
            nodes_created,
            relations_projected,
            warning,
        })
    }

    fn already_validated(&self, draft: ConsultationDraft) -> DraftValidation {
        self.counters.increment(metrics::DRAFTS_ALREADY_VALIDATED);
        tracing::info!(draft_id = %draft.id, "Draft already validated, nothing to do");
        DraftValidation {
            draft,
            nodes_created: 0,
            relations_projected: 0,
            warning: Some(ALREADY_VALIDATED_WARNING.to_string()),
        }
    }
}

/// One node per distinct symptom, diagnosis and medication.
///
/// Symptoms and medications are compared case-insensitively, diagnoses by
/// code and label. Blank entries produce no node.
pub fn build_semantic_nodes(draft: &ConsultationDraft) -> Vec<SemanticNode> {
    let data = &draft.structured_data;
    let now = Utc::now();
    let mut seen = HashSet::new();
    let mut nodes = Vec::new();

    let mut push = |node_type: SemanticNodeType,
                    key: String,
                    label: &str,
                    code: Option<&str>,
                    confidence: Option<f64>| {
        if label.trim().is_empty() || !seen.insert((node_type, key)) {
            return;
        }
        nodes.push(SemanticNode {
            id: Uuid::new_v4(),
            draft_id: draft.id,
            patient_id: draft.patient_id.clone(),
            node_type,
            label: label.trim().to_string(),
            code: code.map(str::to_string),
            confidence,
            created_at: now,
        });
    };

    for symptom in &data.symptoms {
        push(
            SemanticNodeType::Symptom,
            symptom.trim().to_lowercase(),
            symptom,
            None,
            None,
        );
    }
    for d in &data.diagnosis {
        push(
            SemanticNodeType::Diagnosis,
            format!("{}|{}", d.code.trim(), d.label.trim()),
            &d.label,
            Some(d.code.trim()),
            Some(d.confidence),
        );
    }
    for m in &data.medications {
        push(
            SemanticNodeType::Medication,
            m.name.trim().to_lowercase(),
            &m.name,
            None,
            None,
        );
    }

    nodes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteDraftStore;
    use crate::graph::{DisconnectedGraphStore, GraphStore, SqliteGraphStore};
    use crate::models::{Consultation, DiagnosisEntry, DraftStatus, MedicationEntry};
    use serde_json::json;
    use std::time::Duration;

    fn consultation() -> Consultation {
        Consultation {
            patient_id: "P-100".into(),
            transcript: "Patient avec fièvre et toux".into(),
            symptoms: vec!["Fièvre modérée".into(), "Toux sèche".into(), "toux sèche".into()],
            diagnosis: vec![DiagnosisEntry {
                code: "J06.9".into(),
                label: "Infection aiguë des voies respiratoires supérieures".into(),
                confidence: 0.82,
            }],
            medications: vec![MedicationEntry {
                name: "Paracétamol".into(),
                dosage: "1g".into(),
                duration: "5 jours".into(),
            }],
            billing_codes: vec![],
            prescription: vec![],
            alerts: None,
        }
    }

    struct Fixture {
        lifecycle: DraftLifecycle,
        store: Arc<SqliteDraftStore>,
        graph: Arc<dyn GraphStore>,
        counters: Arc<PipelineCounters>,
        cache: Arc<ResultCache>,
    }

    fn fixture_with_graph(graph: Arc<dyn GraphStore>) -> Fixture {
        let store = Arc::new(SqliteDraftStore::open_in_memory().unwrap());
        let counters = Arc::new(PipelineCounters::new());
        let cache = Arc::new(ResultCache::new(Duration::from_secs(3600)));
        let lifecycle = DraftLifecycle::new(
            store.clone(),
            Arc::new(GraphProjector::new(graph.clone())),
            counters.clone(),
            Some(cache.clone()),
        );
        Fixture {
            lifecycle,
            store,
            graph,
            counters,
            cache,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_graph(Arc::new(SqliteGraphStore::open_in_memory().unwrap()))
    }

    fn seeded(f: &Fixture) -> ConsultationDraft {
        f.store.create("P-100", &consultation()).unwrap()
    }

    // ── update_draft ──

    #[test]
    fn update_replaces_arrays_and_bumps_version() {
        let f = fixture();
        let draft = seeded(&f);

        let out = f
            .lifecycle
            .update_draft(&draft.id, &json!({ "symptoms": ["Céphalée", ""] }), None)
            .unwrap();

        assert_eq!(out.consultation.symptoms, vec!["Céphalée".to_string()]);
        assert_eq!(out.draft.version, draft.version + 1);
        assert_eq!(out.consultation.medications.len(), 1);
        assert_eq!(f.counters.get(metrics::DRAFTS_UPDATED), 1);
    }

    #[test]
    fn update_with_empty_symptoms_is_rejected() {
        let f = fixture();
        let draft = seeded(&f);

        let err = f
            .lifecycle
            .update_draft(&draft.id, &json!({ "symptoms": [] }), None)
            .unwrap_err();
        match err {
            PipelineError::Validation(v) => assert!(v.touches("symptoms")),
            other => panic!("expected validation error, got {other:?}"),
        }
        let stored = f.store.find_by_id(&draft.id).unwrap().unwrap();
        assert_eq!(stored.version, draft.version);
    }

    #[test]
    fn update_of_missing_draft_is_not_found() {
        let f = fixture();
        let err = f
            .lifecycle
            .update_draft(&Uuid::new_v4(), &json!({}), None)
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }

    #[test]
    fn update_of_validated_draft_is_illegal_state() {
        let f = fixture();
        let draft = seeded(&f);
        f.lifecycle.validate_draft(&draft.id).unwrap();

        let err = f
            .lifecycle
            .update_draft(&draft.id, &json!({ "symptoms": ["Fatigue"] }), None)
            .unwrap_err();
        assert!(matches!(err, PipelineError::IllegalState { .. }), "{err:?}");
    }

    #[test]
    fn stale_version_conflicts() {
        let f = fixture();
        let draft = seeded(&f);
        f.lifecycle
            .update_draft(&draft.id, &json!({ "symptoms": ["Fatigue"] }), None)
            .unwrap();

        let err = f
            .lifecycle
            .update_draft(&draft.id, &json!({ "symptoms": ["Nausée"] }), Some(draft.version))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Conflict { .. }), "{err:?}");
    }

    #[test]
    fn update_invalidates_cached_result() {
        let f = fixture();
        let draft = seeded(&f);
        f.cache.put(&draft.structured_data.transcript, &draft.structured_data);

        f.lifecycle
            .update_draft(&draft.id, &json!({ "symptoms": ["Fatigue"] }), None)
            .unwrap();
        assert!(f.cache.get(&draft.structured_data.transcript).is_none());
    }

    // ── validate_draft ──

    #[test]
    fn validate_creates_deduplicated_nodes_and_projects() {
        let f = fixture();
        let draft = seeded(&f);

        let out = f.lifecycle.validate_draft(&draft.id).unwrap();

        assert_eq!(out.draft.status, DraftStatus::Validated);
        // two distinct symptoms, one diagnosis, one medication
        assert_eq!(out.nodes_created, 4);
        assert!(out.relations_projected > 0);
        assert!(out.warning.is_none());
        assert_eq!(f.store.nodes_for_draft(&draft.id).unwrap().len(), 4);
        assert!(f.graph.counts().unwrap().edges > 0);
        assert_eq!(f.counters.get(metrics::VALIDATION_NODES_CREATED), 4);
    }

    #[test]
    fn second_validation_is_a_warning_no_op() {
        let f = fixture();
        let draft = seeded(&f);
        f.lifecycle.validate_draft(&draft.id).unwrap();
        let edges = f.graph.counts().unwrap().edges;

        let again = f.lifecycle.validate_draft(&draft.id).unwrap();

        assert_eq!(again.warning.as_deref(), Some(ALREADY_VALIDATED_WARNING));
        assert_eq!(again.nodes_created, 0);
        assert_eq!(f.store.nodes_for_draft(&draft.id).unwrap().len(), 4);
        assert_eq!(f.graph.counts().unwrap().edges, edges);
        assert_eq!(f.counters.get(metrics::DRAFTS_VALIDATED), 1);
        assert_eq!(f.counters.get(metrics::DRAFTS_ALREADY_VALIDATED), 1);
    }

    #[test]
    fn graph_outage_is_a_warning() {
        let f = fixture_with_graph(Arc::new(DisconnectedGraphStore::new("graph down")));
        let draft = seeded(&f);

        let out = f.lifecycle.validate_draft(&draft.id).unwrap();

        assert_eq!(out.draft.status, DraftStatus::Validated);
        assert_eq!(out.relations_projected, 0);
        assert!(out.warning.unwrap().contains("Graph sync failed"));
        assert_eq!(f.counters.get(metrics::GRAPH_PROJECTION_ERROR), 1);
    }

    /// Commits an edit just before every validation commit.
    struct EditingStore {
        inner: Arc<SqliteDraftStore>,
    }

    impl DraftStore for EditingStore {
        fn create(&self, p: &str, c: &Consultation) -> Result<ConsultationDraft, DatabaseError> {
            self.inner.create(p, c)
        }
        fn find_by_id(&self, id: &Uuid) -> Result<Option<ConsultationDraft>, DatabaseError> {
            self.inner.find_by_id(id)
        }
        fn update(
            &self,
            id: &Uuid,
            version: i64,
            c: &Consultation,
        ) -> Result<ConsultationDraft, DatabaseError> {
            self.inner.update(id, version, c)
        }
        fn commit_validation(
            &self,
            id: &Uuid,
            expected_version: i64,
            nodes: &[SemanticNode],
        ) -> Result<ValidationCommit, DatabaseError> {
            if let Some(current) = self.inner.find_by_id(id)? {
                if !current.is_validated() {
                    let mut data = current.structured_data.clone();
                    data.symptoms = vec!["Céphalée".into()];
                    self.inner.update(id, current.version, &data)?;
                }
            }
            self.inner.commit_validation(id, expected_version, nodes)
        }
        fn nodes_for_draft(&self, id: &Uuid) -> Result<Vec<SemanticNode>, DatabaseError> {
            self.inner.nodes_for_draft(id)
        }
        fn draft_counts(&self) -> Result<crate::db::DraftCounts, DatabaseError> {
            self.inner.draft_counts()
        }
        fn semantic_node_count(&self) -> Result<i64, DatabaseError> {
            self.inner.semantic_node_count()
        }
        fn ping(&self) -> Result<Duration, DatabaseError> {
            self.inner.ping()
        }
    }

    #[test]
    fn edit_between_read_and_commit_conflicts() {
        let inner = Arc::new(SqliteDraftStore::open_in_memory().unwrap());
        let graph: Arc<dyn GraphStore> = Arc::new(SqliteGraphStore::open_in_memory().unwrap());
        let lifecycle = DraftLifecycle::new(
            Arc::new(EditingStore { inner: inner.clone() }),
            Arc::new(GraphProjector::new(graph.clone())),
            Arc::new(PipelineCounters::new()),
            None,
        );
        let draft = inner.create("P-100", &consultation()).unwrap();

        let err = lifecycle.validate_draft(&draft.id).unwrap_err();
        assert!(matches!(err, PipelineError::Conflict { .. }), "{err:?}");

        let stored = inner.find_by_id(&draft.id).unwrap().unwrap();
        assert_eq!(stored.status, DraftStatus::Draft);
        assert_eq!(stored.structured_data.symptoms, vec!["Céphalée".to_string()]);
        assert_eq!(inner.semantic_node_count().unwrap(), 0);
        assert_eq!(graph.counts().unwrap().edges, 0);
    }

    #[test]
    fn nodes_match_the_data_that_was_validated() {
        let f = fixture();
        let draft = seeded(&f);
        f.lifecycle
            .update_draft(&draft.id, &json!({ "symptoms": ["Céphalée"] }), None)
            .unwrap();

        let out = f.lifecycle.validate_draft(&draft.id).unwrap();

        let symptoms: Vec<String> = f
            .store
            .nodes_for_draft(&draft.id)
            .unwrap()
            .into_iter()
            .filter(|n| n.node_type == SemanticNodeType::Symptom)
            .map(|n| n.label)
            .collect();
        assert_eq!(symptoms, out.draft.structured_data.symptoms);
    }

    #[test]
    fn validating_missing_draft_is_not_found() {
        let f = fixture();
        let err = f.lifecycle.validate_draft(&Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }

    #[test]
    fn semantic_nodes_skip_blanks() {
        let f = fixture();
        let mut draft = seeded(&f);
        draft.structured_data.medications.push(MedicationEntry {
            name: "  ".into(),
            dosage: "x".into(),
            duration: "y".into(),
        });
        let nodes = build_semantic_nodes(&draft);
        assert_eq!(nodes.len(), 4);
        let diagnosis = nodes
            .iter()
            .find(|n| n.node_type == SemanticNodeType::Diagnosis)
            .unwrap();
        assert_eq!(diagnosis.code.as_deref(), Some("J06.9"));
        assert_eq!(diagnosis.confidence, Some(0.82));
    }

    #[test]
    fn database_errors_map_to_caller_errors() {
        let err: PipelineError = DatabaseError::VersionConflict {
            id: "d".into(),
            expected: 1,
            found: 2,
        }
        .into();
        assert!(matches!(err, PipelineError::Conflict { expected: 1, found: 2, .. }));

        let err: PipelineError = DatabaseError::LockPoisoned.into();
        assert!(matches!(err, PipelineError::Database(_)));
    }
}
