//! Draft store: the record of truth for structuring results.
//!
//! All writes go through one connection guarded by a mutex. Data updates are
//! conditional on the version the caller read; validation flips the status
//! and inserts the semantic nodes in a single transaction.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use rusqlite::Connection;
use uuid::Uuid;

use super::repository::*;
use super::sqlite::{open_database, open_memory_database, ping};
use super::DatabaseError;
use crate::models::*;

/// Outcome of committing a validation.
#[derive(Debug, Clone)]
pub enum ValidationCommit {
    /// Status flipped and `nodes_created` rows inserted.
    Committed {
        draft: ConsultationDraft,
        nodes_created: usize,
    },
    /// Another caller validated first; nothing was written.
    AlreadyValidated(ConsultationDraft),
}

/// Durable store for consultation drafts and their semantic nodes.
pub trait DraftStore: Send + Sync {
    /// Persist a new DRAFT for the given consultation.
    fn create(
        &self,
        patient_id: &str,
        consultation: &Consultation,
    ) -> Result<ConsultationDraft, DatabaseError>;

    fn find_by_id(&self, id: &Uuid) -> Result<Option<ConsultationDraft>, DatabaseError>;

    /// Replace the structured data of a DRAFT read at `expected_version`.
    fn update(
        &self,
        id: &Uuid,
        expected_version: i64,
        consultation: &Consultation,
    ) -> Result<ConsultationDraft, DatabaseError>;

    /// Flip DRAFT → VALIDATED and insert `nodes`, atomically.
    ///
    /// `nodes` were built from the draft at `expected_version`; a draft
    /// edited since then is a `VersionConflict`.
    fn commit_validation(
        &self,
        id: &Uuid,
        expected_version: i64,
        nodes: &[SemanticNode],
    ) -> Result<ValidationCommit, DatabaseError>;

    fn nodes_for_draft(&self, id: &Uuid) -> Result<Vec<SemanticNode>, DatabaseError>;

    fn draft_counts(&self) -> Result<DraftCounts, DatabaseError>;

    fn semantic_node_count(&self) -> Result<i64, DatabaseError>;

    fn ping(&self) -> Result<Duration, DatabaseError>;
}

/// SQLite-backed `DraftStore`.
pub struct SqliteDraftStore {
    conn: Mutex<Connection>,
}

impl SqliteDraftStore {
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        Ok(Self::from_connection(open_database(path)?))
    }

    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        Ok(Self::from_connection(open_memory_database()?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, DatabaseError> {
        self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)
    }
}

fn not_found(id: &Uuid) -> DatabaseError {
    DatabaseError::NotFound {
        entity_type: "ConsultationDraft".into(),
        id: id.to_string(),
    }
}

impl DraftStore for SqliteDraftStore {
    fn create(
        &self,
        patient_id: &str,
        consultation: &Consultation,
    ) -> Result<ConsultationDraft, DatabaseError> {
        let now = Utc::now();
        let draft = ConsultationDraft {
            id: Uuid::new_v4(),
            patient_id: patient_id.to_string(),
            status: DraftStatus::Draft,
            structured_data: consultation.clone(),
            version: 1,
            created_at: now,
            updated_at: now,
        };

        let conn = self.lock()?;
        insert_draft(&conn, &draft)?;
        tracing::debug!(draft_id = %draft.id, patient_id = %patient_id, "Draft created");
        Ok(draft)
    }

    fn find_by_id(&self, id: &Uuid) -> Result<Option<ConsultationDraft>, DatabaseError> {
        let conn = self.lock()?;
        get_draft(&conn, id)
    }

    fn update(
        &self,
        id: &Uuid,
        expected_version: i64,
        consultation: &Consultation,
    ) -> Result<ConsultationDraft, DatabaseError> {
        let conn = self.lock()?;
        let changed = update_draft_data(
            &conn,
            id,
            expected_version,
            &consultation.patient_id,
            consultation,
            Utc::now(),
        )?;

        let current = get_draft(&conn, id)?.ok_or_else(|| not_found(id))?;
        if changed == 0 {
            if current.is_validated() {
                return Err(DatabaseError::InvalidTransition {
                    id: id.to_string(),
                    status: current.status.as_str().into(),
                });
            }
            return Err(DatabaseError::VersionConflict {
                id: id.to_string(),
                expected: expected_version,
                found: current.version,
            });
        }
        Ok(current)
    }

    fn commit_validation(
        &self,
        id: &Uuid,
        expected_version: i64,
        nodes: &[SemanticNode],
    ) -> Result<ValidationCommit, DatabaseError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        if mark_draft_validated(&tx, id, expected_version, Utc::now())? == 0 {
            // Dropping the transaction rolls back; nothing was written.
            let current = get_draft(&tx, id)?.ok_or_else(|| not_found(id))?;
            if current.is_validated() {
                return Ok(ValidationCommit::AlreadyValidated(current));
            }
            return Err(DatabaseError::VersionConflict {
                id: id.to_string(),
                expected: expected_version,
                found: current.version,
            });
        }

        for node in nodes {
            insert_semantic_node(&tx, node)?;
        }

        let draft = get_draft(&tx, id)?.ok_or_else(|| not_found(id))?;
        tx.commit()?;

        Ok(ValidationCommit::Committed {
            draft,
            nodes_created: nodes.len(),
        })
    }

    fn nodes_for_draft(&self, id: &Uuid) -> Result<Vec<SemanticNode>, DatabaseError> {
        let conn = self.lock()?;
        get_nodes_for_draft(&conn, id)
    }

    fn draft_counts(&self) -> Result<DraftCounts, DatabaseError> {
        let conn = self.lock()?;
        count_drafts_by_status(&conn)
    }

    fn semantic_node_count(&self) -> Result<i64, DatabaseError> {
        let conn = self.lock()?;
        count_semantic_nodes(&conn)
    }

    fn ping(&self) -> Result<Duration, DatabaseError> {
        let conn = self.lock()?;
        ping(&conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consultation(patient_id: &str) -> Consultation {
        Consultation {
            patient_id: patient_id.into(),
            transcript: "Toux sèche depuis trois jours".into(),
            symptoms: vec!["Toux sèche".into()],
            diagnosis: vec![DiagnosisEntry {
                code: "J00".into(),
                label: "Rhume".into(),
                confidence: 0.75,
            }],
            medications: vec![MedicationEntry {
                name: "Paracétamol".into(),
                dosage: "500mg".into(),
                duration: "7 jours".into(),
            }],
            billing_codes: vec![],
            prescription: vec![],
            alerts: None,
        }
    }

    fn symptom_node(draft: &ConsultationDraft, draft_id: Uuid) -> SemanticNode {
        SemanticNode {
            id: Uuid::new_v4(),
            draft_id,
            patient_id: draft.patient_id.clone(),
            node_type: SemanticNodeType::Symptom,
            label: "Toux sèche".into(),
            code: None,
            confidence: None,
            created_at: Utc::now(),
        }
    }

    // ── create / find ──

    #[test]
    fn create_starts_in_draft_at_version_one() {
        let store = SqliteDraftStore::open_in_memory().unwrap();
        let draft = store.create("patient_a", &consultation("patient_a")).unwrap();

        assert_eq!(draft.status, DraftStatus::Draft);
        assert_eq!(draft.version, 1);
        let found = store.find_by_id(&draft.id).unwrap().unwrap();
        assert_eq!(found.structured_data, draft.structured_data);
    }

    // ── update ──

    #[test]
    fn update_bumps_version() {
        let store = SqliteDraftStore::open_in_memory().unwrap();
        let draft = store.create("patient_a", &consultation("patient_a")).unwrap();

        let mut data = draft.structured_data.clone();
        data.symptoms = vec!["Fatigue".into()];
        let updated = store.update(&draft.id, draft.version, &data).unwrap();

        assert_eq!(updated.version, 2);
        assert_eq!(updated.structured_data.symptoms, vec!["Fatigue".to_string()]);
    }

    #[test]
    fn stale_update_is_a_version_conflict() {
        let store = SqliteDraftStore::open_in_memory().unwrap();
        let draft = store.create("patient_a", &consultation("patient_a")).unwrap();

        store.update(&draft.id, 1, &draft.structured_data).unwrap();
        let err = store.update(&draft.id, 1, &draft.structured_data).unwrap_err();

        assert!(matches!(err, DatabaseError::VersionConflict { expected: 1, found: 2, .. }));
    }

    #[test]
    fn update_of_missing_draft_is_not_found() {
        let store = SqliteDraftStore::open_in_memory().unwrap();
        let err = store
            .update(&Uuid::new_v4(), 1, &consultation("patient_a"))
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[test]
    fn update_after_validation_is_invalid_transition() {
        let store = SqliteDraftStore::open_in_memory().unwrap();
        let draft = store.create("patient_a", &consultation("patient_a")).unwrap();
        store.commit_validation(&draft.id, 1, &[]).unwrap();

        let err = store.update(&draft.id, 2, &draft.structured_data).unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidTransition { .. }));
    }

    // ── validation ──

    #[test]
    fn commit_validation_writes_nodes_and_status() {
        let store = SqliteDraftStore::open_in_memory().unwrap();
        let draft = store.create("patient_a", &consultation("patient_a")).unwrap();
        let nodes = vec![symptom_node(&draft, draft.id)];

        match store.commit_validation(&draft.id, 1, &nodes).unwrap() {
            ValidationCommit::Committed { draft, nodes_created } => {
                assert_eq!(draft.status, DraftStatus::Validated);
                assert_eq!(nodes_created, 1);
            }
            other => panic!("Expected commit, got {other:?}"),
        }
        assert_eq!(store.nodes_for_draft(&draft.id).unwrap().len(), 1);
    }

    #[test]
    fn second_validation_writes_nothing() {
        let store = SqliteDraftStore::open_in_memory().unwrap();
        let draft = store.create("patient_a", &consultation("patient_a")).unwrap();
        let nodes = vec![symptom_node(&draft, draft.id)];

        store.commit_validation(&draft.id, 1, &nodes).unwrap();
        let second = store.commit_validation(&draft.id, 1, &nodes).unwrap();

        assert!(matches!(second, ValidationCommit::AlreadyValidated(_)));
        assert_eq!(store.semantic_node_count().unwrap(), 1);
    }

    #[test]
    fn validation_of_edited_draft_is_a_version_conflict() {
        let store = SqliteDraftStore::open_in_memory().unwrap();
        let draft = store.create("patient_a", &consultation("patient_a")).unwrap();
        let nodes = vec![symptom_node(&draft, draft.id)];

        let mut data = draft.structured_data.clone();
        data.symptoms = vec!["Céphalée".into()];
        store.update(&draft.id, 1, &data).unwrap();

        let err = store.commit_validation(&draft.id, 1, &nodes).unwrap_err();
        assert!(matches!(err, DatabaseError::VersionConflict { expected: 1, found: 2, .. }));

        let reloaded = store.find_by_id(&draft.id).unwrap().unwrap();
        assert_eq!(reloaded.status, DraftStatus::Draft);
        assert_eq!(store.semantic_node_count().unwrap(), 0);
    }

    #[test]
    fn failed_node_insert_rolls_back_status() {
        let store = SqliteDraftStore::open_in_memory().unwrap();
        let draft = store.create("patient_a", &consultation("patient_a")).unwrap();
        // Second node references a draft that does not exist.
        let nodes = vec![
            symptom_node(&draft, draft.id),
            symptom_node(&draft, Uuid::new_v4()),
        ];

        assert!(store.commit_validation(&draft.id, 1, &nodes).is_err());

        let reloaded = store.find_by_id(&draft.id).unwrap().unwrap();
        assert_eq!(reloaded.status, DraftStatus::Draft);
        assert_eq!(store.semantic_node_count().unwrap(), 0);
    }

    #[test]
    fn validating_missing_draft_is_not_found() {
        let store = SqliteDraftStore::open_in_memory().unwrap();
        let err = store.commit_validation(&Uuid::new_v4(), 1, &[]).unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    // ── stats ──

    #[test]
    fn counts_and_ping() {
        let store = SqliteDraftStore::open_in_memory().unwrap();
        let a = store.create("patient_a", &consultation("patient_a")).unwrap();
        store.create("patient_b", &consultation("patient_b")).unwrap();
        store.commit_validation(&a.id, 1, &[]).unwrap();

        let counts = store.draft_counts().unwrap();
        assert_eq!(counts.total, 2);
        assert_eq!(counts.validated, 1);
        assert_eq!(counts.draft, 1);
        assert!(store.ping().is_ok());
    }

    #[test]
    fn store_is_object_safe() {
        fn _assert(_: &dyn DraftStore) {}
    }
}
