//! Idempotent projection of a consultation into the graph store.
//!
//! Every write is a merge on a natural key, so projecting the same
//! consultation twice leaves the graph exactly as one projection would.
//! A failed projection is logged and returned; callers decide whether to
//! surface it as a warning.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use super::store::*;
use super::GraphError;
use crate::models::{Consultation, ConsultationDraft};

#[derive(Error, Debug)]
pub enum ProjectionError {
    #[error("Graph projection failed: {0}")]
    Store(#[from] GraphError),
}

/// Totals from one projection call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionReport {
    pub statements: usize,
    pub nodes_created: usize,
    pub relationships_created: usize,
    /// Nothing was written because the patient id was blank.
    pub skipped: bool,
}

pub struct GraphProjector {
    store: Arc<dyn GraphStore>,
}

impl GraphProjector {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    /// Merge the patient, its symptoms, diagnoses and medications.
    pub fn project(
        &self,
        patient_id: &str,
        consultation: &Consultation,
    ) -> Result<ProjectionReport, ProjectionError> {
        self.run(patient_id, build_statements(patient_id, consultation, None))
    }

    /// Same as `project`, plus a Consultation node keyed by the draft id.
    pub fn project_draft(
        &self,
        draft: &ConsultationDraft,
    ) -> Result<ProjectionReport, ProjectionError> {
        let draft_key = draft.id.to_string();
        self.run(
            &draft.patient_id,
            build_statements(&draft.patient_id, &draft.structured_data, Some(&draft_key)),
        )
    }

    fn run(
        &self,
        patient_id: &str,
        statements: Vec<GraphStatement>,
    ) -> Result<ProjectionReport, ProjectionError> {
        if statements.is_empty() {
            tracing::debug!("Graph projection skipped: blank patient id");
            return Ok(ProjectionReport {
                skipped: true,
                ..ProjectionReport::default()
            });
        }

        let summaries = match self.store.execute_batch(&statements) {
            Ok(summaries) => summaries,
            Err(e) => {
                tracing::warn!(patient_id = %patient_id, error = %e, "Graph projection failed");
                return Err(e.into());
            }
        };

        let report = ProjectionReport {
            statements: statements.len(),
            nodes_created: summaries.iter().map(|s| s.nodes_created).sum(),
            relationships_created: summaries.iter().map(|s| s.relationships_created).sum(),
            skipped: false,
        };
        tracing::debug!(
            patient_id = %patient_id,
            statements = report.statements,
            nodes_created = report.nodes_created,
            relationships_created = report.relationships_created,
            "Graph projection applied"
        );
        Ok(report)
    }
}

/// Build the merge statements for one consultation.
///
/// Empty when `patient_id` is blank. Blank symptom, diagnosis and
/// medication names are skipped.
pub fn build_statements(
    patient_id: &str,
    consultation: &Consultation,
    consultation_key: Option<&str>,
) -> Vec<GraphStatement> {
    let patient_id = patient_id.trim();
    if patient_id.is_empty() {
        return Vec::new();
    }

    let timestamp = Utc::now().to_rfc3339();
    let patient = NodeRef::new(NodeLabel::Patient, patient_id);
    let mut statements = vec![GraphStatement::MergeNode {
        node: patient.clone(),
        properties: json!({ "id": patient_id }),
    }];

    let visit = consultation_key.map(|key| {
        let node = NodeRef::new(NodeLabel::Consultation, key);
        statements.push(GraphStatement::MergeNode {
            node: node.clone(),
            properties: json!({ "id": key }),
        });
        statements.push(GraphStatement::MergeEdge {
            kind: RelationKind::HasConsultation,
            from: patient.clone(),
            to: node.clone(),
            properties: json!({}),
        });
        node
    });

    let link = |statements: &mut Vec<GraphStatement>,
                    node: NodeRef,
                    properties: serde_json::Value,
                    patient_edge: RelationKind,
                    edge_properties: serde_json::Value,
                    visit_edge: RelationKind| {
        statements.push(GraphStatement::MergeNode {
            node: node.clone(),
            properties,
        });
        statements.push(GraphStatement::MergeEdge {
            kind: patient_edge,
            from: patient.clone(),
            to: node.clone(),
            properties: edge_properties,
        });
        if let Some(visit) = &visit {
            statements.push(GraphStatement::MergeEdge {
                kind: visit_edge,
                from: visit.clone(),
                to: node,
                properties: json!({}),
            });
        }
    };

    for symptom in &consultation.symptoms {
        let name = symptom.trim();
        if name.is_empty() {
            continue;
        }
        link(
            &mut statements,
            NodeRef::new(NodeLabel::Symptom, name.to_lowercase()),
            json!({ "name": name.to_lowercase(), "label": name }),
            RelationKind::HasSymptom,
            json!({ "timestamp": timestamp }),
            RelationKind::Reveals,
        );
    }

    for diagnosis in &consultation.diagnosis {
        let (code, label) = (diagnosis.code.trim(), diagnosis.label.trim());
        if code.is_empty() || label.is_empty() {
            continue;
        }
        link(
            &mut statements,
            NodeRef::new(NodeLabel::Diagnosis, format!("{code}|{label}")),
            json!({ "code": code, "label": label }),
            RelationKind::HasCondition,
            json!({ "confidence": diagnosis.confidence }),
            RelationKind::Concluded,
        );
    }

    for medication in &consultation.medications {
        let name = medication.name.trim();
        if name.is_empty() {
            continue;
        }
        link(
            &mut statements,
            NodeRef::new(NodeLabel::Medication, name.to_lowercase()),
            json!({ "name": name }),
            RelationKind::Prescribed,
            json!({ "dosage": medication.dosage, "duration": medication.duration }),
            RelationKind::Prescribes,
        );
    }

    statements
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::SqliteGraphStore;
    use crate::models::*;
    use uuid::Uuid;

    fn consultation() -> Consultation {
        Consultation {
            patient_id: "patient_42".into(),
            transcript: "Patient avec fièvre et toux".into(),
            symptoms: vec!["Fièvre modérée".into(), "Toux sèche".into(), "  ".into()],
            diagnosis: vec![DiagnosisEntry {
                code: "J11.1".into(),
                label: "Grippe saisonnière".into(),
                confidence: 0.85,
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

    fn projector() -> (GraphProjector, Arc<SqliteGraphStore>) {
        let store = Arc::new(SqliteGraphStore::open_in_memory().unwrap());
        (GraphProjector::new(store.clone()), store)
    }

    // ── statement building ──

    #[test]
    fn blank_patient_builds_nothing() {
        assert!(build_statements("  ", &consultation(), None).is_empty());
    }

    #[test]
    fn blank_symptoms_skipped_and_keys_normalized() {
        let statements = build_statements("patient_42", &consultation(), None);
        let symptom_keys: Vec<&str> = statements
            .iter()
            .filter_map(|s| match s {
                GraphStatement::MergeNode { node, .. } if node.label == NodeLabel::Symptom => {
                    Some(node.key.as_str())
                }
                _ => None,
            })
            .collect();
        assert_eq!(symptom_keys, vec!["fièvre modérée", "toux sèche"]);
    }

    #[test]
    fn symptom_edges_carry_timestamp() {
        let statements = build_statements("patient_42", &consultation(), None);
        let stamps: Vec<&serde_json::Value> = statements
            .iter()
            .filter_map(|s| match s {
                GraphStatement::MergeEdge { kind: RelationKind::HasSymptom, properties, .. } => {
                    Some(&properties["timestamp"])
                }
                _ => None,
            })
            .collect();
        assert_eq!(stamps.len(), 2);
        assert!(stamps
            .iter()
            .all(|t| t.as_str().is_some_and(|t| chrono::DateTime::parse_from_rfc3339(t).is_ok())));
    }

    // ── projection ──

    #[test]
    fn project_creates_nodes_and_edges() {
        let (projector, store) = projector();
        let report = projector.project("patient_42", &consultation()).unwrap();

        // patient + 2 symptoms + 1 diagnosis + 1 medication
        assert_eq!(report.nodes_created, 5);
        assert_eq!(report.relationships_created, 4);
        assert_eq!(store.counts().unwrap(), GraphCounts { nodes: 5, edges: 4 });
    }

    #[test]
    fn projection_is_idempotent() {
        let (projector, store) = projector();
        projector.project("patient_42", &consultation()).unwrap();
        let once = store.counts().unwrap();

        let second = projector.project("patient_42", &consultation()).unwrap();
        assert_eq!(second.nodes_created, 0);
        assert_eq!(second.relationships_created, 0);
        assert_eq!(store.counts().unwrap(), once);
    }

    #[test]
    fn symptoms_shared_across_patients() {
        let (projector, store) = projector();
        projector.project("patient_42", &consultation()).unwrap();
        let report = projector.project("patient_43", &consultation()).unwrap();

        assert_eq!(report.nodes_created, 1);
        assert_eq!(report.relationships_created, 4);
        assert_eq!(store.counts().unwrap().nodes, 6);
    }

    #[test]
    fn draft_projection_links_consultation_node() {
        let (projector, store) = projector();
        let now = Utc::now();
        let draft = ConsultationDraft {
            id: Uuid::new_v4(),
            patient_id: "patient_42".into(),
            status: DraftStatus::Validated,
            structured_data: consultation(),
            version: 2,
            created_at: now,
            updated_at: now,
        };

        let report = projector.project_draft(&draft).unwrap();
        assert_eq!(report.nodes_created, 6);
        // HAS_CONSULTATION + 4 patient edges + 4 consultation edges
        assert_eq!(report.relationships_created, 9);

        let again = projector.project_draft(&draft).unwrap();
        assert_eq!(again.relationships_created, 0);
        assert_eq!(
            store
                .edge_count_from(RelationKind::HasConsultation, &NodeRef::new(NodeLabel::Patient, "patient_42"))
                .unwrap(),
            1
        );
    }

    #[test]
    fn blank_patient_is_skipped_not_failed() {
        let (projector, store) = projector();
        let report = projector.project("", &consultation()).unwrap();
        assert!(report.skipped);
        assert_eq!(store.counts().unwrap(), GraphCounts::default());
    }

    #[test]
    fn unreachable_store_returns_error() {
        let projector = GraphProjector::new(Arc::new(DisconnectedGraphStore::new("down")));
        let err = projector.project("patient_42", &consultation()).unwrap_err();
        assert!(err.to_string().contains("down"));
    }
}
