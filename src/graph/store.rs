use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use super::GraphError;

/// Node labels the projector writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NodeLabel {
    Patient,
    Symptom,
    Diagnosis,
    Medication,
    Consultation,
}

impl NodeLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Patient => "Patient",
            Self::Symptom => "Symptom",
            Self::Diagnosis => "Diagnosis",
            Self::Medication => "Medication",
            Self::Consultation => "Consultation",
        }
    }
}

/// Edge types the projector writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationKind {
    HasSymptom,
    HasCondition,
    Prescribed,
    HasConsultation,
    Reveals,
    Concluded,
    Prescribes,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HasSymptom => "HAS_SYMPTOM",
            Self::HasCondition => "HAS_CONDITION",
            Self::Prescribed => "PRESCRIBED",
            Self::HasConsultation => "HAS_CONSULTATION",
            Self::Reveals => "REVEALS",
            Self::Concluded => "CONCLUDED",
            Self::Prescribes => "PRESCRIBES",
        }
    }
}

/// A node addressed by its natural business key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub label: NodeLabel,
    pub key: String,
}

impl NodeRef {
    pub fn new(label: NodeLabel, key: impl Into<String>) -> Self {
        Self {
            label,
            key: key.into(),
        }
    }
}

/// One idempotent write: create if absent, otherwise touch.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphStatement {
    MergeNode {
        node: NodeRef,
        properties: Value,
    },
    MergeEdge {
        kind: RelationKind,
        from: NodeRef,
        to: NodeRef,
        properties: Value,
    },
}

/// What one statement changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementSummary {
    pub nodes_created: usize,
    pub relationships_created: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphCounts {
    pub nodes: i64,
    pub edges: i64,
}

/// Store the projector writes into.
pub trait GraphStore: Send + Sync {
    /// Run all statements in one transaction, one summary per statement.
    fn execute_batch(&self, statements: &[GraphStatement])
        -> Result<Vec<StatementSummary>, GraphError>;

    fn counts(&self) -> Result<GraphCounts, GraphError>;

    /// Labels of the diagnoses linked to a patient by `HAS_CONDITION`.
    fn patient_conditions(&self, patient_id: &str) -> Result<Vec<String>, GraphError>;

    fn ping(&self) -> Result<Duration, GraphError>;
}

/// Stand-in used when the graph store could not be opened at start-up.
///
/// Every call fails with `Unavailable`, which the projector logs and the
/// health check reports as degraded.
pub struct DisconnectedGraphStore {
    reason: String,
}

impl DisconnectedGraphStore {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl GraphStore for DisconnectedGraphStore {
    fn execute_batch(&self, _: &[GraphStatement]) -> Result<Vec<StatementSummary>, GraphError> {
        Err(GraphError::Unavailable(self.reason.clone()))
    }

    fn counts(&self) -> Result<GraphCounts, GraphError> {
        Err(GraphError::Unavailable(self.reason.clone()))
    }

    fn patient_conditions(&self, _: &str) -> Result<Vec<String>, GraphError> {
        Err(GraphError::Unavailable(self.reason.clone()))
    }

    fn ping(&self) -> Result<Duration, GraphError> {
        Err(GraphError::Unavailable(self.reason.clone()))
    }
}
