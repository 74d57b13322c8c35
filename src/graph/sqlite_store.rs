//! Graph store on its own SQLite file.
//!
//! Nodes are unique on `(label, node_key)` and edges on
//! `(kind, from_node, to_node)`, so a merge is a lookup followed by either an
//! insert or a touch of `updated_at` (with properties patched in).

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use super::store::*;
use super::GraphError;
use crate::db::sqlite::{apply_migrations, configure_pragmas};

const GRAPH_MIGRATIONS: &[(i64, &str)] = &[(
    1,
    include_str!("../../resources/migrations/graph/001_graph.sql"),
)];

pub struct SqliteGraphStore {
    conn: Mutex<Connection>,
}

impl SqliteGraphStore {
    pub fn open(path: &Path) -> Result<Self, GraphError> {
        let conn = Connection::open(path).map_err(|e| GraphError::Unavailable(e.to_string()))?;
        Self::prepare(conn)
    }

    pub fn open_in_memory() -> Result<Self, GraphError> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> Result<Self, GraphError> {
        configure_pragmas(&conn).map_err(|e| GraphError::Migration(e.to_string()))?;
        apply_migrations(&conn, GRAPH_MIGRATIONS).map_err(|e| GraphError::Migration(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, GraphError> {
        self.conn.lock().map_err(|_| GraphError::LockPoisoned)
    }

    /// Properties stored on a node, for inspection.
    pub fn node_properties(&self, node: &NodeRef) -> Result<Option<Value>, GraphError> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT properties FROM graph_nodes WHERE label = ?1 AND node_key = ?2",
                params![node.label.as_str(), node.key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }

    /// Number of edges of `kind` leaving `from`.
    pub fn edge_count_from(&self, kind: RelationKind, from: &NodeRef) -> Result<i64, GraphError> {
        let conn = self.lock()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM graph_edges e
             JOIN graph_nodes n ON n.id = e.from_node
             WHERE e.kind = ?1 AND n.label = ?2 AND n.node_key = ?3",
            params![kind.as_str(), from.label.as_str(), from.key],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn node_id(conn: &Connection, node: &NodeRef) -> Result<Option<i64>, GraphError> {
    let id = conn
        .query_row(
            "SELECT id FROM graph_nodes WHERE label = ?1 AND node_key = ?2",
            params![node.label.as_str(), node.key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

/// Returns true when the node was created.
fn merge_node(
    conn: &Connection,
    node: &NodeRef,
    properties: &Value,
    now: &str,
) -> Result<bool, GraphError> {
    let props = properties.to_string();
    match node_id(conn, node)? {
        Some(id) => {
            conn.execute(
                "UPDATE graph_nodes SET properties = json_patch(properties, ?1), updated_at = ?2
                 WHERE id = ?3",
                params![props, now, id],
            )?;
            Ok(false)
        }
        None => {
            conn.execute(
                "INSERT INTO graph_nodes (label, node_key, properties, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![node.label.as_str(), node.key, props, now],
            )?;
            Ok(true)
        }
    }
}

/// Returns true when the edge was created.
fn merge_edge(
    conn: &Connection,
    kind: RelationKind,
    from: &NodeRef,
    to: &NodeRef,
    properties: &Value,
    now: &str,
) -> Result<bool, GraphError> {
    let endpoint = |node: &NodeRef| -> Result<i64, GraphError> {
        node_id(conn, node)?.ok_or_else(|| GraphError::MissingEndpoint {
            kind: kind.as_str().into(),
            label: node.label.as_str().into(),
            key: node.key.clone(),
        })
    };
    let from_id = endpoint(from)?;
    let to_id = endpoint(to)?;
    let props = properties.to_string();

    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM graph_edges WHERE kind = ?1 AND from_node = ?2 AND to_node = ?3",
            params![kind.as_str(), from_id, to_id],
            |row| row.get(0),
        )
        .optional()?;

    match existing {
        Some(id) => {
            conn.execute(
                "UPDATE graph_edges SET properties = json_patch(properties, ?1), updated_at = ?2
                 WHERE id = ?3",
                params![props, now, id],
            )?;
            Ok(false)
        }
        None => {
            conn.execute(
                "INSERT INTO graph_edges (kind, from_node, to_node, properties, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![kind.as_str(), from_id, to_id, props, now],
            )?;
            Ok(true)
        }
    }
}

impl GraphStore for SqliteGraphStore {
    fn execute_batch(
        &self,
        statements: &[GraphStatement],
    ) -> Result<Vec<StatementSummary>, GraphError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        let mut summaries = Vec::with_capacity(statements.len());
        for statement in statements {
            let summary = match statement {
                GraphStatement::MergeNode { node, properties } => StatementSummary {
                    nodes_created: usize::from(merge_node(&tx, node, properties, &now)?),
                    relationships_created: 0,
                },
                GraphStatement::MergeEdge {
                    kind,
                    from,
                    to,
                    properties,
                } => StatementSummary {
                    nodes_created: 0,
                    relationships_created: usize::from(merge_edge(
                        &tx, *kind, from, to, properties, &now,
                    )?),
                },
            };
            summaries.push(summary);
        }

        tx.commit()?;
        Ok(summaries)
    }

    fn counts(&self) -> Result<GraphCounts, GraphError> {
        let conn = self.lock()?;
        let nodes = conn.query_row("SELECT COUNT(*) FROM graph_nodes", [], |row| row.get(0))?;
        let edges = conn.query_row("SELECT COUNT(*) FROM graph_edges", [], |row| row.get(0))?;
        Ok(GraphCounts { nodes, edges })
    }

    fn patient_conditions(&self, patient_id: &str) -> Result<Vec<String>, GraphError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT json_extract(c.properties, '$.label')
             FROM graph_nodes p
             JOIN graph_edges e ON e.from_node = p.id AND e.kind = ?1
             JOIN graph_nodes c ON c.id = e.to_node
             WHERE p.label = ?2 AND p.node_key = ?3 AND c.label = ?4",
        )?;
        let rows = stmt.query_map(
            params![
                RelationKind::HasCondition.as_str(),
                NodeLabel::Patient.as_str(),
                patient_id.trim(),
                NodeLabel::Diagnosis.as_str()
            ],
            |row| row.get::<_, Option<String>>(0),
        )?;

        let mut labels = Vec::new();
        for row in rows {
            if let Some(label) = row? {
                labels.push(label);
            }
        }
        Ok(labels)
    }

    fn ping(&self) -> Result<Duration, GraphError> {
        let started = Instant::now();
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(started.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patient() -> NodeRef {
        NodeRef::new(NodeLabel::Patient, "patient_1")
    }

    fn symptom() -> NodeRef {
        NodeRef::new(NodeLabel::Symptom, "toux sèche")
    }

    fn batch() -> Vec<GraphStatement> {
        vec![
            GraphStatement::MergeNode {
                node: patient(),
                properties: json!({ "id": "patient_1" }),
            },
            GraphStatement::MergeNode {
                node: symptom(),
                properties: json!({ "name": "toux sèche", "label": "Toux sèche" }),
            },
            GraphStatement::MergeEdge {
                kind: RelationKind::HasSymptom,
                from: patient(),
                to: symptom(),
                properties: json!({}),
            },
        ]
    }

    #[test]
    fn first_batch_creates_everything() {
        let store = SqliteGraphStore::open_in_memory().unwrap();
        let summaries = store.execute_batch(&batch()).unwrap();

        assert_eq!(summaries.iter().map(|s| s.nodes_created).sum::<usize>(), 2);
        assert_eq!(summaries.iter().map(|s| s.relationships_created).sum::<usize>(), 1);
        assert_eq!(store.counts().unwrap(), GraphCounts { nodes: 2, edges: 1 });
    }

    #[test]
    fn repeated_batch_creates_nothing() {
        let store = SqliteGraphStore::open_in_memory().unwrap();
        store.execute_batch(&batch()).unwrap();
        let summaries = store.execute_batch(&batch()).unwrap();

        assert!(summaries.iter().all(|s| *s == StatementSummary::default()));
        assert_eq!(store.counts().unwrap(), GraphCounts { nodes: 2, edges: 1 });
    }

    #[test]
    fn merge_patches_properties() {
        let store = SqliteGraphStore::open_in_memory().unwrap();
        store.execute_batch(&batch()).unwrap();
        store
            .execute_batch(&[GraphStatement::MergeNode {
                node: symptom(),
                properties: json!({ "severity": "moderate" }),
            }])
            .unwrap();

        let props = store.node_properties(&symptom()).unwrap().unwrap();
        assert_eq!(props["label"], "Toux sèche");
        assert_eq!(props["severity"], "moderate");
    }

    #[test]
    fn edge_to_missing_node_rolls_back_batch() {
        let store = SqliteGraphStore::open_in_memory().unwrap();
        let statements = vec![
            GraphStatement::MergeNode {
                node: patient(),
                properties: json!({}),
            },
            GraphStatement::MergeEdge {
                kind: RelationKind::HasSymptom,
                from: patient(),
                to: symptom(),
                properties: json!({}),
            },
        ];

        let err = store.execute_batch(&statements).unwrap_err();
        assert!(matches!(err, GraphError::MissingEndpoint { .. }));
        assert_eq!(store.counts().unwrap(), GraphCounts::default());
    }

    #[test]
    fn patient_conditions_follow_has_condition_edges() {
        let store = SqliteGraphStore::open_in_memory().unwrap();
        let allergy = NodeRef::new(NodeLabel::Diagnosis, "Z88.0|Allergie à la pénicilline");
        let mut statements = batch();
        statements.push(GraphStatement::MergeNode {
            node: allergy.clone(),
            properties: json!({ "code": "Z88.0", "label": "Allergie à la pénicilline" }),
        });
        statements.push(GraphStatement::MergeEdge {
            kind: RelationKind::HasCondition,
            from: patient(),
            to: allergy,
            properties: json!({ "confidence": 0.9 }),
        });
        store.execute_batch(&statements).unwrap();

        assert_eq!(
            store.patient_conditions("patient_1").unwrap(),
            vec!["Allergie à la pénicilline".to_string()]
        );
        assert!(store.patient_conditions("patient_2").unwrap().is_empty());
    }

    #[test]
    fn open_in_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent").join("graph.db");
        assert!(SqliteGraphStore::open(&path).is_err());
    }

    #[test]
    fn file_store_persists_between_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.db");
        SqliteGraphStore::open(&path).unwrap().execute_batch(&batch()).unwrap();

        let reopened = SqliteGraphStore::open(&path).unwrap();
        assert_eq!(reopened.counts().unwrap(), GraphCounts { nodes: 2, edges: 1 });
        assert_eq!(reopened.edge_count_from(RelationKind::HasSymptom, &patient()).unwrap(), 1);
    }
}
