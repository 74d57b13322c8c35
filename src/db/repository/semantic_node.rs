use std::str::FromStr;

use rusqlite::{params, Connection};
use uuid::Uuid;

use super::draft::parse_timestamp;
use crate::db::DatabaseError;
use crate::models::*;

pub fn insert_semantic_node(conn: &Connection, node: &SemanticNode) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO semantic_nodes (id, draft_id, patient_id, node_type, label, code, confidence,
         created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            node.id.to_string(),
            node.draft_id.to_string(),
            node.patient_id,
            node.node_type.as_str(),
            node.label,
            node.code,
            node.confidence,
            node.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn get_nodes_for_draft(
    conn: &Connection,
    draft_id: &Uuid,
) -> Result<Vec<SemanticNode>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, draft_id, patient_id, node_type, label, code, confidence, created_at
         FROM semantic_nodes WHERE draft_id = ?1 ORDER BY rowid",
    )?;

    let rows = stmt.query_map(params![draft_id.to_string()], |row| {
        Ok(SemanticNodeRow {
            id: row.get(0)?,
            draft_id: row.get(1)?,
            patient_id: row.get(2)?,
            node_type: row.get(3)?,
            label: row.get(4)?,
            code: row.get(5)?,
            confidence: row.get(6)?,
            created_at: row.get(7)?,
        })
    })?;

    let mut nodes = Vec::new();
    for row in rows {
        nodes.push(semantic_node_from_row(row?)?);
    }
    Ok(nodes)
}

pub fn count_semantic_nodes(conn: &Connection) -> Result<i64, DatabaseError> {
    let count = conn.query_row("SELECT COUNT(*) FROM semantic_nodes", [], |row| row.get(0))?;
    Ok(count)
}

struct SemanticNodeRow {
    id: String,
    draft_id: String,
    patient_id: String,
    node_type: String,
    label: String,
    code: Option<String>,
    confidence: Option<f64>,
    created_at: String,
}

fn semantic_node_from_row(row: SemanticNodeRow) -> Result<SemanticNode, DatabaseError> {
    let parse_id = |value: &str| {
        Uuid::parse_str(value).map_err(|e| DatabaseError::CorruptRecord {
            entity_type: "SemanticNode".into(),
            id: row.id.clone(),
            reason: e.to_string(),
        })
    };

    Ok(SemanticNode {
        id: parse_id(&row.id)?,
        draft_id: parse_id(&row.draft_id)?,
        patient_id: row.patient_id.clone(),
        node_type: SemanticNodeType::from_str(&row.node_type)?,
        label: row.label.clone(),
        code: row.code.clone(),
        confidence: row.confidence,
        created_at: parse_timestamp(&row.created_at),
    })
}
