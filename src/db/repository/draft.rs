use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::db::DatabaseError;
use crate::models::*;

const DRAFT_COLUMNS: &str =
    "id, patient_id, status, structured_data, version, created_at, updated_at";

pub fn insert_draft(conn: &Connection, draft: &ConsultationDraft) -> Result<(), DatabaseError> {
    let data = serde_json::to_string(&draft.structured_data).map_err(|e| {
        DatabaseError::CorruptRecord {
            entity_type: "ConsultationDraft".into(),
            id: draft.id.to_string(),
            reason: e.to_string(),
        }
    })?;

    conn.execute(
        "INSERT INTO consultation_drafts (id, patient_id, status, structured_data, version,
         created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            draft.id.to_string(),
            draft.patient_id,
            draft.status.as_str(),
            data,
            draft.version,
            draft.created_at.to_rfc3339(),
            draft.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn get_draft(conn: &Connection, id: &Uuid) -> Result<Option<ConsultationDraft>, DatabaseError> {
    let sql = format!("SELECT {DRAFT_COLUMNS} FROM consultation_drafts WHERE id = ?1");
    let mut stmt = conn.prepare(&sql)?;

    let result = stmt.query_row(params![id.to_string()], |row| {
        Ok(DraftRow {
            id: row.get(0)?,
            patient_id: row.get(1)?,
            status: row.get(2)?,
            structured_data: row.get(3)?,
            version: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    });

    match result {
        Ok(row) => Ok(Some(draft_from_row(row)?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Overwrite structured data if the row is still a DRAFT at `expected_version`.
///
/// Returns the number of rows changed (0 when the guard did not match).
pub fn update_draft_data(
    conn: &Connection,
    id: &Uuid,
    expected_version: i64,
    patient_id: &str,
    data: &Consultation,
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let json = serde_json::to_string(data).map_err(|e| DatabaseError::CorruptRecord {
        entity_type: "ConsultationDraft".into(),
        id: id.to_string(),
        reason: e.to_string(),
    })?;

    let changed = conn.execute(
        "UPDATE consultation_drafts
         SET structured_data = ?1, patient_id = ?2, version = version + 1, updated_at = ?3
         WHERE id = ?4 AND version = ?5 AND status = 'DRAFT'",
        params![json, patient_id, now.to_rfc3339(), id.to_string(), expected_version],
    )?;
    Ok(changed)
}

/// Flip a DRAFT row at `expected_version` to VALIDATED.
///
/// Returns 0 if it was not in DRAFT or has been edited since.
pub fn mark_draft_validated(
    conn: &Connection,
    id: &Uuid,
    expected_version: i64,
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE consultation_drafts
         SET status = 'VALIDATED', version = version + 1, updated_at = ?1
         WHERE id = ?2 AND version = ?3 AND status = 'DRAFT'",
        params![now.to_rfc3339(), id.to_string(), expected_version],
    )?;
    Ok(changed)
}

/// Draft totals by lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftCounts {
    pub total: i64,
    pub draft: i64,
    pub validated: i64,
}

pub fn count_drafts_by_status(conn: &Connection) -> Result<DraftCounts, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT status, COUNT(*) FROM consultation_drafts GROUP BY status")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

    let mut counts = DraftCounts::default();
    for row in rows {
        let (status, count) = row?;
        match DraftStatus::from_str(&status)? {
            DraftStatus::Draft => counts.draft = count,
            DraftStatus::Validated => counts.validated = count,
        }
        counts.total += count;
    }
    Ok(counts)
}

// Internal row type for ConsultationDraft mapping
struct DraftRow {
    id: String,
    patient_id: String,
    status: String,
    structured_data: String,
    version: i64,
    created_at: String,
    updated_at: String,
}

fn draft_from_row(row: DraftRow) -> Result<ConsultationDraft, DatabaseError> {
    let corrupt = |reason: String| DatabaseError::CorruptRecord {
        entity_type: "ConsultationDraft".into(),
        id: row.id.clone(),
        reason,
    };

    let structured_data: Consultation =
        serde_json::from_str(&row.structured_data).map_err(|e| corrupt(e.to_string()))?;

    Ok(ConsultationDraft {
        id: Uuid::parse_str(&row.id).map_err(|e| corrupt(e.to_string()))?,
        patient_id: row.patient_id.clone(),
        status: DraftStatus::from_str(&row.status)?,
        structured_data,
        version: row.version,
        created_at: parse_timestamp(&row.created_at),
        updated_at: parse_timestamp(&row.updated_at),
    })
}

pub(crate) fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::open_memory_database;

    fn sample_consultation() -> Consultation {
        Consultation {
            patient_id: "patient_001".into(),
            transcript: "Patient avec fièvre et toux".into(),
            symptoms: vec!["Fièvre".into(), "Toux".into()],
            diagnosis: vec![DiagnosisEntry {
                code: "J11.1".into(),
                label: "Grippe saisonnière".into(),
                confidence: 0.85,
            }],
            medications: vec![],
            billing_codes: vec![],
            prescription: vec![],
            alerts: None,
        }
    }

    fn sample_draft() -> ConsultationDraft {
        let now = Utc::now();
        ConsultationDraft {
            id: Uuid::new_v4(),
            patient_id: "patient_001".into(),
            status: DraftStatus::Draft,
            structured_data: sample_consultation(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn insert_and_get_draft() {
        let conn = open_memory_database().unwrap();
        let draft = sample_draft();
        insert_draft(&conn, &draft).unwrap();

        let loaded = get_draft(&conn, &draft.id).unwrap().unwrap();
        assert_eq!(loaded.patient_id, "patient_001");
        assert_eq!(loaded.status, DraftStatus::Draft);
        assert_eq!(loaded.structured_data, draft.structured_data);
        assert_eq!(loaded.version, 1);
    }

    #[test]
    fn get_missing_draft_returns_none() {
        let conn = open_memory_database().unwrap();
        assert!(get_draft(&conn, &Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn update_requires_matching_version() {
        let conn = open_memory_database().unwrap();
        let draft = sample_draft();
        insert_draft(&conn, &draft).unwrap();

        let mut data = draft.structured_data.clone();
        data.symptoms = vec!["Fatigue".into()];

        assert_eq!(update_draft_data(&conn, &draft.id, 7, "patient_001", &data, Utc::now()).unwrap(), 0);
        assert_eq!(update_draft_data(&conn, &draft.id, 1, "patient_001", &data, Utc::now()).unwrap(), 1);

        let loaded = get_draft(&conn, &draft.id).unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.structured_data.symptoms, vec!["Fatigue".to_string()]);
    }

    #[test]
    fn validated_draft_rejects_data_update() {
        let conn = open_memory_database().unwrap();
        let draft = sample_draft();
        insert_draft(&conn, &draft).unwrap();

        assert_eq!(mark_draft_validated(&conn, &draft.id, 1, Utc::now()).unwrap(), 1);
        assert_eq!(mark_draft_validated(&conn, &draft.id, 2, Utc::now()).unwrap(), 0);

        let loaded = get_draft(&conn, &draft.id).unwrap().unwrap();
        let changed = update_draft_data(
            &conn,
            &draft.id,
            loaded.version,
            "patient_001",
            &loaded.structured_data,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(changed, 0);
    }

    #[test]
    fn stale_version_does_not_validate() {
        let conn = open_memory_database().unwrap();
        let draft = sample_draft();
        insert_draft(&conn, &draft).unwrap();
        update_draft_data(&conn, &draft.id, 1, "patient_001", &draft.structured_data, Utc::now())
            .unwrap();

        assert_eq!(mark_draft_validated(&conn, &draft.id, 1, Utc::now()).unwrap(), 0);
        let loaded = get_draft(&conn, &draft.id).unwrap().unwrap();
        assert_eq!(loaded.status, DraftStatus::Draft);
        assert_eq!(mark_draft_validated(&conn, &draft.id, 2, Utc::now()).unwrap(), 1);
    }

    #[test]
    fn counts_by_status() {
        let conn = open_memory_database().unwrap();
        let first = sample_draft();
        let second = sample_draft();
        insert_draft(&conn, &first).unwrap();
        insert_draft(&conn, &second).unwrap();
        mark_draft_validated(&conn, &second.id, 1, Utc::now()).unwrap();

        let counts = count_drafts_by_status(&conn).unwrap();
        assert_eq!(counts, DraftCounts { total: 2, draft: 1, validated: 1 });
    }

    #[test]
    fn corrupt_json_is_reported() {
        let conn = open_memory_database().unwrap();
        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO consultation_drafts (id, patient_id, status, structured_data, version, created_at, updated_at)
             VALUES (?1, 'p', 'DRAFT', '{not json', 1, '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            params![id.to_string()],
        )
        .unwrap();

        let err = get_draft(&conn, &id).unwrap_err();
        assert!(matches!(err, DatabaseError::CorruptRecord { .. }));
    }
}
