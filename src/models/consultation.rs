use serde::{Deserialize, Serialize};

/// Validated structured output of one dictation.
///
/// Only ever built through `pipeline::schema::validate`, so `symptoms` and
/// `diagnosis` are non-empty and every confidence lies in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Consultation {
    pub patient_id: String,
    pub transcript: String,
    pub symptoms: Vec<String>,
    pub diagnosis: Vec<DiagnosisEntry>,
    #[serde(default)]
    pub medications: Vec<MedicationEntry>,
    #[serde(default)]
    pub billing_codes: Vec<BillingCode>,
    #[serde(default)]
    pub prescription: Vec<PrescriptionItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alerts: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisEntry {
    pub code: String,
    pub label: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedicationEntry {
    pub name: String,
    pub dosage: String,
    pub duration: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingCode {
    pub code: String,
    pub label: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrescriptionItem {
    pub drug: String,
    pub dosage: String,
    pub duration: String,
}
