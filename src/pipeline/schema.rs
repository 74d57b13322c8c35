//! Consultation schema contract.
//!
//! `validate` is the only way structured output becomes a `Consultation`;
//! every inference mode and every draft mutation funnels through it.
//! `describe` produces the JSON-Schema sent to inference backends so they can
//! constrain their own output.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::models::{BillingCode, Consultation, DiagnosisEntry, MedicationEntry, PrescriptionItem};

/// One rejected field, addressed by path (e.g. `diagnosis[1].confidence`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldIssue {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for FieldIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            f.write_str(&self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Consultation failed schema validation: {}", join_issues(.issues))]
pub struct ValidationError {
    pub issues: Vec<FieldIssue>,
}

impl ValidationError {
    pub fn single(path: &str, message: &str) -> Self {
        Self {
            issues: vec![FieldIssue {
                path: path.into(),
                message: message.into(),
            }],
        }
    }

    /// Whether any issue concerns `path` or one of its children.
    pub fn touches(&self, path: &str) -> bool {
        self.issues.iter().any(|i| i.path.starts_with(path))
    }
}

fn join_issues(issues: &[FieldIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Machine-readable structural description of a Consultation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineSchema(pub Value);

impl MachineSchema {
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn to_pretty_string(&self) -> String {
        serde_json::to_string_pretty(&self.0).unwrap_or_else(|_| self.0.to_string())
    }
}

// ═══════════════════════════════════════════
// validate
// ═══════════════════════════════════════════

/// Check a candidate JSON value against the contract.
///
/// Unknown top-level keys are ignored. Optional lists default to empty.
pub fn validate(candidate: &Value) -> Result<Consultation, ValidationError> {
    let Some(obj) = candidate.as_object() else {
        return Err(ValidationError::single(
            "",
            &format!("expected an object, got {}", type_name(candidate)),
        ));
    };

    let mut check = Checker::default();

    let patient_id = check.text(obj, "patientId", "patientId");
    let transcript = check.text(obj, "transcript", "transcript");

    let symptoms = check.list(obj, "symptoms", true, |check, item, path| {
        check.text_value(item, &path)
    });

    let diagnosis = check.list(obj, "diagnosis", true, |check, item, path| {
        let entry = check.object(item, &path)?;
        Some(DiagnosisEntry {
            code: check.text(entry, "code", &format!("{path}.code"))?,
            label: check.text(entry, "label", &format!("{path}.label"))?,
            confidence: check.confidence(entry, "confidence", &format!("{path}.confidence"))?,
        })
    });

    let medications = check.list(obj, "medications", false, |check, item, path| {
        let entry = check.object(item, &path)?;
        let name = check.text(entry, "name", &format!("{path}.name"));
        let dosage = check.text(entry, "dosage", &format!("{path}.dosage"));
        let duration = check.text(entry, "duration", &format!("{path}.duration"));
        Some(MedicationEntry {
            name: name?,
            dosage: dosage?,
            duration: duration?,
        })
    });

    let billing_codes = check.list(obj, "billingCodes", false, |check, item, path| {
        let entry = check.object(item, &path)?;
        let code = check.text(entry, "code", &format!("{path}.code"));
        let label = check.text(entry, "label", &format!("{path}.label"));
        let confidence = check.confidence(entry, "confidence", &format!("{path}.confidence"));
        Some(BillingCode {
            code: code?,
            label: label?,
            confidence: confidence?,
        })
    });

    let prescription = check.list(obj, "prescription", false, |check, item, path| {
        let entry = check.object(item, &path)?;
        let drug = check.text(entry, "drug", &format!("{path}.drug"));
        let dosage = check.text(entry, "dosage", &format!("{path}.dosage"));
        let duration = check.text(entry, "duration", &format!("{path}.duration"));
        Some(PrescriptionItem {
            drug: drug?,
            dosage: dosage?,
            duration: duration?,
        })
    });

    let alerts = match obj.get("alerts") {
        None | Some(Value::Null) => None,
        Some(_) => check.list(obj, "alerts", false, |check, item, path| match item {
            Value::String(s) => Some(s.clone()),
            other => {
                check.fail(&path, format!("expected string, got {}", type_name(other)));
                None
            }
        }),
    };

    if !check.issues.is_empty() {
        return Err(ValidationError {
            issues: check.issues,
        });
    }

    // Every branch above recorded an issue when it returned None.
    match (patient_id, transcript, symptoms, diagnosis, medications, billing_codes, prescription) {
        (
            Some(patient_id),
            Some(transcript),
            Some(symptoms),
            Some(diagnosis),
            Some(medications),
            Some(billing_codes),
            Some(prescription),
        ) => Ok(Consultation {
            patient_id,
            transcript,
            symptoms,
            diagnosis,
            medications,
            billing_codes,
            prescription,
            alerts,
        }),
        _ => Err(ValidationError::single("", "incomplete consultation")),
    }
}

/// Validate an already-typed consultation (re-checks invariants).
pub fn revalidate(consultation: &Consultation) -> Result<Consultation, ValidationError> {
    let value = serde_json::to_value(consultation)
        .map_err(|e| ValidationError::single("", &e.to_string()))?;
    validate(&value)
}

#[derive(Default)]
struct Checker {
    issues: Vec<FieldIssue>,
}

impl Checker {
    fn fail(&mut self, path: &str, message: impl Into<String>) {
        self.issues.push(FieldIssue {
            path: path.into(),
            message: message.into(),
        });
    }

    fn text(&mut self, obj: &Map<String, Value>, key: &str, path: &str) -> Option<String> {
        match obj.get(key) {
            None | Some(Value::Null) => {
                self.fail(path, "required");
                None
            }
            Some(value) => self.text_value(value, path),
        }
    }

    fn text_value(&mut self, value: &Value, path: &str) -> Option<String> {
        match value {
            Value::String(s) if s.trim().is_empty() => {
                self.fail(path, "must not be blank");
                None
            }
            Value::String(s) => Some(s.clone()),
            other => {
                self.fail(path, format!("expected string, got {}", type_name(other)));
                None
            }
        }
    }

    fn confidence(&mut self, obj: &Map<String, Value>, key: &str, path: &str) -> Option<f64> {
        match obj.get(key) {
            None | Some(Value::Null) => {
                self.fail(path, "required");
                None
            }
            Some(Value::Number(n)) => match n.as_f64() {
                Some(c) if (0.0..=1.0).contains(&c) => Some(c),
                Some(c) => {
                    self.fail(path, format!("must be between 0 and 1, got {c}"));
                    None
                }
                None => {
                    self.fail(path, "not a finite number");
                    None
                }
            },
            Some(other) => {
                self.fail(path, format!("expected number, got {}", type_name(other)));
                None
            }
        }
    }

    fn object<'a>(&mut self, value: &'a Value, path: &str) -> Option<&'a Map<String, Value>> {
        match value.as_object() {
            Some(obj) => Some(obj),
            None => {
                self.fail(path, format!("expected object, got {}", type_name(value)));
                None
            }
        }
    }

    /// Check a list field entry by entry. Absent optional lists are empty.
    fn list<T, F>(
        &mut self,
        obj: &Map<String, Value>,
        key: &str,
        non_empty: bool,
        mut entry: F,
    ) -> Option<Vec<T>>
    where
        F: FnMut(&mut Self, &Value, String) -> Option<T>,
    {
        let items = match obj.get(key) {
            None | Some(Value::Null) if non_empty => {
                self.fail(key, "required");
                return None;
            }
            None | Some(Value::Null) => return Some(Vec::new()),
            Some(Value::Array(items)) => items,
            Some(other) => {
                self.fail(key, format!("expected array, got {}", type_name(other)));
                return None;
            }
        };

        if non_empty && items.is_empty() {
            self.fail(key, "must contain at least one entry");
            return None;
        }

        let mut out = Vec::with_capacity(items.len());
        let mut all_ok = true;
        for (i, item) in items.iter().enumerate() {
            match entry(self, item, format!("{key}[{i}]")) {
                Some(value) => out.push(value),
                None => all_ok = false,
            }
        }
        all_ok.then_some(out)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ═══════════════════════════════════════════
// describe
// ═══════════════════════════════════════════

/// JSON-Schema description of the contract, embedded in backend prompts.
pub fn describe() -> MachineSchema {
    let text = |description: &str| json!({ "type": "string", "minLength": 1, "description": description });
    let confidence = json!({ "type": "number", "minimum": 0, "maximum": 1 });

    MachineSchema(json!({
        "type": "object",
        "title": "Consultation",
        "properties": {
            "patientId": text("Patient identifier"),
            "transcript": text("Raw dictation text"),
            "symptoms": {
                "type": "array",
                "minItems": 1,
                "items": { "type": "string", "minLength": 1 },
                "description": "Symptoms reported or observed"
            },
            "diagnosis": {
                "type": "array",
                "minItems": 1,
                "items": {
                    "type": "object",
                    "properties": {
                        "code": text("ICD-10 code"),
                        "label": text("Diagnosis label"),
                        "confidence": confidence.clone()
                    },
                    "required": ["code", "label", "confidence"]
                }
            },
            "medications": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": text("Drug name"),
                        "dosage": text("Dose per intake"),
                        "duration": text("Treatment duration")
                    },
                    "required": ["name", "dosage", "duration"]
                },
                "default": []
            },
            "billingCodes": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "code": text("CCAM act code"),
                        "label": text("Act label"),
                        "confidence": confidence
                    },
                    "required": ["code", "label", "confidence"]
                },
                "default": []
            },
            "prescription": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "drug": text("Drug name"),
                        "dosage": text("Dose per intake"),
                        "duration": text("Treatment duration")
                    },
                    "required": ["drug", "dosage", "duration"]
                },
                "default": []
            },
            "alerts": {
                "type": "array",
                "items": { "type": "string" }
            }
        },
        "required": ["patientId", "transcript", "symptoms", "diagnosis"]
    }))
}
