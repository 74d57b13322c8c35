//! Partial updates of a draft's structured data.
//!
//! Objects merge key by key; arrays and scalars present in the patch replace
//! the stored value outright. `null` in the patch leaves the field alone.
//! Blank list entries are dropped after merging so a form that submits an
//! empty row does not fail validation.

use serde_json::Value;

use crate::models::Consultation;
use crate::pipeline::schema::ValidationError;

/// Merge `patch` into `base` in place.
pub fn deep_merge(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                if value.is_null() {
                    continue;
                }
                let nested = value.is_object() && base.get(key).is_some_and(Value::is_object);
                if nested {
                    if let Some(existing) = base.get_mut(key) {
                        deep_merge(existing, value);
                    }
                } else {
                    base.insert(key.clone(), value.clone());
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        _ => false,
    }
}

/// (list field, key that must be non-blank for an entry to be kept)
const KEYED_LISTS: &[(&str, &str)] = &[
    ("diagnosis", "code"),
    ("medications", "name"),
    ("billingCodes", "code"),
    ("prescription", "drug"),
];

/// Remove blank strings and keyless rows from the list fields.
pub fn drop_blank_entries(value: &mut Value) {
    let Some(obj) = value.as_object_mut() else {
        return;
    };

    for field in ["symptoms", "alerts"] {
        if let Some(Value::Array(items)) = obj.get_mut(field) {
            items.retain(|item| !is_blank(Some(item)));
        }
    }

    for (field, key) in KEYED_LISTS {
        if let Some(Value::Array(items)) = obj.get_mut(*field) {
            items.retain(|item| match item {
                Value::Object(entry) => {
                    // Diagnosis rows keyed by label are kept too.
                    !(is_blank(entry.get(*key)) && is_blank(entry.get("label")))
                }
                Value::Null => false,
                _ => true,
            });
        }
    }
}

/// Merge a partial update over an existing consultation, unvalidated.
pub fn apply_partial(existing: &Consultation, partial: &Value) -> Result<Value, ValidationError> {
    if !partial.is_object() {
        return Err(ValidationError::single("", "update must be a JSON object"));
    }
    let mut merged = serde_json::to_value(existing)
        .map_err(|e| ValidationError::single("", &e.to_string()))?;
    deep_merge(&mut merged, partial);
    drop_blank_entries(&mut merged);
    Ok(merged)
}

/// Shape backend output before validation. The caller's patient id wins and
/// the transcript is the dictation that was sent, whatever the backend echoed.
pub fn normalize_candidate(mut candidate: Value, text: &str, patient_id: Option<&str>) -> Value {
    if let Some(obj) = candidate.as_object_mut() {
        if let Some(id) = patient_id.map(str::trim).filter(|id| !id.is_empty()) {
            obj.insert("patientId".to_string(), Value::String(id.to_string()));
        }
        if !text.trim().is_empty() {
            obj.insert("transcript".to_string(), Value::String(text.to_string()));
        }
    }
    candidate
}
