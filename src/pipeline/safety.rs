//! Medication safety check against the patient's known allergies.
//!
//! Allergies come from the graph: diagnoses linked to the patient by
//! `HAS_CONDITION` whose label names an allergy ("Allergie à la pénicilline").
//! A prescribed medication conflicts when it names the allergen itself or
//! belongs to an allergen family. Alerts never block a draft, and an
//! unreachable graph yields no alerts.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::graph::{GraphError, GraphStore};
use crate::models::{Consultation, MedicationEntry};

/// Drug → allergen families it belongs to. Lowercase.
const DRUG_ALLERGENS: &[(&str, &[&str])] = &[
    ("amoxicilline", &["pénicilline", "penicillin"]),
    ("amoxicillin", &["pénicilline", "penicillin"]),
    ("ampicilline", &["pénicilline", "penicillin"]),
    ("ampicillin", &["pénicilline", "penicillin"]),
    ("penicillin", &["pénicilline", "penicillin"]),
    ("pénicilline", &["pénicilline", "penicillin"]),
    ("augmentin", &["pénicilline", "penicillin", "amoxicilline"]),
    ("coamoxiclav", &["pénicilline", "penicillin", "amoxicilline"]),
];

static ALLERGY_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\ballerg(?:ie|y)\s+(?:(?:à|a|aux|to)\s+)?(?:la\s+|le\s+|les\s+|l')?(.+)")
        .expect("allergy pattern is valid")
});

/// Substance named by an allergy condition label, lowercased.
///
/// `None` when the label is not an allergy.
pub fn allergen_from_condition(label: &str) -> Option<String> {
    let captures = ALLERGY_LABEL.captures(label.trim())?;
    let substance = captures.get(1)?.as_str().trim().to_lowercase();
    (!substance.is_empty()).then_some(substance)
}

fn overlaps(a: &str, b: &str) -> bool {
    a == b || a.contains(b) || b.contains(a)
}

fn allergens_for_drug(drug: &str) -> Vec<&'static str> {
    let mut out: Vec<&'static str> = Vec::new();
    for (name, allergens) in DRUG_ALLERGENS {
        if overlaps(drug, name) {
            for allergen in allergens.iter().copied() {
                if !out.contains(&allergen) {
                    out.push(allergen);
                }
            }
        }
    }
    out
}

/// One alert per (medication, allergen) conflict.
pub fn medication_alerts(allergies: &[String], medications: &[MedicationEntry]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut alerts = Vec::new();

    for medication in medications {
        let name = medication.name.trim();
        if name.is_empty() {
            continue;
        }
        let drug = name.to_lowercase();

        let mut matched: Vec<String> = allergies
            .iter()
            .filter(|a| overlaps(a, &drug))
            .cloned()
            .collect();
        matched.extend(
            allergens_for_drug(&drug)
                .into_iter()
                .filter(|allergen| allergies.iter().any(|a| overlaps(a, allergen)))
                .map(str::to_string),
        );

        for allergen in matched {
            if seen.insert((drug.clone(), allergen.clone())) {
                alerts.push(format!(
                    "Contre-indication : {name} (allergie connue : {allergen}). Vérifier avant prescription."
                ));
            }
        }
    }
    alerts
}

pub struct SafetyGuard {
    graph: Arc<dyn GraphStore>,
}

impl SafetyGuard {
    pub fn new(graph: Arc<dyn GraphStore>) -> Self {
        Self { graph }
    }

    /// Allergens recorded for the patient, deduplicated.
    pub fn known_allergies(&self, patient_id: &str) -> Result<Vec<String>, GraphError> {
        let mut allergies = Vec::new();
        for label in self.graph.patient_conditions(patient_id)? {
            if let Some(allergen) = allergen_from_condition(&label) {
                if !allergies.contains(&allergen) {
                    allergies.push(allergen);
                }
            }
        }
        Ok(allergies)
    }

    /// Alerts for the consultation's medications. Empty when the graph
    /// cannot be read.
    pub fn check(&self, consultation: &Consultation) -> Vec<String> {
        let patient_id = consultation.patient_id.trim();
        if patient_id.is_empty() || consultation.medications.is_empty() {
            return Vec::new();
        }

        let allergies = match self.known_allergies(patient_id) {
            Ok(allergies) => allergies,
            Err(e) => {
                tracing::warn!(patient_id = %patient_id, error = %e, "Allergies unavailable, safety check skipped");
                return Vec::new();
            }
        };
        if allergies.is_empty() {
            return Vec::new();
        }

        let alerts = medication_alerts(&allergies, &consultation.medications);
        if !alerts.is_empty() {
            tracing::info!(patient_id = %patient_id, alerts = alerts.len(), "Medication conflicts with known allergies");
        }
        alerts
    }
}
