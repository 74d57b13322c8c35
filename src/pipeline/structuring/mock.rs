//! Deterministic synthetic consultations.
//!
//! Used as the MOCK mode and as the fallback when a real backend fails.
//! Output is seeded by the SHA-256 of the normalized dictation, so the same
//! text always yields the same clinical content. Symptoms named in the text
//! are picked before random ones. A generated patient id is random, so two
//! anonymous dictations never share a patient.

use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

use crate::models::{BillingCode, Consultation, DiagnosisEntry, MedicationEntry, PrescriptionItem};

/// Transcript used when the dictation is empty.
pub const EMPTY_TRANSCRIPT_PLACEHOLDER: &str = "Transcription générée en mode MOCK";

const SYMPTOM_POOL: &[&str] = &[
    "Fièvre modérée",
    "Maux de tête",
    "Toux sèche",
    "Fatigue",
    "Nausée",
    "Douleurs articulaires",
    "Frissons",
    "Congestion nasale",
    "Mal de gorge",
    "Courbatures",
    "Essoufflement",
    "Douleurs musculaires",
];

/// (keyword in lowercase dictation, pool symptom)
const SYMPTOM_KEYWORDS: &[(&str, &str)] = &[
    ("fièvre", "Fièvre modérée"),
    ("fievre", "Fièvre modérée"),
    ("tête", "Maux de tête"),
    ("céphalée", "Maux de tête"),
    ("toux", "Toux sèche"),
    ("fatigue", "Fatigue"),
    ("nausée", "Nausée"),
    ("articul", "Douleurs articulaires"),
    ("frisson", "Frissons"),
    ("congestion", "Congestion nasale"),
    ("gorge", "Mal de gorge"),
    ("courbature", "Courbatures"),
    ("essouffl", "Essoufflement"),
    ("muscul", "Douleurs musculaires"),
];

/// (ICD-10 code, label, confidence)
const DIAGNOSIS_POOL: &[(&str, &str, f64)] = &[
    ("J11.1", "Grippe saisonnière", 0.85),
    ("J00", "Rhume", 0.75),
    ("J06.9", "Infection des voies respiratoires supérieures", 0.80),
    ("A09", "Gastro-entérite", 0.70),
    ("G43.9", "Migraine", 0.65),
    ("R53.83", "Fatigue chronique", 0.60),
    ("J10.1", "Grippe avec autre manifestation respiratoire", 0.90),
];

/// (name, dosage, duration)
const MEDICATION_POOL: &[(&str, &str, &str)] = &[
    ("Paracétamol", "500mg", "7 jours"),
    ("Ibuprofène", "400mg", "5 jours"),
    ("Amoxicilline", "1g", "10 jours"),
    ("Amoxiclav", "625mg", "7 jours"),
    ("Doliprane", "1000mg", "3 jours"),
    ("Strepsils", "1 comprimé", "5 jours"),
];

/// (CCAM code, label, confidence)
const BILLING_POOL: &[(&str, &str, f64)] = &[
    ("HBLT001", "Consultation au cabinet", 0.9),
    ("HBMD001", "Examen clinique", 0.85),
    ("JFSA001", "Bilan biologique", 0.7),
];

fn seed_for(text: &str) -> u64 {
    let digest = Sha256::digest(text.trim().to_lowercase().as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// Symptoms from the pool mentioned in the dictation, in pool order.
fn mentioned_symptoms(text: &str) -> Vec<&'static str> {
    let lowered = text.to_lowercase();
    let mut found: Vec<&'static str> = Vec::new();
    for symptom in SYMPTOM_POOL {
        let mentioned = SYMPTOM_KEYWORDS
            .iter()
            .any(|(keyword, target)| target == symptom && lowered.contains(keyword));
        if mentioned {
            found.push(*symptom);
        }
    }
    found
}

/// Build a schema-valid consultation from the dictation alone.
pub fn synthesize(text: &str, patient_id: Option<&str>) -> Consultation {
    let mut rng = StdRng::seed_from_u64(seed_for(text));

    let mut symptoms: Vec<String> = mentioned_symptoms(text).into_iter().map(String::from).collect();
    let wanted = rng.gen_range(1..=5).max(symptoms.len());
    let remaining: Vec<&str> = SYMPTOM_POOL
        .iter()
        .copied()
        .filter(|s| !symptoms.iter().any(|picked| picked.as_str() == *s))
        .collect();
    let extra = wanted - symptoms.len();
    symptoms.extend(
        remaining
            .choose_multiple(&mut rng, extra)
            .map(|s| s.to_string()),
    );

    let diagnosis_count = rng.gen_range(1..=3);
    let diagnosis = DIAGNOSIS_POOL
        .choose_multiple(&mut rng, diagnosis_count)
        .map(|(code, label, confidence)| DiagnosisEntry {
            code: code.to_string(),
            label: label.to_string(),
            confidence: *confidence,
        })
        .collect();

    let medication_count = rng.gen_range(0..=3);
    let medications: Vec<MedicationEntry> = MEDICATION_POOL
        .choose_multiple(&mut rng, medication_count)
        .map(|(name, dosage, duration)| MedicationEntry {
            name: name.to_string(),
            dosage: dosage.to_string(),
            duration: duration.to_string(),
        })
        .collect();

    let prescription = medications
        .iter()
        .map(|m| PrescriptionItem {
            drug: m.name.clone(),
            dosage: m.dosage.clone(),
            duration: m.duration.clone(),
        })
        .collect();

    let billing_count = rng.gen_range(1..=2);
    let billing_codes = BILLING_POOL
        .choose_multiple(&mut rng, billing_count)
        .map(|(code, label, confidence)| BillingCode {
            code: code.to_string(),
            label: label.to_string(),
            confidence: *confidence,
        })
        .collect();

    let patient_id = match patient_id.map(str::trim).filter(|p| !p.is_empty()) {
        Some(id) => id.to_string(),
        None => {
            let suffix: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(10)
                .map(char::from)
                .collect();
            format!("patient_{suffix}")
        }
    };

    let transcript = if text.trim().is_empty() {
        EMPTY_TRANSCRIPT_PLACEHOLDER.to_string()
    } else {
        text.to_string()
    };

    Consultation {
        patient_id,
        transcript,
        symptoms,
        diagnosis,
        medications,
        billing_codes,
        prescription,
        alerts: None,
    }
}
