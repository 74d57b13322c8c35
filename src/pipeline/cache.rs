//! Content-addressed cache of structuring results.
//!
//! Keyed by the SHA-256 of the trimmed, lowercased input text. Purely an
//! optimization: a miss only costs a backend call. Entries expire after the
//! TTL and the cache is bounded, so distinct dictations cannot grow it
//! without limit.

use std::time::Duration;

use moka::sync::Cache;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::models::Consultation;

const KEY_PREFIX: &str = "scribe:consultation:";

/// Upper bound on cached consultations.
pub const DEFAULT_MAX_ENTRIES: u64 = 10_000;

/// Size and limits of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: u64,
    pub max_entries: u64,
    pub ttl_ms: u64,
}

pub struct ResultCache {
    ttl: Duration,
    max_entries: u64,
    entries: Cache<String, Consultation>,
}

impl ResultCache {
    pub fn new(ttl: Duration) -> Self {
        Self::with_capacity(ttl, DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(ttl: Duration, max_entries: u64) -> Self {
        Self {
            ttl,
            max_entries,
            entries: Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Cache key for a dictation.
    pub fn key_for(text: &str) -> String {
        let normalized = text.trim().to_lowercase();
        format!("{KEY_PREFIX}{:x}", Sha256::digest(normalized.as_bytes()))
    }

    /// Live entry for `text`, if any.
    pub fn get(&self, text: &str) -> Option<Consultation> {
        self.entries.get(&Self::key_for(text))
    }

    pub fn put(&self, text: &str, consultation: &Consultation) {
        self.entries.insert(Self::key_for(text), consultation.clone());
    }

    /// Drop the entry for `text`. Returns whether one existed.
    pub fn invalidate(&self, text: &str) -> bool {
        self.entries.remove(&Self::key_for(text)).is_some()
    }

    /// Evict expired entries now instead of on the cache's own schedule.
    pub fn purge_expired(&self) {
        self.entries.run_pending_tasks();
    }

    pub fn len(&self) -> usize {
        self.purge_expired();
        self.entries.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.purge_expired();
        CacheStats {
            entries: self.entries.entry_count(),
            max_entries: self.max_entries,
            ttl_ms: self.ttl.as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DiagnosisEntry;

    fn consultation(patient_id: &str) -> Consultation {
        Consultation {
            patient_id: patient_id.into(),
            transcript: "Patient avec fièvre".into(),
            symptoms: vec!["Fièvre modérée".into()],
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

    #[test]
    fn key_ignores_case_and_surrounding_whitespace() {
        assert_eq!(
            ResultCache::key_for("  Patient avec FIÈVRE "),
            ResultCache::key_for("patient avec fièvre")
        );
        assert_ne!(
            ResultCache::key_for("patient avec fièvre"),
            ResultCache::key_for("patient avec toux")
        );
    }

    #[test]
    fn key_has_prefix_and_hex_digest() {
        let key = ResultCache::key_for("x");
        let digest = key.strip_prefix(KEY_PREFIX).unwrap();
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hit_after_put() {
        let cache = ResultCache::new(Duration::from_secs(60));
        assert!(cache.get("Patient avec fièvre").is_none());
        cache.put("Patient avec fièvre", &consultation("p1"));
        assert_eq!(cache.get("patient avec fièvre").unwrap().patient_id, "p1");
    }

    #[test]
    fn expired_entry_is_a_miss() {
        let cache = ResultCache::new(Duration::from_millis(10));
        cache.put("text", &consultation("p1"));
        std::thread::sleep(Duration::from_millis(25));
        assert!(cache.get("text").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn expired_entries_do_not_accumulate() {
        let cache = ResultCache::new(Duration::from_millis(5));
        for n in 0..200 {
            cache.put(&format!("dictée {n}"), &consultation("p1"));
        }
        std::thread::sleep(Duration::from_millis(30));
        for n in 0..10 {
            cache.put(&format!("nouvelle dictée {n}"), &consultation("p2"));
        }
        assert!(cache.len() <= 10, "{} entries left", cache.len());
        assert!(cache.get("dictée 0").is_none());
    }

    #[test]
    fn capacity_bounds_the_cache() {
        let cache = ResultCache::with_capacity(Duration::from_secs(60), 20);
        for n in 0..100 {
            cache.put(&format!("dictée {n}"), &consultation("p1"));
        }
        assert!(cache.len() <= 20, "{} entries left", cache.len());
    }

    #[test]
    fn stats_report_size_and_limits() {
        let cache = ResultCache::with_capacity(Duration::from_secs(60), 50);
        cache.put("a", &consultation("p1"));
        cache.put("b", &consultation("p2"));
        cache.put("A ", &consultation("p3"));
        assert_eq!(
            cache.stats(),
            CacheStats {
                entries: 2,
                max_entries: 50,
                ttl_ms: 60_000,
            }
        );
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = ResultCache::new(Duration::from_secs(60));
        cache.put("text", &consultation("p1"));
        assert!(cache.invalidate("TEXT"));
        assert!(!cache.invalidate("text"));
        assert!(cache.get("text").is_none());
    }
}
