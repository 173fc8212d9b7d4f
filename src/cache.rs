// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Fingerprint-keyed, TTL-bounded, LRU-evicted last-resort response cache.
//!
//! Unlike a capacity-and-TTL cache built on an off-the-shelf eviction
//! policy, this cache's eviction rule is a spec requirement (single-pass
//! scan for the smallest `last_accessed`), so the map is hand-rolled over a
//! `parking_lot::RwLock<HashMap<..>>` rather than delegated to a crate that
//! owns its own eviction order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Deterministic from `{normalizedPrompt, operationType, criteriaFingerprint}`.
/// A hex-encoded SHA-256 digest; contains no plaintext of the original
/// request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(pub String);

impl CacheKey {
    pub fn compute(prompt: &str, operation_type: &str, criteria_fingerprint: &str) -> Self {
        let normalized_prompt = prompt.trim().to_lowercase();
        let canonical = serde_json::json!({
            "normalizedPrompt": normalized_prompt,
            "operationType": operation_type,
            "criteriaFingerprint": criteria_fingerprint,
        });
        // `serde_json::Value`'s `Map` is a `BTreeMap` by default (no
        // `preserve_order` feature here), so key order — and therefore the
        // digest — is stable regardless of insertion order above.
        let canonical_bytes = serde_json::to_vec(&canonical).expect("canonical JSON never fails to serialize");
        let mut hasher = Sha256::new();
        hasher.update(&canonical_bytes);
        let digest = hasher.finalize();
        CacheKey(hex::encode(digest))
    }
}

/// A deterministic fingerprint over an `EvaluationCriteria`, used as the
/// `criteriaFingerprint` input to `CacheKey::compute`. Criterion order and
/// weights matter; descriptions/examples do not (they don't change what the
/// judge is asked to score against numerically).
pub fn criteria_fingerprint(criteria: &[(String, f64, i32, i32)]) -> String {
    let mut hasher = Sha256::new();
    for (name, weight, scale_min, scale_max) in criteria {
        hasher.update(name.as_bytes());
        hasher.update(weight.to_le_bytes());
        hasher.update(scale_min.to_le_bytes());
        hasher.update(scale_max.to_le_bytes());
    }
    hex::encode(hasher.finalize())
}

struct Entry<V> {
    value: V,
    created_at: Instant,
    expires_at: Option<Instant>,
    access_count: u64,
    last_accessed: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub ttl_secs: u64,
    pub expired_evictions: u64,
    pub lru_evictions: u64,
}

/// A bounded, TTL-expiring, LRU-evicting in-memory map keyed on
/// `CacheKey`.
pub struct ResponseCache<V> {
    entries: RwLock<HashMap<CacheKey, Entry<V>>>,
    max_size: usize,
    ttl: Duration,
    expired_evictions: AtomicU64,
    lru_evictions: AtomicU64,
}

impl<V: Clone> ResponseCache<V> {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_size,
            ttl,
            expired_evictions: AtomicU64::new(0),
            lru_evictions: AtomicU64::new(0),
        }
    }

    /// On `Get`, an expired entry is deleted and `None` is returned.
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let mut entries = self.entries.write();
        let expired = match entries.get(key) {
            Some(entry) => entry.expires_at.map(|exp| Instant::now() > exp).unwrap_or(false),
            None => return None,
        };
        if expired {
            entries.remove(key);
            self.expired_evictions.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let entry = entries.get_mut(key).expect("checked above");
        entry.access_count += 1;
        entry.last_accessed = Instant::now();
        Some(entry.value.clone())
    }

    /// On `Put`, if the map is at `max_size`, evict the entry with the
    /// smallest `last_accessed` via a single-pass scan.
    pub fn put(&self, key: CacheKey, value: V) {
        let mut entries = self.entries.write();
        let now = Instant::now();

        if !entries.contains_key(&key) && entries.len() >= self.max_size {
            if let Some(victim) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_accessed)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&victim);
                self.lru_evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        entries.insert(
            key,
            Entry {
                value,
                created_at: now,
                expires_at: Some(now + self.ttl),
                access_count: 0,
                last_accessed: now,
            },
        );
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.entries.read().len(),
            max_size: self.max_size,
            ttl_secs: self.ttl.as_secs(),
            expired_evictions: self.expired_evictions.load(Ordering::Relaxed),
            lru_evictions: self.lru_evictions.load(Ordering::Relaxed),
        }
    }

    /// Exposed only for tests: whether an un-expired entry exists without
    /// touching its `last_accessed`.
    #[cfg(test)]
    fn contains(&self, key: &CacheKey) -> bool {
        self.entries.read().contains_key(key)
    }

    #[allow(dead_code)]
    fn created_at(&self, key: &CacheKey) -> Option<Instant> {
        self.entries.read().get(key).map(|e| e.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_requests_produce_identical_keys() {
        let a = CacheKey::compute("  What is AI?  ", "evaluate", "fp1");
        let b = CacheKey::compute("what is ai?", "evaluate", "fp1");
        assert_eq!(a, b);
    }

    #[test]
    fn different_operation_types_produce_different_keys() {
        let a = CacheKey::compute("prompt", "evaluate", "fp1");
        let b = CacheKey::compute("prompt", "compare", "fp1");
        assert_ne!(a, b);
    }

    #[test]
    fn key_is_a_hex_digest_with_no_plaintext() {
        let key = CacheKey::compute("a secret prompt", "evaluate", "fp1");
        assert_eq!(key.0.len(), 64);
        assert!(key.0.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(!key.0.contains("secret"));
    }

    #[test]
    fn get_returns_none_after_expiry() {
        let cache: ResponseCache<String> = ResponseCache::new(10, Duration::from_millis(10));
        let key = CacheKey::compute("p", "evaluate", "fp");
        cache.put(key.clone(), "value".to_string());
        assert!(cache.get(&key).is_some());
        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.get(&key).is_none());
        assert!(!cache.contains(&key));
    }

    #[test]
    fn evicts_least_recently_accessed_when_full() {
        let cache: ResponseCache<String> = ResponseCache::new(2, Duration::from_secs(3600));
        let k1 = CacheKey::compute("p1", "evaluate", "fp");
        let k2 = CacheKey::compute("p2", "evaluate", "fp");
        let k3 = CacheKey::compute("p3", "evaluate", "fp");

        cache.put(k1.clone(), "v1".to_string());
        std::thread::sleep(Duration::from_millis(5));
        cache.put(k2.clone(), "v2".to_string());

        // touch k1 so it's more recently accessed than k2
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(&k1).is_some());

        std::thread::sleep(Duration::from_millis(5));
        cache.put(k3.clone(), "v3".to_string());

        assert_eq!(cache.stats().size, 2);
        assert!(cache.contains(&k1));
        assert!(!cache.contains(&k2));
        assert!(cache.contains(&k3));
    }

    #[test]
    fn clear_empties_the_store() {
        let cache: ResponseCache<String> = ResponseCache::new(10, Duration::from_secs(3600));
        cache.put(CacheKey::compute("p", "evaluate", "fp"), "v".to_string());
        cache.clear();
        assert_eq!(cache.stats().size, 0);
    }
}
