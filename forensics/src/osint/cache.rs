//! Per-source result cache.
//!
//! An in-memory TTL map, optionally layered over an on-disk directory of
//! JSON entries keyed by `sha256(source_name ‖ query)`. Disk writes are
//! atomic per key (write to a temp file, then rename); disk trouble is
//! logged and degrades to memory-only.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::osint::source::{IntelQuery, SourceReport};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    payload: SourceReport,
    expires_at: DateTime<Utc>,
}

/// Shared intel cache.
pub struct IntelCache {
    mem: Mutex<HashMap<String, CacheEntry>>,
    disk_dir: Option<PathBuf>,
}

impl IntelCache {
    /// Memory-only cache.
    pub fn in_memory() -> Self {
        Self {
            mem: Mutex::new(HashMap::new()),
            disk_dir: None,
        }
    }

    /// Cache with an on-disk layer under `dir` (created if missing).
    pub fn with_disk(dir: PathBuf) -> Self {
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::warn!(dir = %dir.display(), error = %e, "cache dir unavailable, memory only");
            return Self::in_memory();
        }
        Self {
            mem: Mutex::new(HashMap::new()),
            disk_dir: Some(dir),
        }
    }

    /// `sha256(source_name ‖ query)` as lowercase hex.
    pub fn key(source: &str, query: &IntelQuery) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        hasher.update(query.cache_key().as_bytes());
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(64);
        for byte in digest {
            use std::fmt::Write;
            let _ = write!(hex, "{byte:02x}");
        }
        hex
    }

    /// Look up a non-expired entry. The returned report is marked
    /// `from_cache`.
    pub fn get(&self, source: &str, query: &IntelQuery) -> Option<SourceReport> {
        let key = Self::key(source, query);
        let now = Utc::now();

        {
            let mut mem = self.mem.lock().expect("cache poisoned");
            if let Some(entry) = mem.get(&key) {
                if entry.expires_at > now {
                    let mut report = entry.payload.clone();
                    report.from_cache = true;
                    return Some(report);
                }
                mem.remove(&key);
            }
        }

        let dir = self.disk_dir.as_ref()?;
        let path = dir.join(format!("{key}.json"));
        let contents = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<CacheEntry>(&contents) {
            Ok(entry) if entry.expires_at > now => {
                let mut report = entry.payload.clone();
                report.from_cache = true;
                self.mem
                    .lock()
                    .expect("cache poisoned")
                    .insert(key, entry);
                Some(report)
            }
            Ok(_) => {
                let _ = std::fs::remove_file(&path);
                None
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "corrupt cache entry removed");
                let _ = std::fs::remove_file(&path);
                None
            }
        }
    }

    /// Insert a report with its TTL.
    pub fn put(&self, source: &str, query: &IntelQuery, report: SourceReport, ttl_secs: u64) {
        let key = Self::key(source, query);
        let entry = CacheEntry {
            payload: report,
            expires_at: Utc::now() + ChronoDuration::seconds(ttl_secs as i64),
        };

        if let Some(dir) = &self.disk_dir {
            match serde_json::to_string(&entry) {
                Ok(json) => {
                    let tmp = dir.join(format!("{key}.json.tmp"));
                    let dst = dir.join(format!("{key}.json"));
                    if let Err(e) =
                        std::fs::write(&tmp, json).and_then(|_| std::fs::rename(&tmp, &dst))
                    {
                        tracing::warn!(error = %e, "cache disk write failed");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "cache entry serialization failed"),
            }
        }

        self.mem.lock().expect("cache poisoned").insert(key, entry);
    }

    pub fn len(&self) -> usize {
        self.mem.lock().expect("cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osint::source::{RateLimitSpec, SourceCategory, SourceSpec, TrustLevel};

    fn spec() -> SourceSpec {
        SourceSpec {
            name: "rep".into(),
            category: SourceCategory::Reputation,
            priority_tier: 1,
            rate_limit: RateLimitSpec {
                rpm: 60,
                rph: 600,
                requires_key: false,
            },
            cache_ttl_secs: 300,
            trust_level: TrustLevel::Medium,
            base_weight: 1.0,
            confidence_bias: 1.0,
            timeout_ms: 1000,
        }
    }

    fn report() -> SourceReport {
        SourceReport::attributes_only(&spec(), Default::default())
    }

    #[test]
    fn test_key_is_stable_and_distinct() {
        let q1 = IntelQuery::domain("example.com");
        let q2 = IntelQuery::domain("example.org");
        assert_eq!(IntelCache::key("rep", &q1), IntelCache::key("rep", &q1));
        assert_ne!(IntelCache::key("rep", &q1), IntelCache::key("rep", &q2));
        assert_ne!(IntelCache::key("rep", &q1), IntelCache::key("dns", &q1));
        assert_eq!(IntelCache::key("rep", &q1).len(), 64);
    }

    #[test]
    fn test_memory_hit_and_expiry() {
        let cache = IntelCache::in_memory();
        let q = IntelQuery::domain("example.com");
        assert!(cache.get("rep", &q).is_none());

        cache.put("rep", &q, report(), 300);
        let hit = cache.get("rep", &q).unwrap();
        assert!(hit.from_cache);

        // Zero TTL expires immediately
        cache.put("rep", &q, report(), 0);
        assert!(cache.get("rep", &q).is_none());
    }

    #[test]
    fn test_disk_layer_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let q = IntelQuery::domain("example.com");

        {
            let cache = IntelCache::with_disk(dir.path().to_path_buf());
            cache.put("rep", &q, report(), 300);
        }

        // Fresh cache instance reads the disk entry
        let cache = IntelCache::with_disk(dir.path().to_path_buf());
        let hit = cache.get("rep", &q).unwrap();
        assert!(hit.from_cache);
        assert_eq!(hit.source, "rep");
    }

    #[test]
    fn test_corrupt_disk_entry_removed() {
        let dir = tempfile::tempdir().unwrap();
        let q = IntelQuery::domain("example.com");
        let key = IntelCache::key("rep", &q);
        std::fs::write(dir.path().join(format!("{key}.json")), "not json").unwrap();

        let cache = IntelCache::with_disk(dir.path().to_path_buf());
        assert!(cache.get("rep", &q).is_none());
        assert!(!dir.path().join(format!("{key}.json")).exists());
    }
}
