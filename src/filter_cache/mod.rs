//! Filter cache: caches the output of a `Transformation::Filter`
//! step (e.g. an image-scaling or compression filter) keyed by the
//! resource's identity and the filter applied to it, so repeated requests
//! for the same filtered variant skip re-running the filter process.
//!
//! Entries use the same size-bounded, `Cache-Control`-driven expiry rules
//! as [`crate::http_cache`]; the two are kept as separate caches because
//! they're invalidated independently — a filter-cache entry is dropped by
//! `cache_tag` (tied to the backend resource), not by upstream `Vary`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::{HeaderMap, StatusCode};

pub struct FilterCacheConfig {
    pub max_size: usize,
    pub max_age_cap: Duration,
}

impl Default for FilterCacheConfig {
    fn default() -> Self {
        FilterCacheConfig {
            max_size: 256 * 1024,
            max_age_cap: Duration::from_secs(3600),
        }
    }
}

struct Entry {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    expires_at: Option<SystemTime>,
    cache_tag: Option<String>,
}

pub struct FilterCache {
    config: FilterCacheConfig,
    entries: Mutex<HashMap<String, Entry>>,
    tag_index: Mutex<HashMap<String, HashSet<String>>>,
    total_size: AtomicUsize,
}

impl FilterCache {
    pub fn new(config: FilterCacheConfig) -> Self {
        FilterCache {
            config,
            entries: Mutex::new(HashMap::new()),
            tag_index: Mutex::new(HashMap::new()),
            total_size: AtomicUsize::new(0),
        }
    }

    /// `resource_tag` identifies the unfiltered backend resource (e.g. its
    /// path + ETag); `filter` identifies which filter chain was applied.
    pub fn key(resource_tag: &str, etag: Option<&str>, filter: &str) -> String {
        match etag {
            Some(etag) => format!("{resource_tag}|etag={etag}|filter={filter}"),
            None => format!("{resource_tag}|filter={filter}"),
        }
    }

    pub fn lookup(&self, key: &str, now: SystemTime) -> Option<(StatusCode, HeaderMap, Bytes)> {
        let entries = self.entries.lock().unwrap();
        let entry = entries.get(key)?;
        if entry.expires_at.map(|e| now >= e).unwrap_or(true) {
            return None;
        }
        Some((entry.status, entry.headers.clone(), entry.body.clone()))
    }

    pub fn store(
        &self,
        key: String,
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        cache_tag: Option<String>,
        now: SystemTime,
    ) {
        if body.len() + self.total_size.load(Ordering::Relaxed) > self.config.max_size {
            return;
        }
        let expires_at = cache_control_max_age(&headers)
            .map(|ttl| now + ttl.min(self.config.max_age_cap))
            .or(Some(now + self.config.max_age_cap));

        self.total_size.fetch_add(body.len(), Ordering::Relaxed);
        if let Some(tag) = &cache_tag {
            self.tag_index
                .lock()
                .unwrap()
                .entry(tag.clone())
                .or_default()
                .insert(key.clone());
        }
        self.entries.lock().unwrap().insert(
            key,
            Entry { status, headers, body, expires_at, cache_tag },
        );
    }

    /// Drops every entry derived from the resource identified by
    /// `cache_tag`, used when the backend resource itself changes.
    pub fn invalidate_tag(&self, cache_tag: &str) {
        let Some(keys) = self.tag_index.lock().unwrap().remove(cache_tag) else { return };
        let mut entries = self.entries.lock().unwrap();
        for key in keys {
            if let Some(removed) = entries.remove(&key) {
                self.total_size.fetch_sub(removed.body.len(), Ordering::Relaxed);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

fn cache_control_max_age(headers: &HeaderMap) -> Option<Duration> {
    let cc = headers.get(http::header::CACHE_CONTROL)?.to_str().ok()?;
    cc.split(',').find_map(|part| {
        part.trim()
            .strip_prefix("max-age=")
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_includes_etag_when_present() {
        let with_etag = FilterCache::key("/img/a.jpg", Some("\"x\""), "scale=100x100");
        let without_etag = FilterCache::key("/img/a.jpg", None, "scale=100x100");
        assert_ne!(with_etag, without_etag);
        assert!(with_etag.contains("etag=\"x\""));
    }

    #[test]
    fn store_then_lookup_then_invalidate_by_tag() {
        let cache = FilterCache::new(FilterCacheConfig::default());
        let now = SystemTime::now();
        let key = FilterCache::key("/img/a.jpg", None, "scale=100x100");
        cache.store(
            key.clone(),
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::from_static(b"scaled"),
            Some("/img/a.jpg".into()),
            now,
        );
        assert!(cache.lookup(&key, now).is_some());

        cache.invalidate_tag("/img/a.jpg");
        assert!(cache.lookup(&key, now).is_none());
    }

    #[test]
    fn oversized_entry_is_rejected() {
        let cache = FilterCache::new(FilterCacheConfig { max_size: 1, ..FilterCacheConfig::default() });
        let key = FilterCache::key("/x", None, "f");
        cache.store(key.clone(), StatusCode::OK, HeaderMap::new(), Bytes::from_static(b"too big"), None, SystemTime::now());
        assert!(cache.lookup(&key, SystemTime::now()).is_none());
    }
}
