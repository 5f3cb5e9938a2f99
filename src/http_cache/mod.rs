//! HTTP response cache: RFC 2616-flavoured freshness and
//! revalidation for responses fetched from an upstream resource, keyed by
//! method + URI (+ any `Vary` headers the stored response named).
//!
//! Header parsing follows the same shape as `kornelski-rusty-http-cache-semantics`,
//! narrowed to this cache's own default-cacheable status list; date handling
//! uses `httpdate` rather than that crate's `time`-based approach, matching
//! the rest of this workspace's date handling (see the translation cache and
//! cookie jar, which also use `httpdate`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};

/// Statuses cacheable without an explicit `Cache-Control`/`Expires`
/// directive.
const STATUS_CACHEABLE_BY_DEFAULT: &[u16] = &[200, 203, 206, 300, 301, 410];

/// Headers that must not be copied from a 304 response onto the cached
/// entry when updating it after revalidation (they describe the bare
/// 304 itself, not the representation).
const EXCLUDED_FROM_REVALIDATION_UPDATE: &[&str] =
    &["content-length", "content-md5", "transfer-encoding"];

#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub etag: Option<String>,
    pub last_modified: Option<SystemTime>,
    pub stored_at: SystemTime,
    pub expires_at: Option<SystemTime>,
    /// Request header values the stored response varied on, captured at
    /// store time so a later request can be checked for a match.
    vary_values: HashMap<String, Option<String>>,
}

impl CachedResponse {
    fn is_fresh(&self, now: SystemTime) -> bool {
        self.expires_at.map(|e| now < e).unwrap_or(false)
    }

    fn is_revalidatable(&self) -> bool {
        self.etag.is_some() || self.last_modified.is_some()
    }
}

pub struct HttpCacheConfig {
    pub max_size: usize,
    pub obey_no_cache: bool,
    pub max_age_cap: Duration,
}

impl Default for HttpCacheConfig {
    fn default() -> Self {
        HttpCacheConfig {
            max_size: 256 * 1024,
            obey_no_cache: true,
            max_age_cap: Duration::from_secs(3600),
        }
    }
}

pub struct HttpCache {
    config: HttpCacheConfig,
    entries: Mutex<HashMap<String, CachedResponse>>,
    total_size: AtomicUsize,
}

impl HttpCache {
    pub fn new(config: HttpCacheConfig) -> Self {
        HttpCache {
            config,
            entries: Mutex::new(HashMap::new()),
            total_size: AtomicUsize::new(0),
        }
    }

    pub fn key(method: &Method, uri: &str) -> String {
        format!("{method} {uri}")
    }

    /// Only `GET`/`HEAD` requests are considered; anything else bypasses
    /// the cache entirely, same as the original's resource-loader shortcut
    /// for non-idempotent methods.
    pub fn is_request_cacheable(&self, method: &Method, headers: &HeaderMap) -> bool {
        if method != Method::GET && method != Method::HEAD {
            return false;
        }
        if self.config.obey_no_cache {
            if let Some(cc) = headers.get(http::header::CACHE_CONTROL) {
                if let Ok(s) = cc.to_str() {
                    if s.contains("no-store") {
                        return false;
                    }
                }
            }
        }
        true
    }

    pub fn is_response_cacheable(&self, status: StatusCode, headers: &HeaderMap) -> bool {
        if let Some(cc) = headers.get(http::header::CACHE_CONTROL) {
            if let Ok(s) = cc.to_str() {
                let s = s.to_ascii_lowercase();
                if s.contains("no-store") || s.contains("private") {
                    return false;
                }
                if s.contains("no-cache") && self.config.obey_no_cache {
                    return false;
                }
            }
        }
        if headers.contains_key(http::header::SET_COOKIE) {
            return false;
        }
        STATUS_CACHEABLE_BY_DEFAULT.contains(&status.as_u16())
            || headers.contains_key(http::header::EXPIRES)
            || cache_control_max_age(headers).is_some()
    }

    pub fn lookup(&self, key: &str, request_headers: &HeaderMap, now: SystemTime) -> Option<LookupResult> {
        let entries = self.entries.lock().unwrap();
        let entry = entries.get(key)?;

        if !vary_matches(&entry.vary_values, request_headers) {
            return None;
        }

        if entry.is_fresh(now) {
            return Some(LookupResult::Fresh(entry.clone()));
        }
        if entry.is_revalidatable() {
            return Some(LookupResult::NeedsRevalidation(entry.clone()));
        }
        None
    }

    /// Conditional request headers to send upstream for a stale-but-
    /// revalidatable entry.
    pub fn conditional_headers(entry: &CachedResponse) -> Vec<(&'static str, String)> {
        let mut headers = Vec::new();
        if let Some(etag) = &entry.etag {
            headers.push(("if-none-match", etag.clone()));
        }
        if let Some(lm) = entry.last_modified {
            headers.push(("if-modified-since", httpdate::fmt_http_date(lm)));
        }
        headers
    }

    /// Applies a `304 Not Modified` upstream reply: the stored body is
    /// kept, freshness is reset from the new response's headers, and any
    /// non-excluded header the 304 carried overrides the stored one.
    pub fn apply_not_modified(&self, key: &str, new_headers: &HeaderMap, now: SystemTime) {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(key) else { return };

        for (name, value) in new_headers {
            if EXCLUDED_FROM_REVALIDATION_UPDATE.contains(&name.as_str().to_ascii_lowercase().as_str()) {
                continue;
            }
            entry.headers.insert(name.clone(), value.clone());
        }
        entry.expires_at = compute_expiry(new_headers, now, self.config.max_age_cap).or(entry.expires_at);
        entry.stored_at = now;
    }

    pub fn store(
        &self,
        key: String,
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        request_headers: &HeaderMap,
        now: SystemTime,
    ) {
        if body.len() + self.total_size.load(Ordering::Relaxed) > self.config.max_size {
            return; // size-bounded; no eviction policy beyond refusing new entries over budget
        }

        let etag = headers
            .get(http::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let last_modified = headers
            .get(http::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| httpdate::parse_http_date(s).ok());
        let expires_at = compute_expiry(&headers, now, self.config.max_age_cap);

        let vary_values = vary_names(&headers)
            .into_iter()
            .map(|name| {
                let value = request_headers
                    .get(&name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                (name, value)
            })
            .collect();

        self.total_size.fetch_add(body.len(), Ordering::Relaxed);
        self.entries.lock().unwrap().insert(
            key,
            CachedResponse {
                status,
                headers,
                body,
                etag,
                last_modified,
                stored_at: now,
                expires_at,
                vary_values,
            },
        );
    }

    pub fn invalidate(&self, key: &str) {
        if let Some(removed) = self.entries.lock().unwrap().remove(key) {
            self.total_size.fetch_sub(removed.body.len(), Ordering::Relaxed);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

pub enum LookupResult {
    Fresh(CachedResponse),
    NeedsRevalidation(CachedResponse),
}

fn vary_names(headers: &HeaderMap) -> Vec<String> {
    headers
        .get(http::header::VARY)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.split(',').map(|n| n.trim().to_ascii_lowercase()).collect())
        .unwrap_or_default()
}

fn vary_matches(stored: &HashMap<String, Option<String>>, request_headers: &HeaderMap) -> bool {
    stored.iter().all(|(name, value)| {
        let current = request_headers.get(name).and_then(|v| v.to_str().ok());
        current == value.as_deref()
    })
}

fn cache_control_max_age(headers: &HeaderMap) -> Option<Duration> {
    let cc = headers.get(http::header::CACHE_CONTROL)?.to_str().ok()?;
    cc.split(',').find_map(|part| {
        let part = part.trim();
        part.strip_prefix("max-age=")
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
    })
}

fn compute_expiry(headers: &HeaderMap, now: SystemTime, cap: Duration) -> Option<SystemTime> {
    if let Some(max_age) = cache_control_max_age(headers) {
        return Some(now + max_age.min(cap));
    }
    let expires = headers.get(http::header::EXPIRES)?.to_str().ok()?;
    let expires_at = httpdate::parse_http_date(expires).ok()?;
    let date_at = headers
        .get(http::header::DATE)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| httpdate::parse_http_date(s).ok())
        .unwrap_or(now);
    // Clock-skew adjustment: express Expires relative to our own clock
    // rather than trusting the upstream's Date verbatim.
    let ttl = expires_at.duration_since(date_at).unwrap_or(Duration::ZERO);
    Some(now + ttl.min(cap))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{HeaderName, HeaderValue};

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(HeaderName::from_bytes(k.as_bytes()).unwrap(), HeaderValue::from_str(v).unwrap());
        }
        h
    }

    #[test]
    fn no_store_response_is_never_cacheable() {
        let cache = HttpCache::new(HttpCacheConfig::default());
        let h = headers(&[("cache-control", "no-store")]);
        assert!(!cache.is_response_cacheable(StatusCode::OK, &h));
    }

    #[test]
    fn store_then_lookup_returns_fresh_entry() {
        let cache = HttpCache::new(HttpCacheConfig::default());
        let now = SystemTime::now();
        let h = headers(&[("cache-control", "max-age=60")]);
        cache.store(
            "GET /x".into(),
            StatusCode::OK,
            h,
            Bytes::from_static(b"hello"),
            &HeaderMap::new(),
            now,
        );

        match cache.lookup("GET /x", &HeaderMap::new(), now) {
            Some(LookupResult::Fresh(entry)) => assert_eq!(entry.body, Bytes::from_static(b"hello")),
            _ => panic!("expected fresh hit"),
        }
    }

    #[test]
    fn stale_entry_with_etag_needs_revalidation() {
        let cache = HttpCache::new(HttpCacheConfig::default());
        let past = SystemTime::now() - Duration::from_secs(120);
        let h = headers(&[("cache-control", "max-age=1"), ("etag", "\"abc\"")]);
        cache.store("GET /y".into(), StatusCode::OK, h, Bytes::new(), &HeaderMap::new(), past);

        match cache.lookup("GET /y", &HeaderMap::new(), SystemTime::now()) {
            Some(LookupResult::NeedsRevalidation(entry)) => assert_eq!(entry.etag.as_deref(), Some("\"abc\"")),
            other => panic!("expected revalidation, got {}", matches!(other, Some(LookupResult::Fresh(_)))),
        }
    }

    #[test]
    fn size_budget_rejects_oversized_entry() {
        let cache = HttpCache::new(HttpCacheConfig { max_size: 4, ..HttpCacheConfig::default() });
        cache.store(
            "GET /big".into(),
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::from_static(b"too large"),
            &HeaderMap::new(),
            SystemTime::now(),
        );
        assert!(cache.lookup("GET /big", &HeaderMap::new(), SystemTime::now()).is_none());
    }
}
