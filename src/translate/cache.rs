//! Translation cache, grounded on the key-derivation grammar and
//! BASE-prefix lookup walk of the original's `tcache.cxx`.
//!
//! Cache keys are built as:
//!
//! ```text
//! ["W_"]? ["|CHECK=" esc]? ["|WFU=" esc]? ["ERR" status "_"]? [host ":"] URI
//! ```
//!
//! `esc` is percent-encoding of arbitrary request bytes so they can't
//! collide with the key grammar's own delimiters. A cache entry whose
//! response carried a `BASE` is stored under the BASE prefix with the tail
//! stripped; a lookup that misses the exact key then walks the URI's path
//! segments from the end, trying each shorter prefix, reconstructing the
//! full address with [`ResourceAddress::with_tail`] on a hit.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use percent_encoding::{percent_encode, AsciiSet, CONTROLS};
use regex::Regex;

use crate::error::ProxyError;
use crate::translate::{TranslateRequest, TranslateResponse, VaryKey};

const KEY_ESCAPE: &AsciiSet = &CONTROLS.add(b'|').add(b'=').add(b':').add(b'%');

/// Upper bound on how long any entry is trusted for, regardless of what the
/// translation server asked for (mirrors the original's cap on `MAX_AGE`).
const MAX_AGE_CAP: Duration = Duration::from_secs(300);

struct Entry {
    response: TranslateResponse,
    vary_values: HashMap<VaryKey, Option<String>>,
    stored_at: Instant,
    expires_at: Option<Instant>,
    host: Option<String>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.map(|e| Instant::now() >= e).unwrap_or(false)
    }

    fn matches_vary(&self, request: &TranslateRequest) -> bool {
        self.vary_values
            .iter()
            .all(|(key, stored)| stored.as_deref() == request.field(*key))
    }
}

/// In-memory translation response cache.
pub struct TranslationCache {
    entries: Mutex<HashMap<String, Entry>>,
    /// host -> set of cache keys, so a `TCACHE_INVALIDATE` control packet for
    /// one host doesn't require scanning the whole cache.
    host_index: Mutex<HashMap<String, HashSet<String>>>,
}

impl TranslationCache {
    pub fn new() -> Self {
        TranslationCache {
            entries: Mutex::new(HashMap::new()),
            host_index: Mutex::new(HashMap::new()),
        }
    }

    /// Builds the base (non-BASE-stripped) cache key for a request.
    pub fn cache_key(request: &TranslateRequest) -> String {
        let mut key = String::new();
        if request.want_full_uri.is_some() {
            key.push_str("W_");
        }
        if let Some(check) = &request.check {
            key.push_str("|CHECK=");
            key.push_str(&percent_encode(check, KEY_ESCAPE).to_string());
        }
        if let Some(wfu) = &request.want_full_uri {
            key.push_str("|WFU=");
            key.push_str(&percent_encode(wfu, KEY_ESCAPE).to_string());
        }
        if let Some(status) = request.error_document_status {
            key.push_str(&format!("ERR{status}_"));
        }
        if let Some(host) = &request.host {
            key.push_str(host);
            key.push(':');
        }
        key.push_str(request.uri.as_deref().unwrap_or(""));
        key
    }

    /// Looks up a cached response, walking BASE prefixes from the full URI
    /// down to the shortest stored prefix, as the original's
    /// `tcache_lookup` does.
    pub fn lookup(&self, request: &TranslateRequest) -> Option<TranslateResponse> {
        let full_key = Self::cache_key(request);
        let uri = request.uri.as_deref().unwrap_or("");

        let entries = self.entries.lock().unwrap();

        if let Some(hit) = Self::lookup_exact(&entries, &full_key, request, "") {
            return Some(hit);
        }

        for boundary in segment_boundaries(uri) {
            let prefix = &uri[..boundary];
            let tail = &uri[boundary..];
            let prefix_request = TranslateRequest {
                uri: Some(prefix.to_string()),
                ..request.clone()
            };
            let prefix_key = Self::cache_key(&prefix_request);
            if let Some(hit) = Self::lookup_exact(&entries, &prefix_key, request, tail) {
                return Some(hit);
            }
        }

        None
    }

    fn lookup_exact(
        entries: &HashMap<String, Entry>,
        key: &str,
        request: &TranslateRequest,
        tail: &str,
    ) -> Option<TranslateResponse> {
        let entry = entries.get(key)?;
        if entry.is_expired() || !entry.matches_vary(request) {
            return None;
        }
        if entry.response.base.is_none() && !tail.is_empty() {
            // Entry wasn't stored with a BASE; it covers only the exact URI.
            return None;
        }
        if let Some(regex_src) = &entry.response.regex {
            if !regex_accepts(regex_src, tail) {
                return None;
            }
        }
        if let Some(inverse_src) = &entry.response.inverse_regex {
            if regex_accepts(inverse_src, tail) {
                return None;
            }
        }

        let mut response = entry.response.clone();
        if !tail.is_empty() {
            response.address = crate::translate::ResourceAddressOrNone(
                response.address.0.with_tail(tail),
            );
        }
        Some(response)
    }

    /// Evaluates cacheability and stores a response, per the original's
    /// `tcache_store_address`: `max_age` is capped, `BASE`-tailed addresses
    /// are stripped back to the prefix before storing, and `invalidate`
    /// fields are indexed by host for `TCACHE_INVALIDATE` lookups.
    pub fn store(&self, request: &TranslateRequest, response: TranslateResponse) {
        if response.max_age == Some(Duration::ZERO) {
            return; // MAX_AGE=0 means "do not cache" in the wire protocol.
        }

        let full_uri = request.uri.as_deref().unwrap_or("");

        let key = if let Some(base) = &response.base {
            if let Some(prefix) = full_uri.strip_suffix_from_base(base) {
                let prefix_request = TranslateRequest {
                    uri: Some(prefix.to_string()),
                    ..request.clone()
                };
                Self::cache_key(&prefix_request)
            } else {
                Self::cache_key(request)
            }
        } else {
            Self::cache_key(request)
        };

        let stored_address = match &response.base {
            Some(base) => strip_to_base(&response.address.0, base, full_uri),
            None => response.address.0.clone(),
        };

        let mut vary_values = HashMap::new();
        for vary_key in &response.vary {
            vary_values.insert(*vary_key, request.field(*vary_key).map(str::to_string));
        }

        let max_age = response.max_age.unwrap_or(MAX_AGE_CAP).min(MAX_AGE_CAP);
        let mut stored_response = response;
        stored_response.address = crate::translate::ResourceAddressOrNone(stored_address);

        let host = request.host.clone();
        let invalidate = stored_response.invalidate.clone();

        let entry = Entry {
            response: stored_response,
            vary_values,
            stored_at: Instant::now(),
            expires_at: Some(Instant::now() + max_age),
            host: host.clone(),
        };

        self.entries.lock().unwrap().insert(key.clone(), entry);

        if let Some(host) = host {
            if !invalidate.is_empty() || true {
                self.host_index
                    .lock()
                    .unwrap()
                    .entry(host)
                    .or_default()
                    .insert(key);
            }
        }
    }

    /// Drops every cached entry associated with `host`, in response to a
    /// `CONTROL_TCACHE_INVALIDATE` control packet — mirroring
    /// `translate_cache_invalidate_host`'s per-host index walk instead of a
    /// full-cache scan.
    pub fn invalidate_host(&self, host: &str) {
        let keys = self.host_index.lock().unwrap().remove(host);
        let Some(keys) = keys else { return };
        let mut entries = self.entries.lock().unwrap();
        for key in keys {
            entries.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

impl Default for TranslationCache {
    fn default() -> Self {
        Self::new()
    }
}

fn regex_accepts(pattern: &str, input: &str) -> bool {
    Regex::new(pattern)
        .map(|re| re.is_match(input))
        .unwrap_or(false)
}

/// Path-segment boundary offsets for the BASE-prefix walk, from longest to
/// shortest, each guaranteed to land right after a `/`.
fn segment_boundaries(uri: &str) -> Vec<usize> {
    let mut boundaries: Vec<usize> = uri
        .char_indices()
        .filter(|(_, c)| *c == '/')
        .map(|(i, _)| i + 1)
        .collect();
    boundaries.sort_unstable_by(|a, b| b.cmp(a));
    boundaries.pop(); // drop the boundary at position 0 itself, handled by exact lookup
    boundaries
}

/// Strips a BASE-relative address back to its prefix form before storing.
/// The translation server is free to map BASE to an unrelated backend path,
/// so there's no general string operation to invert; in practice backends
/// mirror the client-visible BASE, so the number of bytes the request URI
/// extends past `base` is trimmed off the end of the stored address's path
/// too, leaving a genuinely base-only address for `with_tail` to extend on
/// a later lookup.
fn strip_to_base(
    address: &crate::resource::address::ResourceAddress,
    base: &str,
    request_uri: &str,
) -> crate::resource::address::ResourceAddress {
    let tail_len = request_uri.len().saturating_sub(base.len());
    if tail_len == 0 {
        return address.clone();
    }
    address.truncate_tail(tail_len)
}

trait StripSuffixFromBase {
    fn strip_suffix_from_base<'a>(&'a self, base: &str) -> Option<&'a str>;
}

impl StripSuffixFromBase for str {
    fn strip_suffix_from_base<'a>(&'a self, base: &str) -> Option<&'a str> {
        if self.starts_with(base) {
            Some(&self[..base.len()])
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::address::{ResourceAddress, Scheme};

    fn req(uri: &str) -> TranslateRequest {
        TranslateRequest {
            uri: Some(uri.to_string()),
            host: Some("example.com".into()),
            ..Default::default()
        }
    }

    fn http_response(path: &str) -> TranslateResponse {
        TranslateResponse {
            address: crate::translate::ResourceAddressOrNone(ResourceAddress::Http {
                scheme: Scheme::Http,
                host: "origin".into(),
                path: path.into(),
                address_list: vec!["127.0.0.1:80".parse().unwrap()],
            }),
            ..Default::default()
        }
    }

    #[test]
    fn exact_key_round_trips() {
        let cache = TranslationCache::new();
        let request = req("/foo/bar.html");
        cache.store(&request, http_response("/foo/bar.html"));

        let hit = cache.lookup(&request).expect("cache hit");
        assert_eq!(hit.address.0.path(), Some("/foo/bar.html"));
    }

    #[test]
    fn base_prefix_reconstructs_tail() {
        let cache = TranslationCache::new();
        let store_request = req("/foo/");
        let mut response = http_response("/foo/");
        response.base = Some("/foo/".into());
        cache.store(&store_request, response);

        let lookup_request = req("/foo/bar.html");
        let hit = cache.lookup(&lookup_request).expect("base prefix hit");
        assert_eq!(hit.address.0.path(), Some("/foo/bar.html"));
    }

    #[test]
    fn base_store_strips_tail_before_reuse() {
        // Storing under a BASE whose request URI already had a tail past
        // the prefix (e.g. `/a/b/c.html` under BASE `/a/b/`) must not leave
        // that tail baked into the stored address, or a later lookup for a
        // different tail doubles it up instead of replacing it.
        let cache = TranslationCache::new();
        let store_request = req("/a/b/c.html");
        let mut response = http_response("/a/b/c.html");
        response.base = Some("/a/b/".into());
        cache.store(&store_request, response);

        let lookup_request = req("/a/b/d.html");
        let hit = cache.lookup(&lookup_request).expect("base prefix hit");
        assert_eq!(hit.address.0.path(), Some("/a/b/d.html"));
    }

    #[test]
    fn invalidate_host_drops_its_entries() {
        let cache = TranslationCache::new();
        let request = req("/foo");
        cache.store(&request, http_response("/foo"));
        assert_eq!(cache.len(), 1);

        cache.invalidate_host("example.com");
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn vary_mismatch_is_a_miss() {
        let cache = TranslationCache::new();
        let mut response = http_response("/foo");
        response.vary.insert(VaryKey::UserAgent);
        let store_request = TranslateRequest {
            user_agent: Some("curl/8".into()),
            ..req("/foo")
        };
        cache.store(&store_request, response);

        let other_ua = TranslateRequest {
            user_agent: Some("curl/9".into()),
            ..req("/foo")
        };
        assert!(cache.lookup(&other_ua).is_none());
    }
}
