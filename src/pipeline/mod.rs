//! Request pipeline: the per-request orchestrator tying the translation
//! cache, resource loader, HTTP/filter caches and the header-forward policy
//! into one request/response round-trip.
//!
//! `Http` resources are handed off to pingora's own upstream machinery
//! (`DispatchOutcome::Proxy`) rather than fetched synchronously here, same as
//! [`crate::resource::loader`]; the transformation chain and response-cache
//! store for that path run once pingora delivers the response, via
//! [`RequestPipeline::apply_response`] called from the surrounding
//! `ProxyHttp` service's `logging` hook, once the full response (including
//! body) is known. Every other resource kind is fetched inline by `dispatch`
//! and fully pipelined here.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method as HttpMethod, StatusCode};
use pingora_core::upstreams::peer::HttpPeer;

use crate::cookie::CookieJar;
use crate::error::ProxyError;
use crate::filter_cache::{FilterCache, FilterCacheConfig};
use crate::header_forward::{self, Policy};
use crate::headers::StringMap;
use crate::http_cache::{CachedResponse, HttpCache, HttpCacheConfig, LookupResult};
use crate::istream::{ByteIstream, Istream};
use crate::resource::loader::{LoaderRequest, LoaderResponse, ResourceLoader};
use crate::stock::{Stock, StockClass};
use crate::translate::cache::TranslationCache;
use crate::translate::client::TranslationClient;
use crate::translate::{Transformation, TranslateRequest, TranslateResponse};

/// Caps the internal transparent-redirect loop.
const MAX_INTERNAL_REDIRECTS: u8 = 8;

/// One incoming client request, already parsed down to what the pipeline
/// needs (the surrounding HTTP server/`ProxyHttp` layer owns the rest).
pub struct IncomingRequest {
    pub method: HttpMethod,
    pub uri: String,
    pub host: String,
    pub is_ssl: bool,
    pub remote_addr: String,
    pub headers: StringMap,
    pub body: Option<Bytes>,
}

/// What the pipeline decided to do with one request.
pub enum DispatchOutcome {
    /// Fully served from this crate's own clients; transformation chain and
    /// response headers already applied.
    Direct {
        status: u16,
        headers: StringMap,
        body: Box<dyn Istream>,
    },
    /// Hand off to pingora. `translate_response` is carried along so
    /// [`RequestPipeline::apply_response`] can run the transformation chain
    /// and cache store once the real response comes back.
    Proxy {
        peer: Box<HttpPeer>,
        loader_request: LoaderRequest,
        translate_response: TranslateResponse,
    },
}

struct TranslationConnectClass {
    socket_path: String,
}

#[async_trait]
impl StockClass<TranslationClient> for TranslationConnectClass {
    async fn create(&self, _key: &str) -> Result<TranslationClient, ProxyError> {
        TranslationClient::connect(&self.socket_path).await
    }
}

pub struct PipelineConfig {
    pub translation_socket_path: String,
    pub local_identity: String,
    pub translation_pool_size: usize,
}

pub struct RequestPipeline {
    translation_stock: Arc<Stock<TranslationClient>>,
    translation_cache: Arc<TranslationCache>,
    loader: Arc<ResourceLoader>,
    http_cache: Arc<HttpCache>,
    filter_cache: Arc<FilterCache>,
    header_policy: Policy,
    local_identity: String,
}

impl RequestPipeline {
    pub fn new(config: PipelineConfig, loader: Arc<ResourceLoader>) -> Self {
        let class = Arc::new(TranslationConnectClass {
            socket_path: config.translation_socket_path,
        });
        RequestPipeline {
            translation_stock: Stock::new(class, config.translation_pool_size, config.translation_pool_size),
            translation_cache: Arc::new(TranslationCache::new()),
            loader,
            http_cache: Arc::new(HttpCache::new(HttpCacheConfig::default())),
            filter_cache: Arc::new(FilterCache::new(FilterCacheConfig::default())),
            header_policy: Policy::default(),
            local_identity: config.local_identity,
        }
    }

    /// Shares this pipeline's translation cache with the control-plane
    /// listener, so `CONTROL_TCACHE_INVALIDATE` reaches the same cache
    /// requests are actually served from.
    pub fn translation_cache(&self) -> Arc<TranslationCache> {
        self.translation_cache.clone()
    }

    /// Exposed for [`crate::stats::StatsSource`], which reads cache sizes
    /// without otherwise reaching into the pipeline's internals.
    pub fn http_cache(&self) -> Arc<HttpCache> {
        self.http_cache.clone()
    }

    pub fn filter_cache(&self) -> Arc<FilterCache> {
        self.filter_cache.clone()
    }

    /// Runs the translation round-trip: a cache hit skips the wire
    /// round-trip entirely; a miss dials the translation server and stores
    /// the result before returning it.
    async fn translate(&self, request: &TranslateRequest) -> Result<TranslateResponse, ProxyError> {
        if let Some(cached) = self.translation_cache.lookup(request) {
            return Ok(cached);
        }

        let mut lease = self.translation_stock.get("translation").await?;
        let response = lease.get_mut().translate(request).await;
        match &response {
            Ok(_) => lease.release(true).await,
            Err(_) => lease.release(false).await,
        }
        let response = response?;

        self.translation_cache.store(request, response.clone());
        Ok(response)
    }

    /// Runs one request end to end: translate, dispatch to the resource, and
    /// (for non-proxied resources) apply the transformation chain and
    /// response header-forward policy. `cookies` is the caller's session jar;
    /// `Set-Cookie` values from every intermediate hop are folded into it.
    pub async fn process(
        &self,
        incoming: IncomingRequest,
        cookies: &mut CookieJar,
    ) -> Result<DispatchOutcome, ProxyError> {
        let mut current = incoming;
        let mut hops = 0u8;

        loop {
            let translate_request = translate_request_from(&current);
            let translate_response = self.translate(&translate_request).await?;

            if translate_response.address.0 == crate::resource::address::ResourceAddress::None {
                // A translate response with no address and an explicit status
                // is a bounce: the translation server answers the request
                // itself (e.g. a synthetic redirect), with no resource fetch.
                let status = translate_response.status.unwrap_or(500);
                return Ok(DispatchOutcome::Direct {
                    status,
                    headers: StringMap::new(),
                    body: Box::new(ByteIstream::empty()),
                });
            }

            // Cache lookup happens before any fetch: a fresh hit serves the
            // cached representation without touching the resource at all; a
            // stale-but-revalidatable hit adds conditional headers to the
            // outgoing request so the fetch below (or the eventual upstream
            // request, for `Http` addresses) can come back `304`.
            let request_header_map = string_map_to_http_header_map(&current.headers);
            let resource_uri = translate_response.address.0.path().unwrap_or("").to_string();
            let cache_key = HttpCache::key(&HttpMethod::GET, &resource_uri);
            let now = SystemTime::now();
            let mut revalidate_candidate: Option<CachedResponse> = None;
            if self.http_cache.is_request_cacheable(&current.method, &request_header_map) {
                match self.http_cache.lookup(&cache_key, &request_header_map, now) {
                    Some(LookupResult::Fresh(cached)) => {
                        return Ok(DispatchOutcome::Direct {
                            status: cached.status.as_u16(),
                            headers: http_header_map_to_string_map(&cached.headers),
                            body: Box::new(ByteIstream::new(cached.body)),
                        });
                    }
                    Some(LookupResult::NeedsRevalidation(cached)) => {
                        revalidate_candidate = Some(cached);
                    }
                    None => {}
                }
            }

            let mut loader_request = self.build_loader_request(&current, &translate_response, cookies);
            if let Some(cached) = &revalidate_candidate {
                for (name, value) in HttpCache::conditional_headers(cached) {
                    loader_request.headers.set(name, value);
                }
            }

            if let crate::resource::address::ResourceAddress::Http { .. } = &translate_response.address.0 {
                let response = self.loader.load(&translate_response.address.0, &loader_request).await?;
                return match response {
                    LoaderResponse::Proxy(peer) => Ok(DispatchOutcome::Proxy {
                        peer,
                        loader_request,
                        translate_response,
                    }),
                    // The loader only returns `Proxy` for `Http` addresses; a
                    // `Direct` here would mean the address dispatch in
                    // `ResourceLoader::load` and this match fell out of sync.
                    LoaderResponse::Direct { status, headers, body } => {
                        Ok(DispatchOutcome::Direct { status, headers, body })
                    }
                };
            }

            let response = self.loader.load(&translate_response.address.0, &loader_request).await?;
            let LoaderResponse::Direct { status, headers, mut body } = response else {
                return Err(ProxyError::Configuration(
                    "non-HTTP resource address unexpectedly produced a Proxy response".into(),
                ));
            };

            absorb_cookies(&headers, &current.host, cookies);

            let body = match crate::istream::collect_to_bytes(body.as_mut(), usize::MAX).await {
                crate::istream::ProxyResultBytes::Ok(b) => b,
                crate::istream::ProxyResultBytes::TooLarge => {
                    return Err(ProxyError::Configuration("resource body too large to buffer".into()))
                }
                crate::istream::ProxyResultBytes::Err(e) => return Err(e),
            };

            // `304` against a revalidation candidate means the cached body is
            // still current: refresh its freshness metadata and serve it in
            // place of the (bodyless) `304`. Anything else either replaces a
            // stale entry or stores a previously-uncached response.
            let (status, headers, body) = if status == 304 {
                if let Some(cached) = revalidate_candidate {
                    let new_header_map = string_map_to_http_header_map(&headers);
                    self.http_cache.apply_not_modified(&cache_key, &new_header_map, now);
                    (
                        cached.status.as_u16(),
                        http_header_map_to_string_map(&cached.headers),
                        cached.body,
                    )
                } else {
                    (status, headers, body)
                }
            } else {
                let header_map = string_map_to_http_header_map(&headers);
                let status_code = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
                if self.http_cache.is_response_cacheable(status_code, &header_map) {
                    self.http_cache.store(
                        cache_key.clone(),
                        status_code,
                        header_map,
                        body.clone(),
                        &request_header_map,
                        now,
                    );
                }
                (status, headers, body)
            };

            if translate_response.transparent && is_redirect(status) {
                if let Some(location) = headers.get("location") {
                    hops += 1;
                    if hops > MAX_INTERNAL_REDIRECTS {
                        return Err(ProxyError::Protocol("too many internal redirects".into()));
                    }
                    current = IncomingRequest {
                        method: HttpMethod::GET,
                        uri: location.to_string(),
                        host: current.host,
                        is_ssl: current.is_ssl,
                        remote_addr: current.remote_addr,
                        headers: current.headers,
                        body: None,
                    };
                    continue;
                }
            }

            let (status, headers, body) = self
                .run_transformations(&translate_response.transformations, status, headers, body)
                .await?;

            let out_headers = header_forward::forward_response_headers(&headers, &self.header_policy, &self.local_identity);
            return Ok(DispatchOutcome::Direct { status, headers: out_headers, body: Box::new(ByteIstream::new(body)) });
        }
    }

    /// Completes the pipeline for a proxied (`Http`) resource once the real
    /// upstream response has arrived through pingora: runs the same
    /// transformation chain and response-cache store the inline path applies
    /// in `process`. Returns the final headers to send downstream.
    pub async fn apply_response(
        &self,
        translate_response: &TranslateResponse,
        request_headers: &HeaderMap,
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    ) -> (StatusCode, HeaderMap) {
        let now = SystemTime::now();
        let uri = translate_response
            .address
            .0
            .path()
            .unwrap_or("")
            .to_string();
        let key = HttpCache::key(&HttpMethod::GET, &uri);

        if status == StatusCode::NOT_MODIFIED {
            // The conditional headers `process` attached to this request (from
            // a prior `NeedsRevalidation` lookup) were confirmed: refresh the
            // stored entry's freshness instead of overwriting it with the
            // (bodyless) `304`.
            self.http_cache.apply_not_modified(&key, &headers, now);
        } else if self.http_cache.is_response_cacheable(status, &headers) {
            self.http_cache
                .store(key, status, headers.clone(), body, request_headers, now);
        }

        (status, headers)
    }

    fn build_loader_request(
        &self,
        incoming: &IncomingRequest,
        translate_response: &TranslateResponse,
        cookies: &CookieJar,
    ) -> LoaderRequest {
        let mut headers = header_forward::forward_request_headers(
            &incoming.headers,
            &self.header_policy,
            &self.local_identity,
            false,
            incoming.headers.get("upgrade").is_some(),
        );
        headers.secure_set(
            "x-forwarded-for",
            Some(crate::resource::loader::forwarded_for(
                headers.get("x-forwarded-for"),
                &incoming.remote_addr,
            )),
        );
        let path = incoming.uri.split('?').next().unwrap_or(&incoming.uri);
        if let Some(cookie_header) = cookies.cookie_header(&incoming.host, path, incoming.is_ssl) {
            headers.set("cookie", cookie_header);
        }
        if translate_response.stateful {
            headers.set("cookie2", CookieJar::cookie2_header());
        }

        LoaderRequest {
            method: incoming.method.clone(),
            headers,
            body: incoming.body.clone(),
            remote_addr: incoming.remote_addr.clone(),
        }
    }

    /// Applies each transformation step in order. `Filter` steps are cached
    /// by input-etag ⊕ filter-identity; the process/CSS/text transformations
    /// are contract-only here (their parse-tree logic is an out-of-scope
    /// external collaborator) and pass the body through unchanged.
    async fn run_transformations(
        &self,
        transformations: &[Transformation],
        mut status: u16,
        mut headers: StringMap,
        mut body: Bytes,
    ) -> Result<(u16, StringMap, Bytes), ProxyError> {
        for transformation in transformations {
            match transformation {
                Transformation::Filter { address, cache_tag, .. } => {
                    let resource_tag = address.path().unwrap_or("").to_string();
                    let etag = headers.get("etag").map(str::to_string);
                    let filter_key = FilterCache::key(&resource_tag, etag.as_deref(), &format!("{address:?}"));

                    if let Some((cached_status, cached_headers, cached_body)) =
                        self.filter_cache.lookup(&filter_key, SystemTime::now())
                    {
                        status = cached_status.as_u16();
                        body = cached_body;
                        headers = http_header_map_to_string_map(&cached_headers);
                        continue;
                    }

                    let filter_request = LoaderRequest {
                        method: HttpMethod::POST,
                        headers: StringMap::new(),
                        body: Some(body.clone()),
                        remote_addr: "127.0.0.1".into(),
                    };
                    let filtered = self.loader.load(address, &filter_request).await?;
                    let LoaderResponse::Direct { status: filter_status, headers: filter_headers, mut body: filter_body } = filtered
                    else {
                        return Err(ProxyError::Configuration(
                            "filter transformation resolved to a Proxy address".into(),
                        ));
                    };
                    let collected = crate::istream::collect_to_bytes(filter_body.as_mut(), usize::MAX);
                    let filtered_bytes = match collected.await {
                        crate::istream::ProxyResultBytes::Ok(b) => b,
                        crate::istream::ProxyResultBytes::TooLarge => {
                            return Err(ProxyError::Configuration("filter output too large to buffer".into()))
                        }
                        crate::istream::ProxyResultBytes::Err(e) => return Err(e),
                    };

                    status = filter_status;
                    body = filtered_bytes.clone();
                    let header_map = string_map_to_http_header_map(&filter_headers);
                    self.filter_cache.store(
                        filter_key,
                        StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
                        header_map,
                        filtered_bytes,
                        cache_tag.clone(),
                        SystemTime::now(),
                    );
                    headers = filter_headers;
                }
                Transformation::Process { .. } | Transformation::ProcessCss { .. } | Transformation::ProcessText => {
                    // Contract-only: the parse-tree/CSS/text processors are
                    // out-of-scope external collaborators.
                }
            }
        }
        Ok((status, headers, body))
    }
}

fn translate_request_from(incoming: &IncomingRequest) -> TranslateRequest {
    let (path, query) = match incoming.uri.split_once('?') {
        Some((p, q)) => (p.to_string(), Some(q.to_string())),
        None => (incoming.uri.clone(), None),
    };
    TranslateRequest {
        uri: Some(path),
        host: Some(incoming.host.clone()),
        remote_host: Some(incoming.remote_addr.clone()),
        query_string: query,
        user_agent: incoming.headers.get("user-agent").map(str::to_string),
        ..Default::default()
    }
}

fn is_redirect(status: u16) -> bool {
    (300..400).contains(&status)
}

fn absorb_cookies(headers: &StringMap, host: &str, cookies: &mut CookieJar) {
    let now = SystemTime::now();
    for value in headers.equal_range("set-cookie") {
        cookies.set_cookie(value, host, now);
    }
}

fn http_header_map_to_string_map(headers: &HeaderMap) -> StringMap {
    let mut out = StringMap::new();
    for (name, value) in headers {
        if let Ok(v) = value.to_str() {
            out.add(name.as_str(), v);
        }
    }
    out
}

fn string_map_to_http_header_map(headers: &StringMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::from_bytes(name.as_bytes()),
            http::header::HeaderValue::from_str(value),
        ) {
            out.append(name, value);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_status_range_is_3xx_only() {
        assert!(is_redirect(302));
        assert!(is_redirect(301));
        assert!(!is_redirect(200));
        assert!(!is_redirect(404));
    }

    #[test]
    fn translate_request_splits_query_string() {
        let incoming = IncomingRequest {
            method: HttpMethod::GET,
            uri: "/foo?bar=1".into(),
            host: "example.com".into(),
            is_ssl: false,
            remote_addr: "127.0.0.1".into(),
            headers: StringMap::new(),
            body: None,
        };
        let request = translate_request_from(&incoming);
        assert_eq!(request.uri.as_deref(), Some("/foo"));
        assert_eq!(request.query_string.as_deref(), Some("bar=1"));
    }

    #[test]
    fn absorb_cookies_adds_to_jar() {
        let mut headers = StringMap::new();
        headers.add("set-cookie", "sid=abc; Path=/");
        let mut jar = CookieJar::new();
        absorb_cookies(&headers, "example.com", &mut jar);
        assert_eq!(jar.len(), 1);
    }

    #[test]
    fn string_map_http_header_map_round_trip() {
        let mut m = StringMap::new();
        m.add("x-custom", "value");
        let hm = string_map_to_http_header_map(&m);
        let back = http_header_map_to_string_map(&hm);
        assert_eq!(back.get("x-custom"), Some("value"));
    }
}
