//! Cookie jar, grounded on the original's `CookieJar.hxx` /
//! `CookieJar.cxx`: cookies are keyed by (domain, path, name), matched
//! against a request host/path with an "implicit dot" deviation from
//! RFC 2965 (a `Domain` attribute without a leading dot still matches as if
//! one were prepended, since that's what real browsers do and what the
//! original chose to emulate).

use std::time::{Duration, SystemTime};

#[derive(Debug, Clone)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub expires: Option<SystemTime>,
    pub secure: bool,
}

impl Cookie {
    fn is_expired(&self, now: SystemTime) -> bool {
        self.expires.map(|e| now >= e).unwrap_or(false)
    }
}

/// Per-session cookie storage, one instance per translation `session`.
#[derive(Debug, Default)]
pub struct CookieJar {
    cookies: Vec<Cookie>,
}

impl CookieJar {
    pub fn new() -> Self {
        CookieJar { cookies: Vec::new() }
    }

    /// Applies one `Set-Cookie` header value against `request_host`. A
    /// `max-age=0` or already-past `expires` deletes any matching cookie,
    /// mirroring `CookieJar::EraseAndDispose`.
    pub fn set_cookie(&mut self, header_value: &str, request_host: &str, now: SystemTime) {
        let Some(parsed) = parse_set_cookie(header_value, request_host) else {
            return;
        };

        self.cookies
            .retain(|c| !(c.name == parsed.name && c.domain == parsed.domain && c.path == parsed.path));

        if !parsed.is_expired(now) {
            self.cookies.push(parsed);
        }
    }

    /// Merges cookies received from one upstream response into this jar,
    /// mirroring `CookieJar::MoveFrom` (all entries unconditionally adopted,
    /// replacing any same-identity entry already present).
    pub fn move_from(&mut self, mut other: CookieJar) {
        for cookie in other.cookies.drain(..) {
            self.cookies
                .retain(|c| !(c.name == cookie.name && c.domain == cookie.domain && c.path == cookie.path));
            self.cookies.push(cookie);
        }
    }

    /// Drops everything that has expired as of `now`, per `CookieJar::Expire`.
    pub fn expire(&mut self, now: SystemTime) {
        self.cookies.retain(|c| !c.is_expired(now));
    }

    /// Builds the `Cookie:` header value for a request to `host`/`path`,
    /// matching domain suffix (with the implicit-dot exception) and path
    /// prefix, as `CookieJar::Find` does.
    pub fn cookie_header(&self, host: &str, path: &str, is_secure: bool) -> Option<String> {
        let matches: Vec<&Cookie> = self
            .cookies
            .iter()
            .filter(|c| domain_matches(&c.domain, host) && path.starts_with(&c.path))
            .filter(|c| !c.secure || is_secure)
            .collect();

        if matches.is_empty() {
            return None;
        }

        Some(
            matches
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// `Cookie2: $Version="1"` is sent alongside `Cookie` when the
    /// translation response asked for RFC 2965-style jar behaviour (spec
    /// 4.11's supplemented `secure_cookie`/stateful handling).
    pub fn cookie2_header() -> &'static str {
        "$Version=\"1\""
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }
}

/// RFC 2965 domain matching with the "implicit dot" deviation: a `Domain`
/// value with no leading dot is still treated as if it had one, so
/// `Domain=example.com` matches `www.example.com` the way real browsers
/// behave (the original's documented departure from strict RFC 2965).
fn domain_matches(cookie_domain: &str, request_host: &str) -> bool {
    let request_host = request_host.split(':').next().unwrap_or(request_host);
    if cookie_domain.eq_ignore_ascii_case(request_host) {
        return true;
    }
    let dotted = if cookie_domain.starts_with('.') {
        cookie_domain.to_string()
    } else {
        format!(".{cookie_domain}")
    };
    request_host.to_ascii_lowercase().ends_with(&dotted.to_ascii_lowercase())
}

fn parse_set_cookie(header_value: &str, request_host: &str) -> Option<Cookie> {
    let mut parts = header_value.split(';').map(str::trim);
    let (name, value) = parts.next()?.split_once('=')?;

    let mut domain = request_host.to_string();
    let mut path = "/".to_string();
    let mut max_age: Option<Duration> = None;
    let mut expires: Option<SystemTime> = None;
    let mut secure = false;

    for attr in parts {
        let (key, val) = attr.split_once('=').unwrap_or((attr, ""));
        match key.to_ascii_lowercase().as_str() {
            "domain" => domain = val.to_string(),
            "path" => path = val.to_string(),
            "secure" => secure = true,
            "max-age" => max_age = val.parse::<i64>().ok().map(|s| Duration::from_secs(s.max(0) as u64)),
            "expires" => expires = httpdate::parse_http_date(val).ok(),
            _ => {}
        }
    }

    let expires = max_age
        .map(|d| if d.is_zero() { SystemTime::UNIX_EPOCH } else { SystemTime::now() + d })
        .or(expires);

    Some(Cookie {
        name: name.trim().to_string(),
        value: value.trim().trim_matches('"').to_string(),
        domain,
        path,
        expires,
        secure,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn implicit_dot_matches_subdomain() {
        assert!(domain_matches("example.com", "www.example.com"));
        assert!(domain_matches(".example.com", "www.example.com"));
        assert!(!domain_matches("example.com", "notexample.com"));
    }

    #[test]
    fn set_cookie_then_header_round_trips() {
        let mut jar = CookieJar::new();
        jar.set_cookie("sid=abc123; Path=/; Domain=example.com", "example.com", SystemTime::now());
        let header = jar.cookie_header("www.example.com", "/app", false).unwrap();
        assert_eq!(header, "sid=abc123");
    }

    #[test]
    fn max_age_zero_deletes_immediately() {
        let mut jar = CookieJar::new();
        let now = SystemTime::now();
        jar.set_cookie("sid=abc; Path=/; Domain=example.com", "example.com", now);
        assert_eq!(jar.len(), 1);
        jar.set_cookie("sid=abc; Path=/; Domain=example.com; Max-Age=0", "example.com", now);
        assert_eq!(jar.len(), 0);
    }

    #[test]
    fn secure_cookie_withheld_from_plain_request() {
        let mut jar = CookieJar::new();
        jar.set_cookie("sid=abc; Path=/; Domain=example.com; Secure", "example.com", SystemTime::now());
        assert!(jar.cookie_header("example.com", "/", false).is_none());
        assert!(jar.cookie_header("example.com", "/", true).is_some());
    }

    #[test]
    fn path_prefix_must_match() {
        let mut jar = CookieJar::new();
        jar.set_cookie("sid=abc; Path=/admin; Domain=example.com", "example.com", SystemTime::now());
        assert!(jar.cookie_header("example.com", "/public", false).is_none());
        assert!(jar.cookie_header("example.com", "/admin/x", false).is_some());
    }
}
