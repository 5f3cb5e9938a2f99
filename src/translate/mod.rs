//! Data model exchanged with the translation server.

pub mod cache;
pub mod client;

use std::collections::BTreeSet;
use std::time::Duration;

use crate::resource::address::ResourceAddress;

/// A request field the translation server may ask to vary a response on, or
/// invalidate cache entries by. Mirrors the wire protocol's field codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VaryKey {
    Uri,
    Host,
    Session,
    Param,
    Language,
    UserAgent,
    UaClass,
    QueryString,
    RemoteHost,
    LocalAddress,
    Check,
    WantFullUri,
}

/// Inputs to the translation server.
#[derive(Debug, Clone, Default)]
pub struct TranslateRequest {
    pub uri: Option<String>,
    pub widget_type: Option<String>,
    pub host: Option<String>,
    pub remote_host: Option<String>,
    pub local_address: Option<String>,
    pub session: Option<Vec<u8>>,
    pub param: Option<String>,
    pub query_string: Option<String>,
    pub user_agent: Option<String>,
    pub ua_class: Option<String>,
    pub language: Option<String>,
    pub check: Option<Vec<u8>>,
    pub want_full_uri: Option<Vec<u8>>,
    pub want: Vec<String>,
    pub authorization: Option<String>,
    pub error_document_status: Option<u16>,
}

impl TranslateRequest {
    pub fn field(&self, key: VaryKey) -> Option<&str> {
        match key {
            VaryKey::Uri => self.uri.as_deref(),
            VaryKey::Host => self.host.as_deref(),
            VaryKey::Session => None,
            VaryKey::Param => self.param.as_deref(),
            VaryKey::Language => self.language.as_deref(),
            VaryKey::UserAgent => self.user_agent.as_deref(),
            VaryKey::UaClass => self.ua_class.as_deref(),
            VaryKey::QueryString => self.query_string.as_deref(),
            VaryKey::RemoteHost => self.remote_host.as_deref(),
            VaryKey::LocalAddress => self.local_address.as_deref(),
            VaryKey::Check => None,
            VaryKey::WantFullUri => None,
        }
    }
}

/// A single step of the response-side transformation chain.
#[derive(Debug, Clone)]
pub enum Transformation {
    Process { options: ProcessOptions },
    ProcessCss { options: ProcessOptions },
    ProcessText,
    Filter {
        address: ResourceAddress,
        cache_tag: Option<String>,
        reveal_user: bool,
    },
}

#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    pub container: bool,
    pub focus: bool,
}

/// Everything the translation server said about how to handle one request.
/// `Default` is used when synthesizing test fixtures, never as a
/// "no translation happened" sentinel.
#[derive(Debug, Clone, Default)]
pub struct TranslateResponse {
    pub address: ResourceAddressOrNone,
    pub base: Option<String>,
    pub regex: Option<String>,
    pub inverse_regex: Option<String>,
    pub transformations: Vec<Transformation>,
    pub vary: BTreeSet<VaryKey>,
    pub invalidate: BTreeSet<VaryKey>,
    pub max_age: Option<Duration>,
    pub expires_relative: Option<Duration>,
    pub user: Option<String>,
    pub user_max_age: Option<Duration>,
    pub session: Option<Vec<u8>>,
    pub realm: Option<String>,
    pub check: Option<Vec<u8>>,
    pub auth: Option<Vec<u8>>,
    pub site: Option<String>,
    pub validate_mtime: Option<(String, std::time::SystemTime)>,
    pub unsafe_base: bool,
    pub easy_base: bool,
    pub regex_tail: bool,
    pub stateful: bool,
    pub secure_cookie: bool,
    pub transparent: bool,
    pub auto_base: bool,
    pub widget_info: bool,
    pub dump_headers: bool,
    pub filter_4xx: bool,
    pub status: Option<u16>,
    pub www_authenticate: Option<String>,
    pub authentication_info: Option<String>,
}

/// Newtype so `TranslateResponse` can `#[derive(Default)]` while still
/// distinguishing "explicitly no resource" from "plain default".
#[derive(Debug, Clone)]
pub struct ResourceAddressOrNone(pub ResourceAddress);

impl Default for ResourceAddressOrNone {
    fn default() -> Self {
        ResourceAddressOrNone(ResourceAddress::None)
    }
}

impl TranslateResponse {
    /// An entry is expandable when any of its address/auth fields carry a
    /// capture-group template — approximated here by a regex being present
    /// together with a base (the only place expansion happens in the cache).
    pub fn is_expandable(&self) -> bool {
        self.regex.is_some() && self.base.is_some()
    }
}
