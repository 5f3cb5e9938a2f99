//! Unified error handling for beng-proxy.
//!
//! One error enum carries every error *kind* distinguished in the request
//! pipeline's failure-handling design: protocol framing errors, upstream I/O
//! errors, translation failures, and so on. Each kind knows how to lower
//! itself into a synthetic HTTP response, and into a `pingora_error::Error`
//! so it can cross back into the `ProxyHttp` boundary.

use std::fmt;

use http::StatusCode;

/// Unified error type for proxy-internal operations.
#[derive(Debug)]
pub enum ProxyError {
    /// Malformed framing or an illegal protocol state transition
    /// (AJP, FastCGI, WAS, the translation wire protocol).
    Protocol(String),
    /// I/O failure talking to an upstream resource (EIO, reset, timeout).
    UpstreamIo(std::io::Error),
    /// The translation server could not be reached or returned garbage.
    Translation(String),
    /// The resource does not exist, or is not a regular file.
    NotFound(String),
    /// A malformed request at the entry point (bad method, bad URI).
    Configuration(String),
    /// Static configuration failed validation at startup.
    Validation(String),
    /// Request header section exceeded configured limits.
    HeaderTooLarge,
    /// A precondition header (`Expect`) could not be satisfied.
    ExpectationFailed,
    /// Generic I/O error not tied to an upstream connection.
    Io(std::io::Error),
    /// Escape hatch for the pingora framework's own error type.
    Pingora(pingora_error::Error),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            ProxyError::UpstreamIo(err) => write!(f, "upstream I/O error: {err}"),
            ProxyError::Translation(msg) => write!(f, "translation error: {msg}"),
            ProxyError::NotFound(msg) => write!(f, "not found: {msg}"),
            ProxyError::Configuration(msg) => write!(f, "configuration error: {msg}"),
            ProxyError::Validation(msg) => write!(f, "validation error: {msg}"),
            ProxyError::HeaderTooLarge => write!(f, "request header too large"),
            ProxyError::ExpectationFailed => write!(f, "expectation failed"),
            ProxyError::Io(err) => write!(f, "I/O error: {err}"),
            ProxyError::Pingora(err) => write!(f, "pingora error: {err}"),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProxyError::UpstreamIo(err) | ProxyError::Io(err) => Some(err),
            ProxyError::Pingora(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::Io(err)
    }
}

impl From<pingora_error::Error> for ProxyError {
    fn from(err: pingora_error::Error) -> Self {
        ProxyError::Pingora(err)
    }
}

impl From<Box<pingora_error::Error>> for ProxyError {
    fn from(err: Box<pingora_error::Error>) -> Self {
        ProxyError::Pingora(*err)
    }
}

impl From<ProxyError> for Box<pingora_error::Error> {
    fn from(err: ProxyError) -> Self {
        match err {
            ProxyError::Pingora(e) => Box::new(e),
            other => Box::new(pingora_error::Error::new_str(Box::leak(
                other.to_string().into_boxed_str(),
            ))),
        }
    }
}

impl ProxyError {
    /// Maps this error onto the synthetic status code the pipeline should
    /// answer the client with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::NotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::Configuration(_) => StatusCode::BAD_REQUEST,
            ProxyError::HeaderTooLarge => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            ProxyError::ExpectationFailed => StatusCode::EXPECTATION_FAILED,
            ProxyError::Translation(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Protocol(_) | ProxyError::UpstreamIo(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Validation(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Io(_) | ProxyError::Pingora(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Result alias used throughout the proxy-internal modules.
pub type ProxyResult<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_error_kinds() {
        assert_eq!(
            ProxyError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ProxyError::HeaderTooLarge.status_code(),
            StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
        );
        assert_eq!(
            ProxyError::ExpectationFailed.status_code(),
            StatusCode::EXPECTATION_FAILED
        );
    }
}
