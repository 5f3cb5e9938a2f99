use std::{fs, net::SocketAddr, time::Duration};

use pingora::server::configuration::{Opt, ServerConf};
use pingora_error::{Error, ErrorType::*, OrErr, Result};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Root configuration structure: listener/TLS setup plus the proxy-specific
/// settings the translation-driven pipeline needs.
///
/// Loading is synchronous and eager (`load_from_yaml`/`from_yaml`): validate
/// before any async machinery (translation stock, caches, listeners) starts.
#[derive(Default, Debug, Serialize, Deserialize, Validate)]
pub struct Config {
    /// Pingora framework configuration (worker count, daemonization, etc.).
    #[serde(default)]
    pub pingora: ServerConf,

    #[validate(length(min = 1))]
    #[validate(nested)]
    pub listeners: Vec<Listener>,

    #[validate(nested)]
    pub translation_server: TranslationServerConfig,

    #[serde(default)]
    #[validate(nested)]
    pub caches: CachesConfig,

    #[serde(default)]
    pub stock: StockDefaults,

    #[serde(default)]
    #[validate(nested)]
    pub log: LogConfig,

    #[serde(default)]
    pub control: Option<ControlConfig>,
}

impl Config {
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path)
            .or_err_with(ReadError, || format!("unable to read conf file from {path}"))?;
        log::debug!("conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    pub fn load_yaml_with_opt_override(opt: &Opt) -> Result<Self> {
        if let Some(path) = &opt.conf {
            let mut conf = Self::load_from_yaml(path)?;
            conf.merge_with_opt(opt);
            Ok(conf)
        } else {
            Error::e_explain(ReadError, "no path specified")
        }
    }

    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        log::trace!("read conf file: {conf_str}");
        let conf: Config = serde_yaml::from_str(conf_str)
            .or_err_with(ReadError, || format!("unable to parse yaml conf {conf_str}"))?;
        log::trace!("loaded conf: {conf:?}");
        conf.validate()
            .or_err_with(FileReadError, || "conf file validation failed")?;
        Ok(conf)
    }

    #[allow(dead_code)]
    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_else(|e| {
            log::error!("failed to serialize config to yaml: {e}");
            String::new()
        })
    }

    pub fn merge_with_opt(&mut self, opt: &Opt) {
        if opt.daemon {
            self.pingora.daemon = true;
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Listener::validate_tls_for_offer_h2"))]
pub struct Listener {
    pub address: SocketAddr,
    pub tls: Option<Tls>,
    #[serde(default)]
    pub offer_h2: bool,
}

impl Listener {
    fn validate_tls_for_offer_h2(&self) -> std::result::Result<(), ValidationError> {
        if self.offer_h2 && self.tls.is_none() {
            Err(ValidationError::new("tls_required_for_h2"))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tls {
    pub cert_path: String,
    pub key_path: String,
}

/// Where to find the translation server and how the `TranslationClient`
/// `Stock` it's borrowed through should be sized.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct TranslationServerConfig {
    #[validate(length(min = 1))]
    pub socket_path: String,
    #[serde(default = "TranslationServerConfig::default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "TranslationServerConfig::default_pool_size")]
    pub pool_size: usize,
}

impl TranslationServerConfig {
    fn default_connect_timeout_ms() -> u64 {
        1_000
    }

    fn default_pool_size() -> usize {
        4
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for TranslationServerConfig {
    fn default() -> Self {
        TranslationServerConfig {
            socket_path: "/run/beng-proxy/translate.socket".to_string(),
            connect_timeout_ms: Self::default_connect_timeout_ms(),
            pool_size: Self::default_pool_size(),
        }
    }
}

/// Per-cache sizing, mirrored across the translation, HTTP response, and
/// filter caches; each cache additionally enforces its own ceilings (the
/// translation cache's 300s store cap is fixed in code, not configurable,
/// matching the original's `MAX_AGE_CAP`).
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct CachesConfig {
    #[serde(default)]
    #[validate(nested)]
    pub translation: CacheSizing,
    #[serde(default)]
    #[validate(nested)]
    pub http: CacheSizing,
    #[serde(default)]
    #[validate(nested)]
    pub filter: CacheSizing,
}

impl Default for CachesConfig {
    fn default() -> Self {
        CachesConfig {
            translation: CacheSizing::default(),
            http: CacheSizing::default(),
            filter: CacheSizing::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct CacheSizing {
    #[serde(default = "CacheSizing::default_max_size")]
    pub max_size: usize,
    #[serde(default = "CacheSizing::default_obey_no_cache")]
    pub obey_no_cache: bool,
    #[serde(default = "CacheSizing::default_max_age_cap_secs")]
    pub max_age_cap_secs: u64,
}

impl CacheSizing {
    fn default_max_size() -> usize {
        256 * 1024
    }

    fn default_obey_no_cache() -> bool {
        true
    }

    fn default_max_age_cap_secs() -> u64 {
        3600
    }

    pub fn max_age_cap(&self) -> Duration {
        Duration::from_secs(self.max_age_cap_secs)
    }
}

impl Default for CacheSizing {
    fn default() -> Self {
        CacheSizing {
            max_size: Self::default_max_size(),
            obey_no_cache: Self::default_obey_no_cache(),
            max_age_cap_secs: Self::default_max_age_cap_secs(),
        }
    }
}

/// Process-wide defaults for any `Stock` this proxy opens (translation
/// client connections today; AJP/FastCGI connection pools would reuse the
/// same defaults), overridable per resource class at the call site.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StockDefaults {
    pub limit: usize,
    pub max_idle: usize,
    pub idle_timeout_secs: u64,
}

impl Default for StockDefaults {
    fn default() -> Self {
        StockDefaults {
            limit: 16,
            max_idle: 4,
            idle_timeout_secs: 60,
        }
    }
}

impl StockDefaults {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct LogConfig {
    #[validate(length(min = 1), custom(function = "LogConfig::validate_path"))]
    pub access_log_path: String,
    #[serde(default = "LogConfig::default_level")]
    pub level: String,
}

impl LogConfig {
    fn validate_path(path: &str) -> std::result::Result<(), ValidationError> {
        if path.contains('\0') || path.trim().is_empty() {
            return Err(ValidationError::new("invalid_log_file_path"));
        }
        Ok(())
    }

    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            access_log_path: "/var/log/beng-proxy/access.log".to_string(),
            level: Self::default_level(),
        }
    }
}

/// Bind address for the control-plane UDP listener; absent means the
/// control channel isn't started.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ControlConfig {
    pub address: SocketAddr,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn test_load_file() {
        init_log();
        let conf_str = r#"
---
listeners:
  - address: 0.0.0.0:8080

translation_server:
  socket_path: /run/beng-proxy/translate.socket
        "#;
        let conf = Config::from_yaml(conf_str).unwrap();
        assert_eq!(1, conf.listeners.len());
        assert_eq!(conf.translation_server.pool_size, 4);
        assert_eq!(conf.caches.translation.max_size, 256 * 1024);
    }

    #[test]
    fn test_valid_listeners_length() {
        init_log();
        let conf_str = r#"
---
listeners: []
translation_server:
  socket_path: /run/beng-proxy/translate.socket
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_valid_listeners_tls_for_offer_h2() {
        init_log();
        let conf_str = r#"
---
listeners:
  - address: "[::1]:8080"
    offer_h2: true
translation_server:
  socket_path: /run/beng-proxy/translate.socket
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_missing_translation_socket_path() {
        init_log();
        let conf_str = r#"
---
listeners:
  - address: "[::1]:8080"
translation_server:
  socket_path: ""
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_round_trip_to_yaml() {
        init_log();
        let conf = Config {
            pingora: ServerConf::default(),
            listeners: vec![Listener {
                address: "0.0.0.0:8080".parse().unwrap(),
                tls: None,
                offer_h2: false,
            }],
            translation_server: TranslationServerConfig::default(),
            caches: CachesConfig::default(),
            stock: StockDefaults::default(),
            log: LogConfig::default(),
            control: None,
        };
        let yaml = conf.to_yaml();
        let reparsed = Config::from_yaml(&yaml).unwrap();
        assert_eq!(reparsed.listeners.len(), 1);
    }
}
