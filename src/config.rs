use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 48 * 1024 * 1024;
pub const DEFAULT_MAX_DOCUMENT_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub listen_addr: String,
    /// Additional TLS listener (requires tls_cert_file + tls_key_file).
    #[serde(default)]
    pub listen_tls: Option<String>,
    #[serde(default)]
    pub listen_unix: Option<String>,
    pub postgres_url: Option<String>,
    pub log_level: Option<String>,
    /// Directory for the persisted state file. None disables state keeping.
    #[serde(default)]
    pub state_dir: Option<String>,
    /// Require SASL authentication before non-handshake commands.
    #[serde(default)]
    pub auth: bool,
    #[serde(default)]
    pub tls_cert_file: Option<String>,
    #[serde(default)]
    pub tls_key_file: Option<String>,
    /// Client CA bundle; setting it enables mTLS on the TLS listener.
    #[serde(default)]
    pub tls_ca_file: Option<String>,
    pub max_message_size_bytes: Option<usize>,
    pub compression_threshold_bytes: Option<usize>,
    /// Connection-fatal limit on waiting for the next request. None waits
    /// forever.
    pub read_timeout_secs: Option<u64>,
    pub cursor_timeout_secs: Option<u64>,
    pub cursor_sweep_interval_secs: Option<u64>,
    pub drain_timeout_secs: Option<u64>,
    pub pool_max_size: Option<usize>,
    pub pool_acquire_timeout_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Default to Mongo's standard port locally
            listen_addr: "127.0.0.1:27017".to_string(),
            listen_tls: None,
            listen_unix: None,
            postgres_url: None,
            log_level: None,
            state_dir: None,
            auth: false,
            tls_cert_file: None,
            tls_key_file: None,
            tls_ca_file: None,
            max_message_size_bytes: Some(DEFAULT_MAX_MESSAGE_SIZE),
            compression_threshold_bytes: Some(512),
            read_timeout_secs: None,
            cursor_timeout_secs: Some(600),
            cursor_sweep_interval_secs: Some(60),
            drain_timeout_secs: Some(30),
            pool_max_size: Some(50),
            pool_acquire_timeout_secs: Some(30),
        }
    }
}

/// CLI/env override set applied on top of a loaded config.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen_addr: Option<String>,
    pub listen_tls: Option<String>,
    pub listen_unix: Option<String>,
    pub postgres_url: Option<String>,
    pub state_dir: Option<String>,
    pub log_level: Option<String>,
    pub auth: Option<bool>,
    pub tls_cert_file: Option<String>,
    pub tls_key_file: Option<String>,
    pub tls_ca_file: Option<String>,
}

impl Config {
    /// Load configuration from a TOML file. If `path_opt` is None or the file is
    /// missing/unreadable, returns defaults. Parsing errors are returned.
    pub fn load_from_file(path_opt: Option<&str>) -> Result<Self> {
        let path = path_opt.unwrap_or("config.toml");
        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<Config>(&contents) {
                Ok(cfg) => Ok(cfg),
                Err(e) => Err(Error::Msg(format!("Failed to parse {}: {}", path, e))),
            },
            Err(_e) => Ok(Self::default()),
        }
    }

    /// Apply CLI/env overrides (highest precedence) to an existing config.
    pub fn with_overrides(mut self, ov: Overrides) -> Self {
        if let Some(addr) = ov.listen_addr {
            self.listen_addr = addr;
        }
        if let Some(addr) = ov.listen_tls {
            self.listen_tls = Some(addr);
        }
        if let Some(path) = ov.listen_unix {
            self.listen_unix = Some(path);
        }
        if let Some(pg) = ov.postgres_url {
            self.postgres_url = Some(pg);
        }
        if let Some(dir) = ov.state_dir {
            self.state_dir = Some(dir);
        }
        if let Some(ll) = ov.log_level {
            self.log_level = Some(ll);
        }
        if let Some(auth) = ov.auth {
            self.auth = auth;
        }
        if let Some(f) = ov.tls_cert_file {
            self.tls_cert_file = Some(f);
        }
        if let Some(f) = ov.tls_key_file {
            self.tls_key_file = Some(f);
        }
        if let Some(f) = ov.tls_ca_file {
            self.tls_ca_file = Some(f);
        }
        self
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size_bytes
            .unwrap_or(DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn compression_threshold(&self) -> usize {
        self.compression_threshold_bytes.unwrap_or(512)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            return Err(Error::Msg("listen_addr cannot be empty".to_string()));
        }
        if !self.listen_addr.contains(':') {
            return Err(Error::Msg(format!(
                "listen_addr '{}' must be in host:port format",
                self.listen_addr
            )));
        }

        if let Some(ref url) = self.postgres_url {
            if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
                return Err(Error::Msg(format!(
                    "postgres_url '{}' must start with postgres:// or postgresql://",
                    url
                )));
            }
        }

        if let Some(ref addr) = self.listen_tls {
            if !addr.contains(':') {
                return Err(Error::Msg(format!(
                    "listen_tls '{}' must be in host:port format",
                    addr
                )));
            }
            if self.tls_cert_file.is_none() || self.tls_key_file.is_none() {
                return Err(Error::Msg(
                    "listen_tls requires tls_cert_file and tls_key_file".to_string(),
                ));
            }
        }

        // If one TLS file is set, both must be set
        if self.tls_cert_file.is_some() != self.tls_key_file.is_some() {
            return Err(Error::Msg(
                "tls_cert_file and tls_key_file must be set together".to_string(),
            ));
        }

        for (name, file) in [
            ("tls_cert_file", &self.tls_cert_file),
            ("tls_key_file", &self.tls_key_file),
            ("tls_ca_file", &self.tls_ca_file),
        ] {
            if let Some(path) = file {
                if !std::path::Path::new(path).exists() {
                    return Err(Error::Msg(format!("{} '{}' does not exist", name, path)));
                }
            }
        }

        if let Some(max) = self.max_message_size_bytes {
            if max < DEFAULT_MAX_DOCUMENT_SIZE {
                return Err(Error::Msg(format!(
                    "max_message_size_bytes must be at least {} (one full document)",
                    DEFAULT_MAX_DOCUMENT_SIZE
                )));
            }
        }

        if self.pool_max_size == Some(0) {
            return Err(Error::Msg("pool_max_size must be nonzero".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.listen_addr, "127.0.0.1:27017");
        assert_eq!(cfg.max_message_size(), DEFAULT_MAX_MESSAGE_SIZE);
    }

    #[test]
    fn overrides_take_precedence() {
        let cfg = Config::default().with_overrides(Overrides {
            listen_addr: Some("0.0.0.0:27027".into()),
            postgres_url: Some("postgres://localhost/db".into()),
            auth: Some(true),
            ..Default::default()
        });
        assert_eq!(cfg.listen_addr, "0.0.0.0:27027");
        assert_eq!(cfg.postgres_url.as_deref(), Some("postgres://localhost/db"));
        assert!(cfg.auth);
    }

    #[test]
    fn rejects_bad_postgres_url() {
        let mut cfg = Config::default();
        cfg.postgres_url = Some("mysql://nope".into());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_tls_listener_without_certs() {
        let mut cfg = Config::default();
        cfg.listen_tls = Some("127.0.0.1:27018".into());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_undersized_message_cap() {
        let mut cfg = Config::default();
        cfg.max_message_size_bytes = Some(1024);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parses_toml() {
        let cfg: Config = toml::from_str(
            r#"
            listen_addr = "127.0.0.1:27017"
            auth = true
            cursor_timeout_secs = 120
            "#,
        )
        .unwrap();
        assert!(cfg.auth);
        assert_eq!(cfg.cursor_timeout_secs, Some(120));
    }
}
