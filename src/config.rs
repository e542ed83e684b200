//! Server configuration
//!
//! Loaded from a JSON file passed via `--config`. With no file, an empty
//! default configuration is used (no applications, standalone mode).

use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::Deserialize;

/// Configuration of an individual application namespace.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Stable application name, used in REST paths.
    pub name: String,
    /// Public key browsers connect with (`/app/{key}`).
    pub key: String,
    /// HMAC secret for private-channel authorization. Never transmitted.
    pub secret: String,
}

/// Optional Redis coordination parameters. An empty address means
/// standalone mode.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RedisConfig {
    #[serde(default)]
    pub address: String,
    /// Logical database selected after connect.
    #[serde(default)]
    pub database: i64,
    #[serde(default)]
    pub password: String,
    /// Treat `address` as a Sentinel endpoint and resolve the master
    /// named `mymaster` through it.
    #[serde(default)]
    pub sentinel: bool,
    /// Connect over TLS.
    #[serde(default)]
    pub secure: bool,
}

/// The entire configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub certificate: String,
    #[serde(rename = "private-key", default)]
    pub private_key: String,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub applications: Vec<AppConfig>,
}

impl Config {
    /// Read a config file. `None` yields the default configuration.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let mut file = File::open(path).map_err(|source| ConfigError::Open {
            path: path.display().to_string(),
            source,
        })?;
        let mut raw = String::new();
        file.read_to_string(&mut raw)
            .map_err(|source| ConfigError::Open {
                path: path.display().to_string(),
                source,
            })?;
        Self::parse(&raw)
    }

    /// Parse configuration data and validate it.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(raw).map_err(ConfigError::Format)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.certificate.is_empty() != self.private_key.is_empty() {
            return Err(ConfigError::TlsPair);
        }
        for path in [&self.certificate, &self.private_key] {
            if !path.is_empty() && !Path::new(path).exists() {
                return Err(ConfigError::TlsFile(path.clone()));
            }
        }
        Ok(())
    }

    /// Look up an application by name.
    pub fn app(&self, name: &str) -> Option<&AppConfig> {
        self.applications.iter().find(|a| a.name == name)
    }

    /// Look up an application by its public key.
    pub fn app_by_key(&self, key: &str) -> Option<&AppConfig> {
        self.applications.iter().find(|a| a.key == key)
    }

    /// Whether membership is coordinated through Redis.
    pub fn distributed(&self) -> bool {
        !self.redis.address.is_empty()
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("can't open the config file {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config file format: {0}")]
    Format(#[from] serde_json::Error),
    #[error("to use https, both certificate and private-key must be specified")]
    TlsPair,
    #[error("cannot access TLS file `{0}'")]
    TlsFile(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "host": "localhost",
        "port": 8111,
        "applications": [
            {"name": "testapp", "key": "1234567890", "secret": "abcdefghij"},
            {"name": "testapp2", "key": "2345678901", "secret": "bcdefghijk"}
        ]
    }"#;

    #[test]
    fn test_parse_sample() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 8111);
        assert_eq!(config.applications.len(), 2);
        assert!(!config.distributed());
    }

    #[test]
    fn test_parse_redis() {
        let config = Config::parse(
            r#"{"applications": [],
                "redis": {"address": "localhost:6379", "database": 1, "sentinel": false}}"#,
        )
        .unwrap();
        assert!(config.distributed());
        assert_eq!(config.redis.database, 1);
        assert!(!config.redis.secure);
    }

    #[test]
    fn test_empty_object_defaults() {
        let config = Config::parse("{}").unwrap();
        assert_eq!(config.port, 0);
        assert!(config.applications.is_empty());
        assert!(!config.distributed());
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            Config::parse("{not json"),
            Err(ConfigError::Format(_))
        ));
    }

    #[test]
    fn test_certificate_without_key() {
        let result = Config::parse(r#"{"certificate": "/tmp/cert.pem"}"#);
        assert!(matches!(result, Err(ConfigError::TlsPair)));
    }

    #[test]
    fn test_missing_tls_files() {
        let result = Config::parse(
            r#"{"certificate": "/nonexistent/cert.pem",
                "private-key": "/nonexistent/key.pem"}"#,
        );
        assert!(matches!(result, Err(ConfigError::TlsFile(_))));
    }

    #[test]
    fn test_app_lookup() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.app("testapp").unwrap().key, "1234567890");
        assert!(config.app("nosuchapp").is_none());
        assert_eq!(config.app_by_key("2345678901").unwrap().name, "testapp2");
        assert!(config.app_by_key("0000000000").is_none());
    }
}
