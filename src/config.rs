use std::path::PathBuf;
use std::time::Duration;

use crate::backend::RemoteConfig;
use crate::net::protocol::BotId;
use crate::net::tls::{TlsConfig, TlsError};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error(transparent)]
    Tls(#[from] TlsError),
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebTransport base address of the world server
    pub server_url: String,
    /// HTTP base address used for bot uploads
    pub http_url: String,
    /// World to join; falls back to the stored session
    pub world_id: Option<String>,
    /// Bot to track; falls back to the stored session
    pub bot_id: Option<BotId>,
    /// Directory holding the session and ownership records
    pub state_dir: PathBuf,
    /// Base64 SHA-256 hash of a self-signed server certificate
    pub cert_hash: Option<String>,
    /// DER certificate to pin instead of a hash
    pub cert_der_path: Option<PathBuf>,
    /// Delay between reconnection attempts
    pub reconnect_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "https://localhost:1313".to_string(),
            http_url: "http://localhost:1313".to_string(),
            world_id: None,
            bot_id: None,
            state_dir: PathBuf::from(".botworld"),
            cert_hash: None,
            cert_der_path: None,
            reconnect_delay: Duration::from_millis(250),
        }
    }
}

impl ClientConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("SERVER_URL") {
            if is_http_url(&url) {
                config.server_url = url;
            } else {
                tracing::warn!("Invalid SERVER_URL '{}', using default", url);
            }
        }

        if let Ok(url) = std::env::var("HTTP_URL") {
            if is_http_url(&url) {
                config.http_url = url;
            } else {
                tracing::warn!("Invalid HTTP_URL '{}', using default", url);
            }
        }

        if let Ok(world_id) = std::env::var("WORLD_ID") {
            if !world_id.trim().is_empty() {
                config.world_id = Some(world_id.trim().to_string());
            }
        }

        if let Ok(bot_id) = std::env::var("BOT_ID") {
            if !bot_id.trim().is_empty() {
                config.bot_id = Some(BotId::new(bot_id.trim()));
            }
        }

        if let Ok(dir) = std::env::var("STATE_DIR") {
            config.state_dir = PathBuf::from(dir);
        }

        if let Ok(hash) = std::env::var("CERT_HASH") {
            config.cert_hash = Some(hash);
        }

        if let Ok(path) = std::env::var("CERT_DER_PATH") {
            config.cert_der_path = Some(PathBuf::from(path));
        }

        if let Ok(delay) = std::env::var("RECONNECT_DELAY_MS") {
            if let Ok(parsed) = delay.parse::<u64>() {
                if parsed > 0 && parsed <= 60_000 {
                    config.reconnect_delay = Duration::from_millis(parsed);
                } else {
                    tracing::warn!("RECONNECT_DELAY_MS must be 1-60000, using default");
                }
            } else {
                tracing::warn!("Invalid RECONNECT_DELAY_MS '{}', using default", delay);
            }
        }

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_http_url(&self.server_url) {
            return Err(ConfigError::Invalid(format!("server_url '{}' is not an http(s) URL", self.server_url)));
        }
        if !is_http_url(&self.http_url) {
            return Err(ConfigError::Invalid(format!("http_url '{}' is not an http(s) URL", self.http_url)));
        }
        if self.reconnect_delay.is_zero() {
            return Err(ConfigError::Invalid("reconnect_delay cannot be 0".to_string()));
        }
        if self.cert_hash.is_some() && self.cert_der_path.is_some() {
            return Err(ConfigError::Invalid("set either CERT_HASH or CERT_DER_PATH, not both".to_string()));
        }
        Ok(())
    }

    /// Certificate verification to use for the server
    pub fn tls(&self) -> Result<TlsConfig, ConfigError> {
        if let Some(hash) = &self.cert_hash {
            return Ok(TlsConfig::from_cert_hash(hash)?);
        }

        if let Some(path) = &self.cert_der_path {
            return Ok(TlsConfig::from_der_file(path)?);
        }

        Ok(TlsConfig::native())
    }

    pub fn remote(&self, world_id: impl Into<String>) -> Result<RemoteConfig, ConfigError> {
        Ok(RemoteConfig {
            server_url: self.server_url.clone(),
            http_url: self.http_url.clone(),
            world_id: world_id.into(),
            tls: self.tls()?,
        })
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("https://") || url.starts_with("http://")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.reconnect_delay, Duration::from_millis(250));
        assert!(config.world_id.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_or_default() {
        let config = ClientConfig::load_or_default();
        assert!(!config.reconnect_delay.is_zero());
    }

    #[test]
    fn test_validate_rejects_bad_urls() {
        let config = ClientConfig {
            server_url: "localhost:1313".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_two_pins() {
        let config = ClientConfig {
            cert_hash: Some("AAAA".to_string()),
            cert_der_path: Some(PathBuf::from("cert.der")),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_remote_config() {
        let config = ClientConfig::default();
        let remote = config.remote("w1").unwrap();

        assert_eq!(remote.world_id, "w1");
        assert_eq!(remote.join_url(None).unwrap().as_str(), "https://localhost:1313/worlds/w1");
        assert_eq!(remote.tls, TlsConfig::native());
    }

    #[test]
    fn test_bad_cert_hash() {
        let config = ClientConfig {
            cert_hash: Some("not base64!".to_string()),
            ..Default::default()
        };
        assert!(matches!(config.tls(), Err(ConfigError::Tls(_))));
    }
}
