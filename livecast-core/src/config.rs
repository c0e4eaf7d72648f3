use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub media: MediaConfig,
    pub signaling: SignalingConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// PEM certificate chain; TLS is enabled only when both paths are set
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    /// Largest accepted WebSocket frame in bytes
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            tls_cert_path: None,
            tls_key_path: None,
            max_message_size: 64 * 1024,
        }
    }
}

/// Media engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Number of media workers (0 = min(logical CPUs, 4))
    pub num_workers: usize,
    /// IP the engine binds RTC sockets to
    pub listen_ip: String,
    /// Public IP advertised in ICE candidates when behind NAT
    pub announced_ip: Option<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    /// Delay before exiting after a worker died
    pub worker_death_grace_ms: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            num_workers: 0,
            listen_ip: "0.0.0.0".to_string(),
            announced_ip: None,
            rtc_min_port: 40000,
            rtc_max_port: 49999,
            worker_death_grace_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Outbound frames buffered per peer before sends start failing
    pub peer_queue_capacity: usize,
    /// Maximum peers per room (0 = unlimited)
    pub max_peers_per_room: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            peer_queue_capacity: 256,
            max_peers_per_room: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Deployment variables (`PORT`, `TLS_CERT_PATH`, `TLS_KEY_PATH`,
    ///    `MEDIA_LISTEN_IP`, `MEDIA_ANNOUNCED_IP`)
    /// 2. `LIVECAST_*` environment variables
    /// 3. Config file (if provided)
    /// 4. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // LIVECAST_SERVER__PORT, LIVECAST_MEDIA__LISTEN_IP, ...
        builder = builder.add_source(
            Environment::with_prefix("LIVECAST")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder = builder
            .set_override_option("server.port", std::env::var("PORT").ok())?
            .set_override_option("server.tls_cert_path", std::env::var("TLS_CERT_PATH").ok())?
            .set_override_option("server.tls_key_path", std::env::var("TLS_KEY_PATH").ok())?
            .set_override_option("media.listen_ip", std::env::var("MEDIA_LISTEN_IP").ok())?
            .set_override_option(
                "media.announced_ip",
                std::env::var("MEDIA_ANNOUNCED_IP").ok(),
            )?;

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Collect every configuration problem instead of stopping at the first
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be non-zero".to_string());
        }
        if self.server.tls_cert_path.is_some() != self.server.tls_key_path.is_some() {
            errors.push("server.tls_cert_path and server.tls_key_path must be set together".to_string());
        }
        if self.server.max_message_size == 0 {
            errors.push("server.max_message_size must be non-zero".to_string());
        }
        if self.media.rtc_min_port > self.media.rtc_max_port {
            errors.push(format!(
                "media.rtc_min_port ({}) is greater than media.rtc_max_port ({})",
                self.media.rtc_min_port, self.media.rtc_max_port
            ));
        }
        if self.signaling.peer_queue_capacity == 0 {
            errors.push("signaling.peer_queue_capacity must be non-zero".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got \"{}\"",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Get HTTP/WebSocket listen address
    #[must_use]
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// TLS certificate and key paths, when TLS is enabled
    #[must_use]
    pub fn tls_paths(&self) -> Option<(&str, &str)> {
        match (&self.server.tls_cert_path, &self.server.tls_key_path) {
            (Some(cert), Some(key)) => Some((cert.as_str(), key.as_str())),
            _ => None,
        }
    }

    /// Number of media workers to spawn
    #[must_use]
    pub fn worker_count(&self) -> usize {
        if self.media.num_workers > 0 {
            return self.media.num_workers;
        }
        std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1)
            .min(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen_address(), "0.0.0.0:3001");
        assert!(config.tls_paths().is_none());
    }

    #[test]
    fn test_worker_count_is_capped() {
        let config = Config::default();
        let count = config.worker_count();
        assert!((1..=4).contains(&count));

        let config = Config {
            media: MediaConfig {
                num_workers: 7,
                ..MediaConfig::default()
            },
            ..Config::default()
        };
        assert_eq!(config.worker_count(), 7);
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let config = Config {
            server: ServerConfig {
                port: 0,
                tls_cert_path: Some("cert.pem".to_string()),
                ..ServerConfig::default()
            },
            media: MediaConfig {
                rtc_min_port: 50000,
                rtc_max_port: 40000,
                ..MediaConfig::default()
            },
            logging: LoggingConfig {
                format: "xml".to_string(),
                ..LoggingConfig::default()
            },
            ..Config::default()
        };

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4, "{errors:?}");
    }

    #[test]
    fn test_tls_paths_require_both() {
        let config = Config {
            server: ServerConfig {
                tls_cert_path: Some("cert.pem".to_string()),
                tls_key_path: Some("key.pem".to_string()),
                ..ServerConfig::default()
            },
            ..Config::default()
        };
        assert_eq!(config.tls_paths(), Some(("cert.pem", "key.pem")));
    }
}
