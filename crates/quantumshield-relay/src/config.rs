//! Relay configuration: TOML file with environment overrides.
//!
//! The process refuses to start on fatal misconfiguration (missing or
//! too-short signing secret, zero port) rather than limping along.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub limits: LimitsConfig,
    pub origins: OriginsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    /// HMAC secret for bearer tokens. Fatal if missing or shorter than 32 bytes.
    pub jwt_secret: String,
    pub handshake_timeout_secs: u64,
    /// Development builds may surface full 5xx detail.
    pub detailed_errors: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    /// Hard cap on the decoded message ciphertext, bytes.
    pub max_message_ciphertext_bytes: usize,
    /// Hard cap on the decoded file_data field, bytes. Sized for
    /// base64(10 MiB) since file plaintexts are base64 of the raw bytes.
    pub max_file_data_bytes: usize,
    pub events_per_minute: u32,
    pub friend_requests_per_hour: u32,
    pub http_requests_per_minute: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OriginsConfig {
    /// Browser origins allowed to connect. Requests that carry an Origin
    /// header outside this list are refused with a non-generic error;
    /// requests without an Origin (non-browser clients) are admitted only
    /// with a valid token.
    pub allowed: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                workers: 4,
            },
            auth: AuthConfig {
                jwt_secret: String::new(),
                handshake_timeout_secs: 10,
                detailed_errors: false,
            },
            limits: LimitsConfig {
                max_message_ciphertext_bytes: 10 * 1024 * 1024,
                // base64 of exactly 10 MiB, including padding
                max_file_data_bytes: 13_981_016,
                events_per_minute: 120,
                friend_requests_per_hour: 10,
                http_requests_per_minute: 20,
            },
            origins: OriginsConfig {
                allowed: vec!["http://localhost:3000".to_string()],
            },
        }
    }
}

impl RelayConfig {
    /// Load from the path in `QUANTUMSHIELD_CONFIG` (default
    /// `config/relay.toml`), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let config_path =
            env::var("QUANTUMSHIELD_CONFIG").unwrap_or_else(|_| "config/relay.toml".to_string());
        let mut config = if let Ok(content) = fs::read_to_string(&config_path) {
            toml::from_str(&content)?
        } else {
            Self::default()
        };

        if let Ok(host) = env::var("QUANTUMSHIELD_HOST") {
            config.server.host = host;
        }
        if let Ok(port) = env::var("QUANTUMSHIELD_PORT") {
            config.server.port = port.parse()?;
        }
        if let Ok(workers) = env::var("QUANTUMSHIELD_WORKERS") {
            config.server.workers = workers.parse()?;
        }
        if let Ok(secret) = env::var("QUANTUMSHIELD_JWT_SECRET") {
            config.auth.jwt_secret = secret;
        }

        Ok(config)
    }

    /// Fatal-configuration check. The process must not start if this fails.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("server port cannot be 0"));
        }
        if self.server.workers == 0 {
            return Err(anyhow::anyhow!("server workers cannot be 0"));
        }
        if self.auth.jwt_secret.len() < 32 {
            return Err(anyhow::anyhow!(
                "auth.jwt_secret must be at least 32 bytes (set QUANTUMSHIELD_JWT_SECRET)"
            ));
        }
        if self.limits.max_message_ciphertext_bytes == 0 || self.limits.max_file_data_bytes == 0 {
            return Err(anyhow::anyhow!("payload limits cannot be 0"));
        }
        Ok(())
    }

    #[must_use]
    pub fn test_config() -> Self {
        let mut config = Self::default();
        config.auth.jwt_secret = "test-secret-key-32-bytes-minimum!!".to_string();
        config.auth.detailed_errors = true;
        config
    }
}
