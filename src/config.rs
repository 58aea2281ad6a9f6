//! StreamGate configuration management

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main StreamGate configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamGateConfig {
    /// Gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Connection limit configuration
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Credential verification configuration
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Allowed WebSocket origins. Empty means any origin (same-origin
    /// deployments behind a reverse proxy typically leave this empty).
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    /// Maximum size of an inbound text frame in bytes. The streaming leg
    /// only carries ping/heartbeat traffic, so this stays small.
    pub max_inbound_frame_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 18890,
            allowed_origins: Vec::new(),
            max_inbound_frame_bytes: 512,
        }
    }
}

/// Connection limit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum concurrent connections per identity
    pub max_connections_per_user: usize,

    /// Hard connection lifetime in seconds, enforced independent of activity
    pub max_connection_age_secs: u64,

    /// Idle eviction threshold in seconds. Disabled when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,

    /// Interval between sweep passes in seconds
    pub sweep_interval_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections_per_user: 3,
            max_connection_age_secs: 2 * 60 * 60,
            idle_timeout_secs: None,
            sweep_interval_secs: 60,
        }
    }
}

impl LimitsConfig {
    /// Hard lifetime in milliseconds
    pub fn max_age_ms(&self) -> i64 {
        (self.max_connection_age_secs as i64).saturating_mul(1000)
    }

    /// Idle threshold in milliseconds, if configured
    pub fn idle_timeout_ms(&self) -> Option<i64> {
        self.idle_timeout_secs
            .map(|s| (s as i64).saturating_mul(1000))
    }

    /// Sweep cadence as a [`Duration`]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Credential verification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Signing key material for credential verification
    pub secret: SecretRef,

    /// JWT algorithm name (e.g. "HS256")
    pub algorithm: String,

    /// Clock skew tolerance in seconds when checking expiration
    pub leeway_secs: u64,

    /// Expected audience claim. Not checked when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: SecretRef {
                value: None,
                env: Some("STREAMGATE_JWT_SECRET".to_string()),
                file: None,
            },
            algorithm: "HS256".to_string(),
            leeway_secs: 60,
            audience: None,
        }
    }
}

/// Reference to secret material by inline value, environment variable,
/// or file path. Exactly one source should be set; they are consulted
/// in that order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretRef {
    /// Inline secret value (development only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// Environment variable holding the secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,

    /// File containing the secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl SecretRef {
    /// Create an inline secret reference
    pub fn inline(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            env: None,
            file: None,
        }
    }

    /// Resolve the referenced secret material
    pub fn resolve(&self) -> Result<String> {
        if let Some(value) = &self.value {
            return Ok(value.clone());
        }
        if let Some(var) = &self.env {
            return std::env::var(var).map_err(|_| {
                Error::Config(format!("secret environment variable {} is not set", var))
            });
        }
        if let Some(path) = &self.file {
            let content = std::fs::read_to_string(path).map_err(|e| {
                Error::Config(format!("failed to read secret file {}: {}", path.display(), e))
            })?;
            return Ok(content.trim().to_string());
        }
        Err(Error::Config("no secret source configured".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = StreamGateConfig::default();
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.gateway.port, 18890);
        assert_eq!(config.gateway.max_inbound_frame_bytes, 512);
        assert!(config.gateway.allowed_origins.is_empty());
        assert_eq!(config.limits.max_connections_per_user, 3);
        assert_eq!(config.limits.max_connection_age_secs, 7200);
        assert!(config.limits.idle_timeout_secs.is_none());
        assert_eq!(config.auth.algorithm, "HS256");
    }

    #[test]
    fn test_limit_conversions() {
        let limits = LimitsConfig::default();
        assert_eq!(limits.max_age_ms(), 7_200_000);
        assert_eq!(limits.idle_timeout_ms(), None);
        assert_eq!(limits.sweep_interval(), Duration::from_secs(60));

        let with_idle = LimitsConfig {
            idle_timeout_secs: Some(300),
            ..Default::default()
        };
        assert_eq!(with_idle.idle_timeout_ms(), Some(300_000));
    }

    #[test]
    fn test_toml_round_trip() {
        let config = StreamGateConfig {
            gateway: GatewayConfig {
                port: 9000,
                allowed_origins: vec!["http://localhost:5173".to_string()],
                ..Default::default()
            },
            limits: LimitsConfig {
                max_connections_per_user: 5,
                idle_timeout_secs: Some(120),
                ..Default::default()
            },
            auth: AuthConfig {
                secret: SecretRef::inline("dev-secret"),
                ..Default::default()
            },
        };

        let toml = toml::to_string_pretty(&config).unwrap();
        let parsed: StreamGateConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.gateway.port, 9000);
        assert_eq!(parsed.gateway.allowed_origins.len(), 1);
        assert_eq!(parsed.limits.max_connections_per_user, 5);
        assert_eq!(parsed.limits.idle_timeout_secs, Some(120));
        assert_eq!(parsed.auth.secret.value.as_deref(), Some("dev-secret"));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: StreamGateConfig = toml::from_str("[gateway]\nhost = \"0.0.0.0\"\nport = 8080\nmax_inbound_frame_bytes = 1024\n").unwrap();
        assert_eq!(parsed.gateway.host, "0.0.0.0");
        assert_eq!(parsed.limits.max_connections_per_user, 3);
        assert_eq!(parsed.auth.algorithm, "HS256");
    }

    #[test]
    fn test_secret_ref_inline() {
        let secret = SecretRef::inline("abc");
        assert_eq!(secret.resolve().unwrap(), "abc");
    }

    #[test]
    fn test_secret_ref_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "file-secret").unwrap();

        let secret = SecretRef {
            value: None,
            env: None,
            file: Some(file.path().to_path_buf()),
        };
        assert_eq!(secret.resolve().unwrap(), "file-secret");
    }

    #[test]
    fn test_secret_ref_missing_env() {
        let secret = SecretRef {
            value: None,
            env: Some("STREAMGATE_TEST_UNSET_VAR".to_string()),
            file: None,
        };
        assert!(secret.resolve().is_err());
    }

    #[test]
    fn test_secret_ref_empty() {
        let secret = SecretRef::default();
        assert!(secret.resolve().is_err());
    }
}
