use crate::core::balance::{backend_key, MeterOptions, RebalanceOptions};
use crate::core::forward::ForwardOptions;
use http::Uri;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listener: ListenerConfig,
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub sticky: Option<StickyConfig>,
    #[serde(default)]
    pub rebalance: RebalanceConfig,
    #[serde(default)]
    pub forward: ForwardConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenerConfig {
    pub bind: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StickyConfig {
    /// Name of the session cookie pinning a client to a backend.
    #[serde(default = "default_cookie_name")]
    pub cookie: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RebalanceConfig {
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
    #[serde(default = "default_grow_factor")]
    pub grow_factor: u32,
    #[serde(default = "default_max_weight")]
    pub max_weight: u32,
    #[serde(default = "default_split_threshold")]
    pub split_threshold: f64,
    #[serde(default = "default_meter_buckets")]
    pub meter_buckets: usize,
    #[serde(default = "default_meter_resolution_ms")]
    pub meter_resolution_ms: u64,
    #[serde(default = "default_meter_min_samples")]
    pub meter_min_samples: u64,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            backoff_secs: default_backoff_secs(),
            grow_factor: default_grow_factor(),
            max_weight: default_max_weight(),
            split_threshold: default_split_threshold(),
            meter_buckets: default_meter_buckets(),
            meter_resolution_ms: default_meter_resolution_ms(),
            meter_min_samples: default_meter_min_samples(),
        }
    }
}

impl RebalanceConfig {
    pub fn options(&self) -> RebalanceOptions {
        RebalanceOptions {
            backoff: Duration::from_secs(self.backoff_secs),
            grow_factor: self.grow_factor,
            max_weight: self.max_weight,
            split_threshold: self.split_threshold,
            meter: MeterOptions {
                buckets: self.meter_buckets,
                resolution: Duration::from_millis(self.meter_resolution_ms),
                min_samples: self.meter_min_samples,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ForwardConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Budget for response headers; absent means no limit.
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: Option<u64>,
    #[serde(default)]
    pub trust_forwarded: bool,
    #[serde(default = "default_server_name")]
    pub server_name: String,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            response_timeout_ms: default_response_timeout_ms(),
            trust_forwarded: false,
            server_name: default_server_name(),
        }
    }
}

impl ForwardConfig {
    pub fn options(&self) -> ForwardOptions {
        ForwardOptions {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            response_timeout: self.response_timeout_ms.map(Duration::from_millis),
            trust_forwarded: self.trust_forwarded,
            server_name: self.server_name.clone(),
        }
    }
}

// Default values for the configuration
fn default_weight() -> u32 {
    1
}
fn default_cookie_name() -> String {
    "ferryman_backend".to_string()
}
fn default_backoff_secs() -> u64 {
    10
}
fn default_grow_factor() -> u32 {
    4
}
fn default_max_weight() -> u32 {
    4096
}
fn default_split_threshold() -> f64 {
    1.5
}
fn default_meter_buckets() -> usize {
    10
}
fn default_meter_resolution_ms() -> u64 {
    1000
}
fn default_meter_min_samples() -> u64 {
    10
}
fn default_connect_timeout_ms() -> u64 {
    1000
}
fn default_response_timeout_ms() -> Option<u64> {
    Some(30_000)
}
fn default_server_name() -> String {
    "ferryman".to_string()
}

impl Config {
    /// Load configuration from a YAML file
    pub async fn from_yaml_file(path: &str) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Self::from_yaml_str(&content)
    }

    /// Parse configuration from a YAML string (useful for testing)
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration for common errors
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backends.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one backend is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for backend in &self.backends {
            let url: Uri = backend.url.parse().map_err(|_| {
                ConfigError::ValidationError(format!("backend url '{}' is not valid", backend.url))
            })?;
            let key = backend_key(&url).map_err(|_| {
                ConfigError::ValidationError(format!(
                    "backend url '{}' must be absolute",
                    backend.url
                ))
            })?;
            match url.scheme_str() {
                Some("http") => {}
                other => {
                    return Err(ConfigError::ValidationError(format!(
                        "backend url '{}' has unsupported scheme '{}'; TLS termination is \
                         handled in front of the balancer",
                        backend.url,
                        other.unwrap_or("")
                    )))
                }
            }
            if !seen.insert(key.clone()) {
                return Err(ConfigError::ValidationError(format!(
                    "backend '{}' is declared twice",
                    key
                )));
            }
        }

        if self.rebalance.grow_factor < 2 {
            return Err(ConfigError::ValidationError(
                "rebalance.grow_factor must be at least 2".to_string(),
            ));
        }
        if self.rebalance.max_weight == 0 {
            return Err(ConfigError::ValidationError(
                "rebalance.max_weight must be positive".to_string(),
            ));
        }
        if self.rebalance.split_threshold <= 0.0 {
            return Err(ConfigError::ValidationError(
                "rebalance.split_threshold must be positive".to_string(),
            ));
        }
        if self.rebalance.meter_buckets == 0 || self.rebalance.meter_resolution_ms == 0 {
            return Err(ConfigError::ValidationError(
                "rebalance meter window must be non-empty".to_string(),
            ));
        }

        if let Some(sticky) = &self.sticky {
            if sticky.cookie.is_empty() {
                return Err(ConfigError::ValidationError(
                    "sticky.cookie must not be empty".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let yaml = r#"
listener:
  bind: "127.0.0.1:8080"

backends:
  - url: "http://127.0.0.1:9001"
  - url: "http://127.0.0.1:9002"
"#;

        let config = Config::from_yaml_str(yaml).expect("Failed to parse config");

        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends[0].weight, 1);
        assert!(config.sticky.is_none());
        assert_eq!(config.rebalance.grow_factor, 4);
        assert_eq!(config.rebalance.max_weight, 4096);
        assert_eq!(config.rebalance.split_threshold, 1.5);
        assert_eq!(config.forward.connect_timeout_ms, 1000);
        assert!(!config.forward.trust_forwarded);
    }

    #[test]
    fn test_full_config_round_trips_into_options() {
        let yaml = r#"
listener:
  bind: "0.0.0.0:80"

backends:
  - url: "http://10.0.0.1:9000"
    weight: 3
  - url: "http://10.0.0.2:9000"
    weight: 2

sticky:
  cookie: "lane"

rebalance:
  backoff_secs: 5
  meter_resolution_ms: 500

forward:
  trust_forwarded: true
  server_name: "edge-1"
"#;

        let config = Config::from_yaml_str(yaml).expect("Failed to parse config");
        assert_eq!(config.backends[0].weight, 3);
        assert_eq!(config.sticky.as_ref().unwrap().cookie, "lane");

        let rebalance = config.rebalance.options();
        assert_eq!(rebalance.backoff, Duration::from_secs(5));
        assert_eq!(rebalance.meter.resolution, Duration::from_millis(500));

        let forward = config.forward.options();
        assert!(forward.trust_forwarded);
        assert_eq!(forward.server_name, "edge-1");
        assert_eq!(forward.response_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_validation_requires_backends() {
        let yaml = r#"
listener:
  bind: "127.0.0.1:8080"
backends: []
"#;
        let result = Config::from_yaml_str(yaml);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_validation_rejects_duplicate_backends() {
        let yaml = r#"
listener:
  bind: "127.0.0.1:8080"
backends:
  - url: "http://a:9000/"
  - url: "http://a:9000/?replica=2"
"#;
        let result = Config::from_yaml_str(yaml);
        if let Err(ConfigError::ValidationError(msg)) = result {
            assert!(msg.contains("declared twice"));
        } else {
            panic!("Expected validation error for duplicate backend");
        }
    }

    #[test]
    fn test_validation_rejects_https_backends() {
        let yaml = r#"
listener:
  bind: "127.0.0.1:8080"
backends:
  - url: "https://a:9000/"
"#;
        let result = Config::from_yaml_str(yaml);
        if let Err(ConfigError::ValidationError(msg)) = result {
            assert!(msg.contains("unsupported scheme"));
        } else {
            panic!("Expected validation error for https backend");
        }
    }

    #[test]
    fn test_validation_rejects_relative_backend_url() {
        let yaml = r#"
listener:
  bind: "127.0.0.1:8080"
backends:
  - url: "not-absolute"
"#;
        let result = Config::from_yaml_str(yaml);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }
}
