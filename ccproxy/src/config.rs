//! Configuration loading, validation, and environment overrides.
//!
//! Configuration is plain JSON (not TOML): `{host, port, log, apikey,
//! providers, routes, performance}`. Environment variables override with
//! `CCPROXY_{FIELD}`, the indexed `CCPROXY_PROVIDERS_{N}_{FIELD}` form, and
//! `{PROVIDER_NAME}_API_KEY` for per-provider key injection — the last of
//! those follows the teacher's own `apply_env_overrides` idiom verbatim.

use ccproxy_core::provider::Provider;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("config error: {field} - {reason}")]
    Invalid { field: String, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log")]
    pub log: String,
    #[serde(default)]
    pub apikey: String,
    #[serde(default)]
    pub providers: Vec<Provider>,
    #[serde(default)]
    pub routes: HashMap<String, RouteConfig>,
    #[serde(default)]
    pub performance: PerformanceConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3456
}

fn default_log() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log: default_log(),
            apikey: String::new(),
            providers: Vec::new(),
            routes: HashMap::new(),
            performance: PerformanceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    #[serde(with = "ccproxy_core::common::duration_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
    #[serde(default = "default_max_body_size")]
    pub max_request_body_size: usize,
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
    #[serde(default = "default_true")]
    pub rate_limit_enabled: bool,
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
    #[serde(default = "default_true")]
    pub circuit_breaker_enabled: bool,
    #[serde(with = "ccproxy_core::common::duration_serde", default = "default_health_check_interval")]
    pub health_check_interval: Duration,
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_body_size() -> usize {
    10 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

fn default_rate_limit_per_minute() -> u32 {
    6000
}

fn default_rate_limit_burst() -> u32 {
    100
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(30)
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            max_request_body_size: default_max_body_size(),
            metrics_enabled: true,
            rate_limit_enabled: true,
            rate_limit_per_minute: default_rate_limit_per_minute(),
            rate_limit_burst: default_rate_limit_burst(),
            circuit_breaker_enabled: true,
            health_check_interval: default_health_check_interval(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let mut config: Config =
            serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_string(),
                source,
            })?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `CCPROXY_*`, `CCPROXY_PROVIDERS_{N}_*`, and
    /// `{PROVIDER_NAME}_API_KEY` environment overrides in place.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = env::var("CCPROXY_HOST") {
            self.host = host;
        }
        if let Ok(port) = env::var("CCPROXY_PORT") {
            if let Ok(port) = port.parse() {
                self.port = port;
            }
        }
        if let Ok(log) = env::var("CCPROXY_LOG") {
            self.log = log;
        }
        if let Ok(apikey) = env::var("CCPROXY_APIKEY") {
            self.apikey = apikey;
        }

        for (index, provider) in self.providers.iter_mut().enumerate() {
            let prefix = format!("CCPROXY_PROVIDERS_{index}_");
            if let Ok(v) = env::var(format!("{prefix}API_BASE_URL")) {
                provider.api_base_url = v;
            }
            if let Ok(v) = env::var(format!("{prefix}API_KEY")) {
                provider.api_key = v;
            }
            if let Ok(v) = env::var(format!("{prefix}ENABLED")) {
                if let Ok(v) = v.parse() {
                    provider.enabled = v;
                }
            }

            let env_key = format!("{}_API_KEY", provider.name.to_uppercase().replace('-', "_"));
            if let Ok(v) = env::var(env_key) {
                provider.api_key = v;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.name.clone()) {
                return Err(ConfigError::Invalid {
                    field: "providers".to_string(),
                    reason: format!("duplicate provider name {}", provider.name),
                });
            }
        }

        for (route_name, route) in &self.routes {
            if !seen.contains(&route.provider) {
                return Err(ConfigError::Invalid {
                    field: format!("routes.{route_name}.provider"),
                    reason: format!("route references unknown provider {}", route.provider),
                });
            }
        }

        if self.port == 0 {
            return Err(ConfigError::Invalid {
                field: "port".to_string(),
                reason: "port must be nonzero".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 3456);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_route_to_unknown_provider() {
        let mut config = Config::default();
        config.routes.insert(
            "default".to_string(),
            RouteConfig {
                provider: "missing".to_string(),
                model: "m".to_string(),
                parameters: HashMap::new(),
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_provider_names() {
        let mut config = Config::default();
        let provider = Provider {
            name: "a".to_string(),
            api_base_url: "https://example.invalid".to_string(),
            api_key: "k".to_string(),
            enabled: true,
            models: vec!["m".to_string()],
            timeout: Duration::from_secs(30),
            max_tokens_limit: None,
        };
        config.providers.push(provider.clone());
        config.providers.push(provider);
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_override_sets_provider_api_key() {
        let mut config = Config::default();
        config.providers.push(Provider {
            name: "openai".to_string(),
            api_base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            enabled: true,
            models: vec!["gpt-4".to_string()],
            timeout: Duration::from_secs(30),
            max_tokens_limit: None,
        });
        env::set_var("OPENAI_API_KEY", "sk-test");
        config.apply_env_overrides();
        env::remove_var("OPENAI_API_KEY");
        assert_eq!(config.providers[0].api_key, "sk-test");
    }
}
