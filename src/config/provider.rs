//! Gateway Configuration
//!
//! Defines the configuration schema for providers, models and the router.

use crate::router::balancer::BalancerKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Provider configurations keyed by provider name
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Logical models keyed by the name callers request
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,

    /// Router tuning
    #[serde(default)]
    pub router: RouterConfig,
}

/// Configuration for a single upstream provider, tagged by wire style
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProviderConfig {
    /// OpenAI-compatible chat completions API
    #[serde(rename = "openai")]
    OpenAI(EndpointConfig),

    /// Anthropic messages API
    #[serde(rename = "anthropic")]
    Anthropic(EndpointConfig),
}

/// Wire style of a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStyle {
    OpenAI,
    Anthropic,
}

/// Connection settings shared by all provider styles
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Base URL for the API
    pub base_url: String,

    /// Optional environment variable for custom base URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_base_env: Option<String>,

    /// Environment variable name for the API key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Optional list of environment variables for multiple keys
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_keys_env: Option<Vec<String>>,

    /// Inline keys
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<KeyConfig>,

    /// Additional headers to send with requests, applied in key order
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

/// One configured credential
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyConfig {
    pub key: String,

    #[serde(default)]
    pub remark: String,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl std::fmt::Debug for KeyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyConfig")
            .field("key", &"<redacted>")
            .field("remark", &self.remark)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// A logical model and the providers that can serve it
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Candidate selection strategy
    #[serde(default)]
    pub strategy: BalancerKind,

    #[serde(default)]
    pub providers: Vec<ModelProviderConfig>,
}

/// One model-provider association
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelProviderConfig {
    /// Provider name (key into `providers`)
    pub provider: String,

    /// Model name sent upstream
    pub model: String,

    #[serde(default = "default_weight")]
    pub weight: u32,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Headers added on top of the provider's own
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

/// Router and transport tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Upper bound on attempts per request (unbounded when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    /// Bytes of an upstream error body kept for diagnostics
    #[serde(default = "default_error_body_limit")]
    pub error_body_limit: usize,

    /// Whole-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            error_body_limit: default_error_body_limit(),
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_weight() -> u32 {
    1
}

fn default_error_body_limit() -> usize {
    4096
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl ProviderConfig {
    pub fn openai(base_url: impl Into<String>) -> Self {
        ProviderConfig::OpenAI(EndpointConfig {
            base_url: base_url.into(),
            ..Default::default()
        })
    }

    pub fn anthropic(base_url: impl Into<String>) -> Self {
        ProviderConfig::Anthropic(EndpointConfig {
            base_url: base_url.into(),
            ..Default::default()
        })
    }

    pub fn style(&self) -> ProviderStyle {
        match self {
            ProviderConfig::OpenAI(_) => ProviderStyle::OpenAI,
            ProviderConfig::Anthropic(_) => ProviderStyle::Anthropic,
        }
    }

    pub fn endpoint(&self) -> &EndpointConfig {
        match self {
            ProviderConfig::OpenAI(endpoint) | ProviderConfig::Anthropic(endpoint) => endpoint,
        }
    }

    pub fn endpoint_mut(&mut self) -> &mut EndpointConfig {
        match self {
            ProviderConfig::OpenAI(endpoint) | ProviderConfig::Anthropic(endpoint) => endpoint,
        }
    }

    /// Get the effective base URL (from env var if configured, otherwise default)
    pub fn base_url(&self) -> String {
        let endpoint = self.endpoint();
        if let Some(env_var) = &endpoint.api_base_env {
            if let Ok(url) = std::env::var(env_var) {
                return url;
            }
        }
        endpoint.base_url.clone()
    }

    /// Path of the generation endpoint below the base URL
    pub fn request_path(&self) -> &'static str {
        match self.style() {
            ProviderStyle::OpenAI => "/chat/completions",
            ProviderStyle::Anthropic => "/messages",
        }
    }

    /// All configured keys: env-var keys first, then inline keys, deduplicated
    pub fn resolved_keys(&self) -> Vec<KeyConfig> {
        let endpoint = self.endpoint();
        let mut keys: Vec<KeyConfig> = Vec::new();

        let env_vars = endpoint
            .api_key_env
            .iter()
            .chain(endpoint.api_keys_env.iter().flatten());
        for env_var in env_vars {
            if let Ok(key) = std::env::var(env_var) {
                if !keys.iter().any(|k| k.key == key) {
                    keys.push(KeyConfig {
                        key,
                        remark: env_var.clone(),
                        enabled: true,
                    });
                }
            }
        }

        for configured in &endpoint.keys {
            if !keys.iter().any(|k| k.key == configured.key) {
                keys.push(configured.clone());
            }
        }

        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_config() {
        let json = r#"{
            "providers": {
                "openai": {
                    "type": "openai",
                    "base_url": "https://api.openai.com/v1",
                    "keys": [
                        {"key": "sk-one", "remark": "primary"},
                        {"key": "sk-two", "enabled": false}
                    ],
                    "headers": {"x-team": "core"}
                },
                "claude": {
                    "type": "anthropic",
                    "base_url": "https://api.anthropic.com/v1"
                }
            },
            "models": {
                "chat": {
                    "strategy": "smooth_weighted_rr",
                    "providers": [
                        {"provider": "openai", "model": "gpt-4o", "weight": 5},
                        {"provider": "claude", "model": "claude-sonnet-4"}
                    ]
                }
            }
        }"#;

        let config: GatewayConfig = serde_json::from_str(json).unwrap();
        let openai = &config.providers["openai"];
        assert_eq!(openai.style(), ProviderStyle::OpenAI);
        assert_eq!(openai.endpoint().keys.len(), 2);
        assert!(openai.endpoint().keys[0].enabled);
        assert!(!openai.endpoint().keys[1].enabled);
        assert_eq!(config.providers["claude"].style(), ProviderStyle::Anthropic);
        assert_eq!(config.providers["claude"].request_path(), "/messages");

        let chat = &config.models["chat"];
        assert_eq!(chat.strategy, BalancerKind::SmoothWeightedRR);
        assert_eq!(chat.providers[0].weight, 5);
        assert_eq!(chat.providers[1].weight, 1);
        assert!(chat.providers[1].enabled);

        assert_eq!(config.router.error_body_limit, 4096);
        assert!(config.router.max_attempts.is_none());
    }

    #[test]
    fn test_resolved_keys_merge_env_and_inline() {
        std::env::set_var("LLMSWITCH_TEST_RESOLVE_KEY", "sk-env");
        let mut config = ProviderConfig::openai("https://api.example.com");
        {
            let endpoint = config.endpoint_mut();
            endpoint.api_key_env = Some("LLMSWITCH_TEST_RESOLVE_KEY".to_string());
            endpoint.api_keys_env = Some(vec!["LLMSWITCH_TEST_RESOLVE_MISSING".to_string()]);
            endpoint.keys = vec![
                KeyConfig {
                    key: "sk-env".to_string(),
                    remark: "duplicate".to_string(),
                    enabled: true,
                },
                KeyConfig {
                    key: "sk-inline".to_string(),
                    remark: String::new(),
                    enabled: true,
                },
            ];
        }

        let keys = config.resolved_keys();
        let secrets: Vec<_> = keys.iter().map(|k| k.key.as_str()).collect();
        assert_eq!(secrets, vec!["sk-env", "sk-inline"]);
        assert_eq!(keys[0].remark, "LLMSWITCH_TEST_RESOLVE_KEY");
    }

    #[test]
    fn test_key_config_debug_redacts() {
        let key = KeyConfig {
            key: "sk-secret".to_string(),
            remark: String::new(),
            enabled: true,
        };
        assert!(!format!("{:?}", key).contains("sk-secret"));
    }
}
