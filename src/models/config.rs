use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub proxy: ProxyConfig,
    pub dispatch: DispatchConfig,
    // Primary model -> substitute tried once when every account is exhausted.
    pub model_fallbacks: HashMap<String, String>,
    pub fallback_enabled: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            proxy: ProxyConfig::default(),
            dispatch: DispatchConfig::default(),
            model_fallbacks: HashMap::new(),
            fallback_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyConfig {
    pub port: u16,
    pub api_key: Option<String>,
    pub allow_lan_access: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 8045,
            api_key: None,
            allow_lan_access: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatchConfig {
    pub token_cache_ttl_ms: i64,
    pub default_cooldown_ms: u64,
    pub max_retries: usize,
    pub max_accounts: usize,
    pub max_wait_before_error_ms: u64,
    pub account_config_path: Option<PathBuf>,
    pub default_project_id: String,
    pub endpoints: Vec<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            token_cache_ttl_ms: 5 * 60 * 1000,
            default_cooldown_ms: 30_000,
            max_retries: 5,
            max_accounts: 25,
            max_wait_before_error_ms: 120_000,
            account_config_path: None,
            default_project_id: "bamboo-precept-lgxtn".to_string(),
            endpoints: crate::proxy::google::endpoints::default_endpoints(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_knobs() {
        let config = DispatchConfig::default();
        assert_eq!(config.token_cache_ttl_ms, 300_000);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.max_wait_before_error_ms, 120_000);
        assert_eq!(config.endpoints.len(), 2);
    }

    #[test]
    fn partial_config_fills_missing_fields() {
        let config: AppConfig =
            serde_json::from_str(r#"{"dispatch":{"maxRetries":3}}"#).unwrap();
        assert_eq!(config.dispatch.max_retries, 3);
        assert_eq!(config.dispatch.default_cooldown_ms, 30_000);
        assert!(!config.fallback_enabled);
    }
}
