use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccountSource {
    Oauth,
    Manual,
    LegacyDb,
}

// Per-(account, model) rate-limit record. The record is "active" only while
// `is_rate_limited` holds and `reset_time` lies in the future; expired records
// are cleared lazily on inspection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRateLimit {
    #[serde(default)]
    pub is_rate_limited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_time: Option<i64>,
}

impl ModelRateLimit {
    pub fn until(reset_time_ms: i64) -> Self {
        Self {
            is_rate_limited: true,
            reset_time: Some(reset_time_ms),
        }
    }

    pub fn is_active(&self, now_ms: i64) -> bool {
        self.is_rate_limited && self.reset_time.is_some_and(|t| t > now_ms)
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.is_rate_limited && self.reset_time.is_none_or(|t| t <= now_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub email: String,
    pub source: AccountSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub is_invalid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_at: Option<i64>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub model_rate_limits: HashMap<String, ModelRateLimit>,
    #[serde(default)]
    pub last_used: i64,
}

fn default_true() -> bool {
    true
}

impl Account {
    pub fn oauth(email: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            source: AccountSource::Oauth,
            refresh_token: Some(refresh_token.into()),
            api_key: None,
            db_path: None,
            project_id: None,
            enabled: true,
            is_invalid: false,
            invalid_reason: None,
            invalid_at: None,
            model_rate_limits: HashMap::new(),
            last_used: 0,
        }
    }

    pub fn manual(email: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            ..Self::oauth(email, "")
        }
        .with_source(AccountSource::Manual)
    }

    fn with_source(mut self, source: AccountSource) -> Self {
        self.source = source;
        if source != AccountSource::Oauth {
            self.refresh_token = None;
        }
        self
    }

    // Remaining wait in ms for an active limit on `model`, if any.
    pub fn active_limit_wait_ms(&self, model: &str, now_ms: i64) -> Option<i64> {
        self.model_rate_limits
            .get(model)
            .filter(|r| r.is_active(now_ms))
            .and_then(|r| r.reset_time)
            .map(|t| t - now_ms)
    }
}
