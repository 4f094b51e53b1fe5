use serde::{Deserialize, Serialize};
use thiserror::Error;

const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

// Transport-level failures must stay distinguishable from provider rejections:
// a network error is transient and never invalidates an account, while a
// rejected refresh (revoked/expired grant) is sticky until re-auth.
#[derive(Error, Debug)]
pub enum OAuthError {
    #[error("token refresh network error: {0}")]
    Network(String),

    #[error("token refresh rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: i64,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

fn env_first(keys: &[&str]) -> Option<String> {
    for k in keys {
        if let Ok(v) = std::env::var(k) {
            let t = v.trim();
            if !t.is_empty() {
                return Some(t.to_string());
            }
        }
    }
    None
}

fn client_id() -> Result<String, OAuthError> {
    env_first(&["GANTRY_GOOGLE_OAUTH_CLIENT_ID", "GOOGLE_OAUTH_CLIENT_ID"]).ok_or_else(|| {
        OAuthError::Rejected(
            "Missing Google OAuth client_id. Set GANTRY_GOOGLE_OAUTH_CLIENT_ID.".to_string(),
        )
    })
}

fn client_secret_optional() -> Option<String> {
    env_first(&[
        "GANTRY_GOOGLE_OAUTH_CLIENT_SECRET",
        "GOOGLE_OAUTH_CLIENT_SECRET",
    ])
}

pub async fn refresh_access_token(refresh_token: &str) -> Result<TokenResponse, OAuthError> {
    refresh_access_token_at(TOKEN_URL, refresh_token).await
}

pub async fn refresh_access_token_at(
    token_url: &str,
    refresh_token: &str,
) -> Result<TokenResponse, OAuthError> {
    let cid = client_id()?;
    let mut params: Vec<(&str, String)> = vec![
        ("client_id", cid),
        ("refresh_token", refresh_token.to_string()),
        ("grant_type", "refresh_token".to_string()),
    ];
    if let Some(secret) = client_secret_optional() {
        params.push(("client_secret", secret));
    }

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .user_agent(crate::constants::USER_AGENT.as_str())
        .build()
        .map_err(|e| OAuthError::Network(format!("Failed to build HTTP client: {}", e)))?;

    let response = client
        .post(token_url)
        .form(&params)
        .send()
        .await
        .map_err(|e| OAuthError::Network(format!("Refresh request failed: {}", e)))?;

    if response.status().is_success() {
        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| OAuthError::Network(format!("Refresh data parsing failed: {}", e)))
    } else {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(OAuthError::Rejected(format!(
            "Refresh failed with {}: {}",
            status, body
        )))
    }
}
