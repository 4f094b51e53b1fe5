use crate::proxy::google::endpoints;
use crate::proxy::model_family::{family_of, is_thinking_model, ModelFamily};
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Response};
use serde_json::Value;
use tokio::time::Duration;

const INTERLEAVED_THINKING_BETA: &str = "interleaved-thinking-2025-05-14";

pub struct UpstreamClient {
    client: Client,
}

impl UpstreamClient {
    pub fn new() -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(Duration::from_secs(600))
            .user_agent(crate::constants::USER_AGENT.as_str())
            .build()
            .expect("Failed to create upstream HTTP client");
        Self { client }
    }

    // One POST against one endpoint; fallback across endpoints is the
    // dispatcher's business, not the transport's.
    pub async fn post_v1_internal(
        &self,
        base_url: &str,
        method: &str,
        query: Option<&str>,
        access_token: &str,
        body: &Value,
        headers: HeaderMap,
    ) -> Result<Response, reqwest::Error> {
        let url = endpoints::v1_internal_url(base_url, method, query);
        self.client
            .post(&url)
            .bearer_auth(access_token)
            .headers(headers)
            .json(body)
            .send()
            .await
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

// Fixed platform headers plus the conditional thinking/streaming markers.
pub fn build_request_headers(target_model: &str, streaming: bool) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    if let Ok(value) = HeaderValue::from_str(crate::constants::USER_AGENT.as_str()) {
        headers.insert(header::USER_AGENT, value);
    }
    if let Ok(value) = HeaderValue::from_str(crate::constants::CLIENT_METADATA.as_str()) {
        headers.insert(HeaderName::from_static("x-client-metadata"), value);
    }
    if family_of(target_model) == ModelFamily::Claude && is_thinking_model(target_model) {
        headers.insert(
            HeaderName::from_static("anthropic-beta"),
            HeaderValue::from_static(INTERLEAVED_THINKING_BETA),
        );
    }
    if streaming {
        headers.insert(header::ACCEPT, HeaderValue::from_static("text/event-stream"));
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_thinking_model_gets_interleaved_beta_header() {
        let headers = build_request_headers("claude-opus-4-5-thinking", false);
        assert_eq!(
            headers.get("anthropic-beta").unwrap(),
            INTERLEAVED_THINKING_BETA
        );
    }

    #[test]
    fn non_thinking_claude_has_no_beta_header() {
        let headers = build_request_headers("claude-sonnet-4-5", false);
        assert!(headers.get("anthropic-beta").is_none());
    }

    #[test]
    fn gemini_thinking_model_has_no_anthropic_beta() {
        let headers = build_request_headers("gemini-3-pro-high", true);
        assert!(headers.get("anthropic-beta").is_none());
        assert_eq!(headers.get(header::ACCEPT).unwrap(), "text/event-stream");
    }

    #[test]
    fn platform_identity_headers_are_always_present() {
        let headers = build_request_headers("claude-sonnet-4-5", false);
        assert!(headers
            .get(header::USER_AGENT)
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("antigravity/"));
        assert!(headers.get("x-client-metadata").is_some());
    }
}
