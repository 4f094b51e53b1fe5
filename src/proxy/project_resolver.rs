use crate::proxy::google::endpoints;
use crate::proxy::token::selector::SelectedAccount;
use crate::proxy::upstream::client::UpstreamClient;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

// Per-account project-id discovery via the backend's loadCodeAssist endpoint.
// Results live for the process lifetime until explicitly cleared.
pub struct ProjectResolver {
    cache: DashMap<String, String>,
    upstream: Arc<UpstreamClient>,
    endpoints: Vec<String>,
    default_project_id: String,
}

impl ProjectResolver {
    pub fn new(
        upstream: Arc<UpstreamClient>,
        endpoints: Vec<String>,
        default_project_id: String,
    ) -> Self {
        Self {
            cache: DashMap::new(),
            upstream,
            endpoints,
            default_project_id,
        }
    }

    pub async fn project_for(&self, account: &SelectedAccount, access_token: &str) -> String {
        if let Some(cached) = self.cache.get(&account.email) {
            return cached.clone();
        }

        if let Some(project_id) = &account.project_id {
            self.cache
                .insert(account.email.clone(), project_id.clone());
            return project_id.clone();
        }

        for base in &self.endpoints {
            match self.fetch_from(base, access_token).await {
                Ok(Some(project_id)) => {
                    debug!(
                        "Resolved project {} for {} via {}",
                        project_id, account.email, base
                    );
                    self.cache.insert(account.email.clone(), project_id.clone());
                    return project_id;
                }
                Ok(None) => {
                    debug!("loadCodeAssist at {} returned no project id", base);
                }
                Err(e) => {
                    debug!("loadCodeAssist failed at {}: {}", base, e);
                }
            }
        }

        warn!(
            "Project discovery failed for {}, using default project id",
            account.email
        );
        self.cache
            .insert(account.email.clone(), self.default_project_id.clone());
        self.default_project_id.clone()
    }

    async fn fetch_from(&self, base: &str, access_token: &str) -> Result<Option<String>, String> {
        let body = json!({
            "metadata": {
                "ideType": "ANTIGRAVITY"
            }
        });
        let response = self
            .upstream
            .post_v1_internal(
                base,
                endpoints::METHOD_LOAD_CODE_ASSIST,
                None,
                access_token,
                &body,
                crate::proxy::upstream::client::build_request_headers("", false),
            )
            .await
            .map_err(|e| format!("loadCodeAssist request failed: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("loadCodeAssist returned {}: {}", status, body));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| format!("Failed to parse loadCodeAssist response: {}", e))?;
        Ok(extract_project_id(&data))
    }

    pub fn clear_project_cache(&self, email: Option<&str>) {
        match email {
            Some(email) => {
                self.cache.remove(email);
            }
            None => self.cache.clear(),
        }
    }
}

// The field arrives either as a plain string or as an object with an `id`.
fn extract_project_id(data: &Value) -> Option<String> {
    let field = data.get("cloudaicompanionProject")?;
    if let Some(s) = field.as_str() {
        if !s.is_empty() {
            return Some(s.to_string());
        }
        return None;
    }
    field
        .get("id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Account;
    use axum::{routing::post, Json, Router};
    use serde_json::json;

    fn selected(email: &str, project_id: Option<&str>) -> SelectedAccount {
        let mut account = Account::oauth(email, "rt");
        account.project_id = project_id.map(|s| s.to_string());
        SelectedAccount::from(&account)
    }

    async fn start_mock(response: Value) -> (String, tokio::task::JoinHandle<()>) {
        let app = Router::new().route(
            "/v1internal:loadCodeAssist",
            post(move || {
                let response = response.clone();
                async move { Json(response) }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), handle)
    }

    #[test]
    fn project_id_parses_both_wire_shapes() {
        assert_eq!(
            extract_project_id(&json!({"cloudaicompanionProject": "proj-1"})),
            Some("proj-1".to_string())
        );
        assert_eq!(
            extract_project_id(&json!({"cloudaicompanionProject": {"id": "proj-2"}})),
            Some("proj-2".to_string())
        );
        assert_eq!(extract_project_id(&json!({"cloudaicompanionProject": ""})), None);
        assert_eq!(extract_project_id(&json!({})), None);
    }

    #[tokio::test]
    async fn explicit_project_id_short_circuits_discovery() {
        let resolver = ProjectResolver::new(
            Arc::new(UpstreamClient::new()),
            vec!["http://127.0.0.1:1".to_string()],
            "default-proj".to_string(),
        );
        let account = selected("a@test", Some("explicit-proj"));
        assert_eq!(resolver.project_for(&account, "tok").await, "explicit-proj");
        // Cached: a second call must not attempt the dead endpoint either.
        assert_eq!(resolver.project_for(&account, "tok").await, "explicit-proj");
    }

    #[tokio::test]
    async fn discovers_and_caches_project_id_from_backend() {
        let (base, server) = start_mock(json!({"cloudaicompanionProject": "discovered-1"})).await;
        let resolver = ProjectResolver::new(
            Arc::new(UpstreamClient::new()),
            vec![base],
            "default-proj".to_string(),
        );
        let account = selected("a@test", None);
        assert_eq!(resolver.project_for(&account, "tok").await, "discovered-1");
        server.abort();
        // Served from cache once the backend is gone.
        assert_eq!(resolver.project_for(&account, "tok").await, "discovered-1");
    }

    #[tokio::test]
    async fn all_endpoints_failing_falls_back_to_default() {
        let resolver = ProjectResolver::new(
            Arc::new(UpstreamClient::new()),
            vec![
                "http://127.0.0.1:1".to_string(),
                "http://127.0.0.1:2".to_string(),
            ],
            "default-proj".to_string(),
        );
        let account = selected("a@test", None);
        assert_eq!(resolver.project_for(&account, "tok").await, "default-proj");
    }

    #[tokio::test]
    async fn clear_cache_forces_rediscovery() {
        let (base, server) = start_mock(json!({"cloudaicompanionProject": "discovered-2"})).await;
        let resolver = ProjectResolver::new(
            Arc::new(UpstreamClient::new()),
            vec![base],
            "default-proj".to_string(),
        );
        let account = selected("a@test", None);
        resolver.project_for(&account, "tok").await;
        resolver.clear_project_cache(Some("a@test"));
        assert_eq!(resolver.project_for(&account, "tok").await, "discovered-2");
        server.abort();
    }
}
