use crate::error::{AppError, AppResult};
use crate::proxy::handlers;
use crate::proxy::state::AppState;
use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tracing::{info, warn};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(handlers::claude::handle_messages))
        .route("/v1/models", get(handlers::claude::handle_list_models))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .route("/health", get(health))
        .with_state(state)
}

pub async fn serve(state: AppState) -> AppResult<()> {
    let port = state.config.proxy.port;
    let host = if state.config.proxy.allow_lan_access {
        "0.0.0.0"
    } else {
        "127.0.0.1"
    };
    if state.config.proxy.allow_lan_access {
        warn!("LAN access enabled, binding 0.0.0.0:{}", port);
    }

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind((host, port))
        .await
        .map_err(AppError::Io)?;
    info!("Proxy listening on {}:{}", host, port);
    axum::serve(listener, app).await.map_err(AppError::Io)
}

async fn health() -> Response {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") })).into_response()
}

// Bearer / x-api-key check against the configured proxy key. With no key
// configured the proxy is open (local-only bind by default).
async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.config.proxy.api_key.as_deref() else {
        return next.run(request).await;
    };
    if expected.is_empty() {
        return next.run(request).await;
    }

    let presented = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            request
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        });

    if presented == Some(expected) {
        return next.run(request).await;
    }

    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "type": "error",
            "error": {
                "type": "authentication_error",
                "message": "Invalid or missing API key"
            }
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AppConfig, DispatchConfig};
    use crate::proxy::clock::SystemClock;
    use crate::proxy::dispatch::Dispatcher;
    use crate::proxy::token::credentials::GoogleTokenExchanger;
    use crate::proxy::token::pool::AccountPool;
    use crate::proxy::token::selector::noop_save_hook;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    fn test_state(api_key: Option<&str>) -> AppState {
        let mut config = AppConfig::default();
        config.proxy.api_key = api_key.map(|s| s.to_string());
        let pool = Arc::new(Mutex::new(AccountPool::new(vec![], 0)));
        let dispatcher = Dispatcher::new(
            pool,
            Arc::new(SystemClock),
            Arc::new(GoogleTokenExchanger),
            DispatchConfig::default(),
            HashMap::new(),
            noop_save_hook(),
        );
        AppState {
            dispatcher: Arc::new(dispatcher),
            config: Arc::new(config),
        }
    }

    async fn request_status(state: AppState, path: &str, api_key: Option<&str>) -> StatusCode {
        let app = build_router(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = reqwest::Client::new();
        let mut builder = client.get(format!("http://{}{}", addr, path));
        if let Some(key) = api_key {
            builder = builder.header("x-api-key", key);
        }
        let status = builder.send().await.unwrap().status();
        server.abort();
        StatusCode::from_u16(status.as_u16()).unwrap()
    }

    #[tokio::test]
    async fn health_is_reachable_without_a_key() {
        let status = request_status(test_state(Some("secret")), "/health", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn models_route_rejects_missing_key() {
        let status = request_status(test_state(Some("secret")), "/v1/models", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn models_route_accepts_the_configured_key() {
        let status = request_status(test_state(Some("secret")), "/v1/models", Some("secret")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn open_proxy_without_key_allows_requests() {
        let status = request_status(test_state(None), "/v1/models", None).await;
        assert_eq!(status, StatusCode::OK);
    }
}
