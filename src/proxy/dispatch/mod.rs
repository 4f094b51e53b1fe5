pub mod errors;

use crate::models::DispatchConfig;
use crate::proxy::clock::Clock;
use crate::proxy::google::endpoints;
use crate::proxy::mappers::claude::models::{ClaudeRequest, ClaudeResponse};
use crate::proxy::mappers::claude::{
    build_backend_request, collect_stream_to_json, create_event_stream, transform_response,
    ClaudeEventStream,
};
use crate::proxy::model_family::is_thinking_model;
use crate::proxy::project_resolver::ProjectResolver;
use crate::proxy::rate_limit::parse_reset_ms;
use crate::proxy::session;
use crate::proxy::token::credentials::{CredentialStore, TokenExchanger};
use crate::proxy::token::pool::AccountPool;
use crate::proxy::token::selector::{AccountSelector, SaveHook, SelectedAccount};
use crate::proxy::upstream::client::{build_request_headers, UpstreamClient};
use errors::DispatchError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const SERVER_ERROR_PAUSE: Duration = Duration::from_secs(1);

pub enum DispatchOutcome {
    Json(ClaudeResponse),
    Stream(ClaudeEventStream),
}

impl std::fmt::Debug for DispatchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchOutcome::Json(resp) => f.debug_tuple("Json").field(resp).finish(),
            DispatchOutcome::Stream(_) => f.debug_tuple("Stream").finish(),
        }
    }
}

// The orchestrator: selects an account, obtains credentials, translates the
// request, walks the endpoint fallback list, and feeds failures back into the
// rate-limit ledger. Account selection, endpoint fallback and retry all read
// the same ledger under concurrent callers.
pub struct Dispatcher {
    pool: Arc<Mutex<AccountPool>>,
    selector: AccountSelector,
    credentials: CredentialStore,
    projects: ProjectResolver,
    upstream: Arc<UpstreamClient>,
    clock: Arc<dyn Clock>,
    config: DispatchConfig,
    model_fallbacks: HashMap<String, String>,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<Mutex<AccountPool>>,
        clock: Arc<dyn Clock>,
        exchanger: Arc<dyn TokenExchanger>,
        config: DispatchConfig,
        model_fallbacks: HashMap<String, String>,
        save: SaveHook,
    ) -> Self {
        let upstream = Arc::new(UpstreamClient::new());
        let selector = AccountSelector::new(
            pool.clone(),
            clock.clone(),
            config.max_wait_before_error_ms,
            save,
        );
        let credentials = CredentialStore::new(
            pool.clone(),
            clock.clone(),
            exchanger,
            config.token_cache_ttl_ms,
        );
        let projects = ProjectResolver::new(
            upstream.clone(),
            config.endpoints.clone(),
            config.default_project_id.clone(),
        );
        Self {
            pool,
            selector,
            credentials,
            projects,
            upstream,
            clock,
            config,
            model_fallbacks,
        }
    }

    // Entry point. `fallback_enabled` is owned by the caller; when the pool is
    // exhausted on the primary model, one pass on the mapped fallback model is
    // made with fallback disabled, so the substitution can never cascade.
    pub async fn send(
        &self,
        request: &ClaudeRequest,
        fallback_enabled: bool,
    ) -> Result<DispatchOutcome, DispatchError> {
        match self.dispatch(request).await {
            Err(err) if fallback_enabled && err.is_pool_exhausted() => {
                let Some(fallback_model) = self.model_fallbacks.get(&request.model) else {
                    return Err(err);
                };
                warn!(
                    "All accounts exhausted for {}, retrying once on fallback model {}",
                    request.model, fallback_model
                );
                let mut fallback_request = request.clone();
                fallback_request.model = fallback_model.clone();
                self.dispatch(&fallback_request).await
            }
            other => other,
        }
    }

    async fn dispatch(&self, request: &ClaudeRequest) -> Result<DispatchOutcome, DispatchError> {
        let model = request.model.as_str();
        let account_count = self.selector.account_count().await;
        let max_attempts = self.config.max_retries.max(account_count + 1);
        let mut last_error: Option<DispatchError> = None;

        for attempt in 0..max_attempts {
            let Some(account) = self.acquire_account(model).await? else {
                return Err(DispatchError::NoAccountsAvailable);
            };
            debug!(
                "Attempt {}/{} using account {} for {}",
                attempt + 1,
                max_attempts,
                account.email,
                model
            );

            match self.attempt_account(request, &account).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    match &err {
                        // The ledger already holds the reset; the sticky pick
                        // skips this account on the next attempt.
                        DispatchError::RateLimited { email, reset_ms } => {
                            debug!("Account {} parked for {}ms", email, reset_ms);
                        }
                        DispatchError::AuthInvalid { email, .. } => {
                            debug!("Account {} invalid, trying next", email);
                        }
                        DispatchError::Upstream5xx { status } => {
                            debug!("Server error {} from upstream, rotating account", status);
                            self.selector.pick_next(model).await;
                        }
                        DispatchError::AuthNetwork(_) | DispatchError::Network(_) => {
                            self.clock.sleep(SERVER_ERROR_PAUSE).await;
                            self.selector.pick_next(model).await;
                        }
                        _ => return Err(err),
                    }
                    last_error = Some(err);
                }
            }
        }

        Err(DispatchError::MaxRetriesExceeded {
            attempts: max_attempts,
            last_error: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    // Steps 1-3 of the attempt: sticky preference, wait-or-switch, and the
    // all-rate-limited decision.
    async fn acquire_account(
        &self,
        model: &str,
    ) -> Result<Option<SelectedAccount>, DispatchError> {
        let pick = self.selector.pick_sticky(model).await;
        let mut account = pick.account;

        if account.is_none() && pick.wait_ms > 0 {
            debug!("Sleeping {}ms for sticky account reset", pick.wait_ms);
            self.clock.sleep(Duration::from_millis(pick.wait_ms)).await;
            self.selector.clear_expired().await;
            account = self.selector.current_sticky(model).await;
        }

        if account.is_none() {
            let now = self.clock.now_ms();
            let (pool_empty, all_limited, wait_ms) = {
                let pool = self.pool.lock().await;
                let all = pool.all_rate_limited(model, now);
                let (wait, soonest) =
                    pool.min_wait_ms(model, now, self.config.default_cooldown_ms);
                if let Some(email) = soonest {
                    debug!("Soonest reset belongs to {} ({}ms)", email, wait);
                }
                (pool.is_empty(), all, wait)
            };

            if !pool_empty && all_limited {
                if wait_ms > self.config.max_wait_before_error_ms {
                    return Err(DispatchError::ResourceExhausted {
                        model: model.to_string(),
                        reset_at: now + wait_ms as i64,
                    });
                }
                self.clock.sleep(Duration::from_millis(wait_ms)).await;
                self.selector.clear_expired().await;
                account = self.selector.pick_next(model).await;
            }
        }

        Ok(account)
    }

    // Steps 4-6: credentials, translation, and the endpoint fallback walk for
    // one account.
    async fn attempt_account(
        &self,
        request: &ClaudeRequest,
        account: &SelectedAccount,
    ) -> Result<DispatchOutcome, DispatchError> {
        let token = self.credentials.token_for(account).await?;
        let project = self.projects.project_for(account, &token).await;
        let session_id = session::extract_session_id(request);
        let payload = build_backend_request(request, &project, &session_id)
            .map_err(DispatchError::InvalidRequest)?;

        // Thinking models only answer usefully over SSE, so both streaming
        // callers and buffered thinking requests take the stream path.
        let use_sse = request.stream || is_thinking_model(&request.model);
        let (method, query) = if use_sse {
            (
                endpoints::METHOD_STREAM_GENERATE_CONTENT,
                Some(endpoints::SSE_QUERY),
            )
        } else {
            (endpoints::METHOD_GENERATE_CONTENT, None)
        };

        let endpoint_count = self.config.endpoints.len();
        let mut last_error: Option<DispatchError> = None;
        let mut min_reset_ms: Option<u64> = None;
        let mut count_429 = 0usize;
        let mut count_401 = 0usize;

        for base in &self.config.endpoints {
            let headers = build_request_headers(&request.model, use_sse);
            let response = match self
                .upstream
                .post_v1_internal(base, method, query, &token, &payload, headers)
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    debug!("Transport failure at {}: {}", base, e);
                    last_error = Some(DispatchError::Network(e.to_string()));
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                return self.finish_success(request, response, use_sse).await;
            }

            match status.as_u16() {
                401 => {
                    // A stale token poisons every endpoint the same way;
                    // drop the caches so the next attempt re-exchanges.
                    count_401 += 1;
                    self.credentials.clear_token_cache(Some(&account.email));
                    self.projects.clear_project_cache(Some(&account.email));
                    let body = response.text().await.unwrap_or_default();
                    debug!("401 from {} for {}: {}", base, account.email, body);
                    last_error = Some(DispatchError::AuthInvalid {
                        email: account.email.clone(),
                        reason: format!("unauthorized: {}", body),
                    });
                }
                429 => {
                    count_429 += 1;
                    let retry_after = response
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.to_string());
                    let body = response.text().await.unwrap_or_default();
                    let reset = parse_reset_ms(
                        retry_after.as_deref(),
                        &body,
                        self.clock.now_ms(),
                        self.config.default_cooldown_ms,
                    );
                    debug!("429 from {}, reset in {}ms", base, reset);
                    min_reset_ms = Some(min_reset_ms.map_or(reset, |m| m.min(reset)));
                    last_error = Some(DispatchError::RateLimited {
                        email: account.email.clone(),
                        reset_ms: reset,
                    });
                }
                s if s >= 500 => {
                    warn!("Upstream {} returned {}, pausing before next endpoint", base, s);
                    self.clock.sleep(SERVER_ERROR_PAUSE).await;
                    last_error = Some(DispatchError::Upstream5xx { status: s });
                }
                s => {
                    let body = response.text().await.unwrap_or_default();
                    debug!("Upstream {} returned {}: {}", base, s, body);
                    last_error = Some(DispatchError::Upstream4xx { status: s, body });
                }
            }
        }

        // Every endpoint rate-limited this account: park it in the ledger
        // with the smallest reset observed and hand control back upstream.
        if endpoint_count > 0 && count_429 == endpoint_count {
            let reset = min_reset_ms.unwrap_or(self.config.default_cooldown_ms);
            let now = self.clock.now_ms();
            self.pool.lock().await.mark_rate_limited(
                &account.email,
                Some(reset),
                &request.model,
                now,
                self.config.default_cooldown_ms,
            );
            return Err(DispatchError::RateLimited {
                email: account.email.clone(),
                reset_ms: reset,
            });
        }
        if endpoint_count > 0 && count_401 == endpoint_count {
            return Err(DispatchError::AuthInvalid {
                email: account.email.clone(),
                reason: "unauthorized across all endpoints".to_string(),
            });
        }

        Err(last_error.unwrap_or(DispatchError::NoAccountsAvailable))
    }

    async fn finish_success(
        &self,
        request: &ClaudeRequest,
        response: reqwest::Response,
        use_sse: bool,
    ) -> Result<DispatchOutcome, DispatchError> {
        if use_sse {
            let stream = create_event_stream(Box::pin(response.bytes_stream()));
            if request.stream {
                return Ok(DispatchOutcome::Stream(stream));
            }
            // Buffered caller on the SSE path: accumulate to a single value.
            let mut collected = collect_stream_to_json(stream)
                .await
                .map_err(DispatchError::Network)?;
            if collected.model.is_empty() {
                collected.model = request.model.clone();
            }
            return Ok(DispatchOutcome::Json(collected));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| DispatchError::Network(format!("Failed to read body: {}", e)))?;
        let value: Value = serde_json::from_slice(&bytes)
            .map_err(|e| DispatchError::Network(format!("Parse error: {}", e)))?;
        let unwrapped = value.get("response").unwrap_or(&value);
        let gemini = serde_json::from_value(unwrapped.clone())
            .map_err(|e| DispatchError::Network(format!("Convert error: {}", e)))?;
        let claude = transform_response(&gemini, &request.model);
        info!(
            "Request finished. Model: {}, Tokens: In {}, Out {}",
            claude.model, claude.usage.input_tokens, claude.usage.output_tokens
        );
        Ok(DispatchOutcome::Json(claude))
    }
}
