use super::pool::AccountPool;
use super::selector::SelectedAccount;
use crate::models::AccountSource;
use crate::modules::oauth::{OAuthError, TokenResponse};
use crate::proxy::clock::Clock;
use crate::proxy::dispatch::errors::DispatchError;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

// Refresh-token exchange behind a seam so the store can be exercised without
// the real OAuth endpoint.
pub trait TokenExchanger: Send + Sync {
    fn refresh(&self, refresh_token: &str) -> BoxFuture<'static, Result<TokenResponse, OAuthError>>;
}

pub struct GoogleTokenExchanger;

impl TokenExchanger for GoogleTokenExchanger {
    fn refresh(&self, refresh_token: &str) -> BoxFuture<'static, Result<TokenResponse, OAuthError>> {
        let refresh_token = refresh_token.to_string();
        Box::pin(async move { crate::modules::oauth::refresh_access_token(&refresh_token).await })
    }
}

struct CachedToken {
    token: String,
    extracted_at: i64,
}

// Per-account access-token cache keyed by email, valid for the configured TTL.
pub struct CredentialStore {
    cache: DashMap<String, CachedToken>,
    pool: Arc<Mutex<AccountPool>>,
    clock: Arc<dyn Clock>,
    exchanger: Arc<dyn TokenExchanger>,
    ttl_ms: i64,
}

impl CredentialStore {
    pub fn new(
        pool: Arc<Mutex<AccountPool>>,
        clock: Arc<dyn Clock>,
        exchanger: Arc<dyn TokenExchanger>,
        ttl_ms: i64,
    ) -> Self {
        Self {
            cache: DashMap::new(),
            pool,
            clock,
            exchanger,
            ttl_ms,
        }
    }

    pub async fn token_for(&self, account: &SelectedAccount) -> Result<String, DispatchError> {
        let now = self.clock.now_ms();
        if let Some(entry) = self.cache.get(&account.email) {
            if now - entry.extracted_at < self.ttl_ms {
                debug!("Token cache hit for {}", account.email);
                return Ok(entry.token.clone());
            }
        }

        let token = match account.source {
            AccountSource::Oauth => self.exchange_oauth(account).await?,
            AccountSource::Manual => account.api_key.clone().ok_or_else(|| {
                DispatchError::AuthInvalid {
                    email: account.email.clone(),
                    reason: "manual account has no api key".to_string(),
                }
            })?,
            AccountSource::LegacyDb => {
                let db_path = account.db_path.clone();
                let email = account.email.clone();
                tokio::task::spawn_blocking(move || {
                    crate::modules::legacy_db::read_access_token(db_path.as_deref())
                })
                .await
                .map_err(|e| DispatchError::Network(format!("legacy db read aborted: {}", e)))?
                .map_err(|reason| DispatchError::AuthInvalid { email, reason })?
            }
        };

        self.cache.insert(
            account.email.clone(),
            CachedToken {
                token: token.clone(),
                extracted_at: self.clock.now_ms(),
            },
        );
        Ok(token)
    }

    async fn exchange_oauth(&self, account: &SelectedAccount) -> Result<String, DispatchError> {
        let refresh_token =
            account
                .refresh_token
                .as_deref()
                .ok_or_else(|| DispatchError::AuthInvalid {
                    email: account.email.clone(),
                    reason: "oauth account has no refresh token".to_string(),
                })?;

        match self.exchanger.refresh(refresh_token).await {
            Ok(response) => {
                // The refresh worked, so any sticky invalid flag is stale.
                let mut pool = self.pool.lock().await;
                pool.clear_invalid(&account.email);
                Ok(response.access_token)
            }
            Err(OAuthError::Network(message)) => {
                warn!(
                    "Transient auth failure for {}, not invalidating: {}",
                    account.email, message
                );
                Err(DispatchError::AuthNetwork(message))
            }
            Err(OAuthError::Rejected(message)) => {
                let now = self.clock.now_ms();
                let mut pool = self.pool.lock().await;
                pool.mark_invalid(&account.email, &message, now);
                Err(DispatchError::AuthInvalid {
                    email: account.email.clone(),
                    reason: message,
                })
            }
        }
    }

    pub fn clear_token_cache(&self, email: Option<&str>) {
        match email {
            Some(email) => {
                self.cache.remove(email);
            }
            None => self.cache.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Account;
    use crate::proxy::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TTL: i64 = 300_000;

    struct StubExchanger {
        calls: AtomicUsize,
        result: Box<dyn Fn() -> Result<TokenResponse, OAuthError> + Send + Sync>,
    }

    impl StubExchanger {
        fn ok(token: &'static str) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                result: Box::new(move || {
                    Ok(TokenResponse {
                        access_token: token.to_string(),
                        expires_in: 3600,
                        token_type: "Bearer".to_string(),
                        refresh_token: None,
                    })
                }),
            })
        }

        fn failing(error: fn() -> OAuthError) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                result: Box::new(move || Err(error())),
            })
        }
    }

    impl TokenExchanger for StubExchanger {
        fn refresh(
            &self,
            _refresh_token: &str,
        ) -> BoxFuture<'static, Result<TokenResponse, OAuthError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let result = (self.result)();
            Box::pin(async move { result })
        }
    }

    fn store_with(
        exchanger: Arc<StubExchanger>,
        accounts: Vec<Account>,
    ) -> (CredentialStore, Arc<Mutex<AccountPool>>, Arc<ManualClock>) {
        let pool = Arc::new(Mutex::new(AccountPool::new(accounts, 0)));
        let clock = Arc::new(ManualClock::new(0));
        let store = CredentialStore::new(pool.clone(), clock.clone(), exchanger, TTL);
        (store, pool, clock)
    }

    fn selected(email: &str) -> SelectedAccount {
        SelectedAccount::from(&Account::oauth(email, "rt-1"))
    }

    #[tokio::test]
    async fn fresh_cache_hit_skips_the_exchange() {
        let exchanger = StubExchanger::ok("tok-1");
        let (store, _, clock) = store_with(exchanger.clone(), vec![Account::oauth("a@test", "rt")]);
        let account = selected("a@test");

        assert_eq!(store.token_for(&account).await.unwrap(), "tok-1");
        clock.advance(TTL - 1);
        assert_eq!(store.token_for(&account).await.unwrap(), "tok-1");
        assert_eq!(exchanger.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_cache_entry_re_exchanges() {
        let exchanger = StubExchanger::ok("tok-1");
        let (store, _, clock) = store_with(exchanger.clone(), vec![Account::oauth("a@test", "rt")]);
        let account = selected("a@test");

        store.token_for(&account).await.unwrap();
        clock.advance(TTL);
        store.token_for(&account).await.unwrap();
        assert_eq!(exchanger.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn explicit_clear_forces_re_exchange() {
        let exchanger = StubExchanger::ok("tok-1");
        let (store, _, _) = store_with(exchanger.clone(), vec![Account::oauth("a@test", "rt")]);
        let account = selected("a@test");

        store.token_for(&account).await.unwrap();
        store.clear_token_cache(Some("a@test"));
        store.token_for(&account).await.unwrap();
        assert_eq!(exchanger.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn network_failure_does_not_invalidate_account() {
        let exchanger =
            StubExchanger::failing(|| OAuthError::Network("connection reset".to_string()));
        let (store, pool, _) = store_with(exchanger, vec![Account::oauth("a@test", "rt")]);

        let err = store.token_for(&selected("a@test")).await.unwrap_err();
        assert!(matches!(err, DispatchError::AuthNetwork(_)));
        assert!(!pool.lock().await.account(0).unwrap().is_invalid);
    }

    #[tokio::test]
    async fn rejected_refresh_marks_account_invalid() {
        let exchanger =
            StubExchanger::failing(|| OAuthError::Rejected("invalid_grant".to_string()));
        let (store, pool, _) = store_with(exchanger, vec![Account::oauth("a@test", "rt")]);

        let err = store.token_for(&selected("a@test")).await.unwrap_err();
        assert!(matches!(err, DispatchError::AuthInvalid { .. }));
        let guard = pool.lock().await;
        let account = guard.account(0).unwrap();
        assert!(account.is_invalid);
        assert!(account.invalid_reason.as_deref().unwrap().contains("invalid_grant"));
    }

    #[tokio::test]
    async fn successful_refresh_lifts_stale_invalid_flag() {
        let exchanger = StubExchanger::ok("tok-1");
        let mut account = Account::oauth("a@test", "rt");
        account.is_invalid = true;
        account.invalid_reason = Some("old failure".to_string());
        let (store, pool, _) = store_with(exchanger, vec![account]);

        store.token_for(&selected("a@test")).await.unwrap();
        assert!(!pool.lock().await.account(0).unwrap().is_invalid);
    }

    #[tokio::test]
    async fn manual_account_returns_configured_key_without_exchange() {
        let exchanger = StubExchanger::ok("unused");
        let (store, _, _) = store_with(exchanger.clone(), vec![]);

        let account = SelectedAccount::from(&Account::manual("m@test", "sk-manual"));
        assert_eq!(store.token_for(&account).await.unwrap(), "sk-manual");
        assert_eq!(exchanger.calls.load(Ordering::SeqCst), 0);
    }
}
