use super::pool::AccountPool;
use crate::models::{Account, AccountSource};
use crate::proxy::clock::Clock;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

// Snapshot handed to the save hook after a mutation; written to disk outside
// the pool lock, best-effort.
#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    pub accounts: Vec<Account>,
    pub active_index: usize,
}

pub type SaveHook = Arc<dyn Fn(PoolSnapshot) + Send + Sync>;

pub fn noop_save_hook() -> SaveHook {
    Arc::new(|_| {})
}

// Small copied projection of an account. Selection hands these out instead of
// references into the pool; writers re-look-up by email under the lock.
#[derive(Debug, Clone)]
pub struct SelectedAccount {
    pub email: String,
    pub source: AccountSource,
    pub refresh_token: Option<String>,
    pub api_key: Option<String>,
    pub db_path: Option<PathBuf>,
    pub project_id: Option<String>,
}

impl From<&Account> for SelectedAccount {
    fn from(account: &Account) -> Self {
        Self {
            email: account.email.clone(),
            source: account.source,
            refresh_token: account.refresh_token.clone(),
            api_key: account.api_key.clone(),
            db_path: account.db_path.clone(),
            project_id: account.project_id.clone(),
        }
    }
}

#[derive(Debug)]
pub struct StickyPick {
    pub account: Option<SelectedAccount>,
    pub wait_ms: u64,
}

// Sticky-preference round-robin over the account list. The account under the
// cursor is reused as long as it stays usable, preserving backend-side session
// affinity; rotation happens only when stickiness is unusable and another
// account is free.
pub struct AccountSelector {
    pool: Arc<Mutex<AccountPool>>,
    clock: Arc<dyn Clock>,
    max_wait_before_error_ms: u64,
    save: SaveHook,
}

impl AccountSelector {
    pub fn new(
        pool: Arc<Mutex<AccountPool>>,
        clock: Arc<dyn Clock>,
        max_wait_before_error_ms: u64,
        save: SaveHook,
    ) -> Self {
        Self {
            pool,
            clock,
            max_wait_before_error_ms,
            save,
        }
    }

    pub async fn account_count(&self) -> usize {
        self.pool.lock().await.len()
    }

    pub async fn clear_expired(&self) -> usize {
        let now = self.clock.now_ms();
        self.pool.lock().await.clear_expired(now)
    }

    pub async fn pick_sticky(&self, model: &str) -> StickyPick {
        let now = self.clock.now_ms();
        let (pick, snapshot) = {
            let mut pool = self.pool.lock().await;
            if pool.is_empty() {
                return StickyPick {
                    account: None,
                    wait_ms: 0,
                };
            }
            pool.clear_expired(now);

            let index = pool.active_index();
            if pool.is_usable(index, model, now) {
                let account = pool.account_mut_at(index).expect("active index in range");
                account.last_used = now;
                let selected = SelectedAccount::from(&*account);
                debug!("Sticky account {} reused for {}", selected.email, model);
                (
                    StickyPick {
                        account: Some(selected),
                        wait_ms: 0,
                    },
                    Some(snapshot_of(&pool)),
                )
            } else if (0..pool.len()).any(|i| i != index && pool.is_usable(i, model, now)) {
                let selected = advance_to_next_usable(&mut pool, model, now);
                (
                    StickyPick {
                        account: selected,
                        wait_ms: 0,
                    },
                    Some(snapshot_of(&pool)),
                )
            } else if let Some(wait) = pool
                .account(index)
                .and_then(|a| a.active_limit_wait_ms(model, now))
                .filter(|wait| *wait > 0 && *wait as u64 <= self.max_wait_before_error_ms)
            {
                // Nobody else is free and the sticky account resets soon:
                // tell the caller to sleep it out and keep the affinity.
                debug!(
                    "Sticky account rate-limited for {}ms on {}, caller should wait",
                    wait, model
                );
                (
                    StickyPick {
                        account: None,
                        wait_ms: wait as u64,
                    },
                    None,
                )
            } else {
                let selected = advance_to_next_usable(&mut pool, model, now);
                let mutated = selected.is_some();
                (
                    StickyPick {
                        account: selected,
                        wait_ms: 0,
                    },
                    mutated.then(|| snapshot_of(&pool)),
                )
            }
        };

        if let Some(snapshot) = snapshot {
            (self.save)(snapshot);
        }
        pick
    }

    pub async fn pick_next(&self, model: &str) -> Option<SelectedAccount> {
        let now = self.clock.now_ms();
        let (selected, snapshot) = {
            let mut pool = self.pool.lock().await;
            pool.clear_expired(now);
            let selected = advance_to_next_usable(&mut pool, model, now);
            let snapshot = selected.is_some().then(|| snapshot_of(&pool));
            (selected, snapshot)
        };
        if let Some(snapshot) = snapshot {
            (self.save)(snapshot);
        }
        selected
    }

    pub async fn current_sticky(&self, model: &str) -> Option<SelectedAccount> {
        let now = self.clock.now_ms();
        let (selected, snapshot) = {
            let mut pool = self.pool.lock().await;
            let index = pool.active_index();
            if !pool.is_usable(index, model, now) {
                return None;
            }
            let account = pool.account_mut_at(index)?;
            account.last_used = now;
            (Some(SelectedAccount::from(&*account)), snapshot_of(&pool))
        };
        (self.save)(snapshot);
        selected
    }
}

fn snapshot_of(pool: &AccountPool) -> PoolSnapshot {
    PoolSnapshot {
        accounts: pool.accounts().to_vec(),
        active_index: pool.active_index(),
    }
}

// Rotation rule: scan (activeIndex + 1) mod N .. activeIndex for the first
// usable account, move the cursor there and touch lastUsed.
fn advance_to_next_usable(
    pool: &mut AccountPool,
    model: &str,
    now_ms: i64,
) -> Option<SelectedAccount> {
    let len = pool.len();
    if len == 0 {
        return None;
    }
    let start = pool.active_index();
    for offset in 1..=len {
        let index = (start + offset) % len;
        if pool.is_usable(index, model, now_ms) {
            pool.set_active_index(index);
            let account = pool.account_mut_at(index).expect("index in range");
            account.last_used = now_ms;
            debug!("Rotated to account {} for {}", account.email, model);
            return Some(SelectedAccount::from(&*account));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MODEL: &str = "claude-sonnet-4-5";
    const MAX_WAIT: u64 = 120_000;

    struct Fixture {
        selector: AccountSelector,
        pool: Arc<Mutex<AccountPool>>,
        clock: Arc<ManualClock>,
        saves: Arc<AtomicUsize>,
    }

    fn fixture(accounts: Vec<Account>) -> Fixture {
        let pool = Arc::new(Mutex::new(AccountPool::new(accounts, 0)));
        let clock = Arc::new(ManualClock::new(1_000_000));
        let saves = Arc::new(AtomicUsize::new(0));
        let saves_hook = saves.clone();
        let selector = AccountSelector::new(
            pool.clone(),
            clock.clone(),
            MAX_WAIT,
            Arc::new(move |_| {
                saves_hook.fetch_add(1, Ordering::SeqCst);
            }),
        );
        Fixture {
            selector,
            pool,
            clock,
            saves,
        }
    }

    #[tokio::test]
    async fn sticky_account_is_stable_across_picks() {
        let f = fixture(vec![
            Account::oauth("a@test", "rt"),
            Account::oauth("b@test", "rt"),
        ]);

        for _ in 0..3 {
            let pick = f.selector.pick_sticky(MODEL).await;
            assert_eq!(pick.account.unwrap().email, "a@test");
        }
        assert_eq!(f.pool.lock().await.active_index(), 0);
        assert!(f.saves.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn advances_when_sticky_becomes_unusable() {
        let f = fixture(vec![
            Account::oauth("a@test", "rt"),
            Account::oauth("b@test", "rt"),
        ]);
        {
            let mut pool = f.pool.lock().await;
            pool.mark_invalid("a@test", "revoked", 0);
        }

        let pick = f.selector.pick_sticky(MODEL).await;
        assert_eq!(pick.account.unwrap().email, "b@test");
        assert_eq!(f.pool.lock().await.active_index(), 1);
    }

    #[tokio::test]
    async fn reports_wait_when_sticky_limited_and_pool_empty_otherwise() {
        let f = fixture(vec![Account::oauth("a@test", "rt")]);
        {
            let mut pool = f.pool.lock().await;
            let now = f.clock.now_ms();
            pool.mark_rate_limited("a@test", Some(20_000), MODEL, now, 30_000);
        }

        let pick = f.selector.pick_sticky(MODEL).await;
        assert!(pick.account.is_none());
        assert_eq!(pick.wait_ms, 20_000);
        // The sticky cursor stays on the parked account.
        assert_eq!(f.pool.lock().await.active_index(), 0);
    }

    #[tokio::test]
    async fn no_wait_signal_beyond_the_error_cap() {
        let f = fixture(vec![Account::oauth("a@test", "rt")]);
        {
            let mut pool = f.pool.lock().await;
            let now = f.clock.now_ms();
            pool.mark_rate_limited("a@test", Some(MAX_WAIT + 60_000), MODEL, now, 30_000);
        }

        let pick = f.selector.pick_sticky(MODEL).await;
        assert!(pick.account.is_none());
        assert_eq!(pick.wait_ms, 0);
    }

    #[tokio::test]
    async fn pick_next_wraps_around_and_clears_expired_records() {
        let f = fixture(vec![
            Account::oauth("a@test", "rt"),
            Account::oauth("b@test", "rt"),
        ]);
        {
            let mut pool = f.pool.lock().await;
            let now = f.clock.now_ms();
            pool.mark_rate_limited("b@test", Some(5_000), MODEL, now, 30_000);
        }

        // b is limited, so rotation from a lands back on a.
        let first = f.selector.pick_next(MODEL).await.unwrap();
        assert_eq!(first.email, "a@test");

        f.clock.advance(6_000);
        let second = f.selector.pick_next(MODEL).await.unwrap();
        assert_eq!(second.email, "b@test");
        assert!(f.pool.lock().await.account(1).unwrap().model_rate_limits.is_empty());
    }

    #[tokio::test]
    async fn current_sticky_returns_none_without_touching_state() {
        let f = fixture(vec![Account::oauth("a@test", "rt")]);
        {
            let mut pool = f.pool.lock().await;
            pool.mark_invalid("a@test", "revoked", 0);
        }
        let before = f.saves.load(Ordering::SeqCst);
        assert!(f.selector.current_sticky(MODEL).await.is_none());
        assert_eq!(f.saves.load(Ordering::SeqCst), before);
    }

    #[tokio::test]
    async fn touches_last_used_on_selection() {
        let f = fixture(vec![Account::oauth("a@test", "rt")]);
        f.selector.pick_sticky(MODEL).await;
        let pool = f.pool.lock().await;
        assert_eq!(pool.account(0).unwrap().last_used, f.clock.now_ms());
    }

    #[tokio::test]
    async fn empty_pool_returns_no_account_and_no_wait() {
        let f = fixture(vec![]);
        let pick = f.selector.pick_sticky(MODEL).await;
        assert!(pick.account.is_none());
        assert_eq!(pick.wait_ms, 0);
        assert!(f.selector.pick_next(MODEL).await.is_none());
    }

    #[tokio::test]
    async fn concurrent_picks_keep_index_in_bounds() {
        let f = fixture(vec![
            Account::oauth("a@test", "rt"),
            Account::oauth("b@test", "rt"),
            Account::oauth("c@test", "rt"),
        ]);
        let selector = Arc::new(f.selector);

        let mut tasks = Vec::new();
        for i in 0..100 {
            let selector = selector.clone();
            let pool = f.pool.clone();
            tasks.push(tokio::spawn(async move {
                if i % 3 == 0 {
                    let mut pool = pool.lock().await;
                    pool.mark_rate_limited("b@test", Some(50), MODEL, 0, 30_000);
                }
                selector.pick_sticky(MODEL).await
            }));
        }
        for task in tasks {
            let pick = task.await.unwrap();
            if let Some(account) = pick.account {
                assert!(!account.email.is_empty());
            }
        }
        let pool = f.pool.lock().await;
        assert!(pool.active_index() < pool.len());
    }
}
