use crate::models::{Account, ModelRateLimit};
use tracing::{debug, info, warn};

// The account list plus the sticky cursor, guarded by one mutex at the owner.
// Ledger operations mutate the records in place; expired records are cleared
// lazily and must not reappear until the next 429.
pub struct AccountPool {
    accounts: Vec<Account>,
    active_index: usize,
}

impl AccountPool {
    pub fn new(accounts: Vec<Account>, active_index: usize) -> Self {
        // Out-of-range cursors from a stale state file are clamped to 0.
        let active_index = if active_index < accounts.len() {
            active_index
        } else {
            if active_index != 0 {
                warn!(
                    "activeIndex {} out of range for {} account(s), resetting to 0",
                    active_index,
                    accounts.len()
                );
            }
            0
        };
        Self {
            accounts,
            active_index,
        }
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn accounts(&self) -> &[Account] {
        &self.accounts
    }

    pub fn active_index(&self) -> usize {
        self.active_index
    }

    pub fn set_active_index(&mut self, index: usize) {
        debug_assert!(index < self.accounts.len().max(1));
        self.active_index = index;
    }

    pub fn account(&self, index: usize) -> Option<&Account> {
        self.accounts.get(index)
    }

    pub fn account_mut_at(&mut self, index: usize) -> Option<&mut Account> {
        self.accounts.get_mut(index)
    }

    pub fn account_mut(&mut self, email: &str) -> Option<&mut Account> {
        self.accounts.iter_mut().find(|a| a.email == email)
    }

    pub fn is_usable(&self, index: usize, model: &str, now_ms: i64) -> bool {
        self.accounts
            .get(index)
            .is_some_and(|a| account_is_usable(a, model, now_ms))
    }

    // Vacuously true for an empty pool.
    pub fn all_rate_limited(&self, model: &str, now_ms: i64) -> bool {
        self.accounts.iter().all(|a| {
            a.is_invalid
                || a.model_rate_limits
                    .get(model)
                    .is_some_and(|r| r.is_active(now_ms))
        })
    }

    pub fn available(&self, model: &str, now_ms: i64) -> Vec<&Account> {
        self.accounts
            .iter()
            .filter(|a| account_is_usable(a, model, now_ms))
            .collect()
    }

    pub fn clear_expired(&mut self, now_ms: i64) -> usize {
        let mut cleared = 0;
        for account in &mut self.accounts {
            let email = account.email.clone();
            account.model_rate_limits.retain(|model, record| {
                if record.is_expired(now_ms) {
                    debug!("Rate limit expired for {} on {}, clearing", email, model);
                    cleared += 1;
                    false
                } else {
                    true
                }
            });
        }
        cleared
    }

    // Optimistic manual override: drop every record regardless of expiry.
    pub fn reset_all(&mut self) {
        let count: usize = self
            .accounts
            .iter()
            .map(|a| a.model_rate_limits.len())
            .sum();
        for account in &mut self.accounts {
            account.model_rate_limits.clear();
        }
        if count > 0 {
            warn!("Optimistic reset: cleared {} rate limit record(s)", count);
        }
    }

    pub fn mark_rate_limited(
        &mut self,
        email: &str,
        reset_ms: Option<u64>,
        model: &str,
        now_ms: i64,
        default_cooldown_ms: u64,
    ) {
        let reset_ms = reset_ms.unwrap_or(default_cooldown_ms);
        if let Some(account) = self.account_mut(email) {
            let reset_time = now_ms + reset_ms as i64;
            account
                .model_rate_limits
                .insert(model.to_string(), ModelRateLimit::until(reset_time));
            info!(
                "Account {} rate-limited on {} for {}ms",
                email, model, reset_ms
            );
        }
    }

    pub fn mark_invalid(&mut self, email: &str, reason: &str, now_ms: i64) {
        if let Some(account) = self.account_mut(email) {
            account.is_invalid = true;
            account.invalid_reason = Some(reason.to_string());
            account.invalid_at = Some(now_ms);
            warn!("Account {} marked invalid: {}", email, reason);
        }
    }

    pub fn clear_invalid(&mut self, email: &str) {
        if let Some(account) = self.account_mut(email) {
            if account.is_invalid {
                info!("Account {} recovered, clearing invalid flag", email);
            }
            account.is_invalid = false;
            account.invalid_reason = None;
            account.invalid_at = None;
        }
    }

    // Smallest positive remaining wait across accounts once the pool is fully
    // limited for `model`. The email of the soonest-to-reset account comes
    // along for logging only.
    pub fn min_wait_ms(
        &self,
        model: &str,
        now_ms: i64,
        default_cooldown_ms: u64,
    ) -> (u64, Option<String>) {
        if !self.all_rate_limited(model, now_ms) {
            return (0, None);
        }
        let soonest = self
            .accounts
            .iter()
            .filter_map(|a| {
                a.active_limit_wait_ms(model, now_ms)
                    .filter(|wait| *wait > 0)
                    .map(|wait| (wait as u64, a.email.clone()))
            })
            .min_by_key(|(wait, _)| *wait);

        match soonest {
            Some((wait, email)) => (wait, Some(email)),
            None => (default_cooldown_ms, None),
        }
    }
}

pub fn account_is_usable(account: &Account, model: &str, now_ms: i64) -> bool {
    !account.is_invalid
        && account.enabled
        && !account
            .model_rate_limits
            .get(model)
            .is_some_and(|r| r.is_active(now_ms))
}
