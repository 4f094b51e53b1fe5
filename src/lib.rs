pub mod constants;
pub mod error;
mod models;
mod modules;
mod proxy;
#[cfg(test)]
mod test_utils;

use modules::logger;
use proxy::clock::SystemClock;
use proxy::dispatch::Dispatcher;
use proxy::state::AppState;
use proxy::token::credentials::GoogleTokenExchanger;
use proxy::token::pool::AccountPool;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

fn parse_env_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn apply_env_overrides(config: &mut crate::models::AppConfig) {
    if let Ok(key) = std::env::var("API_KEY") {
        if !key.trim().is_empty() {
            info!("Using API key from environment");
            config.proxy.api_key = Some(key);
        }
    }

    if let Ok(port) = std::env::var("PORT") {
        let trimmed = port.trim();
        if !trimmed.is_empty() {
            match trimmed.parse::<u16>() {
                Ok(p) if p > 0 => {
                    config.proxy.port = p;
                    info!("Using proxy port from environment: {}", p);
                }
                _ => warn!("Ignoring invalid PORT value: {}", port),
            }
        }
    }

    if let Ok(allow_lan) = std::env::var("ALLOW_LAN_ACCESS") {
        match parse_env_bool(&allow_lan) {
            Some(parsed) => config.proxy.allow_lan_access = parsed,
            None => warn!("Ignoring invalid ALLOW_LAN_ACCESS value: {}", allow_lan),
        }
    }

    if let Ok(enabled) = std::env::var("MODEL_FALLBACK_ENABLED") {
        match parse_env_bool(&enabled) {
            Some(parsed) => config.fallback_enabled = parsed,
            None => warn!("Ignoring invalid MODEL_FALLBACK_ENABLED value: {}", enabled),
        }
    }
}

fn state_file_path(config: &crate::models::AppConfig) -> crate::error::AppResult<std::path::PathBuf> {
    if let Ok(path) = std::env::var("GANTRY_STATE_PATH") {
        if !path.trim().is_empty() {
            return Ok(std::path::PathBuf::from(path));
        }
    }
    if let Some(path) = &config.dispatch.account_config_path {
        return Ok(path.clone());
    }
    modules::store::AccountStore::default_path()
}

// Expired ledger records are cleared lazily on selection; this sweep keeps the
// persisted state from accumulating stale records during idle periods.
fn start_ledger_sweeper(pool: Arc<Mutex<AccountPool>>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        interval.tick().await;
        loop {
            interval.tick().await;
            let now = chrono::Utc::now().timestamp_millis();
            let cleared = pool.lock().await.clear_expired(now);
            if cleared > 0 {
                info!("Ledger sweep cleared {} expired rate limit record(s)", cleared);
            }
        }
    });
}

async fn start_runtime() -> Result<(), String> {
    let bootstrap_path = state_file_path(&crate::models::AppConfig::default())
        .map_err(|e| format!("Failed to resolve state path: {}", e))?;
    let mut store = Arc::new(modules::store::AccountStore::new(bootstrap_path.clone()));
    let mut persisted = store
        .load()
        .map_err(|e| format!("Failed to load account state: {}", e))?;

    // The settings may point at a different state file; honor it once.
    if let Some(configured) = persisted.settings.dispatch.account_config_path.clone() {
        if configured != bootstrap_path {
            info!("Following configured account state path {:?}", configured);
            store = Arc::new(modules::store::AccountStore::new(configured));
            persisted = store
                .load()
                .map_err(|e| format!("Failed to load account state: {}", e))?;
        }
    }

    let mut config = persisted.settings.clone();
    apply_env_overrides(&mut config);

    let mut accounts = persisted.accounts;
    let max_accounts = config.dispatch.max_accounts;
    if accounts.len() > max_accounts {
        warn!(
            "Account list exceeds maxAccounts ({} > {}), ignoring the tail",
            accounts.len(),
            max_accounts
        );
        accounts.truncate(max_accounts);
    }
    info!(
        "Loaded {} account(s), activeIndex {}",
        accounts.len(),
        persisted.active_index
    );

    let pool = Arc::new(Mutex::new(AccountPool::new(
        accounts,
        persisted.active_index,
    )));
    let save_hook = modules::store::persistent_save_hook(store.clone(), config.clone());
    let dispatcher = Dispatcher::new(
        pool.clone(),
        Arc::new(SystemClock),
        Arc::new(GoogleTokenExchanger),
        config.dispatch.clone(),
        config.model_fallbacks.clone(),
        save_hook,
    );
    start_ledger_sweeper(pool);

    let state = AppState {
        dispatcher: Arc::new(dispatcher),
        config: Arc::new(config),
    };
    proxy::server::serve(state)
        .await
        .map_err(|e| format!("Proxy server failed: {}", e))
}

pub fn run() {
    logger::init_logger();

    let runtime = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");
    runtime.block_on(async {
        tokio::select! {
            result = start_runtime() => {
                if let Err(e) = result {
                    error!("{}", e);
                    std::process::exit(1);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
            }
        }
    });
}
