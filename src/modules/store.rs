use crate::error::{AppError, AppResult};
use crate::models::{Account, AppConfig};
use crate::proxy::token::selector::{PoolSnapshot, SaveHook};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

// On-disk layout: one JSON document holding the account list, the settings,
// and the sticky cursor. Rewritten whole on every state-mutating operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistedState {
    pub accounts: Vec<Account>,
    pub settings: AppConfig,
    pub active_index: usize,
}

pub struct AccountStore {
    path: PathBuf,
}

impl AccountStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn default_path() -> AppResult<PathBuf> {
        let base = dirs::data_dir()
            .ok_or_else(|| AppError::Config("Failed to resolve data directory".to_string()))?;
        Ok(base.join("gantry").join("state.json"))
    }

    pub fn load(&self) -> AppResult<PersistedState> {
        if !self.path.exists() {
            debug!("No state file at {:?}, starting empty", self.path);
            return Ok(PersistedState::default());
        }
        let content = std::fs::read_to_string(&self.path)?;
        let state = serde_json::from_str(&content)
            .map_err(|e| AppError::Config(format!("Invalid state file {:?}: {}", self.path, e)))?;
        Ok(state)
    }

    pub fn save(&self, state: &PersistedState) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(state)
            .map_err(|e| AppError::Unknown(format!("Failed to serialize state: {}", e)))?;
        std::fs::write(&self.path, content)?;
        debug!("Persisted {} account(s) to {:?}", state.accounts.len(), self.path);
        Ok(())
    }
}

// Selection mutations persist through this hook: snapshot taken under the
// pool lock, written on a blocking task, failures logged and swallowed.
pub fn persistent_save_hook(store: Arc<AccountStore>, settings: AppConfig) -> SaveHook {
    Arc::new(move |snapshot: PoolSnapshot| {
        let store = store.clone();
        let state = PersistedState {
            accounts: snapshot.accounts,
            settings: settings.clone(),
            active_index: snapshot.active_index,
        };
        tokio::task::spawn_blocking(move || {
            if let Err(e) = store.save(&state) {
                warn!("Failed to persist account state: {}", e);
            }
        });
    })
}
