mod account;
mod config;

pub use account::{Account, AccountSource, ModelRateLimit};
pub use config::{AppConfig, DispatchConfig, ProxyConfig};
