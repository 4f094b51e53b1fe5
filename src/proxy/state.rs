use crate::models::AppConfig;
use crate::proxy::dispatch::Dispatcher;
use std::sync::Arc;

// Axum application state.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub config: Arc<AppConfig>,
}
