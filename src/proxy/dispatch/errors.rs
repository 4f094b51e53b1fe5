use thiserror::Error;

// Classified failure kinds surfaced by the dispatcher. Every error is typed at
// the boundary where it arises; the retry loops match on kinds, never on
// message substrings.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("all accounts rate-limited for {model}, reset at {reset_at}")]
    ResourceExhausted { model: String, reset_at: i64 },

    #[error("no accounts available")]
    NoAccountsAvailable,

    #[error("max retries exceeded after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded { attempts: usize, last_error: String },

    #[error("account {email} is invalid: {reason}")]
    AuthInvalid { email: String, reason: String },

    #[error("auth network error: {0}")]
    AuthNetwork(String),

    // Every endpoint answered 429 for one account attempt; carries the
    // smallest reset observed so the outer loop can park the account.
    #[error("account {email} rate-limited, retry in {reset_ms}ms")]
    RateLimited { email: String, reset_ms: u64 },

    #[error("upstream returned {status}: {body}")]
    Upstream4xx { status: u16, body: String },

    #[error("upstream returned {status}")]
    Upstream5xx { status: u16 },

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl DispatchError {
    // Stable Anthropic-style `error.type` tag for the public surface.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::ResourceExhausted { .. } | Self::RateLimited { .. } => "rate_limit_error",
            Self::NoAccountsAvailable => "overloaded_error",
            Self::MaxRetriesExceeded { .. } => "overloaded_error",
            Self::AuthInvalid { .. } => "authentication_error",
            Self::AuthNetwork(_) | Self::Network(_) => "api_error",
            Self::Upstream4xx { status, .. } => match status {
                400 => "invalid_request_error",
                401 => "authentication_error",
                403 => "permission_error",
                _ => "api_error",
            },
            Self::Upstream5xx { .. } => "api_error",
            Self::InvalidRequest(_) => "invalid_request_error",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::ResourceExhausted { .. } | Self::RateLimited { .. } => 429,
            Self::NoAccountsAvailable | Self::MaxRetriesExceeded { .. } => 503,
            Self::AuthInvalid { .. } => 401,
            Self::AuthNetwork(_) | Self::Network(_) => 502,
            Self::Upstream4xx { status, .. } => *status,
            Self::Upstream5xx { status } => *status,
            Self::InvalidRequest(_) => 400,
        }
    }

    // True for the terminal "every account is exhausted" outcomes that the
    // one-level model fallback is allowed to absorb.
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhausted { .. } | Self::NoAccountsAvailable
        )
    }
}
