use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("concurrent modification: {0}")]
    Conflict(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error("failed to resolve required path: {0}")]
    Path(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Keychain(#[from] keyring::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Config(String),
}

/// Failures reported by the external map provider adapter.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("provider rate limit exceeded")]
    RateLimited,
    #[error("provider rejected credentials: {0}")]
    Unauthorized(String),
    #[error("provider returned HTTP {0}")]
    Status(u16),
    #[error("provider rejected request: {0}")]
    Rejected(String),
    #[error("provider returned no results")]
    NoResults,
    #[error("malformed provider payload: {0}")]
    Malformed(String),
    #[error("map provider is not configured")]
    NotConfigured,
}

impl ProviderError {
    /// Whether a repeated request could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Transport(_) | ProviderError::RateLimited => true,
            ProviderError::Status(code) => *code >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(value: reqwest::Error) -> Self {
        AppError::Provider(ProviderError::Transport(value))
    }
}

impl AppError {
    pub fn is_transient_provider_failure(&self) -> bool {
        matches!(self, AppError::Provider(err) if err.is_transient())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transient_provider_failures() {
        assert!(AppError::from(ProviderError::RateLimited).is_transient_provider_failure());
        assert!(AppError::from(ProviderError::Status(503)).is_transient_provider_failure());
        assert!(!AppError::from(ProviderError::Status(404)).is_transient_provider_failure());
        assert!(!AppError::from(ProviderError::NotConfigured).is_transient_provider_failure());
        assert!(!AppError::NotFound("poi".into()).is_transient_provider_failure());
    }
}
