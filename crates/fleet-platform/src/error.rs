//! Error types for platform providers

use reqwest::{Response, StatusCode};
use thiserror::Error;

/// Platform provider error
#[derive(Debug, Error)]
pub enum PlatformError {
    /// Runner or job does not exist on the platform
    #[error("Not found: {0}")]
    NotFound(String),

    /// Platform API rejected or failed the request
    #[error("Platform API error: {0}")]
    Api(String),

    /// Credentials expired or lack permissions
    #[error("Token error: {0}")]
    Token(String),

    /// Malformed provider configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl PlatformError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, PlatformError::NotFound(_))
    }

    /// Errors no retry can fix; the reconcile loop stops on these
    pub fn is_fatal(&self) -> bool {
        matches!(self, PlatformError::Token(_) | PlatformError::Config(_))
    }
}

/// Result type for platform operations
pub type PlatformResult<T> = Result<T, PlatformError>;

/// Map non-success HTTP responses onto [`PlatformError`]
pub(crate) async fn check(response: Response) -> PlatformResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().path().to_string();
    let rate_limited = is_rate_limited(&response);
    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::TOO_MANY_REQUESTS => {
            PlatformError::Api(format!("{} on {}: {}", status, url, body))
        }
        StatusCode::FORBIDDEN if rate_limited => {
            PlatformError::Api(format!("{} (rate limited) on {}: {}", status, url, body))
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            PlatformError::Token(format!("{} on {}: {}", status, url, body))
        }
        StatusCode::NOT_FOUND => PlatformError::NotFound(url),
        _ => PlatformError::Api(format!("{} on {}: {}", status, url, body)),
    })
}

/// GitHub answers primary and secondary rate limits with 403 plus these headers
fn is_rate_limited(response: &Response) -> bool {
    let headers = response.headers();
    let exhausted = headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() == "0");
    exhausted || headers.contains_key(reqwest::header::RETRY_AFTER)
}
