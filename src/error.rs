use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Session missing, expired or rejected. The account is skipped for this tick.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Transport, HTTP, rate-limit or payload failure. Same skip policy as `Auth`.
    #[error("remote call failed: {0}")]
    Remote(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn from_status(status: u16, body: &str) -> Self {
        let excerpt: String = body.chars().take(200).collect();
        match status {
            401 | 403 => Self::Auth(format!("HTTP {status}: {excerpt}")),
            429 => Self::Remote("rate limited (HTTP 429)".to_string()),
            _ => Self::Remote(format!("HTTP {status}: {excerpt}")),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::Remote(format!("timed out after {}s", after.as_secs_f32()))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Error::Auth(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Remote(format!("request timed out: {err}"));
        }
        Self::Remote(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Remote(format!("malformed response: {err}"))
    }
}
