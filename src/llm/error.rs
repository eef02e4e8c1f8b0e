//! LLM error classification and backoff policy.

use std::time::Duration;

use thiserror::Error;

/// Broad classes of LLM call failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// HTTP 429.
    RateLimited,
    /// HTTP 5xx.
    ServerError,
    /// HTTP 4xx other than 429; the request itself is wrong.
    ClientError,
    /// Timeouts, refused connections, resets.
    Network,
    /// The provider answered but the body was not what we expected.
    Parse,
}

impl std::fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::RateLimited => "rate limited",
            Self::ServerError => "server error",
            Self::ClientError => "client error",
            Self::Network => "network error",
            Self::Parse => "parse error",
        };
        f.write_str(name)
    }
}

/// Map an HTTP status code to an error kind.
pub fn classify_http_status(status: u16) -> LlmErrorKind {
    match status {
        429 => LlmErrorKind::RateLimited,
        500..=599 => LlmErrorKind::ServerError,
        408 => LlmErrorKind::Network,
        _ => LlmErrorKind::ClientError,
    }
}

/// Error from a single LLM call.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub message: String,
    pub status_code: Option<u16>,
    pub retry_after: Option<Duration>,
}

impl LlmError {
    pub fn rate_limited(message: String, retry_after: Option<Duration>) -> Self {
        Self {
            kind: LlmErrorKind::RateLimited,
            message,
            status_code: Some(429),
            retry_after,
        }
    }

    pub fn server_error(status_code: u16, message: String) -> Self {
        Self {
            kind: LlmErrorKind::ServerError,
            message,
            status_code: Some(status_code),
            retry_after: None,
        }
    }

    pub fn client_error(status_code: u16, message: String) -> Self {
        Self {
            kind: LlmErrorKind::ClientError,
            message,
            status_code: Some(status_code),
            retry_after: None,
        }
    }

    pub fn network_error(message: String) -> Self {
        Self {
            kind: LlmErrorKind::Network,
            message,
            status_code: None,
            retry_after: None,
        }
    }

    pub fn parse_error(message: String) -> Self {
        Self {
            kind: LlmErrorKind::Parse,
            message,
            status_code: None,
            retry_after: None,
        }
    }

    /// Whether retrying the same request could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            LlmErrorKind::RateLimited | LlmErrorKind::ServerError | LlmErrorKind::Network
        )
    }
}

/// Failure of a text generation call as seen by pipeline stages.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GenerationError {
    #[error("transient generation failure: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },

    /// The collaborator answered with something unusable, or refused the request.
    #[error("generation failed: {0}")]
    Content(String),
}

impl GenerationError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after: None,
        }
    }
}

impl From<LlmError> for GenerationError {
    fn from(err: LlmError) -> Self {
        if err.is_transient() {
            Self::Transient {
                message: err.to_string(),
                retry_after: err.retry_after,
            }
        } else {
            Self::Content(err.to_string())
        }
    }
}

/// Exponential backoff with a ceiling.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Delay before retrying after the `attempt`-th failure (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }

    /// Like [`delay_for_attempt`](Self::delay_for_attempt) but honours a
    /// provider-suggested delay when it is longer.
    pub fn delay_with_hint(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let computed = self.delay_for_attempt(attempt);
        match hint {
            Some(hint) => hint.max(computed).min(self.max_delay),
            None => computed,
        }
    }
}
