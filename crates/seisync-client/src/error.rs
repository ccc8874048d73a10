//! SEI API error classification.

use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Result type for SEI API calls.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Phrases the SEI API uses for records that do not exist.
const NOT_FOUND_MARKERS: &[&str] = &[
    "não encontrado",
    "nao encontrado",
    "não existe",
    "nao existe",
    "not found",
    "does not exist",
];

/// Phrases the SEI API uses when the unit cannot see the process.
const UNIT_ACCESS_MARKERS: &[&str] = &[
    "não possui acesso ao processo",
    "nao possui acesso ao processo",
    "does not have access to process",
];

/// Classification of a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Login rejected.
    Auth,
    /// Token rejected (HTTP 401).
    Unauthorized,
    /// HTTP 429.
    RateLimited,
    /// The record does not exist.
    NotFound,
    /// The unit used for the call cannot see the process.
    UnitAccessDenied,
    /// Any other 4xx.
    Rejected,
    /// HTTP 5xx.
    ServerError,
    Timeout,
    NetworkError,
    /// The response body could not be interpreted.
    Decode,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Auth => "auth",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::NotFound => "not_found",
            ErrorKind::UnitAccessDenied => "unit_access_denied",
            ErrorKind::Rejected => "rejected",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::Decode => "decode",
        }
    }

    /// Kinds retried with exponential backoff up to the attempt cap.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::ServerError | ErrorKind::Timeout | ErrorKind::NetworkError
        )
    }
}

/// A failed SEI API call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("token rejected: {0}")]
    Unauthorized(String),

    #[error("rate limited")]
    RateLimited,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unit has no access to the process: {0}")]
    UnitAccessDenied(String),

    #[error("request rejected with HTTP {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("server error HTTP {status}: {message}")]
    Server { status: u16, message: String },

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Auth(_) => ErrorKind::Auth,
            ApiError::Unauthorized(_) => ErrorKind::Unauthorized,
            ApiError::RateLimited => ErrorKind::RateLimited,
            ApiError::NotFound(_) => ErrorKind::NotFound,
            ApiError::UnitAccessDenied(_) => ErrorKind::UnitAccessDenied,
            ApiError::Rejected { .. } => ErrorKind::Rejected,
            ApiError::Server { .. } => ErrorKind::ServerError,
            ApiError::Timeout => ErrorKind::Timeout,
            ApiError::Network(_) => ErrorKind::NetworkError,
            ApiError::Decode(_) => ErrorKind::Decode,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Classify a non-success response from its status and body.
    pub fn from_response(status: StatusCode, body: &str) -> Self {
        let message = extract_message(body);
        let lowered = message.to_lowercase();

        match status.as_u16() {
            401 => ApiError::Unauthorized(message),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::Server {
                status: status.as_u16(),
                message,
            },
            400..=499 if contains_any(&lowered, UNIT_ACCESS_MARKERS) => {
                ApiError::UnitAccessDenied(message)
            }
            404 => ApiError::NotFound(message),
            400..=499 if contains_any(&lowered, NOT_FOUND_MARKERS) => ApiError::NotFound(message),
            code => ApiError::Rejected {
                status: code,
                message,
            },
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiError::Timeout
        } else if e.is_decode() {
            ApiError::Decode(e.to_string())
        } else {
            ApiError::Network(e.to_string())
        }
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Human-readable message of an SEI error body.
///
/// The API answers `{"detail": [{"msg": "..."}]}`, `{"detail": "..."}`,
/// `{"message": "..."}` or plain text.
pub fn extract_message(body: &str) -> String {
    let parsed: Option<JsonValue> = serde_json::from_str(body).ok();
    let from_json = parsed.as_ref().and_then(|json| match json.get("detail") {
        Some(JsonValue::Array(items)) => {
            let msgs: Vec<&str> = items
                .iter()
                .filter_map(|item| item.get("msg").and_then(|m| m.as_str()))
                .collect();
            (!msgs.is_empty()).then(|| msgs.join("; "))
        }
        Some(JsonValue::String(s)) => Some(s.clone()),
        _ => ["message", "Message", "mensagem", "Mensagem"]
            .iter()
            .find_map(|key| json.get(*key).and_then(|m| m.as_str()))
            .map(str::to_string),
    });

    from_json.unwrap_or_else(|| body.trim().chars().take(200).collect())
}
