//! Crate-wide error type with a stable wire-level taxonomy.
//!
//! Every failure that crosses the CLI/JSON or HTTP boundary is reported as
//! `{"error": {"kind", "message", "details"?}}`. The `kind` string is part of
//! the public contract; messages are free-form.

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    Network,
    Timeout,
    HttpStatus,
    Parse,
    CaptchaBlocked,
    UnsupportedScheme,
    DimMismatch,
    LockConflict,
    Io,
    Cancelled,
    NotFound,
    RateLimited,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::HttpStatus => "http_status",
            ErrorKind::Parse => "parse",
            ErrorKind::CaptchaBlocked => "captcha_blocked",
            ErrorKind::UnsupportedScheme => "unsupported_scheme",
            ErrorKind::DimMismatch => "dim_mismatch",
            ErrorKind::LockConflict => "lock_conflict",
            ErrorKind::Io => "io",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::NotFound => "not_found",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{}: {message}", kind.as_str())]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parse, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "operation cancelled")
    }

    pub fn http_status(code: u16) -> Self {
        Self::new(ErrorKind::HttpStatus, format!("upstream returned HTTP {}", code))
            .with_detail("status", code)
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        let map = self.details.get_or_insert_with(|| serde_json::json!({}));
        if let Some(obj) = map.as_object_mut() {
            obj.insert(key.to_string(), value.into());
        }
        self
    }

    /// Detail lookup, used by retry logic to read e.g. the upstream status.
    pub fn detail_u64(&self, key: &str) -> Option<u64> {
        self.details.as_ref()?.get(key)?.as_u64()
    }

    /// Whether a retry has a realistic chance of succeeding.
    ///
    /// Transient: network, timeout, 5xx and 429 upstream statuses. Everything
    /// else (other 4xx, parse, captcha, validation) is deterministic.
    pub fn is_transient(&self) -> bool {
        match self.kind {
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::RateLimited => true,
            ErrorKind::HttpStatus => self.detail_u64("status").map(|s| s >= 500).unwrap_or(false),
            _ => false,
        }
    }

    /// The `{"error": {...}}` envelope served on every failing JSON response.
    pub fn envelope(&self) -> serde_json::Value {
        let mut inner = serde_json::json!({
            "kind": self.kind.as_str(),
            "message": self.message,
        });
        if let Some(details) = &self.details {
            inner["details"] = details.clone();
        }
        serde_json::json!({ "error": inner })
    }

    pub fn status(&self) -> StatusCode {
        match self.kind {
            ErrorKind::InvalidInput | ErrorKind::UnsupportedScheme => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::LockConflict => StatusCode::CONFLICT,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Network | ErrorKind::HttpStatus | ErrorKind::CaptchaBlocked => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// CLI exit code: 1 for user errors, 2 for operational failures.
    pub fn exit_code(&self) -> i32 {
        match self.kind {
            ErrorKind::InvalidInput | ErrorKind::UnsupportedScheme => 1,
            _ => 2,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::io(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::timeout(e.to_string())
        } else {
            Error::network(e.to_string())
        }
    }
}
