//! Error types for the session manager, the store and the realtime channel

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Reasons a bearer token could not be turned into claims
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("expected 3 dot-separated segments, found {0}")]
    SegmentCount(usize),
    #[error("payload is not valid base64: {0}")]
    Base64(String),
    #[error("payload is not valid UTF-8")]
    Utf8,
    #[error("payload is not valid JSON: {0}")]
    Json(String),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("claims carry no numeric 'exp' field")]
    MissingExpiry,
}

/// Errors raised by the authentication flow
#[derive(Debug, Error)]
pub enum AuthError {
    /// The environment cannot provide secure randomness; fatal for the generator
    #[error("Secure random source unavailable: {0}")]
    RandomnessUnavailable(String),

    #[error("Malformed token: {0}")]
    MalformedToken(#[from] TokenError),

    /// Code exchange failed; the session is back to unauthenticated
    #[error("Login failed: {0}")]
    ExchangeFailed(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Identity provider rejected the request: {0}")]
    Provider(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Invalid provider configuration: {0}")]
    InvalidConfig(String),
}

/// Key-value store errors. Only writes surface these; reads fall back.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to serialize value for '{key}': {source}")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Keyring error: {0}")]
    Keyring(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("No config directory available")]
    NoConfigDir,
}

/// Realtime channel errors
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Realtime channel is not connected")]
    NotConnected,
    #[error("Failed to send message: {0}")]
    Send(String),
}

/// Loopback callback server errors
#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("Redirect URI '{0}' must be an http URL on a loopback address")]
    InvalidRedirect(String),
    #[error("Failed to bind callback server on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("No authorization redirect received within {0:?}")]
    Timeout(Duration),
    #[error("Callback server stopped before a redirect arrived")]
    Closed,
}

/// Application-level error used by the command line host
#[derive(Debug)]
pub enum AppError {
    InvalidInput(String),
    LoginFailed(String),
    NetworkError(String),
    ChannelError(String),
    StorageError(String),
    Timeout(String),
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            AppError::LoginFailed(msg) => write!(f, "Login failed: {}", msg),
            AppError::NetworkError(msg) => write!(f, "Network error: {}", msg),
            AppError::ChannelError(msg) => write!(f, "Channel error: {}", msg),
            AppError::StorageError(msg) => write!(f, "Storage error: {}", msg),
            AppError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    /// Stable machine-readable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::InvalidInput(_) => "invalid_input",
            AppError::LoginFailed(_) => "login_failed",
            AppError::NetworkError(_) => "network_error",
            AppError::ChannelError(_) => "channel_error",
            AppError::StorageError(_) => "storage_error",
            AppError::Timeout(_) => "timeout",
            AppError::Internal(_) => "internal_error",
        }
    }

    /// Process exit code for the command line host
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::InvalidInput(_) => 1,
            AppError::NetworkError(_) | AppError::ChannelError(_) => 2,
            AppError::LoginFailed(_) => 3,
            AppError::Timeout(_) => 4,
            AppError::StorageError(_) | AppError::Internal(_) => 5,
        }
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::ExchangeFailed(msg) | AuthError::Provider(msg) => AppError::LoginFailed(msg),
            AuthError::Network(msg) => AppError::NetworkError(msg),
            AuthError::Storage(e) => AppError::StorageError(e.to_string()),
            AuthError::InvalidConfig(msg) => AppError::InvalidInput(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::StorageError(err.to_string())
    }
}

impl From<ChannelError> for AppError {
    fn from(err: ChannelError) -> Self {
        AppError::ChannelError(err.to_string())
    }
}

impl From<CallbackError> for AppError {
    fn from(err: CallbackError) -> Self {
        match err {
            CallbackError::InvalidRedirect(_) => AppError::InvalidInput(err.to_string()),
            CallbackError::Timeout(_) => AppError::Timeout(err.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}
