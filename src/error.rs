use std::path::PathBuf;

use thiserror::Error;

/// Result type for echo-remote operations
pub type Result<T> = std::result::Result<T, EchoError>;

/// Challenge kinds that need input from the caller before login can continue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    /// Corrected credentials (the service rejected the submitted ones)
    Credentials,
    /// Text transcription of a CAPTCHA image
    Captcha,
    /// A one-time password from an authenticator app
    Otp,
    /// An out-of-band verification code (sent by SMS or email)
    DeviceVerification,
}

impl std::fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Credentials => write!(f, "credentials"),
            Self::Captcha => write!(f, "captcha"),
            Self::Otp => write!(f, "one-time password"),
            Self::DeviceVerification => write!(f, "device verification code"),
        }
    }
}

/// Errors that can occur while authenticating against or talking to the service
#[derive(Error, Debug)]
pub enum EchoError {
    /// The OTP shared secret is not valid base32
    #[error("invalid OTP seed: {0}")]
    InvalidSeed(String),

    /// A persisted session blob could not be decoded
    #[error("corrupt session data: {0}")]
    CorruptSession(String),

    /// Reading or writing the session file failed
    #[error("session storage unavailable at {path}: {source}")]
    StorageUnavailable {
        /// Path that was being read or written
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The server returned something the protocol layer cannot interpret
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The service rejected the login terminally (bad credentials, OTP budget
    /// exhausted, or an anti-automation interstitial)
    #[error("authentication rejected: {0}")]
    AuthenticationRejected(String),

    /// Login cannot continue without caller input for this challenge
    #[error("login requires {0} input")]
    InteractionRequired(ChallengeKind),

    /// An authenticated call was made without a session
    #[error("not authenticated")]
    NotAuthenticated,

    /// The session expired and re-authentication did not recover it
    #[error("session expired")]
    SessionExpired,

    /// The service is throttling us
    #[error("too many requests")]
    TooManyRequests,

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket connection error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection was closed unexpectedly
    #[error("connection closed")]
    ConnectionClosed,

    /// Request timed out waiting for response
    #[error("request timeout")]
    Timeout,

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Channel receive error
    #[error("channel error: {0}")]
    ChannelError(String),
}
