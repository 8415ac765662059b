use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ChallengeKind, EchoError, Result};
use crate::redact::hide_email;

/// Account credentials used to drive the login handshake.
///
/// Never serialized and never logged in the clear; `Debug` obfuscates the
/// email and hides the password entirely.
#[derive(Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
    /// Base32 TOTP shared secret. When present, one-time-password
    /// challenges are answered automatically.
    pub otp_seed: Option<String>,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            otp_seed: None,
        }
    }

    /// Attach a TOTP shared secret for automatic two-factor handling
    pub fn with_otp_seed(mut self, seed: impl Into<String>) -> Self {
        self.otp_seed = Some(seed.into());
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &hide_email(&self.email))
            .field("password", &format_args!("<{} chars>", self.password.len()))
            .field("otp_seed", &self.otp_seed.as_ref().map(|_| "<set>"))
            .finish()
    }
}

/// Authenticated session material harvested after a successful login.
///
/// This is the unit of persistence: the store serializes it to an opaque
/// blob and a later process restores it to skip the login handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    /// Cookies by domain, then by name. BTreeMap keeps serialization
    /// deterministic.
    pub cookies: BTreeMap<String, BTreeMap<String, String>>,

    /// Value of the `csrf` cookie, echoed back as the `csrf` header on
    /// every API call.
    pub csrf: String,

    /// Device-registration identifier sent as `x-amz-device-serial` when
    /// opening the push gateway.
    pub registration_serial: String,

    /// Expiry hint, when the server provided one. `None` means unknown;
    /// expiry is then only discovered by a rejected request.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub customer_id: Option<String>,

    /// Email the session was established for, kept for re-verification
    /// after a restore.
    #[serde(default)]
    pub customer_email: Option<String>,
}

impl SessionState {
    /// Look up a cookie value by name across all domains
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .values()
            .find_map(|jar| jar.get(name))
            .map(String::as_str)
    }

    /// First cookie whose name starts with the given prefix
    pub fn cookie_with_prefix(&self, prefix: &str) -> Option<(&str, &str)> {
        self.cookies.values().find_map(|jar| {
            jar.iter()
                .find(|(name, _)| name.starts_with(prefix))
                .map(|(name, value)| (name.as_str(), value.as_str()))
        })
    }

    /// Render all cookies as a single `Cookie` header value.
    ///
    /// Cookies with the same name in several domains collapse to one entry,
    /// later domains winning, which matches how the jar was harvested.
    pub fn cookie_header(&self) -> String {
        let mut merged: BTreeMap<&str, &str> = BTreeMap::new();
        for jar in self.cookies.values() {
            for (name, value) in jar {
                merged.insert(name, value);
            }
        }
        merged
            .into_iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Check that the cookies a usable session requires are present.
    ///
    /// The service authenticates API calls with the `csrf` cookie/header
    /// pair plus a `ubid-*` device cookie (`ubid-main`, or the regional
    /// `ubid-acb*` variants). A state missing either can never make an
    /// authenticated call, so restoring it is refused up front.
    pub fn validate(&self) -> Result<()> {
        if self.csrf.is_empty() || self.cookie("csrf").is_none() {
            return Err(EchoError::CorruptSession(
                "missing required cookie: csrf".to_string(),
            ));
        }
        if self.cookie_with_prefix("ubid-").is_none() {
            return Err(EchoError::CorruptSession(
                "missing required cookie: ubid-*".to_string(),
            ));
        }
        Ok(())
    }
}

/// Next step the login handshake needs from the caller.
#[derive(Debug, Clone)]
pub enum LoginChallenge {
    /// The sign-in form was presented again, typically after a rejected
    /// password. `message` carries the server's error text when present.
    Credentials { message: String },

    /// A captcha image must be solved by a human
    Captcha { image_url: String },

    /// A one-time password is required and no TOTP seed was configured
    Otp,

    /// The account requires out-of-band device verification; a code was
    /// sent to a registered destination (SMS or email).
    DeviceVerification { message: String },

    /// Terminal: the handshake completed and produced a session
    Authenticated(SessionState),
}

impl LoginChallenge {
    /// The kind of input needed to answer this challenge, `None` for the
    /// terminal state
    pub fn kind(&self) -> Option<ChallengeKind> {
        match self {
            Self::Credentials { .. } => Some(ChallengeKind::Credentials),
            Self::Captcha { .. } => Some(ChallengeKind::Captcha),
            Self::Otp => Some(ChallengeKind::Otp),
            Self::DeviceVerification { .. } => Some(ChallengeKind::DeviceVerification),
            Self::Authenticated(_) => None,
        }
    }
}

/// Caller-supplied answer to a [`LoginChallenge`].
#[derive(Clone)]
pub enum ChallengeAnswer {
    Password(String),
    Captcha(String),
    Otp(String),
    VerificationCode(String),
}

impl fmt::Debug for ChallengeAnswer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(<hidden>)"),
            Self::Captcha(s) => write!(f, "Captcha({:?})", s),
            Self::Otp(_) => f.write_str("Otp(<hidden>)"),
            Self::VerificationCode(_) => f.write_str("VerificationCode(<hidden>)"),
        }
    }
}

/// Broad classification of a push-gateway event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushEventKind {
    /// A device reported a state change (volume, player, bluetooth, ...)
    DeviceStateChanged,

    /// New interaction activity is available for retrieval
    PushActivity,

    /// The gateway acknowledged our connection registration
    CommandAcknowledged,

    /// Command this library does not classify; payload passed through
    Unknown,
}

/// One event delivered over the push gateway
#[derive(Debug, Clone)]
pub struct PushEvent {
    pub kind: PushEventKind,

    /// Raw command name from the wire, e.g. `PUSH_VOLUME_CHANGE`
    pub command: String,

    /// Serial of the device the event concerns, when the payload names one
    pub device_serial: Option<String>,

    /// Decoded payload, untouched beyond JSON parsing
    pub payload: serde_json::Value,
}
