//! Rust client for the Echo smart-speaker cloud service
//!
//! This library speaks the same unofficial web API the vendor's own apps
//! use. It supports:
//!
//! - The multi-step HTML login handshake (credentials, CAPTCHA, one-time
//!   passwords, device verification)
//! - Automatic one-time passwords from a configured TOTP seed
//! - Session persistence: cookies survive process restarts and are
//!   renewed single-flight when the service expires them
//! - Authenticated API calls with the csrf header attached
//! - A push channel delivering device-state events over the gateway
//!   WebSocket, with jittered reconnect backoff
//!
//! The API is unofficial: endpoints, markup and frames follow what the
//! service actually serves, not any published contract.
//!
//! # Quick Start
//!
//! ```no_run
//! use echo_remote::{ApiRequest, Credentials, EchoClient, Endpoints};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let endpoints = Endpoints::for_domain("amazon.com")?;
//!     let credentials = Credentials::new("user@example.com", "hunter2")
//!         .with_otp_seed("JBSWY3DPEHPK3PXP");
//!
//!     let client = EchoClient::new(endpoints, credentials)?
//!         .with_session_file("echo-session.json");
//!     client.authenticate().await?;
//!
//!     // Authenticated API call
//!     let devices = client.execute(ApiRequest::get("/api/devices-v2/device")).await?;
//!     println!("{}", devices.body);
//!
//!     // Device events as they happen
//!     let mut events = client.start_push().await?;
//!     while let Ok(event) = events.recv().await {
//!         println!("{:?} from {:?}", event.kind, event.device_serial);
//!     }
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Restoring a saved session
//!
//! A persisted session skips the login handshake entirely:
//!
//! ```no_run
//! use echo_remote::{Credentials, EchoClient, Endpoints};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let endpoints = Endpoints::for_domain("amazon.com")?;
//!     let credentials = Credentials::new("user@example.com", "hunter2");
//!     let client = EchoClient::new(endpoints, credentials)?;
//!
//!     client.restore_from_path("echo-session.json").await?;
//!     if !client.verify().await? {
//!         client.authenticate().await?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! The library is organized into several layers:
//!
//! - **Session**: `EchoClient`, the session owner and API surface
//! - **Login**: the HTML handshake state machine
//! - **Protocol**: endpoints, page classification, request/response types
//! - **Push**: the gateway WebSocket connection and reconnect loop
//! - **Frame**: the binary gateway frame codec
//! - **Store**: session blob serialization and file persistence
//! - **Types**: credentials, session state, challenges, events

mod error;
pub mod frame;
mod login;
mod protocol;
mod push;
mod redact;
mod session;
pub mod store;
mod subscription;
mod totp;
mod types;

// Public exports
pub use error::{ChallengeKind, EchoError, Result};
pub use login::LoginFlow;
pub use protocol::{ApiRequest, ApiResponse, Endpoints};
pub use push::{ChannelState, PushChannel, ReconnectPolicy};
pub use session::EchoClient;
pub use subscription::EventReceiver;
pub use totp::Totp;
pub use types::{
    ChallengeAnswer, Credentials, LoginChallenge, PushEvent, PushEventKind, SessionState,
};

/// Re-exported because [`Endpoints::custom`] takes one
pub use reqwest::Url;
