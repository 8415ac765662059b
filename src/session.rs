//! Session ownership and the authenticated API surface.
//!
//! `EchoClient` is the one writer of session state. The login flow hands
//! it a fresh `SessionState`, `execute` spends it, and the push channel
//! observes it read-only through a watch handle. When the service expires
//! the cookies mid-call, the client re-authenticates once, single-flight,
//! and retries the call.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use reqwest::cookie::Jar;
use reqwest::{StatusCode, Url};
use tokio::sync::{watch, Mutex};

use crate::error::{EchoError, Result};
use crate::login::{self, LoginFlow};
use crate::protocol::{is_signin_url, ApiRequest, ApiResponse, Bootstrap, Endpoints};
use crate::push::{PushChannel, ReconnectPolicy};
use crate::redact::hide_email;
use crate::store;
use crate::subscription::EventReceiver;
use crate::types::{ChallengeAnswer, Credentials, LoginChallenge, SessionState};

/// A login flow parked between a challenge and its answer
struct PendingLogin {
    flow: LoginFlow,
    challenge: LoginChallenge,
}

/// Client for the speaker cloud service.
///
/// The `EchoClient` owns the authenticated session: it drives the login
/// handshake, persists and restores cookies, renews them when the service
/// expires them, and runs the push channel that delivers device events.
///
/// # Example
///
/// ```no_run
/// use echo_remote::{Credentials, EchoClient, Endpoints};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let endpoints = Endpoints::for_domain("amazon.com")?;
///     let credentials = Credentials::new("user@example.com", "hunter2")
///         .with_otp_seed("JBSWY3DPEHPK3PXP");
///     let client = EchoClient::new(endpoints, credentials)?
///         .with_session_file("echo-session.json");
///
///     client.authenticate().await?;
///     let mut events = client.start_push().await?;
///     while let Ok(event) = events.recv().await {
///         println!("{:?}", event);
///     }
///     Ok(())
/// }
/// ```
pub struct EchoClient {
    endpoints: Endpoints,
    credentials: Credentials,
    client: reqwest::Client,
    jar: Arc<Jar>,
    session_file: Option<PathBuf>,
    push_policy: ReconnectPolicy,
    session_tx: watch::Sender<Option<SessionState>>,
    pending: Mutex<Option<PendingLogin>>,
    push: Mutex<Option<PushChannel>>,
    auth_generation: AtomicU64,
    auth_lock: Mutex<()>,
    closed: AtomicBool,
}

impl EchoClient {
    /// Create an unauthenticated client for the given endpoints
    pub fn new(endpoints: Endpoints, credentials: Credentials) -> Result<Self> {
        let (client, jar) = login::http_client()?;
        let (session_tx, _session_rx) = watch::channel(None);
        Ok(Self {
            endpoints,
            credentials,
            client,
            jar,
            session_file: None,
            push_policy: ReconnectPolicy::default(),
            session_tx,
            pending: Mutex::new(None),
            push: Mutex::new(None),
            auth_generation: AtomicU64::new(0),
            auth_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    /// Persist the session to `path` whenever it changes
    pub fn with_session_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.session_file = Some(path.into());
        self
    }

    /// Override the push channel's reconnect timing
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.push_policy = policy;
        self
    }

    /// The session currently held, if any
    pub fn session(&self) -> Option<SessionState> {
        self.session_tx.borrow().clone()
    }

    /// Whether a session has been adopted
    pub fn is_authenticated(&self) -> bool {
        self.session_tx.borrow().is_some()
    }

    /// The challenge waiting for [`answer_challenge`](Self::answer_challenge),
    /// if login is paused on one
    pub async fn pending_challenge(&self) -> Option<LoginChallenge> {
        self.pending
            .lock()
            .await
            .as_ref()
            .map(|pending| pending.challenge.clone())
    }

    /// Log in with the configured credentials.
    ///
    /// When the service asks for something only the caller can supply (a
    /// CAPTCHA transcription, a one-time password without a configured
    /// seed, a device verification code), this returns
    /// [`EchoError::InteractionRequired`]; fetch the details with
    /// [`pending_challenge`](Self::pending_challenge) and resume with
    /// [`answer_challenge`](Self::answer_challenge).
    pub async fn authenticate(&self) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.auth_lock.lock().await;
        let state = self.run_login().await?;
        self.adopt(state).await
    }

    /// Answer the pending login challenge and continue the handshake
    pub async fn answer_challenge(&self, answer: ChallengeAnswer) -> Result<()> {
        self.ensure_open()?;
        let mut pending = self.pending.lock().await;
        let Some(mut login) = pending.take() else {
            return Err(EchoError::Protocol("no login challenge is pending".to_string()));
        };
        match login.flow.step(answer).await? {
            LoginChallenge::Authenticated(state) => {
                drop(pending);
                self.adopt(state).await
            }
            challenge => {
                let kind = challenge
                    .kind()
                    .ok_or_else(|| EchoError::Protocol("challenge without an input kind".to_string()))?;
                *pending = Some(PendingLogin {
                    flow: login.flow,
                    challenge,
                });
                Err(EchoError::InteractionRequired(kind))
            }
        }
    }

    /// Adopt a previously serialized session without logging in.
    ///
    /// The blob is validated for the cookies the service requires; a blob
    /// that does not decode leaves the client unauthenticated.
    pub async fn restore(&self, blob: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let state = store::deserialize(blob)?;
        state.validate()?;
        self.seed_jar(&state)?;
        tracing::info!("session restored from blob");
        self.adopt(state).await
    }

    /// Adopt the session saved at `path`
    pub async fn restore_from_path(&self, path: impl Into<PathBuf>) -> Result<()> {
        self.ensure_open()?;
        let path = path.into();
        let state = store::load(&path).await?;
        state.validate()?;
        self.seed_jar(&state)?;
        tracing::info!("session restored from {}", path.display());
        self.adopt(state).await
    }

    /// Check with the service that the held cookies still authenticate the
    /// configured account.
    ///
    /// Returns `Ok(false)` when the service no longer recognizes the
    /// session or it belongs to a different account. On success the
    /// customer id reported by the service is refreshed.
    pub async fn verify(&self) -> Result<bool> {
        self.ensure_open()?;
        if !self.is_authenticated() {
            return Err(EchoError::NotAuthenticated);
        }
        let url = self.endpoints.api_url("/api/bootstrap")?;
        let response = self.client.get(url).send().await?;
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(EchoError::TooManyRequests);
        }
        if !response.status().is_success() {
            return Ok(false);
        }
        let bootstrap: Bootstrap = match response.json().await {
            Ok(bootstrap) => bootstrap,
            Err(_) => return Ok(false),
        };
        let auth = bootstrap.authentication;
        if !auth.authenticated {
            return Ok(false);
        }
        let confirmed = match auth.customer_email.as_deref() {
            // Mobile-registered accounts report no email; trust the cookies
            None | Some("") => true,
            Some(email) => email.eq_ignore_ascii_case(&self.credentials.email),
        };
        if confirmed {
            self.session_tx.send_modify(|session| {
                if let Some(state) = session {
                    state.customer_id = auth.customer_id.clone();
                    if let Some(email) = auth.customer_email.as_deref().filter(|e| !e.is_empty()) {
                        state.customer_email = Some(email.to_string());
                    }
                }
            });
            tracing::debug!("session verified for {}", hide_email(&self.credentials.email));
        } else {
            tracing::warn!("session belongs to a different account");
        }
        Ok(confirmed)
    }

    /// Perform an authenticated API call.
    ///
    /// The `csrf` header is attached from the session. If the service
    /// reports the session expired (HTTP 401, or a redirect back to the
    /// sign-in page), the client re-authenticates once and retries the
    /// call once; concurrent expired calls share a single re-login.
    /// HTTP 429 surfaces as [`EchoError::TooManyRequests`] without retry.
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse> {
        self.ensure_open()?;
        let mut renewed = false;
        loop {
            let generation = self.auth_generation.load(Ordering::Acquire);
            let session = self.session().ok_or(EchoError::NotAuthenticated)?;

            if !renewed && is_stale(&session) {
                tracing::info!("session is past its expiry hint; renewing first");
                renewed = true;
                self.reauthenticate(generation).await?;
                continue;
            }

            let response = self.send_api(&request, &session).await?;
            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                return Err(EchoError::TooManyRequests);
            }
            if status == StatusCode::UNAUTHORIZED || is_signin_url(response.url()) {
                if renewed {
                    tracing::warn!(
                        "session still rejected after re-authentication for {} {}",
                        request.method(),
                        request.path()
                    );
                    return Err(EchoError::SessionExpired);
                }
                tracing::info!(
                    "session expired during {} {}; re-authenticating",
                    request.method(),
                    request.path()
                );
                renewed = true;
                self.reauthenticate(generation).await?;
                continue;
            }

            let body = response.text().await?;
            return Ok(ApiResponse { status, body });
        }
    }

    /// Start the push channel and subscribe to its events.
    ///
    /// Starting an already-running channel just adds a subscriber.
    pub async fn start_push(&self) -> Result<EventReceiver> {
        self.ensure_open()?;
        if !self.is_authenticated() {
            return Err(EchoError::NotAuthenticated);
        }
        let mut push = self.push.lock().await;
        let channel = push.get_or_insert_with(|| {
            PushChannel::new(
                self.endpoints.clone(),
                self.push_policy.clone(),
                self.session_tx.subscribe(),
            )
        });
        channel.start()?;
        Ok(channel.subscribe())
    }

    /// Subscribe to push events on the already-started channel
    pub async fn subscribe(&self) -> Result<EventReceiver> {
        self.ensure_open()?;
        let push = self.push.lock().await;
        match push.as_ref() {
            Some(channel) => Ok(channel.subscribe()),
            None => Err(EchoError::Protocol("push channel has not been started".to_string())),
        }
    }

    /// Stop the push channel and mark the client closed.
    ///
    /// Idempotent; operations after the first close fail with
    /// [`EchoError::ConnectionClosed`].
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mut channel) = self.push.lock().await.take() {
            channel.stop().await;
        }
        tracing::info!("client closed");
    }

    /// Close the client, forget the session, and delete the session file
    pub async fn reset(&self) -> Result<()> {
        self.close().await;
        self.session_tx.send_replace(None);
        *self.pending.lock().await = None;
        if let Some(path) = &self.session_file {
            store::remove(path).await?;
        }
        tracing::info!("client state reset");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EchoError::ConnectionClosed);
        }
        Ok(())
    }

    /// Drive a fresh login flow; challenges that need input are parked for
    /// [`answer_challenge`](Self::answer_challenge)
    async fn run_login(&self) -> Result<SessionState> {
        *self.pending.lock().await = None;
        let mut flow = LoginFlow::with_client(
            self.credentials.clone(),
            self.endpoints.clone(),
            self.client.clone(),
            self.jar.clone(),
        )?;
        match flow.start().await? {
            LoginChallenge::Authenticated(state) => Ok(state),
            challenge => {
                let kind = challenge
                    .kind()
                    .ok_or_else(|| EchoError::Protocol("challenge without an input kind".to_string()))?;
                *self.pending.lock().await = Some(PendingLogin { flow, challenge });
                Err(EchoError::InteractionRequired(kind))
            }
        }
    }

    /// Re-login with the stored credentials, single-flight: the first
    /// expired caller logs in, the rest wait and then skip
    async fn reauthenticate(&self, seen_generation: u64) -> Result<()> {
        let _guard = self.auth_lock.lock().await;
        if self.auth_generation.load(Ordering::Acquire) != seen_generation {
            tracing::debug!("session already renewed by another call");
            return Ok(());
        }
        let state = self.run_login().await?;
        self.adopt(state).await
    }

    /// Publish a new session and persist it when configured
    async fn adopt(&self, state: SessionState) -> Result<()> {
        tracing::debug!(
            "adopting session for customer {}",
            state.customer_id.as_deref().unwrap_or("unknown")
        );
        self.session_tx.send_replace(Some(state.clone()));
        self.auth_generation.fetch_add(1, Ordering::Release);
        if let Some(path) = &self.session_file {
            store::save(path, &state).await?;
            tracing::debug!("session saved to {}", path.display());
        }
        Ok(())
    }

    /// Load a restored session's cookies into the shared jar so plain
    /// requests carry them
    fn seed_jar(&self, state: &SessionState) -> Result<()> {
        for (host, cookies) in &state.cookies {
            let url = Url::parse(&format!("https://{host}/")).map_err(|_| {
                EchoError::CorruptSession(format!("invalid cookie host {host:?}"))
            })?;
            for (name, value) in cookies {
                self.jar.add_cookie_str(&format!("{name}={value}; Path=/"), &url);
            }
        }
        Ok(())
    }

    async fn send_api(
        &self,
        request: &ApiRequest,
        session: &SessionState,
    ) -> Result<reqwest::Response> {
        let url = self.endpoints.api_url(request.path())?;
        let mut builder = self.client.request(request.method().clone(), url);
        if !request.query().is_empty() {
            builder = builder.query(request.query());
        }
        builder = builder.header("csrf", &session.csrf);
        if let Some(body) = request.body() {
            builder = builder.json(body);
        }
        Ok(builder.send().await?)
    }
}

/// Whether the expiry hint, when present, has passed
fn is_stale(state: &SessionState) -> bool {
    state.expires_at.is_some_and(|at| at <= Utc::now())
}
