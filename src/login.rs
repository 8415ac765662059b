//! Login handshake.
//!
//! The service has no token endpoint; signing in means walking the retail
//! site's HTML login like a browser would. [`LoginFlow`] drives that walk:
//! it fetches a page, classifies it, answers what it can on its own
//! (credentials, TOTP codes, picker forms) and surfaces everything else as
//! a [`LoginChallenge`] for the caller. Hidden form inputs are echoed back
//! verbatim, so server-side additions pass through untouched.

use std::collections::BTreeMap;
use std::sync::Arc;

use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::Url;

use crate::error::{EchoError, Result};
use crate::protocol::{
    Bootstrap, BootstrapAuthentication, Endpoints, LoginPage, PageKind, USER_AGENT,
};
use crate::redact::hide_email;
use crate::totp::Totp;
use crate::types::{ChallengeAnswer, Credentials, LoginChallenge, SessionState};

/// Automatic one-time-password submissions before giving up
const MAX_OTP_ATTEMPTS: u32 = 3;

/// Page exchanges in a single advance before declaring a loop
const MAX_STEPS: u32 = 10;

/// Shared HTTP client with browser headers and a cookie jar.
///
/// The jar is returned separately because the session keeps feeding it
/// (restores) and reading it back (harvesting after login).
pub(crate) fn http_client() -> Result<(reqwest::Client, Arc<Jar>)> {
    let jar = Arc::new(Jar::default());
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US;q=0.9"));
    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .default_headers(headers)
        .cookie_provider(jar.clone())
        .referer(true)
        .build()?;
    Ok((client, jar))
}

/// Drives the multi-step login handshake.
///
/// ```no_run
/// use echo_remote::{Credentials, Endpoints, LoginChallenge, LoginFlow};
///
/// # async fn run() -> echo_remote::Result<()> {
/// let credentials = Credentials::new("jenny@example.com", "secret")
///     .with_otp_seed("GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ");
/// let endpoints = Endpoints::for_domain("amazon.com")?;
/// let mut flow = LoginFlow::new(credentials, endpoints)?;
/// match flow.start().await? {
///     LoginChallenge::Authenticated(session) => { /* keep it */ }
///     challenge => { /* ask the user, then flow.step(answer) */ }
/// }
/// # Ok(())
/// # }
/// ```
pub struct LoginFlow {
    credentials: Credentials,
    endpoints: Endpoints,
    client: reqwest::Client,
    jar: Arc<Jar>,
    totp: Option<Totp>,
    page: Option<LoginPage>,
    current_url: Url,
    credentials_submitted: bool,
    otp_attempts: u32,
    finished: bool,
}

impl LoginFlow {
    /// Create a flow with its own HTTP client.
    ///
    /// A configured TOTP seed is validated here, before any network I/O.
    pub fn new(credentials: Credentials, endpoints: Endpoints) -> Result<Self> {
        let (client, jar) = http_client()?;
        Self::with_client(credentials, endpoints, client, jar)
    }

    /// Create a flow on an existing client so harvested cookies land in the
    /// caller's jar
    pub(crate) fn with_client(
        credentials: Credentials,
        endpoints: Endpoints,
        client: reqwest::Client,
        jar: Arc<Jar>,
    ) -> Result<Self> {
        let totp = credentials.otp_seed.as_deref().map(Totp::new).transpose()?;
        let current_url = endpoints.api_base().clone();
        Ok(Self {
            credentials,
            endpoints,
            client,
            jar,
            totp,
            page: None,
            current_url,
            credentials_submitted: false,
            otp_attempts: 0,
            finished: false,
        })
    }

    /// Fetch the sign-in page and submit credentials.
    ///
    /// Returns the first challenge that needs caller input, or
    /// [`LoginChallenge::Authenticated`] when the handshake completed on
    /// its own.
    pub async fn start(&mut self) -> Result<LoginChallenge> {
        tracing::info!(
            "starting login for {} at {}",
            hide_email(&self.credentials.email),
            self.endpoints.domain()
        );
        let response = self.client.get(self.endpoints.api_base().clone()).send().await?;
        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(EchoError::TooManyRequests);
        }
        self.current_url = response.url().clone();
        let html = response.text().await?;
        self.page = Some(LoginPage::parse(&html, &self.current_url));
        self.advance(None).await
    }

    /// Answer the pending challenge and continue the handshake
    pub async fn step(&mut self, answer: ChallengeAnswer) -> Result<LoginChallenge> {
        if self.finished {
            return Err(EchoError::Protocol("login flow already completed".to_string()));
        }
        if self.page.is_none() {
            return Err(EchoError::Protocol("login flow was not started".to_string()));
        }
        self.advance(Some(answer)).await
    }

    async fn advance(&mut self, mut answer: Option<ChallengeAnswer>) -> Result<LoginChallenge> {
        for _ in 0..MAX_STEPS {
            let page = self
                .page
                .clone()
                .ok_or_else(|| EchoError::Protocol("no login page loaded".to_string()))?;

            match page.kind {
                PageKind::SignIn => {
                    let supplied = matches!(answer, Some(ChallengeAnswer::Password(_)));
                    if self.credentials_submitted && !supplied {
                        let message = page.error_message.clone().unwrap_or_else(|| {
                            "the sign-in form was presented again".to_string()
                        });
                        tracing::warn!("credentials rejected: {}", message);
                        return Ok(LoginChallenge::Credentials { message });
                    }
                    tracing::debug!("submitting credentials");
                    self.submit_page(&page, answer.take()).await?;
                    self.credentials_submitted = true;
                }

                PageKind::Captcha => {
                    let Some(image_url) = page.captcha_url.clone() else {
                        return Err(EchoError::Protocol(
                            "captcha requested without an image".to_string(),
                        ));
                    };
                    if matches!(answer, Some(ChallengeAnswer::Captcha(_))) {
                        tracing::debug!("submitting captcha answer");
                        self.submit_page(&page, answer.take()).await?;
                        self.credentials_submitted = true;
                    } else {
                        tracing::info!("captcha requested: {}", image_url);
                        return Ok(LoginChallenge::Captcha { image_url });
                    }
                }

                PageKind::Otp => {
                    if matches!(answer, Some(ChallengeAnswer::Otp(_))) {
                        tracing::debug!("submitting caller-provided one-time password");
                        self.submit_page(&page, answer.take()).await?;
                    } else if self.totp.is_some() {
                        if self.otp_attempts >= MAX_OTP_ATTEMPTS {
                            return Err(EchoError::AuthenticationRejected(format!(
                                "one-time password rejected after {} attempts",
                                MAX_OTP_ATTEMPTS
                            )));
                        }
                        self.otp_attempts += 1;
                        tracing::debug!(
                            "submitting generated one-time password (attempt {})",
                            self.otp_attempts
                        );
                        let code = self.totp.as_ref().map(Totp::code).unwrap_or_default();
                        self.submit_page(&page, Some(ChallengeAnswer::Otp(code))).await?;
                    } else {
                        tracing::info!("one-time password required and no seed configured");
                        return Ok(LoginChallenge::Otp);
                    }
                }

                PageKind::ClaimsPicker => {
                    let Some(option) = page.options.first().cloned() else {
                        return Err(EchoError::Protocol(
                            "verification picker offered no destinations".to_string(),
                        ));
                    };
                    tracing::info!("requesting verification code via {}", option);
                    self.submit_page(&page, None).await?;
                }

                PageKind::Verification => {
                    if matches!(answer, Some(ChallengeAnswer::VerificationCode(_))) {
                        tracing::debug!("submitting verification code");
                        self.submit_page(&page, answer.take()).await?;
                    } else {
                        let message = page.prompt.clone().unwrap_or_else(|| {
                            "a verification code was sent to your registered device".to_string()
                        });
                        return Ok(LoginChallenge::DeviceVerification { message });
                    }
                }

                PageKind::Blocked => {
                    let message = page.error_message.clone().unwrap_or_else(|| {
                        "the service blocked this login attempt; wait before retrying".to_string()
                    });
                    tracing::warn!("login blocked: {}", message);
                    return Err(EchoError::AuthenticationRejected(message));
                }

                PageKind::Other => {
                    return match self.confirm_login().await? {
                        Some(auth) => {
                            let state = self.build_session(auth).await?;
                            self.finished = true;
                            tracing::info!(
                                "login confirmed for {}",
                                hide_email(&self.credentials.email)
                            );
                            Ok(LoginChallenge::Authenticated(state))
                        }
                        None => Err(EchoError::AuthenticationRejected(
                            "login could not be confirmed; check credentials".to_string(),
                        )),
                    };
                }
            }
        }
        Err(EchoError::Protocol(
            "login did not converge; the service keeps presenting forms".to_string(),
        ))
    }

    /// Fill the current form and POST it, replacing the current page with
    /// the server's answer
    async fn submit_page(&mut self, page: &LoginPage, answer: Option<ChallengeAnswer>) -> Result<()> {
        let mut form = page.inputs.clone();
        self.fill_form(&mut form, answer.as_ref(), &page.options);

        let action = page
            .action
            .clone()
            .unwrap_or_else(|| self.current_url.clone());
        let response = self.client.post(action).form(&form).send().await?;
        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(EchoError::TooManyRequests);
        }
        self.current_url = response.url().clone();
        let html = response.text().await?;
        tracing::debug!("form response from {}", self.current_url);
        self.page = Some(LoginPage::parse(&html, &self.current_url));
        Ok(())
    }

    /// Mirror of the form contract: only fields the page actually carries
    /// are filled, everything else is echoed back as scraped
    fn fill_form(
        &self,
        form: &mut BTreeMap<String, String>,
        answer: Option<&ChallengeAnswer>,
        options: &[String],
    ) {
        if let Some(email) = form.get_mut("email") {
            if email.is_empty() {
                *email = self.credentials.email.clone();
            }
        }
        if let Some(password) = form.get_mut("password") {
            if password.is_empty() {
                *password = self.credentials.password.clone();
            }
        }
        if form.contains_key("rememberMe") {
            form.insert("rememberMe".to_string(), "true".to_string());
        }
        if let Some(option) = options.first() {
            if form.contains_key("option") {
                form.insert("option".to_string(), option.clone());
            }
            if form.contains_key("otpDeviceContext") {
                form.insert("otpDeviceContext".to_string(), option.clone());
            }
        }

        match answer {
            Some(ChallengeAnswer::Password(password)) => {
                if form.contains_key("password") {
                    form.insert("password".to_string(), password.clone());
                }
            }
            Some(ChallengeAnswer::Captcha(guess)) => {
                if form.contains_key("guess") {
                    form.insert("guess".to_string(), guess.clone());
                }
                if form.contains_key("cvf_captcha_input") {
                    form.insert("cvf_captcha_input".to_string(), guess.clone());
                    form.insert(
                        "cvf_captcha_captcha_action".to_string(),
                        "verifyCaptcha".to_string(),
                    );
                }
            }
            Some(ChallengeAnswer::Otp(code)) => {
                if form.contains_key("otpCode") {
                    form.insert("otpCode".to_string(), code.clone());
                    form.insert("rememberDevice".to_string(), "true".to_string());
                }
            }
            Some(ChallengeAnswer::VerificationCode(code)) => {
                if form.contains_key("code") {
                    form.insert("code".to_string(), code.clone());
                }
            }
            None => {}
        }
    }

    /// The service's own definition of "logged in": the bootstrap document
    /// reports authenticated and names our email. An account with no email
    /// on file (mobile-number registration) passes the name check by
    /// default.
    async fn confirm_login(&self) -> Result<Option<BootstrapAuthentication>> {
        let url = self.endpoints.api_url("/api/bootstrap")?;
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            tracing::debug!("bootstrap returned {}", response.status());
            return Ok(None);
        }
        let bootstrap: Bootstrap = match response.json().await {
            Ok(doc) => doc,
            Err(e) => {
                tracing::debug!("bootstrap unreadable: {}", e);
                return Ok(None);
            }
        };
        let auth = bootstrap.authentication;
        if !auth.authenticated {
            return Ok(None);
        }
        match auth.customer_email.as_deref() {
            None | Some("") => Ok(Some(auth)),
            Some(email) if email.eq_ignore_ascii_case(&self.credentials.email) => Ok(Some(auth)),
            Some(email) => {
                tracing::warn!(
                    "bootstrap names {} but we signed in as {}",
                    hide_email(email),
                    hide_email(&self.credentials.email)
                );
                Ok(None)
            }
        }
    }

    /// Harvest the jar into a portable session
    async fn build_session(&mut self, auth: BootstrapAuthentication) -> Result<SessionState> {
        let mut cookies = self.harvest_cookies();

        // Some accounts only receive the csrf cookie once an API endpoint
        // hands it out
        if !cookies.values().any(|jar| jar.contains_key("csrf")) {
            tracing::debug!("csrf cookie missing; requesting one");
            let url = self.endpoints.api_url("/api/language")?;
            if let Err(e) = self.client.get(url).send().await {
                tracing::debug!("csrf request failed: {}", e);
            }
            cookies = self.harvest_cookies();
        }

        let find = |name: &str| -> Option<String> {
            cookies.values().find_map(|jar| jar.get(name).cloned())
        };
        let Some(csrf) = find("csrf") else {
            return Err(EchoError::Protocol(
                "service granted no csrf cookie".to_string(),
            ));
        };

        let tld = self.endpoints.domain().rsplit('.').next().unwrap_or("");
        let registration_serial = find(&format!("ubid-acb{}", tld))
            .or_else(|| find("ubid-main"))
            .or_else(|| {
                cookies.values().find_map(|jar| {
                    jar.iter()
                        .find(|(name, _)| name.starts_with("ubid-"))
                        .map(|(_, value)| value.clone())
                })
            })
            .unwrap_or_else(|| {
                tracing::warn!("no ubid cookie granted; using a generated registration serial");
                uuid::Uuid::new_v4().to_string()
            });

        Ok(SessionState {
            cookies,
            csrf,
            registration_serial,
            expires_at: None,
            customer_id: auth.customer_id,
            customer_email: auth.customer_email.filter(|e| !e.is_empty()),
        })
    }

    fn harvest_cookies(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        let mut all: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut urls = vec![self.endpoints.api_base().clone()];
        if self.current_url.host_str() != self.endpoints.api_base().host_str() {
            urls.push(self.current_url.clone());
        }
        for url in urls {
            let Some(host) = url.host_str() else { continue };
            let Some(header) = self.jar.cookies(&url) else {
                continue;
            };
            let Ok(text) = header.to_str() else { continue };
            let domain = all.entry(host.to_string()).or_default();
            for pair in text.split("; ") {
                if let Some((name, value)) = pair.split_once('=') {
                    domain.insert(name.to_string(), value.to_string());
                }
            }
        }
        all
    }
}
