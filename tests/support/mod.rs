//! In-process doubles of the service for integration tests: an HTTP origin
//! serving the login handshake and API routes, and a push-gateway
//! WebSocket scripted per scenario.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Form, State};
use axum::http::header::SET_COOKIE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Json, Redirect, Response};
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use echo_remote::{Endpoints, SessionState, Totp, Url};

pub const TEST_EMAIL: &str = "user@example.com";
pub const TEST_PASSWORD: &str = "hunter2";
/// Base32 of the RFC 6238 reference secret
pub const OTP_SEED: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";
pub const UBID: &str = "123-4567890-1234567";
pub const DEVICE_SERIAL: &str = "G090LF0964640000";
pub const VERIFY_CODE: &str = "31415";

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Session blob contents a client would have harvested from `host`
pub fn session_fixture(host: &str, csrf: &str, serial: &str) -> SessionState {
    let mut names = BTreeMap::new();
    names.insert("csrf".to_string(), csrf.to_string());
    names.insert("session-id".to_string(), "sid-restored".to_string());
    names.insert("ubid-main".to_string(), serial.to_string());
    let mut cookies = BTreeMap::new();
    cookies.insert(host.to_string(), names);
    SessionState {
        cookies,
        csrf: csrf.to_string(),
        registration_serial: serial.to_string(),
        ..SessionState::default()
    }
}

// ---------------------------------------------------------------------------
// HTTP origin

/// How the sign-in endpoint behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginScenario {
    /// Credentials alone complete the login
    Plain,
    /// A captcha is demanded before credentials are accepted
    Captcha,
    /// Captcha markup without a usable image source
    CaptchaMissingImage,
    /// One-time password checked against [`OTP_SEED`]
    Otp,
    /// Every one-time password is rejected
    OtpReject,
    /// A verification code is sent out of band; [`VERIFY_CODE`] completes it
    DeviceVerify,
    /// The forgot-password interstitial blocks the attempt
    Blocked,
}

/// How the authenticated API endpoint behaves
#[derive(Debug, Clone)]
pub enum ApiBehavior {
    Ok,
    /// 401 until the csrf header carries this value
    ExpiredUntilCsrf(String),
    /// Redirect to the sign-in page until the csrf header carries this value
    RedirectUntilCsrf(String),
    Throttled,
}

pub struct ServiceOptions {
    /// csrf cookie value handed out on login
    pub csrf_value: String,
    /// Withhold csrf from the login response; only `/api/language` grants it
    pub csrf_on_language: bool,
    /// Bootstrap reports authenticated before any login POST happened
    pub logged_in: bool,
    pub api: ApiBehavior,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            csrf_value: "csrf-1".to_string(),
            csrf_on_language: false,
            logged_in: false,
            api: ApiBehavior::Ok,
        }
    }
}

pub struct ServiceState {
    scenario: LoginScenario,
    csrf_value: String,
    csrf_on_language: bool,
    logged_in: AtomicBool,
    api: Mutex<ApiBehavior>,
    signin_posts: AtomicUsize,
    otp_posts: AtomicUsize,
    api_calls: AtomicUsize,
    language_calls: AtomicUsize,
    last_form: Mutex<Option<HashMap<String, String>>>,
}

pub struct HttpService {
    pub addr: SocketAddr,
    state: Arc<ServiceState>,
}

impl HttpService {
    pub async fn start(scenario: LoginScenario) -> Self {
        Self::start_with(scenario, ServiceOptions::default()).await
    }

    pub async fn start_with(scenario: LoginScenario, options: ServiceOptions) -> Self {
        let state = Arc::new(ServiceState {
            scenario,
            csrf_value: options.csrf_value,
            csrf_on_language: options.csrf_on_language,
            logged_in: AtomicBool::new(options.logged_in),
            api: Mutex::new(options.api),
            signin_posts: AtomicUsize::new(0),
            otp_posts: AtomicUsize::new(0),
            api_calls: AtomicUsize::new(0),
            language_calls: AtomicUsize::new(0),
            last_form: Mutex::new(None),
        });
        let app = Router::new()
            .route("/", get(signin_page))
            .route("/ap/signin", get(signin_page).post(signin_post))
            .route("/ap/verify", axum::routing::post(verify_post))
            .route("/api/bootstrap", get(bootstrap))
            .route("/api/language", get(language))
            .route("/api/devices-v2/device", get(devices))
            .with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    pub fn endpoints(&self) -> Endpoints {
        let api = Url::parse(&format!("http://{}", self.addr)).unwrap();
        Endpoints::custom("127.0.0.1", api, format!("ws://{}", self.addr))
    }

    pub fn signin_posts(&self) -> usize {
        self.state.signin_posts.load(Ordering::SeqCst)
    }

    pub fn otp_posts(&self) -> usize {
        self.state.otp_posts.load(Ordering::SeqCst)
    }

    pub fn api_calls(&self) -> usize {
        self.state.api_calls.load(Ordering::SeqCst)
    }

    pub fn language_calls(&self) -> usize {
        self.state.language_calls.load(Ordering::SeqCst)
    }

    /// Fields of the most recent sign-in POST
    pub fn last_form(&self) -> HashMap<String, String> {
        self.state.last_form.lock().unwrap().clone().unwrap_or_default()
    }

    pub fn set_api(&self, behavior: ApiBehavior) {
        *self.state.api.lock().unwrap() = behavior;
    }

    pub fn set_logged_in(&self, logged_in: bool) {
        self.state.logged_in.store(logged_in, Ordering::SeqCst);
    }
}

const SIGNIN_PAGE: &str = r#"<html><head><title>Sign-In</title></head><body>
<form name="signIn" method="post" action="/ap/signin">
  <input type="hidden" name="appActionToken" value="tok-123">
  <input type="hidden" name="workflowState" value="wf-state-9">
  <input type="email" id="ap_email" name="email" value="">
  <input type="password" id="ap_password" name="password">
  <input type="checkbox" name="rememberMe" value="true" checked>
  <input id="signInSubmit" type="submit" value="Sign in">
</form>
</body></html>"#;

const REJECTED_PAGE: &str = r#"<html><body>
<div id="auth-error-message-box"><div class="a-box-inner">
<h4>There was a problem</h4><span>Your password is incorrect</span>
</div></div>
<form name="signIn" method="post" action="/ap/signin">
  <input type="hidden" name="appActionToken" value="tok-123">
  <input type="email" name="email" value="">
  <input type="password" name="password">
  <input type="checkbox" name="rememberMe" value="true">
</form>
</body></html>"#;

const CAPTCHA_PAGE: &str = r#"<html><body>
<form name="signIn" method="post" action="/ap/signin">
  <input type="hidden" name="appActionToken" value="tok-123">
  <input type="email" name="email" value="">
  <input type="password" name="password">
  <input type="text" name="guess" autocomplete="off">
  <img id="auth-captcha-image" src="/captcha/image.jpg" alt="Visual CAPTCHA">
</form>
</body></html>"#;

const CAPTCHA_PAGE_NO_IMAGE: &str = r#"<html><body>
<form name="signIn" method="post" action="/ap/signin">
  <input type="hidden" name="appActionToken" value="tok-123">
  <input type="email" name="email" value="">
  <input type="password" name="password">
  <input type="text" name="guess">
  <img id="auth-captcha-image" src="" alt="Visual CAPTCHA">
</form>
</body></html>"#;

const OTP_PAGE: &str = r#"<html><body>
<form id="auth-mfa-form" method="post" action="/ap/signin">
  <input type="hidden" name="appActionToken" value="tok-123">
  <input id="auth-mfa-otpcode" type="tel" name="otpCode" maxlength="6">
  <input id="auth-mfa-remember-device" type="checkbox" name="rememberDevice" value="false">
  <input id="auth-signin-button" type="submit" value="Submit">
</form>
</body></html>"#;

const OTP_RETRY_PAGE: &str = r#"<html><body>
<div id="auth-warning-message-box"><span>The One Time Password you entered is not valid</span></div>
<form id="auth-mfa-form" method="post" action="/ap/signin">
  <input type="hidden" name="appActionToken" value="tok-123">
  <input id="auth-mfa-otpcode" type="tel" name="otpCode" maxlength="6">
  <input type="checkbox" name="rememberDevice" value="false">
</form>
</body></html>"#;

const CLAIMS_PAGE: &str = r#"<html><body>
<form name="claimspicker" method="post" action="/ap/signin">
  <input type="hidden" name="appActionToken" value="tok-123">
  <p>Choose where to receive your verification code</p>
  <input type="radio" name="option" value="sms:+1-555-0100">
  <input type="radio" name="option" value="email:u***@example.com">
</form>
</body></html>"#;

const VERIFY_PAGE: &str = r#"<html><body>
<form name="cvf-widget-form" method="post" action="verify">
  <input type="hidden" name="appActionToken" value="tok-123">
  <p>We sent a code to your phone. Enter it below.</p>
  <input type="text" name="code">
</form>
</body></html>"#;

const FORGOT_PASSWORD_PAGE: &str = r#"<html><body>
<h1>Password assistance</h1>
<div id="auth-warning-message-box"><span>Too many failed attempts. Reset your password to continue.</span></div>
<form name="forgotPassword" method="post" action="/ap/forgotpassword">
  <input type="email" name="email" value="">
</form>
</body></html>"#;

const SUCCESS_PAGE: &str =
    r#"<html><body><h1>Hello</h1><p>You are signed in.</p></body></html>"#;

async fn signin_page() -> Html<&'static str> {
    Html(SIGNIN_PAGE)
}

async fn signin_post(
    State(state): State<Arc<ServiceState>>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    state.signin_posts.fetch_add(1, Ordering::SeqCst);
    *state.last_form.lock().unwrap() = Some(form.clone());

    // Hidden fields scraped from our own pages must come back verbatim
    if form.get("appActionToken").map(String::as_str) != Some("tok-123") {
        return (StatusCode::BAD_REQUEST, "workflow token missing").into_response();
    }

    match state.scenario {
        LoginScenario::Plain => {
            if credentials_ok(&form) {
                success_response(&state)
            } else {
                Html(REJECTED_PAGE).into_response()
            }
        }
        LoginScenario::Captcha => match form.get("guess").map(String::as_str) {
            None | Some("") => Html(CAPTCHA_PAGE).into_response(),
            Some(_) if credentials_ok(&form) => success_response(&state),
            Some(_) => Html(REJECTED_PAGE).into_response(),
        },
        LoginScenario::CaptchaMissingImage => Html(CAPTCHA_PAGE_NO_IMAGE).into_response(),
        LoginScenario::Otp => match form.get("otpCode").map(String::as_str) {
            None | Some("") => {
                if credentials_ok(&form) {
                    Html(OTP_PAGE).into_response()
                } else {
                    Html(REJECTED_PAGE).into_response()
                }
            }
            Some(code) => {
                state.otp_posts.fetch_add(1, Ordering::SeqCst);
                if otp_ok(code) {
                    success_response(&state)
                } else {
                    Html(OTP_RETRY_PAGE).into_response()
                }
            }
        },
        LoginScenario::OtpReject => match form.get("otpCode").map(String::as_str) {
            None | Some("") => Html(OTP_PAGE).into_response(),
            Some(_) => {
                state.otp_posts.fetch_add(1, Ordering::SeqCst);
                Html(OTP_RETRY_PAGE).into_response()
            }
        },
        LoginScenario::DeviceVerify => {
            if form.get("option").is_some_and(|o| !o.is_empty()) {
                Html(VERIFY_PAGE).into_response()
            } else if credentials_ok(&form) {
                Html(CLAIMS_PAGE).into_response()
            } else {
                Html(REJECTED_PAGE).into_response()
            }
        }
        LoginScenario::Blocked => Html(FORGOT_PASSWORD_PAGE).into_response(),
    }
}

async fn verify_post(
    State(state): State<Arc<ServiceState>>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    *state.last_form.lock().unwrap() = Some(form.clone());
    if form.get("code").map(String::as_str) == Some(VERIFY_CODE) {
        success_response(&state)
    } else {
        Html(VERIFY_PAGE).into_response()
    }
}

fn credentials_ok(form: &HashMap<String, String>) -> bool {
    form.get("email").map(String::as_str) == Some(TEST_EMAIL)
        && form.get("password").map(String::as_str) == Some(TEST_PASSWORD)
}

fn otp_ok(code: &str) -> bool {
    let totp = Totp::new(OTP_SEED).unwrap();
    let now = SystemTime::now();
    // Accept the previous window too so a rollover mid-test cannot flake
    code == totp.code_at(now) || code == totp.code_at(now - Duration::from_secs(30))
}

fn success_response(state: &ServiceState) -> Response {
    state.logged_in.store(true, Ordering::SeqCst);
    let mut headers = HeaderMap::new();
    headers.append(SET_COOKIE, "session-id=sid-login-1; Path=/".parse().unwrap());
    headers.append(
        SET_COOKIE,
        format!("ubid-main={}; Path=/", UBID).parse().unwrap(),
    );
    headers.append(SET_COOKIE, "x-main=xmain-token; Path=/".parse().unwrap());
    if !state.csrf_on_language {
        headers.append(
            SET_COOKIE,
            format!("csrf={}; Path=/", state.csrf_value).parse().unwrap(),
        );
    }
    (headers, Html(SUCCESS_PAGE)).into_response()
}

async fn bootstrap(State(state): State<Arc<ServiceState>>) -> Json<Value> {
    if state.logged_in.load(Ordering::SeqCst) {
        Json(json!({
            "authentication": {
                "authenticated": true,
                "customerEmail": TEST_EMAIL,
                "customerId": "A123CUSTOMER",
                "customerName": "Test User",
            }
        }))
    } else {
        Json(json!({ "authentication": { "authenticated": false } }))
    }
}

async fn language(State(state): State<Arc<ServiceState>>) -> Response {
    state.language_calls.fetch_add(1, Ordering::SeqCst);
    let mut headers = HeaderMap::new();
    if state.csrf_on_language {
        headers.append(
            SET_COOKIE,
            format!("csrf={}; Path=/", state.csrf_value).parse().unwrap(),
        );
    }
    (headers, Json(json!({ "languages": ["en-US"] }))).into_response()
}

async fn devices(State(state): State<Arc<ServiceState>>, headers: HeaderMap) -> Response {
    state.api_calls.fetch_add(1, Ordering::SeqCst);
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string()
    };
    let csrf = header("csrf");
    let cookie = header("cookie");
    let behavior = state.api.lock().unwrap().clone();

    let ok_body = json!({
        "devices": [{ "serialNumber": DEVICE_SERIAL, "deviceType": "A32DOYMUN6DTXA" }],
        "sawCsrf": csrf.clone(),
        "sawCookie": cookie,
    });
    match behavior {
        ApiBehavior::Ok => Json(ok_body).into_response(),
        ApiBehavior::ExpiredUntilCsrf(accept) if csrf == accept => Json(ok_body).into_response(),
        ApiBehavior::ExpiredUntilCsrf(_) => StatusCode::UNAUTHORIZED.into_response(),
        ApiBehavior::RedirectUntilCsrf(accept) if csrf == accept => Json(ok_body).into_response(),
        ApiBehavior::RedirectUntilCsrf(_) => Redirect::to("/ap/signin").into_response(),
        ApiBehavior::Throttled => StatusCode::TOO_MANY_REQUESTS.into_response(),
    }
}

// ---------------------------------------------------------------------------
// Push gateway

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushScript {
    /// Handshake, then an ACK plus two events; connection stays up
    DeliverEvents,
    /// First connection is dropped right after the handshake; the second
    /// delivers an ACK and one event
    DropThenDeliver,
    /// An undecodable frame, with multi-byte text in the trailer position,
    /// precedes the ACK and event
    MalformedThenEvent,
    /// Upgrade refused with 401
    Reject401,
    /// Upgrade refused with 503
    Unavailable,
}

struct GatewayState {
    script: PushScript,
    connections: AtomicUsize,
    handshakes: Mutex<Vec<Vec<Vec<u8>>>>,
}

pub struct PushGateway {
    pub addr: SocketAddr,
    state: Arc<GatewayState>,
}

impl PushGateway {
    pub async fn start(script: PushScript) -> Self {
        let state = Arc::new(GatewayState {
            script,
            connections: AtomicUsize::new(0),
            handshakes: Mutex::new(Vec::new()),
        });
        let app = Router::new()
            .route("/", get(gateway_upgrade))
            .with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    pub fn endpoints(&self) -> Endpoints {
        let api = Url::parse("http://127.0.0.1/").unwrap();
        Endpoints::custom("127.0.0.1", api, format!("ws://{}", self.addr))
    }

    /// Connection attempts seen, including refused upgrades
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// The five handshake frames received on connection `index`
    pub fn handshake(&self, index: usize) -> Option<Vec<Vec<u8>>> {
        self.state.handshakes.lock().unwrap().get(index).cloned()
    }
}

async fn gateway_upgrade(
    State(state): State<Arc<GatewayState>>,
    ws: WebSocketUpgrade,
) -> Response {
    let connection = state.connections.fetch_add(1, Ordering::SeqCst) + 1;
    match state.script {
        PushScript::Reject401 => StatusCode::UNAUTHORIZED.into_response(),
        PushScript::Unavailable => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        _ => ws
            .on_upgrade(move |socket| gateway_session(socket, state, connection))
            .into_response(),
    }
}

async fn gateway_session(mut socket: WebSocket, state: Arc<GatewayState>, connection: usize) {
    // The client announces itself with five frames before it listens
    let mut frames = Vec::new();
    while frames.len() < 5 {
        match socket.recv().await {
            Some(Ok(WsMessage::Binary(data))) => frames.push(data.to_vec()),
            Some(Ok(WsMessage::Text(text))) => frames.push(text.as_bytes().to_vec()),
            Some(Ok(_)) => {}
            _ => return,
        }
    }
    state.handshakes.lock().unwrap().push(frames);

    if state.script == PushScript::DropThenDeliver && connection == 1 {
        return;
    }
    if state.script == PushScript::MalformedThenEvent {
        let _ = socket
            .send(WsMessage::Binary("BOGUS frame é€".as_bytes().to_vec().into()))
            .await;
    }

    let _ = socket
        .send(WsMessage::Binary(registration_ack_frame().into()))
        .await;
    let _ = socket
        .send(WsMessage::Binary(
            device_state_frame("PUSH_VOLUME_CHANGE", DEVICE_SERIAL).into(),
        ))
        .await;
    if state.script == PushScript::DeliverEvents {
        let _ = socket.send(WsMessage::Binary(activity_frame().into())).await;
    }

    // Hold the connection; drain keepalives until the peer goes away
    while let Some(Ok(_)) = socket.recv().await {}
}

fn fabe_frame(channel: u32, content: &str) -> Vec<u8> {
    format!(
        "MSG 0x{:08x} 0x00000042 f 0x00000001 0x00000000 0x{:08x} {}FABE",
        channel,
        content.len(),
        content
    )
    .into_bytes()
}

pub fn registration_ack_frame() -> Vec<u8> {
    let uuid = "7d335db2-1e92-4d2c-88f2-f40b4fb3e4c4";
    let content = format!(
        "ACK 0x{:08x} {} 0x{:08x} {} 0x{:08x} 0x{:016x} 0x{:016x}",
        3,
        "1.0",
        uuid.len(),
        uuid,
        1,
        0x18a59f2c441u64,
        0x18a59f2c460u64,
    );
    fabe_frame(0x361, &content)
}

/// Gateway message whose string-encoded payload carries `payload`
pub fn gateway_event_frame(command: &str, payload: &Value) -> Vec<u8> {
    let dest = "urn:tcomm-endpoint:service:serviceName:DeeWebsiteMessagingService";
    let device = "urn:tcomm-endpoint:device:deviceType:0:deviceSerialNumber:0";
    let document = json!({ "command": command, "payload": payload.to_string() }).to_string();
    let content = format!(
        "GWM MSG 0x0000b479 0x{:08x} {} 0x{:08x} {} {}",
        dest.len(),
        dest,
        device.len(),
        device,
        document
    );
    fabe_frame(0x362, &content)
}

pub fn device_state_frame(command: &str, serial: &str) -> Vec<u8> {
    gateway_event_frame(
        command,
        &json!({
            "dopplerId": { "deviceSerialNumber": serial, "deviceType": "A32DOYMUN6DTXA" },
            "isMuted": false,
            "volumeSetting": 45,
        }),
    )
}

pub fn activity_frame() -> Vec<u8> {
    gateway_event_frame(
        "PUSH_ACTIVITY",
        &json!({
            "key": { "registeredUserId": "A1B2C3", "entryId": "1700000000000#MSG#G090" },
            "timestamp": 1_700_000_000_000u64,
        }),
    )
}
