//! Frozen wire contract of the retail service.
//!
//! Everything in here mirrors observed server behavior: endpoint layout,
//! the browser headers the site expects, the login-page markers, and the
//! shape of the bootstrap document. None of it is negotiated; the service
//! offers no capability discovery.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{EchoError, Result};

/// The site rejects obvious robots, so every request claims to be a browser
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/112.0.0.0 Safari/537.36";

/// Device type the push gateway registration claims to be
const DEVICE_TYPE: &str = "ALEGCNGL9K0HM";

/// Service endpoints for one retail domain.
///
/// Production use derives everything from the domain
/// (`Endpoints::for_domain("amazon.com")`); tests build custom endpoints
/// pointed at a local server.
#[derive(Debug, Clone)]
pub struct Endpoints {
    domain: String,
    api: Url,
    push: String,
}

impl Endpoints {
    /// Endpoints for a retail domain such as `amazon.com` or `amazon.co.uk`
    pub fn for_domain(domain: &str) -> Result<Self> {
        if domain.is_empty() {
            return Err(EchoError::Protocol("empty retail domain".to_string()));
        }
        let api = Url::parse(&format!("https://alexa.{}", domain))
            .map_err(|e| EchoError::Protocol(format!("bad domain {:?}: {}", domain, e)))?;
        // The .com gateway lives on a different host than the regional ones
        let push = if domain == "amazon.com" {
            "wss://dp-gw-na-js.amazon.com".to_string()
        } else {
            format!("wss://dp-gw-na.{}", domain)
        };
        Ok(Self {
            domain: domain.to_string(),
            api,
            push,
        })
    }

    /// Explicit endpoints, primarily for pointing tests at a local server
    pub fn custom(domain: impl Into<String>, api: Url, push: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            api,
            push: push.into(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Base URL of the API host; also where the login handshake starts
    pub fn api_base(&self) -> &Url {
        &self.api
    }

    /// API URL for a path like `/api/bootstrap`
    pub fn api_url(&self, path: &str) -> Result<Url> {
        self.api
            .join(path)
            .map_err(|e| EchoError::Protocol(format!("bad api path {:?}: {}", path, e)))
    }

    /// `Origin` header value the push gateway upgrade requires
    pub fn origin(&self) -> String {
        self.api.origin().ascii_serialization()
    }

    /// Full push-gateway URL for one connection attempt.
    ///
    /// The serial query parameter carries a per-attempt timestamp suffix,
    /// so every attempt registers as a fresh connection.
    pub fn push_url(&self, registration_serial: &str) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        format!(
            "{}/?x-amz-device-type={}&x-amz-device-serial={}-{}000",
            self.push, DEVICE_TYPE, registration_serial, now
        )
    }
}

/// `GET /api/bootstrap` document, reduced to the fields we read.
/// Unknown fields are ignored so server additions do not break us.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Bootstrap {
    #[serde(default)]
    pub authentication: BootstrapAuthentication,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapAuthentication {
    #[serde(default)]
    pub authenticated: bool,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub customer_id: Option<String>,
}

/// Which login page the server presented
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// Credential form (`name="signIn"`), no captcha attached
    SignIn,
    /// A captcha image must be solved, either on the credential form or on
    /// the verification flow
    Captcha,
    /// One-time-password entry
    Otp,
    /// Pick a destination (SMS or email) for a verification code
    ClaimsPicker,
    /// Enter the verification code that was sent out of band
    Verification,
    /// Interstitial that blocks the login outright, e.g. the
    /// forgot-password page shown after too many failed attempts
    Blocked,
    /// No challenge markers present; the session may be authenticated
    Other,
}

/// One parsed login page: its classification plus the form data needed to
/// answer it.
///
/// Hidden inputs keep their server-assigned values and are echoed back
/// verbatim on submission. That is what keeps the handshake working when
/// the server adds new hidden fields.
#[derive(Debug, Clone)]
pub struct LoginPage {
    pub kind: PageKind,
    /// Absolute form-submission URL, when the page carried a usable form
    pub action: Option<Url>,
    /// Form inputs by name; hidden inputs carry their value, visible ones
    /// an empty placeholder to be filled in
    pub inputs: BTreeMap<String, String>,
    /// Absolute captcha image URL for [`PageKind::Captcha`]
    pub captcha_url: Option<String>,
    /// Destinations offered by a claims picker, in page order
    pub options: Vec<String>,
    /// Text of the server's error or warning box, when present
    pub error_message: Option<String>,
    /// Human-readable text of the challenge form
    pub prompt: Option<String>,
}

static FORM_OPEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<form\b[^>]*>").unwrap());
static FORM_CLOSE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)</form\s*>").unwrap());
static INPUT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<input\b[^>]*>").unwrap());
static IMG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<img\b[^>]*>").unwrap());
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<[a-z][^>]*>").unwrap());
static ATTR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([a-zA-Z][a-zA-Z0-9_:-]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>"'/]+))"#).unwrap()
});
static STRIP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());
static WS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

struct Form<'a> {
    attrs: BTreeMap<String, String>,
    body: &'a str,
}

impl LoginPage {
    /// Classify a login page and harvest its form.
    ///
    /// `base` is the URL the page was fetched from (after redirects); form
    /// actions are resolved against it. Parsing is lenient: a page with no
    /// recognizable markers classifies as [`PageKind::Other`].
    pub fn parse(html: &str, base: &Url) -> Self {
        let forms = collect_forms(html);
        let error_message = error_box_text(html);

        let signin_form = find_form(&forms, |a| attr_eq(a, "name", "signIn"));
        let captcha_src = find_tag(html, &TAG_RE, "id", "auth-captcha-image")
            .and_then(|a| a.get("src").cloned());
        let has_otp_marker = find_tag(html, &TAG_RE, "id", "auth-mfa-otpcode").is_some();
        let claims_form = find_form(&forms, |a| attr_eq(a, "name", "claimspicker"));
        let authselect_form = find_form(&forms, |a| attr_eq(a, "id", "auth-select-device-form"));
        let verify_form = find_form(&forms, |a| {
            a.get("action")
                .is_some_and(|v| v == "verify" || v.ends_with("/verify"))
        });
        let verify_captcha_src =
            find_tag(html, &IMG_RE, "alt", "captcha").and_then(|a| a.get("src").cloned());
        let blocked = find_form(&forms, |a| attr_eq(a, "name", "forgotPassword")).is_some()
            || page_has_input(html, "OTPChallengeOptions")
            || find_tag(html, &TAG_RE, "id", "ap_error_return_home").is_some();

        // Precedence mirrors the server's own flow: a challenge marker wins
        // over the plain sign-in form, and a blocking interstitial only
        // matters when nothing else matched.
        let (kind, form, captcha_url) = if signin_form.is_some() && captcha_src.is_none() {
            (PageKind::SignIn, signin_form, None)
        } else if let Some(src) = captcha_src {
            (PageKind::Captcha, signin_form.or(forms.first()), Some(src))
        } else if has_otp_marker {
            let otp_form = find_form(&forms, |a| attr_eq(a, "id", "auth-mfa-form"));
            (PageKind::Otp, otp_form.or(forms.first()), None)
        } else if claims_form.is_some() {
            (PageKind::ClaimsPicker, claims_form, None)
        } else if authselect_form.is_some() {
            (PageKind::ClaimsPicker, authselect_form, None)
        } else if let Some(src) = verify_captcha_src {
            (PageKind::Captcha, verify_form.or(forms.first()), Some(src))
        } else if verify_form.is_some() {
            (PageKind::Verification, verify_form, None)
        } else if blocked {
            (PageKind::Blocked, None, None)
        } else {
            (PageKind::Other, None, None)
        };

        let form = form.or(forms.first());
        let inputs = match (kind, form) {
            (PageKind::Other, _) | (PageKind::Blocked, _) | (_, None) => BTreeMap::new(),
            (_, Some(f)) => harvest_inputs(f.body),
        };
        let options = form.map(|f| collect_options(f.body)).unwrap_or_default();
        let action = match kind {
            PageKind::Other | PageKind::Blocked => None,
            _ => form
                .and_then(|f| f.attrs.get("action"))
                .filter(|a| !a.is_empty())
                .and_then(|a| base.join(a).ok()),
        };
        let prompt = match kind {
            PageKind::Other | PageKind::Blocked => None,
            _ => form
                .map(|f| visible_text(f.body, 300))
                .filter(|t| !t.is_empty()),
        };
        let captcha_url = captcha_url
            .filter(|s| !s.is_empty())
            .and_then(|s| base.join(&s).ok())
            .map(|u| u.to_string());

        Self {
            kind,
            action,
            inputs,
            captcha_url,
            options,
            error_message,
            prompt,
        }
    }
}

fn attr_eq(attrs: &BTreeMap<String, String>, key: &str, value: &str) -> bool {
    attrs.get(key).map(String::as_str) == Some(value)
}

fn tag_attrs(tag: &str) -> BTreeMap<String, String> {
    ATTR_RE
        .captures_iter(tag)
        .map(|c| {
            let name = c[1].to_ascii_lowercase();
            let value = c
                .get(2)
                .or_else(|| c.get(3))
                .or_else(|| c.get(4))
                .map(|m| m.as_str())
                .unwrap_or("")
                .to_string();
            (name, value)
        })
        .collect()
}

fn collect_forms(html: &str) -> Vec<Form<'_>> {
    FORM_OPEN_RE
        .find_iter(html)
        .map(|m| {
            let rest = &html[m.end()..];
            let body = match FORM_CLOSE_RE.find(rest) {
                Some(close) => &rest[..close.start()],
                None => rest,
            };
            Form {
                attrs: tag_attrs(m.as_str()),
                body,
            }
        })
        .collect()
}

fn find_form<'a, 'b>(
    forms: &'a [Form<'b>],
    pred: impl Fn(&BTreeMap<String, String>) -> bool,
) -> Option<&'a Form<'b>> {
    forms.iter().find(|f| pred(&f.attrs))
}

fn find_tag(html: &str, re: &Regex, key: &str, value: &str) -> Option<BTreeMap<String, String>> {
    re.find_iter(html)
        .map(|m| tag_attrs(m.as_str()))
        .find(|a| attr_eq(a, key, value))
}

fn page_has_input(html: &str, name: &str) -> bool {
    INPUT_RE
        .find_iter(html)
        .any(|m| attr_eq(&tag_attrs(m.as_str()), "name", name))
}

/// Collect every named input of a form. Hidden inputs keep their value;
/// visible ones get an empty placeholder for the caller to fill.
fn harvest_inputs(form_body: &str) -> BTreeMap<String, String> {
    let mut data = BTreeMap::new();
    for m in INPUT_RE.find_iter(form_body) {
        let attrs = tag_attrs(m.as_str());
        let Some(name) = attrs.get("name") else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        let hidden = attrs
            .get("type")
            .is_some_and(|t| t.eq_ignore_ascii_case("hidden"));
        let value = if hidden {
            attrs.get("value").cloned().unwrap_or_default()
        } else {
            String::new()
        };
        data.insert(name.clone(), value);
    }
    data
}

/// Values offered by a picker form's radio buttons, in page order
fn collect_options(form_body: &str) -> Vec<String> {
    let mut options = Vec::new();
    for m in INPUT_RE.find_iter(form_body) {
        let attrs = tag_attrs(m.as_str());
        let named_option = attrs
            .get("name")
            .is_some_and(|n| n == "option" || n == "otpDeviceContext");
        if !named_option {
            continue;
        }
        if let Some(value) = attrs.get("value") {
            let value = value.trim();
            if !value.is_empty() && !options.iter().any(|o| o == value) {
                options.push(value.to_string());
            }
        }
    }
    options
}

fn error_box_text(html: &str) -> Option<String> {
    let marker = TAG_RE.find_iter(html).find(|m| {
        let attrs = tag_attrs(m.as_str());
        attr_eq(&attrs, "id", "auth-error-message-box")
            || attr_eq(&attrs, "id", "auth-warning-message-box")
    })?;
    // The window end is a raw byte offset; walk it back onto a character
    // boundary before slicing
    let mut window_end = (marker.end() + 1500).min(html.len());
    while !html.is_char_boundary(window_end) {
        window_end -= 1;
    }
    let text = visible_text(&html[marker.end()..window_end], 300);
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Strip markup and collapse whitespace, truncating to roughly `limit`
/// characters on a word boundary
fn visible_text(fragment: &str, limit: usize) -> String {
    let stripped = STRIP_RE.replace_all(fragment, " ");
    let collapsed = WS_RE.replace_all(&stripped, " ");
    let trimmed = collapsed.trim();
    if trimmed.len() <= limit {
        return trimmed.to_string();
    }
    let boundary = trimmed
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|i| *i <= limit)
        .last()
        .unwrap_or(0);
    match trimmed[..boundary].rfind(' ') {
        Some(cut) => trimmed[..cut].to_string(),
        None => trimmed[..boundary].to_string(),
    }
}

/// Whether a final response URL landed back on the sign-in flow, which the
/// service uses instead of a status code to signal an expired session
pub(crate) fn is_signin_url(url: &Url) -> bool {
    url.path().starts_with("/ap/signin")
}

/// One authenticated API call, described declaratively.
///
/// ```
/// use echo_remote::ApiRequest;
///
/// let req = ApiRequest::get("/api/devices-v2/device")
///     .with_query("cached", "false");
/// assert_eq!(req.path(), "/api/devices-v2/device");
/// ```
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: Option<Value>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    /// Append a query parameter
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Attach a JSON body
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn query(&self) -> &[(String, String)] {
        &self.query
    }

    pub(crate) fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }
}

/// Response to an [`ApiRequest`]
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: String,
}

impl ApiResponse {
    /// Deserialize the body as JSON
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}
