use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::error::{EchoError, Result};
use crate::redact::hide_serial;

type HmacSha1 = Hmac<Sha1>;

/// TOTP time-step window
const STEP: Duration = Duration::from_secs(30);

/// Number of digits in a generated code
const DIGITS: u32 = 6;

/// Time-based one-time password generator (RFC 6238, HMAC-SHA1).
///
/// Built from the base32 shared secret the service displays during two-factor
/// enrollment. Codes are 6 digits over a 30 second window; two calls within
/// the same window produce the same code.
///
/// ```
/// use echo_remote::Totp;
///
/// let totp = Totp::new("GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ").unwrap();
/// let code = totp.code();
/// assert_eq!(code.len(), 6);
/// ```
#[derive(Clone)]
pub struct Totp {
    mac: HmacSha1,
}

impl Totp {
    /// Create a generator from a base32-encoded shared secret.
    ///
    /// Seeds are accepted the way the enrollment page shows them: whitespace
    /// separators and trailing `=` padding are stripped, case is ignored.
    /// Returns [`EchoError::InvalidSeed`] when the remainder is not valid
    /// base32.
    pub fn new(seed: &str) -> Result<Self> {
        let normalized: String = seed
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '=')
            .collect::<String>()
            .to_ascii_uppercase();

        if normalized.is_empty() {
            return Err(EchoError::InvalidSeed("seed is empty".to_string()));
        }

        let key = base32::decode(base32::Alphabet::Rfc4648 { padding: false }, &normalized)
            .ok_or_else(|| {
                EchoError::InvalidSeed(format!("not base32: {}", hide_serial(&normalized)))
            })?;

        let mac = HmacSha1::new_from_slice(&key)
            .map_err(|e| EchoError::InvalidSeed(e.to_string()))?;

        Ok(Self { mac })
    }

    /// Generate the code for the current time
    pub fn code(&self) -> String {
        self.code_at(SystemTime::now())
    }

    /// Generate the code for an arbitrary time instant
    pub fn code_at(&self, time: SystemTime) -> String {
        let secs = time
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.code_for_counter(secs / STEP.as_secs())
    }

    fn code_for_counter(&self, counter: u64) -> String {
        let mut mac = self.mac.clone();
        mac.update(&counter.to_be_bytes());
        let digest = mac.finalize().into_bytes();

        // Dynamic truncation per RFC 4226 section 5.3
        let offset = (digest[digest.len() - 1] & 0x0f) as usize;
        let binary = u32::from_be_bytes([
            digest[offset] & 0x7f,
            digest[offset + 1],
            digest[offset + 2],
            digest[offset + 3],
        ]);

        format!("{:01$}", binary % 10u32.pow(DIGITS), DIGITS as usize)
    }
}

impl std::fmt::Debug for Totp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Totp(..)")
    }
}
