//! Obfuscation helpers for logging account identifiers.
//!
//! Session and login logging must never leak whole account emails or device
//! serials; these helpers keep just enough of the value to correlate log
//! lines.

/// Obfuscate an email address, keeping the first and last character of each
/// part: `jenny@example.com` becomes `j***y@e*********m`.
pub fn hide_email(email: &str) -> String {
    match email.split_once('@') {
        Some((user, host)) => format!("{}@{}", mask(user), mask(host)),
        None => hide_serial(email),
    }
}

/// Obfuscate a serial-like identifier, keeping the first character and the
/// last three: `G090LF1234567890` becomes `G************890`.
pub fn hide_serial(item: &str) -> String {
    if item.is_empty() {
        return String::new();
    }
    mask_keep(item, 1, 3)
}

fn mask(part: &str) -> String {
    mask_keep(part, 1, 1)
}

fn mask_keep(value: &str, head: usize, tail: usize) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= head + tail {
        return "*".repeat(chars.len());
    }
    let mut result = String::with_capacity(chars.len());
    result.extend(&chars[..head]);
    result.extend(std::iter::repeat('*').take(chars.len() - head - tail));
    result.extend(&chars[chars.len() - tail..]);
    result
}
