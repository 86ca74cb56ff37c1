//! Segment value types shared between the providers and the session.

use std::fmt;

use url::Url;

/// Encryption method declared for a segment.
///
/// Only `NONE` and `AES-128` are actionable; anything else is carried
/// verbatim so the session can report exactly what the playlist declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyMethod {
    /// Segment is not encrypted.
    None,
    /// AES-128-CBC with a fetchable key.
    Aes128,
    /// Any method this crate does not support (e.g. `SAMPLE-AES`).
    Other(String),
}

impl fmt::Display for KeyMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyMethod::None => f.write_str("NONE"),
            KeyMethod::Aes128 => f.write_str("AES-128"),
            KeyMethod::Other(method) => f.write_str(method),
        }
    }
}

impl From<&m3u8_rs::KeyMethod> for KeyMethod {
    fn from(method: &m3u8_rs::KeyMethod) -> Self {
        match method {
            m3u8_rs::KeyMethod::None => KeyMethod::None,
            m3u8_rs::KeyMethod::AES128 => KeyMethod::Aes128,
            m3u8_rs::KeyMethod::SampleAES => KeyMethod::Other("SAMPLE-AES".to_string()),
            m3u8_rs::KeyMethod::Other(other) => KeyMethod::Other(other.clone()),
        }
    }
}

/// One fetchable chunk of the stream, with its encryption metadata.
///
/// Immutable once produced by a provider; URLs are already resolved against
/// the playlist's reference URL.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Absolute URL of the segment content.
    pub url: Url,
    /// Declared encryption method (`NONE` when the entry has no key).
    pub key_method: KeyMethod,
    /// Absolute URL of the key, when the entry declares one.
    pub key_url: Option<Url>,
    /// Initialization vector as it appeared in the playlist: a hex string,
    /// possibly `0x`-prefixed, possibly shorter than 32 hex characters.
    pub iv: Option<String>,
    /// Declared duration in seconds. Informational only.
    pub duration: f32,
}
