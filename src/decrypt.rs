//! Segment decryption.
//!
//! The session holds an `Option<Box<dyn Decrypter>>`: `None` is the
//! pass-through case, [`Aes128Cbc`] handles `AES-128` key declarations.
//!
//! AES-128-CBC decryption is block-wise and stateful: the chaining state
//! lives inside the cipher and carries across successive `decrypt` calls, so
//! a segment can be pushed through in fixed-size chunks without buffering it
//! whole. Padding removal is a deliberate heuristic rather than a strict
//! PKCS#7 validator — a stripped content byte corrupts the transport stream,
//! while a few leftover padding bytes are tolerated by downstream parsers, so
//! the check errs on the side of not stripping (see [`strip_padding`]).

use aes::Aes128;
use async_trait::async_trait;
use cbc::cipher::inout::InOutBuf;
use cbc::cipher::{BlockDecryptMut, KeyIvInit};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::error::{RestreamError, RestreamResult};
use crate::fetch::FetchClient;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

type CbcDecryptor = cbc::Decryptor<Aes128>;

/// Decodes a segment's raw bytes into plaintext.
#[async_trait]
pub trait Decrypter: Send + Sync {
    /// Fetches key material and prepares cipher state. Must be called once
    /// before the first [`Decrypter::decrypt`].
    async fn init(&mut self, cancel: &CancellationToken) -> RestreamResult<()>;

    /// Decrypts `payload` in place and returns the plaintext slice, which
    /// may be shorter than the input when trailing padding was stripped.
    fn decrypt<'a>(&mut self, payload: &'a mut [u8]) -> RestreamResult<&'a [u8]>;

    /// Short name for stats reporting.
    fn info(&self) -> &'static str;
}

/// AES-128-CBC decrypter with chaining state across calls.
pub struct Aes128Cbc {
    fetch: FetchClient,
    key_url: Url,
    iv: String,
    mode: Option<CbcDecryptor>,
}

impl Aes128Cbc {
    /// Creates a decrypter for the given key URL and playlist-declared IV.
    pub fn new(fetch: FetchClient, key_url: Url, iv: String) -> Self {
        Self {
            fetch,
            key_url,
            iv,
            mode: None,
        }
    }

    /// Builds the cipher from raw key bytes and the declared IV.
    fn install_key(&mut self, key: &[u8]) -> RestreamResult<()> {
        let iv = parse_iv(&self.iv)?;
        let mode = CbcDecryptor::new_from_slices(key, &iv)
            .map_err(|_| RestreamError::InvalidKeyLength(key.len()))?;
        self.mode = Some(mode);

        Ok(())
    }
}

#[async_trait]
impl Decrypter for Aes128Cbc {
    async fn init(&mut self, cancel: &CancellationToken) -> RestreamResult<()> {
        let key = self
            .fetch
            .fetch_bytes(cancel, self.key_url.as_str())
            .await
            .map_err(|e| e.with_context("cannot fetch decryption key"))?;

        debug!(key_url = %self.key_url, key_len = key.len(), "fetched decryption key");
        self.install_key(&key)
    }

    fn decrypt<'a>(&mut self, payload: &'a mut [u8]) -> RestreamResult<&'a [u8]> {
        if payload.len() % BLOCK_SIZE != 0 {
            return Err(RestreamError::BlockAlignment {
                len: payload.len(),
                block: BLOCK_SIZE,
            });
        }

        let mode = self
            .mode
            .as_mut()
            .ok_or_else(|| RestreamError::msg("decrypter used before init"))?;

        let (blocks, tail) = InOutBuf::from(&mut *payload).into_chunks();
        debug_assert!(tail.is_empty());
        mode.decrypt_blocks_inout_mut(blocks);

        Ok(strip_padding(payload))
    }

    fn info(&self) -> &'static str {
        "AES-128"
    }
}

/// Parses an IV hex string: strips any `0x` prefix and left-zero-pads to 32
/// hex characters (16 bytes) before decoding.
fn parse_iv(iv: &str) -> RestreamResult<[u8; 16]> {
    let hex_digits = iv.replace("0x", "");
    let padded = format!("{hex_digits:0>32}");

    let mut out = [0u8; 16];
    hex::decode_to_slice(&padded, &mut out).map_err(|e| RestreamError::InvalidIv {
        iv: iv.to_string(),
        reason: e.to_string(),
    })?;

    Ok(out)
}

/// Best-effort PKCS#7 padding removal.
///
/// The last byte `v` is treated as a padding length only when `v <= 16` and
/// `v` is a multiple of 4 (valid padding from a 16-byte block cipher is in
/// 1..=16, and for this stream format empirically a multiple of 4) and the
/// trailing `v` bytes all equal `v`. Anything else is returned unchanged.
fn strip_padding(payload: &[u8]) -> &[u8] {
    let Some(&last) = payload.last() else {
        return payload;
    };

    let pad = last as usize;
    if pad > BLOCK_SIZE || pad % 4 != 0 {
        return payload;
    }

    if payload[payload.len() - pad..].iter().any(|&b| b != last) {
        return payload;
    }

    &payload[..payload.len() - pad]
}
