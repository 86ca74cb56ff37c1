//! Unified crate-level error types.
//!
//! This module provides a single [`RestreamError`] type used across the crate
//! and a convenient [`RestreamResult`] alias.
//!
//! The taxonomy mirrors how failures propagate through a session:
//! - transient network failures never surface here (the fetch client retries
//!   them internally until cancellation),
//! - everything else is terminal and ends the session the first time either
//!   the poller or the consumer observes it,
//! - cancellation is modeled as its own variant so callers can distinguish a
//!   clean shutdown from a real failure.

use std::io;

/// Result type used by this crate.
pub type RestreamResult<T> = Result<T, RestreamError>;

/// Unified error type for the `restream` crate.
#[derive(Debug, thiserror::Error)]
pub enum RestreamError {
    /// A generic error with a message.
    #[error("{0}")]
    Message(String),

    /// Errors related to invalid or unsupported playlist contents.
    #[error("invalid playlist: {0}")]
    InvalidPlaylist(String),

    /// Operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// I/O error, typically a sink write failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// HTTP layer failure (client construction, body collection).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Terminal HTTP status. Only a 404 is surfaced this way; every other
    /// status >= 400 is retried inside the fetch client.
    #[error("request to {url} failed with status code {status}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// URL that failed.
        url: String,
    },

    /// A URI could not be parsed or resolved against its reference URL.
    #[error("cannot parse uri {uri}: {source}")]
    Url {
        /// The offending URI.
        uri: String,
        /// The underlying parse error.
        #[source]
        source: url::ParseError,
    },

    /// Variant selection found nothing under both the configured ceiling and
    /// the current bandwidth estimate.
    #[error("no qualifying variant for bandwidth estimate {estimate} b/s")]
    NoQualifyingVariant {
        /// The estimate that disqualified every variant.
        estimate: u64,
    },

    /// The playlist declared an encryption method this crate cannot handle.
    #[error("key method {0} is not supported")]
    UnsupportedKeyMethod(String),

    /// The initialization vector could not be decoded from its hex form.
    #[error("cannot decode IV {iv}: {reason}")]
    InvalidIv {
        /// The IV string as it appeared in the playlist.
        iv: String,
        /// Why decoding failed.
        reason: String,
    },

    /// The fetched AES key had the wrong length for the cipher.
    #[error("invalid AES-128 key length {0}")]
    InvalidKeyLength(usize),

    /// A decrypt buffer was not a whole number of cipher blocks.
    #[error("payload size {len} is not a multiple of {block}")]
    BlockAlignment {
        /// Offending buffer length.
        len: usize,
        /// Cipher block size in bytes.
        block: usize,
    },

    /// Extra context around a lower-level error.
    #[error("{context}: {source}")]
    Context {
        /// What we were doing when the error occurred.
        context: &'static str,
        /// The underlying error.
        #[source]
        source: Box<RestreamError>,
    },
}

impl RestreamError {
    /// Convenience helper to construct a simple message error.
    pub fn msg(msg: impl Into<String>) -> Self {
        RestreamError::Message(msg.into())
    }

    /// Attach static context to an existing error.
    ///
    /// [`RestreamError::Cancelled`] passes through unchanged so it stays
    /// recognizable as the clean-shutdown marker no matter how deep in the
    /// pipeline the cancellation was observed.
    pub fn with_context(self, context: &'static str) -> Self {
        if self.is_cancelled() {
            return self;
        }

        RestreamError::Context {
            context,
            source: Box::new(self),
        }
    }

    /// Whether this error is the clean-cancellation marker.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RestreamError::Cancelled)
    }
}
