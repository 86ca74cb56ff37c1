//! Adaptive-bitrate HLS relay client.
//!
//! Connects to an HLS playlist (master or media), follows it live, and
//! relays the raw segment bytes to an async sink, decrypting `AES-128`
//! segments on the way. Variant selection adapts to a bandwidth estimate
//! measured from segment downloads, bounded by a configured ceiling.
//!
//! This crate is composed of several modules:
//! - `fetch`: Retrying HTTP client shared by every network access.
//! - `playlist`: Fetching and classifying M3U8 playlist documents.
//! - `provider`: Segment providers for media and master playlists,
//!   including variant selection and the media-sequence watermark.
//! - `decrypt`: AES-128-CBC segment decryption.
//! - `session`: The two-task fetch/decrypt/write pipeline.
//! - `settings`: Session configuration.
//! - `error`: Unified error types.
//!
//! This file (`lib.rs`) acts as a facade: it re-exports the main types
//! from the internal modules to form the public API of the crate.
//!
//! ```no_run
//! use restream::{Restream, RestreamSettings};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> restream::RestreamResult<()> {
//! let sink = tokio::io::stdout();
//! let session = Restream::new(RestreamSettings::default(), sink)?;
//! let cancel = CancellationToken::new();
//! session.run(cancel, "http://example.com/live/master.m3u8").await
//! # }
//! ```

mod decrypt;
mod error;
mod fetch;
mod playlist;
mod provider;
mod segment;
mod session;
mod settings;

pub use crate::decrypt::{Aes128Cbc, Decrypter, BLOCK_SIZE};
pub use crate::error::{RestreamError, RestreamResult};
pub use crate::fetch::FetchClient;
pub use crate::playlist::{decode, resolve_reference, PlaylistDocument};
pub use crate::provider::{segment_provider_for, MediaProvider, SegmentProvider};
pub use crate::segment::{KeyMethod, Segment};
pub use crate::session::Restream;
pub use crate::settings::{
    RestreamSettings, DEFAULT_MAX_BANDWIDTH, DEFAULT_QUEUE_CAPACITY, DEFAULT_READ_BUFFER_SIZE,
    DEFAULT_USER_AGENT,
};
