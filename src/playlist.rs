//! Playlist fetching and classification.
//!
//! Thin adapter around the `m3u8-rs` parser: fetch a playlist document via
//! the [`FetchClient`], parse it, and classify it as Media (a flat segment
//! list) or Master (a list of variants). The response's final post-redirect
//! URL is recorded as the reference URL for resolving relative URIs found
//! inside the document.

use m3u8_rs::{MasterPlaylist, MediaPlaylist, Playlist};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{RestreamError, RestreamResult};
use crate::fetch::FetchClient;

/// A fetched and classified playlist document.
#[derive(Debug, Clone)]
pub enum PlaylistDocument {
    /// A flat, time-ordered segment list.
    Media {
        /// The parsed playlist.
        playlist: MediaPlaylist,
        /// Post-redirect URL the document was fetched from.
        reference_url: Url,
    },
    /// A list of alternate-quality variants.
    Master {
        /// The parsed playlist.
        playlist: MasterPlaylist,
        /// Post-redirect URL the document was fetched from.
        reference_url: Url,
    },
}

impl PlaylistDocument {
    /// The URL relative URIs inside this document resolve against.
    pub fn reference_url(&self) -> &Url {
        match self {
            PlaylistDocument::Media { reference_url, .. }
            | PlaylistDocument::Master { reference_url, .. } => reference_url,
        }
    }
}

/// Fetches and parses the playlist at `url`.
///
/// Fails with [`RestreamError::InvalidPlaylist`] when the body is not a
/// well-formed playlist of either kind.
pub async fn decode(
    fetch: &FetchClient,
    cancel: &CancellationToken,
    url: &str,
) -> RestreamResult<PlaylistDocument> {
    let response = fetch.fetch(cancel, url).await?;
    let reference_url = response.url().clone();

    let body = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(RestreamError::Cancelled),
        res = response.bytes() => res?,
    };

    match m3u8_rs::parse_playlist(&body) {
        Ok((_, Playlist::MediaPlaylist(playlist))) => Ok(PlaylistDocument::Media {
            playlist,
            reference_url,
        }),
        Ok((_, Playlist::MasterPlaylist(playlist))) => Ok(PlaylistDocument::Master {
            playlist,
            reference_url,
        }),
        Err(e) => Err(RestreamError::InvalidPlaylist(format!(
            "failed to decode playlist from {url}: {e:?}"
        ))),
    }
}

/// Resolves a possibly-relative URI against a playlist's reference URL.
pub fn resolve_reference(reference_url: &Url, uri: &str) -> RestreamResult<Url> {
    reference_url.join(uri).map_err(|source| RestreamError::Url {
        uri: uri.to_string(),
        source,
    })
}
