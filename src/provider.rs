//! Segment providers: the playlist state machine.
//!
//! A [`SegmentProvider`] produces the batch of not-yet-seen segments and the
//! delay before the next poll. Two implementations exist:
//!
//! - [`MediaProvider`] tracks a flat media playlist, using sequence numbers
//!   to emit each segment exactly once across successive refetches.
//! - [`MasterProvider`] wraps a `MediaProvider` (composition, not
//!   inheritance) and re-runs variant selection against the caller's current
//!   bandwidth estimate before every delegation, rewriting the wrapped
//!   provider's playlist URL when the choice changes.
//!
//! Poll timing follows the playlist's declared target duration, halved when a
//! refetch produced nothing new so freshly published segments are caught
//! sooner.

use std::time::Duration;

use async_trait::async_trait;
use m3u8_rs::MediaPlaylist;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{RestreamError, RestreamResult};
use crate::fetch::FetchClient;
use crate::playlist::{self, PlaylistDocument};
use crate::segment::{KeyMethod, Segment};

const MB_DIVIDER: f64 = 1_048_576.0;

/// Source of new segments for a streaming session.
#[async_trait]
pub trait SegmentProvider: Send {
    /// Returns the segments published since the last call, and how long to
    /// wait before polling again. `bandwidth` is the session's current
    /// estimate in bits per second, used by variant selection.
    async fn get(
        &mut self,
        cancel: &CancellationToken,
        bandwidth: u64,
    ) -> RestreamResult<(Vec<Segment>, Duration)>;

    /// Human-readable description for stats reporting.
    fn info(&self) -> String;
}

/// Builds the right provider for the playlist at `url`.
///
/// Decodes the document once: a Media playlist yields a [`MediaProvider`], a
/// Master playlist yields a [`MasterProvider`] seeded with its variant list.
pub async fn segment_provider_for(
    fetch: FetchClient,
    cancel: &CancellationToken,
    url: &str,
    max_bandwidth: u64,
) -> RestreamResult<Box<dyn SegmentProvider>> {
    match playlist::decode(&fetch, cancel, url).await? {
        PlaylistDocument::Media { .. } => Ok(Box::new(MediaProvider::new(fetch, url.to_string()))),
        PlaylistDocument::Master {
            playlist,
            reference_url,
        } => {
            let variants = playlist
                .variants
                .iter()
                .filter(|v| !v.is_i_frame)
                .map(|v| Variant {
                    bandwidth: v.bandwidth,
                    resolution: v
                        .resolution
                        .as_ref()
                        .map(|r| format!("{}x{}", r.width, r.height)),
                    uri: v.uri.clone(),
                })
                .collect();

            let media = MediaProvider::new(fetch, url.to_string());
            Ok(Box::new(MasterProvider::new(
                media,
                variants,
                reference_url,
                max_bandwidth,
            )))
        }
    }
}

// Media

/// Provider over a flat media playlist.
pub struct MediaProvider {
    fetch: FetchClient,
    playlist_url: String,
    last_media_sequence: u64,
}

impl MediaProvider {
    /// Creates a provider polling the given media playlist URL.
    pub fn new(fetch: FetchClient, playlist_url: String) -> Self {
        Self {
            fetch,
            playlist_url,
            last_media_sequence: 0,
        }
    }

    /// Repoints this provider at a different media playlist.
    ///
    /// Used by [`MasterProvider`] after variant selection. The sequence
    /// watermark is deliberately kept: variants of one stream share sequence
    /// numbering, so a switch must not re-emit segments already streamed.
    fn set_playlist_url(&mut self, playlist_url: String) {
        self.playlist_url = playlist_url;
    }
}

#[async_trait]
impl SegmentProvider for MediaProvider {
    async fn get(
        &mut self,
        cancel: &CancellationToken,
        _bandwidth: u64,
    ) -> RestreamResult<(Vec<Segment>, Duration)> {
        let document = playlist::decode(&self.fetch, cancel, &self.playlist_url).await?;
        let reference_url = document.reference_url().clone();
        let PlaylistDocument::Media { playlist, .. } = document else {
            return Err(RestreamError::InvalidPlaylist(format!(
                "expected a media playlist at {}",
                self.playlist_url
            )));
        };

        let segments =
            collect_new_segments(&playlist, &reference_url, &mut self.last_media_sequence)?;
        let delay = reload_delay(&playlist, !segments.is_empty());

        Ok((segments, delay))
    }

    fn info(&self) -> String {
        "Media".to_string()
    }
}

/// Walks the playlist entries and returns those not yet emitted, advancing
/// the sequence watermark as it goes.
///
/// Entry `i` carries sequence number `media_sequence + i`; only entries with
/// a sequence above the watermark are emitted, so across refetches every
/// segment is produced at most once and the watermark never decreases.
fn collect_new_segments(
    playlist: &MediaPlaylist,
    reference_url: &Url,
    last_media_sequence: &mut u64,
) -> RestreamResult<Vec<Segment>> {
    let mut segments = Vec::new();

    for (index, entry) in playlist.segments.iter().enumerate() {
        let sequence = playlist.media_sequence + index as u64;
        if sequence <= *last_media_sequence {
            continue;
        }
        *last_media_sequence = sequence;

        let url = playlist::resolve_reference(reference_url, &entry.uri)?;

        let mut segment = Segment {
            url,
            key_method: KeyMethod::None,
            key_url: None,
            iv: None,
            duration: entry.duration,
        };
        if let Some(key) = &entry.key {
            segment.key_method = KeyMethod::from(&key.method);
            segment.key_url = key
                .uri
                .as_deref()
                .map(|uri| playlist::resolve_reference(reference_url, uri))
                .transpose()?;
            segment.iv = key.iv.clone();
        }

        segments.push(segment);
    }

    Ok(segments)
}

/// Reload timing per the HTTP live streaming drafts: wait one target
/// duration, or half of it when the refetch produced nothing new.
fn reload_delay(playlist: &MediaPlaylist, new_segments_found: bool) -> Duration {
    let delay = Duration::from_secs(playlist.target_duration);
    if new_segments_found {
        delay
    } else {
        delay / 2
    }
}

// Master

/// One selectable rendition from a master playlist.
#[derive(Debug, Clone)]
struct Variant {
    bandwidth: u64,
    resolution: Option<String>,
    uri: String,
}

/// Provider over a master playlist: selects a variant, then delegates to the
/// wrapped [`MediaProvider`].
///
/// Built only through [`segment_provider_for`]: the variant list comes from
/// a decoded master playlist, never from callers.
pub(crate) struct MasterProvider {
    media: MediaProvider,
    variants: Vec<Variant>,
    reference_url: Url,
    max_bandwidth: u64,
    variant_bandwidth: u64,
    resolution: Option<String>,
}

impl MasterProvider {
    fn new(
        media: MediaProvider,
        variants: Vec<Variant>,
        reference_url: Url,
        max_bandwidth: u64,
    ) -> Self {
        Self {
            media,
            variants,
            reference_url,
            max_bandwidth,
            variant_bandwidth: 0,
            resolution: None,
        }
    }

    /// Re-runs variant selection and repoints the wrapped media provider.
    fn select_variant(&mut self, bandwidth: u64) -> RestreamResult<()> {
        let target = select_candidate(&self.variants, self.max_bandwidth, bandwidth)
            .ok_or(RestreamError::NoQualifyingVariant {
                estimate: bandwidth,
            })?
            .clone();

        let resolved = playlist::resolve_reference(&self.reference_url, &target.uri)?;
        self.media.set_playlist_url(resolved.into());
        self.variant_bandwidth = target.bandwidth;
        self.resolution = target.resolution;

        Ok(())
    }
}

/// Picks the highest-bandwidth variant fitting under both the configured
/// ceiling and the current estimate.
///
/// Ties keep the first variant in playlist order: a later candidate replaces
/// the current one only when its difference to the estimate is strictly
/// smaller.
fn select_candidate<'a>(
    variants: &'a [Variant],
    max_bandwidth: u64,
    estimate: u64,
) -> Option<&'a Variant> {
    let mut min_diff = estimate;
    let mut target: Option<&Variant> = None;

    for variant in variants {
        if variant.bandwidth > max_bandwidth || variant.bandwidth > estimate {
            continue;
        }

        let diff = estimate - variant.bandwidth;
        if diff >= min_diff && target.is_some() {
            continue;
        }

        min_diff = diff;
        target = Some(variant);
    }

    target
}

#[async_trait]
impl SegmentProvider for MasterProvider {
    async fn get(
        &mut self,
        cancel: &CancellationToken,
        bandwidth: u64,
    ) -> RestreamResult<(Vec<Segment>, Duration)> {
        self.select_variant(bandwidth)?;
        self.media.get(cancel, bandwidth).await
    }

    fn info(&self) -> String {
        let mut info = format!(
            "Master | Bandwidth: {:3.1}Mb/s",
            self.variant_bandwidth as f64 / MB_DIVIDER
        );
        if let Some(resolution) = &self.resolution {
            info.push_str(&format!(" | Resolution: {resolution}"));
        }

        info
    }
}
