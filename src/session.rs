//! Streaming session: the two-task pipeline at the heart of the crate.
//!
//! A session runs exactly two cooperating tasks over a pair of bounded
//! queues:
//!
//! - the *poller* (runs inline in [`Restream::run`]) repeatedly asks the
//!   segment provider for new segments and enqueues them — a full queue
//!   blocks the push, which is the backpressure throttle when the consumer
//!   falls behind;
//! - the *consumer* (spawned) dequeues segments, fetches their content,
//!   decrypts when a key is declared, estimates bandwidth from the first
//!   buffer fill, and writes the plaintext to the sink in fixed-size chunks.
//!
//! The bandwidth estimate is shared through an atomic: the consumer writes
//! the measurement, the poller feeds it into the next variant selection. The
//! value is a heuristic, so the read/write race is tolerated by design.
//!
//! The first error posted by either task ends the whole session; cancelling
//! the supplied token ends it cleanly after a final stats line. Those are the
//! only terminal states — retries live exclusively inside the fetch client.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use parking_lot::RwLock;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::decrypt::{Aes128Cbc, Decrypter};
use crate::error::{RestreamError, RestreamResult};
use crate::fetch::FetchClient;
use crate::provider::{segment_provider_for, SegmentProvider};
use crate::segment::{KeyMethod, Segment};
use crate::settings::RestreamSettings;

/// Size of the chunks fed through decryption and into the sink.
const WRITE_CHUNK_SIZE: usize = 32 * 1024;

const MB_DIVIDER: f64 = 1_048_576.0;

/// An adaptive-bitrate streaming session writing to `W`.
pub struct Restream<W> {
    settings: RestreamSettings,
    fetch: FetchClient,
    sink: W,
}

impl<W> Restream<W>
where
    W: AsyncWrite + Unpin + Send + Sync + 'static,
{
    /// Creates a session with the given settings, writing to `sink`.
    pub fn new(settings: RestreamSettings, sink: W) -> RestreamResult<Self> {
        let fetch =
            FetchClient::new(&settings.user_agent)?.with_retry_interval(settings.retry_interval);

        Ok(Self {
            settings,
            fetch,
            sink,
        })
    }

    /// Streams the playlist at `playlist_url` until cancellation or failure.
    ///
    /// Returns `Ok(())` on clean cancellation; the first error from either
    /// pipeline task otherwise.
    pub async fn run(self, cancel: CancellationToken, playlist_url: &str) -> RestreamResult<()> {
        let provider = segment_provider_for(
            self.fetch.clone(),
            &cancel,
            playlist_url,
            self.settings.max_bandwidth,
        )
        .await?;

        self.run_with_provider(cancel, provider).await
    }

    /// Streams from an already-built provider.
    ///
    /// Exposed so callers (and tests) can inject a provider instead of
    /// having it derived from a playlist URL.
    pub async fn run_with_provider(
        self,
        cancel: CancellationToken,
        mut provider: Box<dyn SegmentProvider>,
    ) -> RestreamResult<()> {
        let (segment_tx, segment_rx) = mpsc::channel::<Segment>(self.settings.queue_capacity);
        let (error_tx, mut error_rx) = mpsc::channel::<RestreamError>(self.settings.queue_capacity);

        // The estimate starts at the ceiling so the first selection is only
        // bounded by configuration.
        let bandwidth = Arc::new(AtomicU64::new(self.settings.max_bandwidth));
        let streamed_bytes = Arc::new(AtomicU64::new(0));
        let decrypter_info = Arc::new(RwLock::new(None));

        let stats = SessionStats {
            bandwidth: Arc::clone(&bandwidth),
            streamed_bytes: Arc::clone(&streamed_bytes),
            decrypter_info: Arc::clone(&decrypter_info),
        };

        let consumer_cancel = cancel.child_token();
        let consumer = Consumer {
            fetch: self.fetch.clone(),
            sink: self.sink,
            read_buffer_size: self.settings.read_buffer_size,
            cancel: consumer_cancel.clone(),
            segment_rx,
            error_tx,
            bandwidth: Arc::clone(&bandwidth),
            streamed_bytes,
            decrypter_info,
            decrypter: None,
        };
        let consumer_task = tokio::spawn(consumer.run());

        let result = 'session: loop {
            let polled = provider
                .get(&cancel, bandwidth.load(Ordering::Relaxed))
                .await;

            let (segments, delay) = match polled {
                Ok(polled) => polled,
                Err(RestreamError::Cancelled) => {
                    stats.log(provider.as_ref());
                    break Ok(());
                }
                Err(e) => break Err(e.with_context("failed to get new segments")),
            };

            for segment in segments {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        stats.log(provider.as_ref());
                        break 'session Ok(());
                    }
                    err = error_rx.recv() => break 'session Err(consumer_error(err)),
                    sent = segment_tx.send(segment) => {
                        if sent.is_err() {
                            // Consumer already exited; its error, if any, is
                            // waiting in the queue.
                            break 'session Err(consumer_error(error_rx.recv().await));
                        }
                    }
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    stats.log(provider.as_ref());
                    break Ok(());
                }
                err = error_rx.recv() => break Err(consumer_error(err)),
                _ = tokio::time::sleep(delay) => stats.log(provider.as_ref()),
            }
        };

        consumer_cancel.cancel();
        let _ = consumer_task.await;

        result
    }
}

/// Maps the error-queue receive result to the session's terminal error.
fn consumer_error(received: Option<RestreamError>) -> RestreamError {
    received.unwrap_or_else(|| RestreamError::msg("segment consumer terminated unexpectedly"))
}

/// Periodic stats shared between the pipeline tasks.
struct SessionStats {
    bandwidth: Arc<AtomicU64>,
    streamed_bytes: Arc<AtomicU64>,
    decrypter_info: Arc<RwLock<Option<&'static str>>>,
}

impl SessionStats {
    fn log(&self, provider: &dyn SegmentProvider) {
        let streamed_mb = self.streamed_bytes.load(Ordering::Relaxed) as f64 / MB_DIVIDER;
        let bandwidth_mbps = self.bandwidth.load(Ordering::Relaxed) as f64 / MB_DIVIDER;
        let decrypter = *self.decrypter_info.read();

        match decrypter {
            Some(decrypter) => info!(
                streamed_mb = format_args!("{streamed_mb:.1}"),
                bandwidth_mbps = format_args!("{bandwidth_mbps:.1}"),
                decrypter,
                provider = %provider.info(),
                "session stats"
            ),
            None => info!(
                streamed_mb = format_args!("{streamed_mb:.1}"),
                bandwidth_mbps = format_args!("{bandwidth_mbps:.1}"),
                provider = %provider.info(),
                "session stats"
            ),
        }
    }
}

/// The dequeue-fetch-decrypt-write half of the pipeline.
struct Consumer<W> {
    fetch: FetchClient,
    sink: W,
    read_buffer_size: usize,
    cancel: CancellationToken,
    segment_rx: mpsc::Receiver<Segment>,
    error_tx: mpsc::Sender<RestreamError>,
    bandwidth: Arc<AtomicU64>,
    streamed_bytes: Arc<AtomicU64>,
    decrypter_info: Arc<RwLock<Option<&'static str>>>,
    decrypter: Option<Box<dyn Decrypter>>,
}

impl<W> Consumer<W>
where
    W: AsyncWrite + Unpin + Send + Sync,
{
    async fn run(mut self) {
        loop {
            let segment = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                segment = self.segment_rx.recv() => match segment {
                    Some(segment) => segment,
                    None => return,
                },
            };

            if let Err(e) = self.process_segment(&segment).await {
                // Clean cancellation is not an error; the poller logs final
                // stats and ends the session on its own.
                if !e.is_cancelled() {
                    let _ = self.error_tx.send(e).await;
                }
                return;
            }
        }
    }

    /// Installs, replaces or clears the decrypter according to the
    /// segment's declared key method.
    async fn install_decrypter(&mut self, segment: &Segment) -> RestreamResult<()> {
        debug!(method = %segment.key_method, url = %segment.url, "applying key method");

        match &segment.key_method {
            KeyMethod::None => {
                self.decrypter = None;
                *self.decrypter_info.write() = None;
                Ok(())
            }
            KeyMethod::Aes128 => {
                let key_url = segment.key_url.clone().ok_or_else(|| {
                    RestreamError::InvalidPlaylist(format!(
                        "AES-128 segment {} declares no key URI",
                        segment.url
                    ))
                })?;
                let iv = segment.iv.clone().unwrap_or_default();

                let mut decrypter: Box<dyn Decrypter> =
                    Box::new(Aes128Cbc::new(self.fetch.clone(), key_url, iv));
                decrypter
                    .init(&self.cancel)
                    .await
                    .map_err(|e| e.with_context("error initiating decrypter"))?;

                *self.decrypter_info.write() = Some(decrypter.info());
                self.decrypter = Some(decrypter);
                Ok(())
            }
            KeyMethod::Other(method) => {
                self.decrypter = None;
                *self.decrypter_info.write() = None;
                Err(RestreamError::UnsupportedKeyMethod(method.clone()))
            }
        }
    }

    async fn process_segment(&mut self, segment: &Segment) -> RestreamResult<()> {
        self.install_decrypter(segment).await?;

        let response = self.fetch.fetch(&self.cancel, segment.url.as_str()).await?;
        let mut stream = Box::pin(response.bytes_stream());
        let mut buffered = BytesMut::with_capacity(self.read_buffer_size.max(WRITE_CHUNK_SIZE));
        let mut ended = false;

        // Bandwidth probe: time the fill of the first read buffer. The
        // resulting bits-per-second figure replaces the running estimate and
        // drives the next variant selection.
        let started = Instant::now();
        while buffered.len() < self.read_buffer_size {
            match self.next_chunk(&mut stream).await? {
                Some(chunk) => buffered.extend_from_slice(&chunk),
                None => {
                    ended = true;
                    break;
                }
            }
        }
        let elapsed = started.elapsed().as_secs_f64();
        if !buffered.is_empty() && elapsed > 0.0 {
            let estimate = (buffered.len() as f64 * 8.0 / elapsed) as u64;
            self.bandwidth.store(estimate, Ordering::Relaxed);
            debug!(url = %segment.url, estimate_bps = estimate, "updated bandwidth estimate");
        }

        // Stream the segment in fixed-size chunks. Full chunks keep the
        // cipher block alignment; the remainder goes out last.
        loop {
            while buffered.len() >= WRITE_CHUNK_SIZE {
                let mut chunk = buffered.split_to(WRITE_CHUNK_SIZE);
                self.emit(&mut chunk).await?;
            }
            if ended {
                break;
            }
            match self.next_chunk(&mut stream).await? {
                Some(chunk) => buffered.extend_from_slice(&chunk),
                None => ended = true,
            }
        }
        if !buffered.is_empty() {
            let len = buffered.len();
            let mut chunk = buffered.split_to(len);
            self.emit(&mut chunk).await?;
        }

        self.sink.flush().await?;

        Ok(())
    }

    /// Pulls the next chunk off the segment body, racing cancellation.
    async fn next_chunk<S>(&self, stream: &mut S) -> RestreamResult<Option<Bytes>>
    where
        S: Stream<Item = reqwest::Result<Bytes>> + Unpin,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RestreamError::Cancelled),
            item = stream.next() => match item {
                Some(Ok(chunk)) => Ok(Some(chunk)),
                Some(Err(e)) => {
                    Err(RestreamError::Http(e).with_context("error reading stream"))
                }
                None => Ok(None),
            },
        }
    }

    /// Decrypts a chunk when a decrypter is active and writes the plaintext
    /// to the sink.
    async fn emit(&mut self, chunk: &mut BytesMut) -> RestreamResult<()> {
        if let Some(decrypter) = self.decrypter.as_mut() {
            let plaintext = decrypter
                .decrypt(&mut chunk[..])
                .map_err(|e| e.with_context("cannot decrypt"))?;
            if self.cancel.is_cancelled() {
                return Err(RestreamError::Cancelled);
            }
            self.sink
                .write_all(plaintext)
                .await
                .map_err(|e| RestreamError::Io(e).with_context("error writing output"))?;
            self.streamed_bytes
                .fetch_add(plaintext.len() as u64, Ordering::Relaxed);
        } else {
            if self.cancel.is_cancelled() {
                return Err(RestreamError::Cancelled);
            }
            self.sink
                .write_all(&chunk[..])
                .await
                .map_err(|e| RestreamError::Io(e).with_context("error writing output"))?;
            self.streamed_bytes
                .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }

        Ok(())
    }
}
