//! Retrying HTTP fetch layer.
//!
//! Every component that touches the network (playlist decoding, key
//! retrieval, segment download) goes through [`FetchClient`]. The client owns
//! transient-failure recovery completely: connection errors, timeouts and any
//! status >= 400 other than 404 are retried at a fixed interval until the
//! request succeeds or the supplied cancellation token fires. A 404 means the
//! resource is gone from the server (live segments expire fast) and is
//! surfaced immediately instead of being retried.
//!
//! Compressed transfer is requested and handled transparently by reqwest's
//! `gzip` support.

use std::time::Duration;

use bytes::Bytes;
use reqwest::{Response, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{RestreamError, RestreamResult};

/// HTTP client with retry-until-cancelled semantics.
#[derive(Debug, Clone)]
pub struct FetchClient {
    client: reqwest::Client,
    retry_interval: Duration,
}

impl FetchClient {
    /// Creates a client sending the given User-Agent with every request.
    pub fn new(user_agent: &str) -> RestreamResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .gzip(true)
            .build()?;

        Ok(Self {
            client,
            retry_interval: Duration::from_secs(1),
        })
    }

    /// Sets the wait between retries. The interval is fixed, never backed
    /// off: against a live segment server, waiting longer only means the
    /// content has expired by the time we get it.
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Issues a GET request, retrying transient failures indefinitely.
    ///
    /// Returns the response as soon as the server answers with a status
    /// below 400. A 404 is returned as [`RestreamError::HttpStatus`] without
    /// retrying; any other failure is logged and retried after
    /// `retry_interval`. Cancelling `cancel` aborts the loop at the next
    /// await point and returns [`RestreamError::Cancelled`].
    pub async fn fetch(&self, cancel: &CancellationToken, url: &str) -> RestreamResult<Response> {
        loop {
            let attempt = self.client.get(url).send();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RestreamError::Cancelled),
                res = attempt => res,
            };

            match outcome {
                Ok(response) => {
                    let status = response.status();
                    if status.as_u16() < 400 {
                        return Ok(response);
                    }
                    if status == StatusCode::NOT_FOUND {
                        return Err(RestreamError::HttpStatus {
                            status: status.as_u16(),
                            url: url.to_string(),
                        });
                    }
                    warn!(
                        url,
                        status = status.as_u16(),
                        retry_in = ?self.retry_interval,
                        "request failed, will retry"
                    );
                }
                Err(e) => {
                    warn!(
                        url,
                        error = %e,
                        retry_in = ?self.retry_interval,
                        "request failed, will retry"
                    );
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RestreamError::Cancelled),
                _ = tokio::time::sleep(self.retry_interval) => {}
            }
        }
    }

    /// Fetches a URL and collects the whole body into memory.
    ///
    /// Used for small resources: playlists and encryption keys.
    pub async fn fetch_bytes(
        &self,
        cancel: &CancellationToken,
        url: &str,
    ) -> RestreamResult<Bytes> {
        let response = self.fetch(cancel, url).await?;
        let collect = response.bytes();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RestreamError::Cancelled),
            res = collect => Ok(res?),
        }
    }
}
