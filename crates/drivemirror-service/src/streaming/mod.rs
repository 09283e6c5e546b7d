//! Resilient streaming of file contents.
//!
//! A download is fetched as consecutive ranged requests of
//! [`chunk_size`](crate::config::StreamingConfig::chunk_size) bytes. Every request goes through
//! the same loop: acquire a token for the current credential, send the request and classify the
//! response. Transient failures are retried with a fixed backoff, quota errors rotate to the
//! next credential and resume at the current byte position. Any other failure ends the stream.
//!
//! The first request is made by [`Streamer::open`], before anything is sent to the client, so
//! that missing files or exhausted credentials still turn into proper status codes.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use reqwest::{Client, Response, StatusCode, header};

use crate::config::StreamingConfig;
use crate::credentials::{Credential, Escalation};
use crate::error::DriveError;
use crate::upstream::{DriveApi, UpstreamOutcome};
use crate::utils::defer::{DeferGuard, defer};
use crate::utils::http::{UpstreamTimeouts, create_stream_client};

mod range;

pub use range::{InvalidRange, RequestedRange, ResolvedRange, unsatisfied_range};

/// Opens download streams.
#[derive(Debug)]
pub struct Streamer {
    api: Arc<DriveApi>,
    timeouts: UpstreamTimeouts,
    config: StreamingConfig,
}

impl Streamer {
    pub fn new(api: Arc<DriveApi>, timeouts: UpstreamTimeouts, config: StreamingConfig) -> Self {
        Self {
            api,
            timeouts,
            config,
        }
    }

    /// Starts streaming `range` of the file.
    ///
    /// Returns once the first chunk was requested successfully. Opening is retried up to
    /// [`max_request_attempts`](StreamingConfig::max_request_attempts) times on transient
    /// failures.
    pub async fn open(&self, file_id: &str, range: ResolvedRange) -> Result<FileStream, DriveError> {
        let pool = self.api.pool();
        let (slot, credential) = pool.current();

        let mut session = Session {
            api: Arc::clone(&self.api),
            client: create_stream_client(&self.timeouts),
            file_id: file_id.into(),
            config: self.config.clone(),
            escalation: pool.escalation(),
            slot,
            credential,
            position: range.start(),
            end: range.end(),
            response: None,
            received: false,
            failures: 0,
            sent: 0,
            cancelled: None,
        };

        let retries = self.config.max_request_attempts.saturating_sub(1);
        let response = session.request(retries).await?;
        session.response = Some(response);
        session.failures = 0;

        let file_id = Arc::clone(&session.file_id);
        let on_drop: Box<dyn FnOnce() + Send> = Box::new(move || {
            metric!(counter("streaming.cancelled") += 1);
            tracing::debug!(%file_id, "stream dropped by the client");
        });
        session.cancelled = Some(defer(on_drop));

        tracing::debug!(
            file_id = %session.file_id,
            range = %range.content_range(),
            "opened stream"
        );
        metric!(counter("streaming.opened") += 1);

        let inner = futures::stream::unfold(Some(session), |session| async move {
            let mut session = session?;
            match session.next_bytes().await {
                Ok(Some(bytes)) => Some((Ok(bytes), Some(session))),
                Ok(None) => {
                    session.complete();
                    None
                }
                Err(err) => {
                    session.fail(&err);
                    Some((Err(err), None))
                }
            }
        });

        Ok(FileStream {
            range,
            inner: inner.boxed(),
        })
    }
}

/// The body of a download.
///
/// Dropping the stream closes the upstream connection.
pub struct FileStream {
    range: ResolvedRange,
    inner: BoxStream<'static, Result<Bytes, DriveError>>,
}

impl FileStream {
    /// The range of the file delivered by this stream.
    pub fn range(&self) -> ResolvedRange {
        self.range
    }
}

impl fmt::Debug for FileStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileStream")
            .field("range", &self.range)
            .finish_non_exhaustive()
    }
}

impl Stream for FileStream {
    type Item = Result<Bytes, DriveError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

/// The state of a running download.
struct Session {
    api: Arc<DriveApi>,
    /// Dedicated client, dropped together with the session.
    client: Client,
    file_id: Arc<str>,
    config: StreamingConfig,
    escalation: Escalation,
    slot: usize,
    credential: Arc<Credential>,
    /// The next byte to deliver.
    position: u64,
    /// The last byte to deliver, inclusive.
    end: u64,
    response: Option<Response>,
    /// Whether `response` delivered any bytes yet.
    received: bool,
    /// Consecutive transient failures.
    failures: usize,
    sent: u64,
    cancelled: Option<DeferGuard<Box<dyn FnOnce() + Send>>>,
}

impl Session {
    /// Returns the next bytes of the range, or `None` once the range is complete.
    async fn next_bytes(&mut self) -> Result<Option<Bytes>, DriveError> {
        let max_retries = self.config.max_chunk_retries;

        while self.position <= self.end {
            let mut response = match self.response.take() {
                Some(response) => response,
                None => self.request(max_retries).await?,
            };

            match response.chunk().await {
                Ok(Some(mut bytes)) => {
                    self.response = Some(response);

                    let remaining = self.end - self.position + 1;
                    if bytes.len() as u64 > remaining {
                        bytes.truncate(remaining as usize);
                    }
                    if bytes.is_empty() {
                        continue;
                    }

                    self.position += bytes.len() as u64;
                    self.sent += bytes.len() as u64;
                    self.received = true;
                    self.failures = 0;
                    if self.escalation.tried() > 1 {
                        // Credentials that ran out earlier may have recovered by now.
                        self.escalation = self.api.pool().escalation();
                    }
                    return Ok(Some(bytes));
                }
                // The chunk is complete, the next one starts at `position`.
                Ok(None) if self.received => {}
                Ok(None) => {
                    let err = DriveError::Transient {
                        status: None,
                        details: "upstream sent an empty response".into(),
                    };
                    self.backoff(max_retries, err).await?;
                }
                Err(err) => {
                    let err = DriveError::Transient {
                        status: None,
                        details: DriveError::from(err).to_string(),
                    };
                    self.backoff(max_retries, err).await?;
                }
            }
        }

        Ok(None)
    }

    /// Requests the next chunk starting at the current position.
    ///
    /// Loops until upstream delivers the chunk, rotating credentials on quota errors and
    /// retrying transient failures up to `max_retries` times in a row.
    async fn request(&mut self, max_retries: usize) -> Result<Response, DriveError> {
        let chunk_size = self.config.chunk_size.max(1);

        loop {
            let chunk_end = self.end.min(self.position.saturating_add(chunk_size - 1));
            let outcome = self
                .api
                .media(
                    &self.client,
                    &self.credential,
                    &self.file_id,
                    (self.position, chunk_end),
                )
                .await;

            match outcome {
                UpstreamOutcome::Success(response) => {
                    self.check_range(&response)?;
                    self.received = false;
                    return Ok(response);
                }
                UpstreamOutcome::RateLimited(reason) => {
                    metric!(counter("upstream.quota_exceeded") += 1, "operation" => "files.media");
                    (self.slot, self.credential) =
                        self.escalation
                            .exhausted(self.api.pool(), self.slot, &reason)?;
                }
                UpstreamOutcome::Transient { status, details } => {
                    let err = DriveError::Transient { status, details };
                    self.backoff(max_retries, err).await?;
                }
                other => return other.into_result(),
            }
        }
    }

    /// Makes sure upstream answered with the requested range.
    fn check_range(&self, response: &Response) -> Result<(), DriveError> {
        match response.status() {
            StatusCode::PARTIAL_CONTENT => {
                let start = response
                    .headers()
                    .get(header::CONTENT_RANGE)
                    .and_then(|value| value.to_str().ok())
                    .and_then(range::content_range_start);
                match start {
                    Some(start) if start == self.position => Ok(()),
                    _ => Err(DriveError::Malformed(format!(
                        "upstream did not return the range starting at {}",
                        self.position
                    ))),
                }
            }
            // Upstream ignored the range and sends the whole file.
            StatusCode::OK if self.position == 0 => Ok(()),
            status => Err(DriveError::Malformed(format!(
                "unexpected status {status} for a ranged request"
            ))),
        }
    }

    /// Counts a transient failure and waits before the next attempt.
    ///
    /// Returns `err` once more than `max_retries` failures happened in a row.
    async fn backoff(&mut self, max_retries: usize, err: DriveError) -> Result<(), DriveError> {
        self.failures += 1;
        if self.failures > max_retries {
            return Err(err);
        }

        metric!(counter("streaming.retries") += 1);
        tracing::warn!(
            file_id = %self.file_id,
            position = self.position,
            failures = self.failures,
            error = %err,
            "upstream stream failed, retrying"
        );
        tokio::time::sleep(self.config.retry_backoff).await;
        Ok(())
    }

    fn complete(&mut self) {
        if let Some(guard) = self.cancelled.take() {
            guard.cancel();
        }
        metric!(time_raw("streaming.bytes") = self.sent);
        tracing::debug!(file_id = %self.file_id, bytes = self.sent, "stream complete");
    }

    fn fail(&mut self, err: &DriveError) {
        if let Some(guard) = self.cancelled.take() {
            guard.cancel();
        }
        metric!(counter("streaming.failed") += 1);
        tracing::error!(
            file_id = %self.file_id,
            position = self.position,
            error = %err,
            "stream failed"
        );
    }
}
