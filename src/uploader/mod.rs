//! Re-hosting through the image host under a rolling request budget.

mod backoff;
mod http;
mod quota;

pub use backoff::BackoffPolicy;
pub use http::HttpImageHost;
pub use quota::QuotaWindow;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint::{ProgressHandle, SlotDecision};
use crate::clock::Clock;
use crate::error::UploadError;

/// What the image host said about one upload call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostResponse {
    Hosted(String),
    Throttled { retry_after: Option<Duration> },
}

#[async_trait]
pub trait ImageHost: Send + Sync {
    /// Upload the image at `source_url`. Every call may produce a new hosted copy.
    async fn upload(&self, source_url: &str) -> Result<HostResponse, UploadError>;
}

/// Outcome of one attempt inside the retry loop.
enum Attempt {
    Success(String),
    Throttled(Option<Duration>),
    Failed(UploadError),
}

pub struct RateLimitedUploader {
    host: Arc<dyn ImageHost>,
    progress: Arc<ProgressHandle>,
    quota: QuotaWindow,
    backoff: BackoffPolicy,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
}

impl RateLimitedUploader {
    pub fn new(
        host: Arc<dyn ImageHost>,
        progress: Arc<ProgressHandle>,
        quota: QuotaWindow,
        backoff: BackoffPolicy,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            host,
            progress,
            quota,
            backoff,
            clock,
            shutdown,
        }
    }

    /// Upload one resolved URL and return the hosted URL.
    ///
    /// Waits for quota before every attempt. Throttling is retried with
    /// exponential backoff up to `max_retries`; any other failure is returned
    /// immediately. A successful upload is appended to the ledger and persisted
    /// before this returns.
    pub async fn upload(&self, source_url: &str) -> Result<String, UploadError> {
        self.upload_observed(source_url, |_, _| {}).await
    }

    /// Same as `upload`, calling `on_backoff(attempt, wait)` before each throttling wait.
    pub async fn upload_observed<F>(
        &self,
        source_url: &str,
        on_backoff: F,
    ) -> Result<String, UploadError>
    where
        F: Fn(u32, Duration) + Send + Sync,
    {
        let mut attempt = 0u32;
        loop {
            self.acquire_slot().await?;

            let step = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => Attempt::Failed(UploadError::Cancelled),
                res = self.host.upload(source_url) => match res {
                    Ok(HostResponse::Hosted(url)) => Attempt::Success(url),
                    Ok(HostResponse::Throttled { retry_after }) => Attempt::Throttled(retry_after),
                    Err(e) => Attempt::Failed(e),
                },
            };

            match step {
                Attempt::Success(hosted) => {
                    self.progress.commit_upload(self.clock.now_millis()).await?;
                    debug!(attempt, %hosted, "upload succeeded");
                    return Ok(hosted);
                }
                Attempt::Failed(err) => {
                    self.progress.release_slot().await;
                    return Err(err);
                }
                Attempt::Throttled(retry_after) => {
                    self.progress.release_slot().await;
                    if self.backoff.exhausted(attempt) {
                        warn!(attempts = attempt + 1, "image host kept throttling; giving up");
                        return Err(UploadError::RateLimitExceeded {
                            attempts: attempt + 1,
                        });
                    }
                    let mut wait = self.backoff.delay(attempt);
                    if let Some(floor) = retry_after {
                        wait = wait.max(floor);
                    }
                    warn!(
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        "image host throttled upload; backing off"
                    );
                    on_backoff(attempt, wait);
                    self.sleep(wait).await?;
                    attempt += 1;
                }
            }
        }
    }

    async fn acquire_slot(&self) -> Result<(), UploadError> {
        loop {
            let now = self.clock.now_millis();
            match self.progress.try_reserve_slot(&self.quota, now).await {
                SlotDecision::Granted => return Ok(()),
                SlotDecision::Wait(wait) => {
                    info!(
                        budget = self.quota.budget,
                        window_secs = self.quota.window.as_secs(),
                        wait_ms = wait.as_millis() as u64,
                        "upload quota exhausted; waiting for window to free up"
                    );
                    self.sleep(wait).await?;
                }
            }
        }
    }

    async fn sleep(&self, wait: Duration) -> Result<(), UploadError> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(UploadError::Cancelled),
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }
}
