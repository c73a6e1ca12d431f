//! Paginated access to the remote tabular source.

mod http;

pub use http::HttpTabularSource;

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SourceError;

/// One row in the remote source. Only the attachment and output fields matter
/// here; everything else is passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl SourceRecord {
    pub fn new(id: impl Into<String>, fields: Value) -> Self {
        Self {
            id: id.into(),
            fields: match fields {
                Value::Object(map) => map,
                _ => Map::new(),
            },
        }
    }

    /// Human label for error reports, read from `title_field` when it holds a string.
    pub fn title(&self, title_field: Option<&str>) -> Option<String> {
        title_field
            .and_then(|f| self.fields.get(f))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SourcePage {
    pub records: Vec<SourceRecord>,
    pub next_cursor: Option<String>,
}

/// How the source applies field updates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpdateMode {
    /// Only the sent fields change.
    #[default]
    Partial,
    /// The sent field set replaces the record's fields; callers must merge.
    Replace,
}

#[async_trait]
pub trait TabularSource: Send + Sync {
    async fn list(&self, cursor: Option<&str>) -> Result<SourcePage, SourceError>;

    async fn patch_fields(
        &self,
        record_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<(), SourceError>;

    fn update_mode(&self) -> UpdateMode {
        UpdateMode::Partial
    }
}

/// Retry budget for page fetches. Separate from the upload quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListingRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for ListingRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

/// Follow cursors until exhausted and return every record in listing order.
///
/// Each page is retried on transient failures; anything else, or running out of
/// attempts, fails the whole listing.
pub async fn fetch_all(
    source: &dyn TabularSource,
    retry: &ListingRetry,
    shutdown: &CancellationToken,
) -> Result<Vec<SourceRecord>, SourceError> {
    let mut records = Vec::new();
    let mut cursor: Option<String> = None;
    let mut seen_cursors: HashSet<String> = HashSet::new();
    let mut pages = 0usize;

    loop {
        let page = fetch_page(source, cursor.as_deref(), retry, shutdown).await?;
        pages += 1;
        debug!(
            page = pages,
            records = page.records.len(),
            "fetched source page"
        );
        records.extend(page.records);

        match page.next_cursor.filter(|c| !c.is_empty()) {
            Some(next) => {
                if !seen_cursors.insert(next.clone()) {
                    return Err(SourceError::Malformed(format!(
                        "pagination cursor {next} repeated"
                    )));
                }
                cursor = Some(next);
            }
            None => break,
        }
    }

    info!(pages, records = records.len(), "source listing complete");
    Ok(records)
}

async fn fetch_page(
    source: &dyn TabularSource,
    cursor: Option<&str>,
    retry: &ListingRetry,
    shutdown: &CancellationToken,
) -> Result<SourcePage, SourceError> {
    let mut attempt = 1u32;
    loop {
        match source.list(cursor).await {
            Ok(page) => return Ok(page),
            Err(err) if err.is_transient() && attempt < retry.attempts.max(1) => {
                warn!(attempt, error = %err, "source page fetch failed; retrying");
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return Err(SourceError::Cancelled),
                    _ = tokio::time::sleep(retry.delay) => {}
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
