use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{SourcePage, SourceRecord, TabularSource, UpdateMode};
use crate::error::SourceError;

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    records: Vec<SourceRecord>,
    #[serde(default)]
    offset: Option<String>,
}

/// REST tabular source: `GET {base}/{container}?pageSize=&offset=` for listing and
/// `PATCH` (or `PUT` in replace mode) `{base}/{container}/{id}` with `{"fields": ...}`.
#[derive(Debug, Clone)]
pub struct HttpTabularSource {
    base_url: String,
    container: String,
    token: String,
    page_size: usize,
    mode: UpdateMode,
    http: Client,
}

impl HttpTabularSource {
    pub fn new(
        base_url: &str,
        container: &str,
        token: &str,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .user_agent(concat!("attachment-rehost/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            container: container.trim_matches('/').to_string(),
            token: token.to_string(),
            page_size: 100,
            mode: UpdateMode::Partial,
            http,
        })
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.clamp(1, 100);
        self
    }

    pub fn with_update_mode(mut self, mode: UpdateMode) -> Self {
        self.mode = mode;
        self
    }

    fn container_url(&self) -> String {
        format!("{}/{}", self.base_url, self.container)
    }

    fn record_url(&self, record_id: &str) -> String {
        format!(
            "{}/{}",
            self.container_url(),
            urlencoding::encode(record_id)
        )
    }
}

#[async_trait]
impl TabularSource for HttpTabularSource {
    async fn list(&self, cursor: Option<&str>) -> Result<SourcePage, SourceError> {
        let page_size = self.page_size.to_string();
        let mut req = self
            .http
            .get(self.container_url())
            .bearer_auth(&self.token)
            .query(&[("pageSize", page_size.as_str())]);
        if let Some(c) = cursor {
            req = req.query(&[("offset", c)]);
        }
        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(SourceError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        let parsed: ListResponse = serde_json::from_str(&text)
            .map_err(|e| SourceError::Malformed(format!("list response: {e}")))?;
        Ok(SourcePage {
            records: parsed.records,
            next_cursor: parsed.offset,
        })
    }

    async fn patch_fields(
        &self,
        record_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<(), SourceError> {
        let method = match self.mode {
            UpdateMode::Partial => Method::PATCH,
            UpdateMode::Replace => Method::PUT,
        };
        let resp = self
            .http
            .request(method, self.record_url(record_id))
            .bearer_auth(&self.token)
            .json(&json!({ "fields": fields }))
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        match status {
            StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY => Err(SourceError::Conflict {
                record_id: record_id.to_string(),
                status: status.as_u16(),
                body,
            }),
            _ => Err(SourceError::Status {
                status: status.as_u16(),
                body,
            }),
        }
    }

    fn update_mode(&self) -> UpdateMode {
        self.mode
    }
}
