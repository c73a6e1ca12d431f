use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;

use super::{HostResponse, ImageHost};
use crate::error::UploadError;

fn truncate_for_log(mut s: String, max_len: usize) -> String {
    if s.len() > max_len {
        let mut cut = max_len;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push('…');
    }
    s
}

fn mentions_rate_limit(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower.contains("rate limit") || lower.contains("too many requests")
}

#[derive(Debug, Deserialize)]
struct HostPayload {
    data: Option<HostedImage>,
    error: Option<HostFailure>,
}

#[derive(Debug, Deserialize)]
struct HostedImage {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HostFailure {
    #[serde(default)]
    message: Option<String>,
}

/// Image host speaking the common "form POST `key` + `image`, get back
/// `{data:{url}}`" protocol. The image is passed by remote URL; the host fetches it.
#[derive(Debug, Clone)]
pub struct HttpImageHost {
    endpoint: String,
    api_key: String,
    http: Client,
}

impl HttpImageHost {
    pub fn new(endpoint: &str, api_key: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .user_agent(concat!("attachment-rehost/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            http,
        })
    }

    fn retry_after(resp: &reqwest::Response) -> Option<Duration> {
        resp.headers()
            .get(header::RETRY_AFTER)
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }
}

#[async_trait]
impl ImageHost for HttpImageHost {
    async fn upload(&self, source_url: &str) -> Result<HostResponse, UploadError> {
        let resp = self
            .http
            .post(&self.endpoint)
            .form(&[("key", self.api_key.as_str()), ("image", source_url)])
            .send()
            .await
            .map_err(|e| UploadError::Transport(e.to_string()))?;

        let status = resp.status();
        let retry_after = Self::retry_after(&resp);
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Ok(HostResponse::Throttled { retry_after });
        }

        let text = resp
            .text()
            .await
            .map_err(|e| UploadError::Transport(e.to_string()))?;
        if !status.is_success() {
            if mentions_rate_limit(&text) {
                return Ok(HostResponse::Throttled { retry_after });
            }
            return Err(UploadError::Rejected(format!(
                "status={}: {}",
                status,
                truncate_for_log(text, 300)
            )));
        }

        let payload: HostPayload = serde_json::from_str(&text).map_err(|e| {
            UploadError::MalformedResponse(format!("{e}: {}", truncate_for_log(text.clone(), 300)))
        })?;
        if let Some(url) = payload
            .data
            .and_then(|d| d.url)
            .filter(|u| !u.trim().is_empty())
        {
            return Ok(HostResponse::Hosted(url));
        }
        match payload.error.and_then(|e| e.message) {
            Some(msg) if mentions_rate_limit(&msg) => Ok(HostResponse::Throttled { retry_after }),
            Some(msg) => Err(UploadError::Rejected(msg)),
            None => Err(UploadError::MalformedResponse(
                "response carried no hosted url".into(),
            )),
        }
    }
}
