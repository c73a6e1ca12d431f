#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use attachment_rehost::clock::Clock;
use attachment_rehost::config::{EngineSettings, FieldMapping};
use attachment_rehost::error::{SourceError, UploadError};
use attachment_rehost::orchestrator::{ProgressObserver, RecordState};
use attachment_rehost::source::{SourcePage, SourceRecord, TabularSource};
use attachment_rehost::uploader::{BackoffPolicy, HostResponse, ImageHost, QuotaWindow};
use serde_json::{json, Map, Value};

pub const START_MS: i64 = 1_700_000_000_000;

/// Engine settings with test-friendly timings: no record delay, no jitter,
/// no per-run cap and a generous quota.
pub fn settings(mappings: Vec<FieldMapping>) -> EngineSettings {
    let mut s = EngineSettings::new(mappings);
    s.quota = QuotaWindow::new(100, Duration::from_secs(3600));
    s.backoff = BackoffPolicy {
        base: Duration::from_millis(100),
        jitter_max: Duration::ZERO,
        max_retries: 3,
    };
    s.max_uploads_per_run = None;
    s.record_delay = Duration::ZERO;
    s
}

pub fn logo_settings() -> EngineSettings {
    settings(vec![FieldMapping::new("Logo", &["LogoUrl"])])
}

/// Record whose `Logo` attachment points at `https://dl/{id}.png`.
pub fn logo_record(id: &str) -> SourceRecord {
    SourceRecord::new(
        id,
        json!({ "Name": format!("Game {id}"), "Logo": [{ "url": logo_url(id) }] }),
    )
}

pub fn logo_url(id: &str) -> String {
    format!("https://dl/{id}.png")
}

pub fn bare_record(id: &str) -> SourceRecord {
    SourceRecord::new(id, json!({ "Name": format!("Game {id}") }))
}

/// Paginated in-memory source that records every patch it receives.
#[derive(Default)]
pub struct FakeSource {
    pages: Vec<Vec<SourceRecord>>,
    patches: Mutex<Vec<(String, Map<String, Value>)>>,
    conflicts: HashSet<String>,
    list_calls: Mutex<usize>,
}

impl FakeSource {
    pub fn new(records: Vec<SourceRecord>, page_size: usize) -> Self {
        Self {
            pages: records.chunks(page_size.max(1)).map(|c| c.to_vec()).collect(),
            ..Default::default()
        }
    }

    /// Patches to these records fail with a conflict.
    pub fn with_conflicts(mut self, ids: &[&str]) -> Self {
        self.conflicts = ids.iter().map(|id| id.to_string()).collect();
        self
    }

    pub fn patches(&self) -> Vec<(String, Map<String, Value>)> {
        self.patches.lock().unwrap().clone()
    }

    pub fn patch_for(&self, record_id: &str) -> Option<Map<String, Value>> {
        self.patches()
            .into_iter()
            .find(|(id, _)| id == record_id)
            .map(|(_, fields)| fields)
    }

    pub fn list_calls(&self) -> usize {
        *self.list_calls.lock().unwrap()
    }
}

#[async_trait]
impl TabularSource for FakeSource {
    async fn list(&self, cursor: Option<&str>) -> Result<SourcePage, SourceError> {
        *self.list_calls.lock().unwrap() += 1;
        let index: usize = match cursor {
            Some(c) => c
                .parse()
                .map_err(|_| SourceError::Malformed(format!("bad cursor {c}")))?,
            None => 0,
        };
        let records = self.pages.get(index).cloned().unwrap_or_default();
        let next_cursor = (index + 1 < self.pages.len()).then(|| (index + 1).to_string());
        Ok(SourcePage {
            records,
            next_cursor,
        })
    }

    async fn patch_fields(
        &self,
        record_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<(), SourceError> {
        if self.conflicts.contains(record_id) {
            return Err(SourceError::Conflict {
                record_id: record_id.to_string(),
                status: 404,
                body: "NOT_FOUND".into(),
            });
        }
        self.patches
            .lock()
            .unwrap()
            .push((record_id.to_string(), fields.clone()));
        Ok(())
    }
}

/// Scripted response for one upload call.
#[derive(Debug, Clone)]
pub enum Reply {
    Throttle,
    Reject,
}

/// Image host that hosts everything at `https://host/{n}` unless a script says
/// otherwise. Scripts are consumed per source URL; `always_reject` fails forever.
pub struct FakeHost {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    always_reject: HashSet<String>,
    calls: Mutex<Vec<String>>,
    hosted: Mutex<Vec<i64>>,
    clock: Option<Arc<dyn Clock>>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            always_reject: HashSet::new(),
            calls: Mutex::new(Vec::new()),
            hosted: Mutex::new(Vec::new()),
            clock: None,
        }
    }

    pub fn script(self, source_url: &str, replies: Vec<Reply>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(source_url.to_string(), replies.into());
        self
    }

    pub fn reject_always(mut self, source_url: &str) -> Self {
        self.always_reject.insert(source_url.to_string());
        self
    }

    /// Stamp every successful upload with `clock` so window usage can be checked.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, source_url: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.as_str() == source_url)
            .count()
    }

    pub fn hosted_times(&self) -> Vec<i64> {
        self.hosted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageHost for FakeHost {
    async fn upload(&self, source_url: &str) -> Result<HostResponse, UploadError> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(source_url.to_string());
            calls.len()
        };
        if self.always_reject.contains(source_url) {
            return Err(UploadError::Rejected("unsupported image".into()));
        }
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(source_url)
            .and_then(|q| q.pop_front());
        match scripted {
            Some(Reply::Throttle) => Ok(HostResponse::Throttled { retry_after: None }),
            Some(Reply::Reject) => Err(UploadError::Rejected("rejected once".into())),
            None => {
                if let Some(clock) = &self.clock {
                    self.hosted.lock().unwrap().push(clock.now_millis());
                }
                Ok(HostResponse::Hosted(format!("https://host/{n}")))
            }
        }
    }
}

/// Largest number of timestamps inside any half-open window `[t, t + window_ms)`.
pub fn peak_window_usage(timestamps: &[i64], window_ms: i64) -> usize {
    let mut sorted = timestamps.to_vec();
    sorted.sort_unstable();
    sorted
        .iter()
        .map(|start| {
            sorted
                .iter()
                .filter(|t| **t >= *start && **t - *start < window_ms)
                .count()
        })
        .max()
        .unwrap_or(0)
}

/// Collects every `record_finished` call as (id, state, completed, total).
#[derive(Default)]
pub struct RecordingObserver {
    finished: Mutex<Vec<(String, RecordState, usize, usize)>>,
}

impl RecordingObserver {
    pub fn finished(&self) -> Vec<(String, RecordState, usize, usize)> {
        self.finished.lock().unwrap().clone()
    }
}

impl ProgressObserver for RecordingObserver {
    fn record_finished(&self, record_id: &str, state: RecordState, completed: usize, total: usize) {
        self.finished
            .lock()
            .unwrap()
            .push((record_id.to_string(), state, completed, total));
    }
}
