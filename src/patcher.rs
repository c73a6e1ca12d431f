use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::SourceError;
use crate::source::{SourceRecord, TabularSource, UpdateMode};

/// Writes hosted URLs back into a record with a single update call.
pub struct RecordPatcher {
    source: Arc<dyn TabularSource>,
}

impl RecordPatcher {
    pub fn new(source: Arc<dyn TabularSource>) -> Self {
        Self { source }
    }

    /// `updates` maps output field -> hosted URL. Sources with replace semantics
    /// receive the record's listed fields merged with the updates, so unrelated
    /// fields are carried over instead of cleared.
    pub async fn patch(
        &self,
        record: &SourceRecord,
        updates: &BTreeMap<String, String>,
    ) -> Result<(), SourceError> {
        if updates.is_empty() {
            return Ok(());
        }
        let body = match self.source.update_mode() {
            UpdateMode::Partial => updates_only(updates),
            UpdateMode::Replace => merge_fields(&record.fields, updates),
        };
        debug!(record_id = %record.id, fields = ?updates.keys().collect::<Vec<_>>(), "patching record");
        self.source.patch_fields(&record.id, &body).await
    }
}

fn updates_only(updates: &BTreeMap<String, String>) -> Map<String, Value> {
    updates
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect()
}

pub fn merge_fields(
    existing: &Map<String, Value>,
    updates: &BTreeMap<String, String>,
) -> Map<String, Value> {
    let mut merged = existing.clone();
    for (k, v) in updates {
        merged.insert(k.clone(), Value::String(v.clone()));
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct RecordingSource {
        mode: UpdateMode,
        sent: Mutex<Vec<(String, Map<String, Value>)>>,
    }

    #[async_trait]
    impl TabularSource for RecordingSource {
        async fn list(&self, _: Option<&str>) -> Result<crate::source::SourcePage, SourceError> {
            Ok(Default::default())
        }

        async fn patch_fields(
            &self,
            record_id: &str,
            fields: &Map<String, Value>,
        ) -> Result<(), SourceError> {
            self.sent
                .lock()
                .unwrap()
                .push((record_id.to_string(), fields.clone()));
            Ok(())
        }

        fn update_mode(&self) -> UpdateMode {
            self.mode
        }
    }

    fn record() -> SourceRecord {
        SourceRecord::new(
            "rec1",
            json!({"Name": "Acme", "Logo": [{"url": "https://dl/x.png"}], "LogoUrl": "old"}),
        )
    }

    fn updates() -> BTreeMap<String, String> {
        BTreeMap::from([("LogoUrl".to_string(), "https://i.host/x.png".to_string())])
    }

    #[tokio::test]
    async fn partial_mode_sends_only_outputs() {
        let source = Arc::new(RecordingSource {
            mode: UpdateMode::Partial,
            sent: Mutex::new(vec![]),
        });
        RecordPatcher::new(source.clone())
            .patch(&record(), &updates())
            .await
            .unwrap();
        let sent = source.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(Value::Object(sent[0].1.clone()), json!({"LogoUrl": "https://i.host/x.png"}));
    }

    #[tokio::test]
    async fn replace_mode_merges_existing_fields() {
        let source = Arc::new(RecordingSource {
            mode: UpdateMode::Replace,
            sent: Mutex::new(vec![]),
        });
        RecordPatcher::new(source.clone())
            .patch(&record(), &updates())
            .await
            .unwrap();
        let sent = source.sent.lock().unwrap();
        let body = &sent[0].1;
        assert_eq!(body["Name"], "Acme");
        assert_eq!(body["LogoUrl"], "https://i.host/x.png");
        assert!(body.contains_key("Logo"));
    }

    #[tokio::test]
    async fn empty_updates_skip_the_call() {
        let source = Arc::new(RecordingSource {
            mode: UpdateMode::Partial,
            sent: Mutex::new(vec![]),
        });
        RecordPatcher::new(source.clone())
            .patch(&record(), &BTreeMap::new())
            .await
            .unwrap();
        assert!(source.sent.lock().unwrap().is_empty());
    }
}
