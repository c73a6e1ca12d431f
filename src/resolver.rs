//! Picks the best binary URL out of a record's attachment field.

use serde::Deserialize;
use serde_json::Value;

use crate::source::SourceRecord;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Attachment {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub thumbnails: Option<Thumbnails>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Thumbnails {
    #[serde(default)]
    pub full: Option<Thumbnail>,
    #[serde(default)]
    pub large: Option<Thumbnail>,
    #[serde(default)]
    pub small: Option<Thumbnail>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Thumbnail {
    #[serde(default)]
    pub url: Option<String>,
}

impl Attachment {
    /// Direct url, then full, large and small thumbnails. Blank strings are skipped.
    pub fn best_url(&self) -> Option<&str> {
        let thumbs = self.thumbnails.as_ref();
        [
            self.url.as_deref(),
            thumbs.and_then(|t| thumb_url(&t.full)),
            thumbs.and_then(|t| thumb_url(&t.large)),
            thumbs.and_then(|t| thumb_url(&t.small)),
        ]
        .into_iter()
        .flatten()
        .find(|u| !u.trim().is_empty())
    }
}

fn thumb_url(thumb: &Option<Thumbnail>) -> Option<&str> {
    thumb.as_ref().and_then(|t| t.url.as_deref())
}

/// First attachment of `field`. Only the primary attachment is migrated.
pub fn primary_attachment(record: &SourceRecord, field: &str) -> Option<Attachment> {
    let first = match record.fields.get(field)? {
        Value::Array(items) => items.first()?,
        obj @ Value::Object(_) => obj,
        _ => return None,
    };
    serde_json::from_value(first.clone()).ok()
}

/// Best usable URL for `field`, or `None` when there is nothing to migrate.
pub fn resolve(record: &SourceRecord, field: &str) -> Option<String> {
    primary_attachment(record, field).and_then(|a| a.best_url().map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(fields: Value) -> SourceRecord {
        SourceRecord::new("rec1", fields)
    }

    #[test]
    fn direct_url_wins() {
        let r = record(json!({"Logo": [{
            "url": "https://dl.example.com/orig.png",
            "thumbnails": {"full": {"url": "https://dl.example.com/full.png"}}
        }]}));
        assert_eq!(resolve(&r, "Logo").as_deref(), Some("https://dl.example.com/orig.png"));
    }

    #[test]
    fn falls_back_through_thumbnails() {
        let full = record(json!({"Logo": [{"thumbnails": {
            "full": {"url": "https://t/full"}, "large": {"url": "https://t/large"}
        }}]}));
        assert_eq!(resolve(&full, "Logo").as_deref(), Some("https://t/full"));

        let large = record(json!({"Logo": [{"thumbnails": {
            "large": {"url": "https://t/large"}, "small": {"url": "https://t/small"}
        }}]}));
        assert_eq!(resolve(&large, "Logo").as_deref(), Some("https://t/large"));

        let small = record(json!({"Logo": [{"thumbnails": {"small": {"url": "https://t/small"}}}]}));
        assert_eq!(resolve(&small, "Logo").as_deref(), Some("https://t/small"));
    }

    #[test]
    fn blank_direct_url_is_skipped() {
        let r = record(json!({"Logo": [{"url": "  ", "thumbnails": {"small": {"url": "https://t/s"}}}]}));
        assert_eq!(resolve(&r, "Logo").as_deref(), Some("https://t/s"));
    }

    #[test]
    fn nothing_to_migrate_is_none() {
        assert_eq!(resolve(&record(json!({})), "Logo"), None);
        assert_eq!(resolve(&record(json!({"Logo": []})), "Logo"), None);
        assert_eq!(resolve(&record(json!({"Logo": [{"id": "att1"}]})), "Logo"), None);
        assert_eq!(resolve(&record(json!({"Logo": "not-an-attachment"})), "Logo"), None);
        assert_eq!(resolve(&record(json!({"Logo": [{"thumbnails": {}}]})), "Logo"), None);
    }

    #[test]
    fn only_first_attachment_counts() {
        let r = record(json!({"Photo": [
            {"thumbnails": {}},
            {"url": "https://dl.example.com/second.png"}
        ]}));
        assert_eq!(resolve(&r, "Photo"), None);
    }
}
