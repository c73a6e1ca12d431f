//! Run configuration. Everything comes from `REHOST_*` env vars (with `.env`
//! support); the CLI may override individual values before `validate()`.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::source::{ListingRetry, UpdateMode};
use crate::uploader::{BackoffPolicy, QuotaWindow};
use crate::util::env::{env_opt, env_parse, env_parse_opt, env_req};

pub const MAX_CONCURRENCY: usize = 10;

/// One attachment field migrated into one or more output fields. The role names
/// the pair inside the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMapping {
    pub role: String,
    pub attachment_field: String,
    pub output_fields: Vec<String>,
}

impl FieldMapping {
    pub fn new(attachment_field: &str, output_fields: &[&str]) -> Self {
        Self {
            role: attachment_field.to_string(),
            attachment_field: attachment_field.to_string(),
            output_fields: output_fields.iter().map(|f| f.to_string()).collect(),
        }
    }
}

/// Parse `Logo:LogoUrl,Photo:PhotoUrl|PhotoUrlBackup`.
pub fn parse_mappings(raw: &str) -> Result<Vec<FieldMapping>, ConfigError> {
    const KEY: &str = "REHOST_FIELDS";
    let mut out = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (attachment, outputs) = entry
            .split_once(':')
            .ok_or_else(|| ConfigError::invalid(KEY, format!("{entry:?} is not attachment:output")))?;
        let attachment = attachment.trim();
        let outputs: Vec<&str> = outputs
            .split('|')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .collect();
        if attachment.is_empty() || outputs.is_empty() {
            return Err(ConfigError::invalid(
                KEY,
                format!("{entry:?} needs an attachment field and at least one output field"),
            ));
        }
        out.push(FieldMapping::new(attachment, &outputs));
    }
    Ok(out)
}

/// Engine knobs, free of credentials, so tests can build them directly.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub mappings: Vec<FieldMapping>,
    /// Field used to label records in error reports.
    pub title_field: Option<String>,
    pub quota: QuotaWindow,
    pub backoff: BackoffPolicy,
    pub listing_retry: ListingRetry,
    /// Records needing an upload that one invocation will take on.
    pub max_uploads_per_run: Option<usize>,
    pub concurrency: usize,
    /// Pause between records (or between batches when concurrency > 1).
    pub record_delay: Duration,
    pub dry_run: bool,
    pub report_error_limit: usize,
}

impl EngineSettings {
    pub fn new(mappings: Vec<FieldMapping>) -> Self {
        Self {
            mappings,
            title_field: None,
            quota: QuotaWindow::new(100, Duration::from_secs(3600)),
            backoff: BackoffPolicy::default(),
            listing_retry: ListingRetry::default(),
            max_uploads_per_run: Some(100),
            concurrency: 1,
            record_delay: Duration::from_secs(1),
            dry_run: false,
            report_error_limit: 10,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mappings.is_empty() {
            return Err(ConfigError::invalid("REHOST_FIELDS", "no field mappings configured"));
        }
        if self.quota.budget == 0 {
            return Err(ConfigError::invalid("REHOST_QUOTA_BUDGET", "must be at least 1"));
        }
        if self.quota.window.is_zero() {
            return Err(ConfigError::invalid("REHOST_QUOTA_WINDOW_SECS", "must be non-zero"));
        }
        if !(1..=MAX_CONCURRENCY).contains(&self.concurrency) {
            return Err(ConfigError::invalid(
                "REHOST_CONCURRENCY",
                format!("must be within 1..={MAX_CONCURRENCY}"),
            ));
        }
        let mut roles = HashSet::new();
        let mut outputs = HashSet::new();
        for m in &self.mappings {
            if !roles.insert(m.role.as_str()) {
                return Err(ConfigError::invalid(
                    "REHOST_FIELDS",
                    format!("attachment field {} listed twice", m.role),
                ));
            }
            for f in &m.output_fields {
                if !outputs.insert(f.as_str()) {
                    return Err(ConfigError::invalid(
                        "REHOST_FIELDS",
                        format!("output field {f} is written by more than one mapping"),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn role_names(&self) -> Vec<&str> {
        self.mappings.iter().map(|m| m.role.as_str()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub base_url: String,
    pub container: String,
    pub token: String,
    pub page_size: usize,
    pub update_mode: UpdateMode,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HostSettings {
    pub endpoint: String,
    pub api_key: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub source: SourceSettings,
    pub host: HostSettings,
    pub engine: EngineSettings,
    pub checkpoint_path: PathBuf,
}

impl MigrationConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with_fields(None)
    }

    /// Like `from_env`, with `fields` (the CLI's `--fields`) taking the place of
    /// `REHOST_FIELDS`. The default checkpoint path follows whichever mapping wins.
    pub fn from_env_with_fields(fields: Option<&str>) -> Result<Self, ConfigError> {
        let container = env_req("REHOST_SOURCE_CONTAINER")?;
        let update_mode = match env_opt("REHOST_SOURCE_UPDATE_MODE").as_deref() {
            None | Some("patch") => UpdateMode::Partial,
            Some("replace") => UpdateMode::Replace,
            Some(other) => {
                return Err(ConfigError::invalid(
                    "REHOST_SOURCE_UPDATE_MODE",
                    format!("{other:?} (expected patch|replace)"),
                ))
            }
        };
        let source = SourceSettings {
            base_url: env_opt("REHOST_SOURCE_URL")
                .unwrap_or_else(|| "https://api.airtable.com/v0".into()),
            container: container.clone(),
            token: env_req("REHOST_SOURCE_TOKEN")?,
            page_size: env_parse("REHOST_SOURCE_PAGE_SIZE", 100usize)?,
            update_mode,
            timeout: Duration::from_secs(env_parse("REHOST_HTTP_TIMEOUT_SECS", 30u64)?),
        };
        let host = HostSettings {
            endpoint: env_opt("REHOST_HOST_URL")
                .unwrap_or_else(|| "https://api.imgbb.com/1/upload".into()),
            api_key: env_req("REHOST_HOST_KEY")?,
            timeout: Duration::from_secs(env_parse("REHOST_UPLOAD_TIMEOUT_SECS", 60u64)?),
        };

        let mappings = match fields {
            Some(raw) => parse_mappings(raw)?,
            None => parse_mappings(&env_req("REHOST_FIELDS")?)?,
        };
        let mut engine = EngineSettings::new(mappings);
        engine.title_field = env_opt("REHOST_TITLE_FIELD");
        engine.quota = quota_from_env(engine.quota)?;
        engine.backoff = BackoffPolicy {
            base: Duration::from_millis(env_parse(
                "REHOST_BACKOFF_BASE_MS",
                engine.backoff.base.as_millis() as u64,
            )?),
            jitter_max: Duration::from_millis(env_parse(
                "REHOST_BACKOFF_JITTER_MS",
                engine.backoff.jitter_max.as_millis() as u64,
            )?),
            max_retries: env_parse("REHOST_UPLOAD_MAX_RETRIES", engine.backoff.max_retries)?,
        };
        engine.listing_retry = ListingRetry {
            attempts: env_parse("REHOST_LIST_ATTEMPTS", engine.listing_retry.attempts)?,
            delay: Duration::from_millis(env_parse(
                "REHOST_LIST_RETRY_MS",
                engine.listing_retry.delay.as_millis() as u64,
            )?),
        };
        if let Some(cap) = env_parse_opt::<usize>("REHOST_MAX_UPLOADS")? {
            // 0 lifts the cap
            engine.max_uploads_per_run = (cap > 0).then_some(cap);
        }
        engine.concurrency = env_parse("REHOST_CONCURRENCY", engine.concurrency)?;
        engine.record_delay = Duration::from_millis(env_parse(
            "REHOST_RECORD_DELAY_MS",
            engine.record_delay.as_millis() as u64,
        )?);
        engine.report_error_limit = env_parse("REHOST_REPORT_ERRORS", engine.report_error_limit)?;

        let checkpoint_path = env_opt("REHOST_CHECKPOINT")
            .map(PathBuf::from)
            .unwrap_or_else(|| default_checkpoint_path(&container, &engine.mappings));

        Ok(Self {
            source,
            host,
            engine,
            checkpoint_path,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        if self.source.page_size == 0 {
            return Err(ConfigError::invalid("REHOST_SOURCE_PAGE_SIZE", "must be at least 1"));
        }
        Ok(())
    }
}

/// Quota knobs alone, for commands that only read the checkpoint.
pub fn quota_from_env(defaults: QuotaWindow) -> Result<QuotaWindow, ConfigError> {
    Ok(QuotaWindow::new(
        env_parse("REHOST_QUOTA_BUDGET", defaults.budget)?,
        Duration::from_secs(env_parse("REHOST_QUOTA_WINDOW_SECS", defaults.window.as_secs())?),
    ))
}

/// Distinct file per container and full field mapping (attachment field and
/// every output field), so two differently configured migrations against one
/// source never share `processedRecords`.
pub fn default_checkpoint_path(container: &str, mappings: &[FieldMapping]) -> PathBuf {
    let mut parts = vec![container.to_string()];
    parts.extend(
        mappings
            .iter()
            .map(|m| format!("{}={}", m.attachment_field, m.output_fields.join("+"))),
    );
    let stem: String = parts
        .join("-")
        .chars()
        .map(|c| match c {
            c if c.is_ascii_alphanumeric() => c,
            '-' | '_' | '=' | '+' => c,
            _ => '_',
        })
        .collect();
    PathBuf::from(".rehost").join(format!("{stem}.json"))
}
