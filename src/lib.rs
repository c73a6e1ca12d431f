//! Batch attachment migration: walk a paginated tabular source, re-host each
//! record's primary attachment through an image host under a rolling request
//! budget, write the hosted URL back, and checkpoint after every record so a
//! crashed run resumes without re-uploading.

pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod patcher;
pub mod resolver;
pub mod source;
pub mod tracing;
pub mod uploader;

pub mod util {
    pub mod env;
}

pub use checkpoint::{CheckpointStore, JsonFileStore, MemoryStore, MigrationProgress};
pub use config::{EngineSettings, FieldMapping, MigrationConfig};
pub use error::{CheckpointError, ConfigError, MigrationError, SourceError, UploadError};
pub use orchestrator::{Orchestrator, RunSummary};
pub use source::{SourceRecord, TabularSource};
pub use uploader::{HostResponse, ImageHost};
