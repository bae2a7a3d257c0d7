//! Correlation of messenger databases found in a forensic case.
//!
//! A case usually holds the live message store plus older backup copies.
//! [`CaseProcessor`] takes each discovered artifact, registers and decodes
//! the databases, folds messages that only survive in backups into their
//! main database, links attachments to files elsewhere in the case and,
//! optionally, downloads media that is missing from it.

pub mod artifact;
pub mod avatar;
pub mod config;
pub mod contacts;
pub mod download;
pub mod error;
pub mod logging;
pub mod merge;
pub mod model;
pub mod processor;
pub mod registry;
pub mod report;
pub mod resolver;
pub mod search;

pub use artifact::{ArtifactKind, Decoders, SourceDecoder, SourceVariant};
pub use config::{ConfigError, CorrelatorConfig};
pub use download::{
    DownloadCoordinator, DownloadError, FetchError, HttpFetcher, LinkError, LinkExtractor,
    MediaFetcher, MediaKind, MediaLink,
};
pub use error::{DecodeError, ProcessError};
pub use processor::{CaseProcessor, ProcessOutcome};
pub use registry::{Classification, DatabaseContext, DatabaseRegistry};
pub use report::{ChatRenderer, JsonChatRenderer, MemorySink, ReportSink, ReportUnit};
pub use resolver::{MediaResolver, ResolveMode, ResolveOutcome};
pub use search::{MemoryIndex, Query, SearchIndex};
