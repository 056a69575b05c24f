/*!
 * Vigil - audit record lifecycle for a clustered API gateway
 *
 * Covers the path an audit record takes from the request that produced it
 * to cold storage:
 * - Per-operation audit contexts with level gating and sink routing
 * - A storage-pressure archiver that ships old records and frees space
 * - Signed, compressed export archives with digest verification
 * - Chunked download sessions over a bounded pipe
 *
 * The record model itself lives in the `vigil-core-audit` crate.
 */

pub mod archiver;
pub mod config;
pub mod context;
pub mod download;
pub mod error;
pub mod export;
pub mod factory;
pub mod logging;
pub mod policy;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod store;

// Re-export commonly used types
pub use archiver::{Archiver, ArchiverHandle, ArchiverThresholds, ArchiverState, ArchiveSink};
pub use config::{ArchiverConfig, AuditPolicy, DownloadConfig, LoggingConfig, VigilConfig};
pub use context::{AuditContext, AuditServices, FlushOutcome};
pub use download::DownloadManager;
pub use error::{Result, VigilError};
pub use export::{verify_archive, ExportSource, ExportedInfo, Exporter};
pub use factory::{AuditContextFactory, ContextGuard};
pub use policy::{SinkOutcome, SinkPolicyEvaluator};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
pub use store::{MemoryStore, RecordStore, SearchCriteria};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
