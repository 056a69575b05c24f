/*!
 * Configuration types for Vigil
 *
 * Configuration is read from a TOML file with a section per component. Every
 * field has a default so a partial (or empty) file is valid. Severity
 * thresholds are kept as strings here and resolved into an [`AuditPolicy`];
 * an unparseable threshold is logged and replaced with its default.
 */

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::warn;
use vigil_core_audit::{AuditLevel, EntityKind};

use crate::archiver::ArchiverThresholds;
use crate::error::{Result, VigilError};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VigilConfig {
    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub archiver: ArchiverConfig,

    #[serde(default)]
    pub download: DownloadConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl VigilConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| VigilError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| VigilError::Config(e.to_string()))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Resolve and validate every section, failing on the first hard error
    pub fn validate(&self) -> Result<()> {
        self.audit.resolve();
        self.archiver.thresholds()?;
        self.download.validate()
    }
}

/// Audit gating, routing and signing options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Minimum effective severity for message-processing records
    #[serde(default = "default_message_threshold")]
    pub message_threshold: String,

    /// Minimum effective severity for administrative records
    #[serde(default = "default_admin_threshold")]
    pub admin_threshold: String,

    /// Minimum effective severity for system records raised by client components
    #[serde(default = "default_system_client_threshold")]
    pub system_client_threshold: String,

    /// Details below this severity are neither persisted nor counted
    #[serde(default = "default_detail_threshold")]
    pub associated_detail_threshold: String,

    /// Sign records with the HMAC key at flush time
    #[serde(default)]
    pub sign_records: bool,

    /// Persist locally when the sink policy fails
    #[serde(default = "default_true")]
    pub sink_fallback_on_failure: bool,

    /// Persist locally even when the sink policy succeeds
    #[serde(default)]
    pub always_save_internal: bool,

    /// Keep the record locally when the sink fails, even with fallback off
    #[serde(default)]
    pub compliance_mode: bool,

    /// Request/response bodies longer than this many bytes are replaced (0 = no limit)
    #[serde(default = "default_message_body_limit")]
    pub message_body_limit: usize,

    /// Node identifier stamped on records created by this process
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Per-entity-kind level for administrative records (e.g. `policy = "WARNING"`)
    #[serde(default)]
    pub admin_levels: BTreeMap<String, String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            message_threshold: default_message_threshold(),
            admin_threshold: default_admin_threshold(),
            system_client_threshold: default_system_client_threshold(),
            associated_detail_threshold: default_detail_threshold(),
            sign_records: false,
            sink_fallback_on_failure: true,
            always_save_internal: false,
            compliance_mode: false,
            message_body_limit: default_message_body_limit(),
            node_id: default_node_id(),
            admin_levels: BTreeMap::new(),
        }
    }
}

impl AuditConfig {
    /// Resolve threshold strings, substituting defaults for invalid values
    pub fn resolve(&self) -> AuditPolicy {
        let mut admin_levels = BTreeMap::new();
        for (kind, level) in &self.admin_levels {
            match (kind.parse::<EntityKind>(), level.parse::<AuditLevel>()) {
                (Ok(kind), Ok(level)) => {
                    admin_levels.insert(kind, level);
                }
                _ => warn!(
                    "Ignoring invalid admin level override '{}' = '{}'",
                    kind, level
                ),
            }
        }

        AuditPolicy {
            message_threshold: parse_level(
                "message_threshold",
                &self.message_threshold,
                AuditLevel::Warning,
            ),
            admin_threshold: parse_level("admin_threshold", &self.admin_threshold, AuditLevel::Info),
            system_client_threshold: parse_level(
                "system_client_threshold",
                &self.system_client_threshold,
                AuditLevel::Warning,
            ),
            detail_threshold: parse_level(
                "associated_detail_threshold",
                &self.associated_detail_threshold,
                AuditLevel::Info,
            ),
            sign_records: self.sign_records,
            sink_fallback_on_failure: self.sink_fallback_on_failure,
            always_save_internal: self.always_save_internal,
            compliance_mode: self.compliance_mode,
            message_body_limit: (self.message_body_limit > 0).then_some(self.message_body_limit),
            node_id: self.node_id.clone(),
            admin_levels,
        }
    }
}

fn parse_level(option: &str, value: &str, default: AuditLevel) -> AuditLevel {
    value.parse().unwrap_or_else(|_| {
        warn!(
            "Invalid audit level '{}' for {}; using default {}",
            value, option, default
        );
        default
    })
}

/// Resolved audit options, as consumed by audit contexts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditPolicy {
    pub message_threshold: AuditLevel,
    pub admin_threshold: AuditLevel,
    pub system_client_threshold: AuditLevel,
    pub detail_threshold: AuditLevel,
    pub sign_records: bool,
    pub sink_fallback_on_failure: bool,
    pub always_save_internal: bool,
    pub compliance_mode: bool,
    pub message_body_limit: Option<usize>,
    pub node_id: String,
    pub admin_levels: BTreeMap<EntityKind, AuditLevel>,
}

impl AuditPolicy {
    /// Level for an admin record about `kind`, falling back to INFO
    pub fn admin_level(&self, kind: EntityKind) -> AuditLevel {
        self.admin_levels
            .get(&kind)
            .copied()
            .unwrap_or(AuditLevel::Info)
    }
}

impl Default for AuditPolicy {
    fn default() -> Self {
        AuditConfig::default().resolve()
    }
}

/// Disk-pressure archiver options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiverConfig {
    /// Usage percentage at which message processing is suspended
    #[serde(default = "default_shutdown_percent")]
    pub shutdown_percent: u8,

    /// Usage percentage at which an archive run starts
    #[serde(default = "default_start_percent")]
    pub start_percent: u8,

    /// Usage percentage at which an archive run stops
    #[serde(default = "default_stop_percent")]
    pub stop_percent: u8,

    /// Records handed to the sink per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,

    /// Cluster lock staleness window in seconds
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,

    /// Seconds between usage checks
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Pause after a deletion so storage statistics can settle
    #[serde(default = "default_settle_millis")]
    pub settle_millis: u64,

    /// Maximum bytes written to one archive file (0 = no limit)
    #[serde(default)]
    pub max_archive_bytes: u64,

    /// Override for the store's reported maximum size
    #[serde(default)]
    pub max_store_bytes: Option<u64>,
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            shutdown_percent: default_shutdown_percent(),
            start_percent: default_start_percent(),
            stop_percent: default_stop_percent(),
            batch_size: default_batch_size(),
            lock_timeout_secs: default_lock_timeout_secs(),
            check_interval_secs: default_check_interval_secs(),
            settle_millis: default_settle_millis(),
            max_archive_bytes: 0,
            max_store_bytes: None,
        }
    }
}

impl ArchiverConfig {
    /// Validated threshold set
    pub fn thresholds(&self) -> Result<ArchiverThresholds> {
        ArchiverThresholds::new(
            self.stop_percent,
            self.start_percent,
            self.shutdown_percent,
            self.batch_size,
            Duration::from_secs(self.lock_timeout_secs),
        )
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_millis)
    }
}

/// Chunked download options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Maximum bytes returned per chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Bounded wait for one chunk read
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,

    /// Sessions idle longer than this are reaped
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Interval of the reaper sweep
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,

    /// Blocks buffered between producer and consumer
    #[serde(default = "default_pipe_blocks")]
    pub pipe_blocks: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            read_timeout_secs: default_read_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            reap_interval_secs: default_reap_interval_secs(),
            pipe_blocks: default_pipe_blocks(),
        }
    }
}

impl DownloadConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(VigilError::Config("download.chunk_size must be positive".into()));
        }
        if self.pipe_blocks == 0 {
            return Err(VigilError::Config("download.pipe_blocks must be positive".into()));
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}

/// Diagnostic logging options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,

    /// Log file path (None = stdout)
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Shorthand for level = debug
    #[serde(default)]
    pub verbose: bool,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_message_threshold() -> String {
    "WARNING".to_string()
}

fn default_admin_threshold() -> String {
    "INFO".to_string()
}

fn default_system_client_threshold() -> String {
    "WARNING".to_string()
}

fn default_detail_threshold() -> String {
    "INFO".to_string()
}

fn default_message_body_limit() -> usize {
    10 * 1024 * 1024
}

fn default_node_id() -> String {
    "node-1".to_string()
}

fn default_shutdown_percent() -> u8 {
    90
}

fn default_start_percent() -> u8 {
    75
}

fn default_stop_percent() -> u8 {
    50
}

fn default_batch_size() -> u64 {
    10_000
}

fn default_lock_timeout_secs() -> u64 {
    600
}

fn default_check_interval_secs() -> u64 {
    60
}

fn default_settle_millis() -> u64 {
    2_000
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_read_timeout_secs() -> u64 {
    10
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_reap_interval_secs() -> u64 {
    60
}

fn default_pipe_blocks() -> usize {
    16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = VigilConfig::from_toml_str("").unwrap();
        let policy = config.audit.resolve();
        assert_eq!(policy.message_threshold, AuditLevel::Warning);
        assert_eq!(policy.admin_threshold, AuditLevel::Info);
        assert_eq!(policy.detail_threshold, AuditLevel::Info);
        assert!(policy.sink_fallback_on_failure);
        assert!(!policy.always_save_internal);
        assert_eq!(policy.message_body_limit, Some(10 * 1024 * 1024));
        assert_eq!(config.archiver.shutdown_percent, 90);
        assert_eq!(config.download.read_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_full_file() {
        let toml_str = r#"
[audit]
message_threshold = "info"
admin_threshold = "WARNING"
system_client_threshold = "SEVERE"
associated_detail_threshold = "FINE"
sign_records = true
sink_fallback_on_failure = false
always_save_internal = true
compliance_mode = true
message_body_limit = 0
node_id = "gw-7"

[audit.admin_levels]
policy = "WARNING"
user = "INFO"

[archiver]
shutdown_percent = 95
start_percent = 80
stop_percent = 60
batch_size = 500
lock_timeout_secs = 30

[download]
chunk_size = 1024
read_timeout_secs = 2

[logging]
level = "debug"
"#;

        let config = VigilConfig::from_toml_str(toml_str).unwrap();
        let policy = config.audit.resolve();
        assert_eq!(policy.message_threshold, AuditLevel::Info);
        assert_eq!(policy.admin_threshold, AuditLevel::Warning);
        assert_eq!(policy.system_client_threshold, AuditLevel::Severe);
        assert_eq!(policy.detail_threshold, AuditLevel::Fine);
        assert!(policy.sign_records);
        assert!(!policy.sink_fallback_on_failure);
        assert!(policy.always_save_internal);
        assert!(policy.compliance_mode);
        assert_eq!(policy.message_body_limit, None);
        assert_eq!(policy.node_id, "gw-7");
        assert_eq!(policy.admin_level(EntityKind::Policy), AuditLevel::Warning);
        assert_eq!(policy.admin_level(EntityKind::Folder), AuditLevel::Info);

        let thresholds = config.archiver.thresholds().unwrap();
        assert_eq!(thresholds.shutdown, 95);
        assert_eq!(thresholds.start, 80);
        assert_eq!(thresholds.stop, 60);
        assert_eq!(thresholds.batch_size, 500);
        assert_eq!(thresholds.lock_timeout, Duration::from_secs(30));

        assert_eq!(config.download.chunk_size, 1024);
        assert_eq!(config.logging.level, LogLevel::Debug);
    }

    #[test]
    fn test_invalid_threshold_substitutes_default() {
        let config = AuditConfig {
            message_threshold: "LOUDEST".to_string(),
            admin_levels: BTreeMap::from([("spaceship".to_string(), "INFO".to_string())]),
            ..Default::default()
        };
        let policy = config.resolve();
        assert_eq!(policy.message_threshold, AuditLevel::Warning);
        assert!(policy.admin_levels.is_empty());
    }

    #[test]
    fn test_misordered_archiver_thresholds_rejected() {
        let config = ArchiverConfig {
            stop_percent: 80,
            start_percent: 70,
            ..Default::default()
        };
        assert!(matches!(config.thresholds(), Err(VigilError::Config(_))));
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let config = DownloadConfig {
            chunk_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(LogLevel::Error.to_tracing_level(), tracing::Level::ERROR);
        assert_eq!(LogLevel::Warn.to_tracing_level(), tracing::Level::WARN);
        assert_eq!(LogLevel::Info.to_tracing_level(), tracing::Level::INFO);
        assert_eq!(LogLevel::Debug.to_tracing_level(), tracing::Level::DEBUG);
        assert_eq!(LogLevel::Trace.to_tracing_level(), tracing::Level::TRACE);
    }

    #[test]
    fn test_to_file_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("vigil.toml");
        let mut config = VigilConfig::default();
        config.audit.node_id = "round-trip".to_string();
        config.to_file(&path).unwrap();

        let loaded = VigilConfig::from_file(&path).unwrap();
        assert_eq!(loaded.audit.node_id, "round-trip");
    }
}
