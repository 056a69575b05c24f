//! Archive sinks
//!
//! A sink receives identifier ranges from the archiver and makes them durable
//! somewhere off-node. The archiver deletes a range only after
//! [`ArchiveSink::flush`] returns `true` for it.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use vigil_core_audit::RecordId;

use crate::error::{Result, VigilError};
use crate::export::{ArchiveWriter, ExportedInfo, Exporter};

/// Destination for archived record ranges
pub trait ArchiveSink: Send + Sync {
    fn is_enabled(&self) -> bool;

    /// Archive records with `start <= id <= end`
    ///
    /// Returns the accumulated export summary for everything staged since
    /// the last flush, or `None` when this range produced no records.
    fn archive_records(&self, start: RecordId, end: RecordId) -> Result<Option<ExportedInfo>>;

    /// Make everything staged durable; `false` means nothing may be deleted
    fn flush(&self) -> bool;
}

/// Ships a finished archive file somewhere
pub trait ArchiveTransport: Send + Sync {
    fn upload(&self, file: &Path, name: &str) -> Result<()>;

    /// Human-readable destination for logs
    fn describe(&self) -> String;
}

/// Copies archives into a local (or mounted) directory
#[derive(Debug, Clone)]
pub struct DirectoryTransport {
    dir: PathBuf,
}

impl DirectoryTransport {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ArchiveTransport for DirectoryTransport {
    fn upload(&self, file: &Path, name: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let partial = self.dir.join(format!("{}.part", name));
        fs::copy(file, &partial)?;
        fs::rename(&partial, self.dir.join(name))?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.dir.display().to_string()
    }
}

struct PendingArchive {
    writer: ArchiveWriter<BufWriter<File>>,
    path: PathBuf,
    name: String,
    info: Option<ExportedInfo>,
    failed: bool,
}

/// Stages batches into one archive file per flush and ships it
pub struct TransportArchiveSink {
    exporter: Exporter,
    transport: Arc<dyn ArchiveTransport>,
    staging_dir: PathBuf,
    node_id: String,
    max_archive_bytes: Option<u64>,
    enabled: bool,
    pending: Mutex<Option<PendingArchive>>,
}

impl TransportArchiveSink {
    pub fn new(
        exporter: Exporter,
        transport: Arc<dyn ArchiveTransport>,
        staging_dir: impl Into<PathBuf>,
        node_id: &str,
    ) -> Self {
        Self {
            exporter,
            transport,
            staging_dir: staging_dir.into(),
            node_id: node_id.to_string(),
            max_archive_bytes: None,
            enabled: true,
            pending: Mutex::new(None),
        }
    }

    /// Cap the compressed size of one archive file (0 = unlimited)
    pub fn with_max_archive_bytes(mut self, max: u64) -> Self {
        self.max_archive_bytes = Some(max).filter(|m| *m > 0);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    fn open_archive(&self, first: RecordId) -> Result<PendingArchive> {
        fs::create_dir_all(&self.staging_dir)?;
        let name = format!(
            "audit-{}-{}-{}.zip",
            self.node_id,
            Utc::now().format("%Y%m%d%H%M%S%3f"),
            first
        );
        let path = self.staging_dir.join(&name);
        let file = File::create(&path)?;
        debug!("Staging audit archive {}", path.display());
        Ok(PendingArchive {
            writer: self.exporter.new_archive(BufWriter::new(file))?,
            path,
            name,
            info: None,
            failed: false,
        })
    }

    fn discard(path: &Path) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to remove staged archive {}: {}", path.display(), e);
        }
    }

    fn ship(&self, archive: PendingArchive) -> Result<Option<ExportedInfo>> {
        let PendingArchive {
            writer,
            path,
            name,
            info,
            ..
        } = archive;

        let Some(info) = info.filter(|i| i.records_exported > 0) else {
            drop(writer);
            Self::discard(&path);
            return Ok(None);
        };

        let result = self
            .exporter
            .finish_archive(writer, &info)
            .and_then(|_| self.transport.upload(&path, &name));
        Self::discard(&path);
        result.map(|_| Some(info))
    }
}

impl ArchiveSink for TransportArchiveSink {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn archive_records(&self, start: RecordId, end: RecordId) -> Result<Option<ExportedInfo>> {
        let mut pending = self.pending.lock();
        if pending.is_none() {
            *pending = Some(self.open_archive(start)?);
        }
        let Some(archive) = pending.as_mut() else {
            return Err(VigilError::Archive("no staged archive".to_string()));
        };
        if archive.failed {
            return Err(VigilError::Archive(
                "staged archive is unusable after an earlier failure".to_string(),
            ));
        }

        let before = archive.info.as_ref().map_or(0, |i| i.records_exported);
        let info = match self.exporter.export_ids(
            start,
            end,
            &mut archive.writer,
            self.max_archive_bytes,
            archive.info.as_ref(),
        ) {
            Ok(info) => info,
            Err(e) => {
                archive.failed = true;
                return Err(e);
            }
        };

        let exported = info.records_exported - before;
        archive.info = Some(info.clone());
        if exported == 0 {
            return Ok(None);
        }
        Ok(Some(info))
    }

    fn flush(&self) -> bool {
        let Some(archive) = self.pending.lock().take() else {
            return true;
        };
        if archive.failed {
            error!("Discarding staged audit archive {} after a failed batch", archive.name);
            let path = archive.path.clone();
            drop(archive);
            Self::discard(&path);
            return false;
        }

        let name = archive.name.clone();
        match self.ship(archive) {
            Ok(Some(info)) => {
                info!(
                    "Shipped audit archive {} to {} ({} records)",
                    name,
                    self.transport.describe(),
                    info.records_exported
                );
                true
            }
            Ok(None) => true,
            Err(e) => {
                error!("Failed to ship audit archive {}: {}", name, e);
                false
            }
        }
    }
}

impl Drop for TransportArchiveSink {
    fn drop(&mut self) {
        if let Some(archive) = self.pending.get_mut().take() {
            let path = archive.path.clone();
            drop(archive);
            Self::discard(&path);
        }
    }
}
