//! Digesting zip writer for export archives
//!
//! [`ArchiveWriter`] wraps a [`ZipWriter`] over a seekable destination (a
//! file or an in-memory cursor). Bytes written to the data entry are fed to
//! MD5 and SHA-1 and counted before compression. The compressed size is the
//! furthest offset the zip has reached in the destination, which gives the
//! running compression ratio used by the size ceiling.

use std::io::{self, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use md5::{Digest, Md5};
use sha1::Sha1;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::Result;

/// Data entry name
pub const AUDITS_FILENAME: &str = "audit.dat";
/// Metadata and signature entry name
pub const SIG_FILENAME: &str = "sig.xml";

/// Tracks the furthest offset written to the underlying destination
///
/// The zip writer seeks back to patch local headers, so rewritten bytes
/// must not be counted twice.
struct CountingWriter<W> {
    inner: W,
    base: u64,
    pos: u64,
    count: Arc<AtomicU64>,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.pos += written as u64;
        self.count
            .fetch_max(self.pos.saturating_sub(self.base), Ordering::Relaxed);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: Seek> Seek for CountingWriter<W> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = self.inner.seek(pos)?;
        Ok(self.pos)
    }
}

/// Hex digests of the data entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveDigests {
    pub md5: String,
    pub sha1: String,
}

/// Zip archive with a digested `audit.dat` entry
pub struct ArchiveWriter<W: Write + Seek> {
    zip: ZipWriter<CountingWriter<W>>,
    zipped: Arc<AtomicU64>,
    raw: u64,
    md5: Md5,
    sha1: Sha1,
    data_started: bool,
    header_written: bool,
}

impl<W: Write + Seek> ArchiveWriter<W> {
    /// Start an archive at the destination's current position
    ///
    /// The zip comment carries the build id and creation time.
    pub fn new(mut inner: W, build_id: &str) -> Result<Self> {
        let pos = inner.stream_position()?;
        let zipped = Arc::new(AtomicU64::new(0));
        let counting = CountingWriter {
            inner,
            base: pos,
            pos,
            count: zipped.clone(),
        };
        let mut zip = ZipWriter::new(counting);
        zip.set_comment(archive_comment(build_id));
        Ok(Self {
            zip,
            zipped,
            raw: 0,
            md5: Md5::new(),
            sha1: Sha1::new(),
            data_started: false,
            header_written: false,
        })
    }

    fn start_data_entry(&mut self) -> Result<()> {
        if !self.data_started {
            let options =
                SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
            self.zip.start_file(AUDITS_FILENAME, options)?;
            self.data_started = true;
        }
        Ok(())
    }

    /// Append bytes to `audit.dat`
    pub fn write_data(&mut self, bytes: &[u8]) -> Result<()> {
        self.start_data_entry()?;
        self.zip.write_all(bytes)?;
        self.md5.update(bytes);
        self.sha1.update(bytes);
        self.raw += bytes.len() as u64;
        Ok(())
    }

    /// Whether the column header row has been written
    pub fn header_written(&self) -> bool {
        self.header_written
    }

    pub(crate) fn mark_header_written(&mut self) {
        self.header_written = true;
    }

    /// Push compressed bytes buffered by the zip writer to the destination
    pub fn flush(&mut self) -> Result<()> {
        self.zip.flush()?;
        Ok(())
    }

    /// Uncompressed bytes written to the data entry
    pub fn raw_byte_count(&self) -> u64 {
        self.raw
    }

    /// Bytes written to the destination so far
    pub fn zipped_byte_count(&self) -> u64 {
        self.zipped.load(Ordering::Relaxed)
    }

    /// Raw to zipped ratio, never below 1
    pub fn compression_ratio(&self) -> f64 {
        let zipped = self.zipped_byte_count();
        if zipped == 0 {
            return 1.0;
        }
        (self.raw as f64 / zipped as f64).max(1.0)
    }

    /// Digests of everything written to the data entry so far
    pub fn digests(&self) -> ArchiveDigests {
        ArchiveDigests {
            md5: hex::encode(self.md5.clone().finalize()),
            sha1: hex::encode(self.sha1.clone().finalize()),
        }
    }

    /// Append the metadata entry
    pub fn write_metadata(&mut self, xml: &[u8]) -> Result<()> {
        self.start_data_entry()?;
        self.zip
            .start_file(SIG_FILENAME, SimpleFileOptions::default())?;
        self.zip.write_all(xml)?;
        Ok(())
    }

    /// Write the central directory and hand back the destination
    pub fn finish(mut self) -> Result<(W, u64)> {
        self.start_data_entry()?;
        let mut counting = self.zip.finish()?;
        counting.flush()?;
        Ok((counting.inner, self.zipped.load(Ordering::Relaxed)))
    }
}

/// Zip comment for an archive created now
pub fn archive_comment(build_id: &str) -> String {
    format!(
        "{} - Exported Audit Records - Created {}",
        build_id,
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};
    use zip::ZipArchive;

    #[test]
    fn test_archive_round_trip() {
        let mut writer = ArchiveWriter::new(Cursor::new(Vec::new()), "vigil-test").unwrap();
        writer.write_data(b"id:time\n").unwrap();
        writer.write_data(b"1:1000\n").unwrap();
        assert_eq!(writer.raw_byte_count(), 15);
        let digests = writer.digests();
        writer.write_metadata(b"<AuditMetadata/>").unwrap();
        let (cursor, total) = writer.finish().unwrap();
        let buffer = cursor.into_inner();
        assert_eq!(total, buffer.len() as u64);

        let mut archive = ZipArchive::new(Cursor::new(buffer)).unwrap();
        let comment = String::from_utf8_lossy(archive.comment()).into_owned();
        assert!(comment.starts_with("vigil-test - Exported Audit Records - Created "));

        let mut data = String::new();
        archive
            .by_name(AUDITS_FILENAME)
            .unwrap()
            .read_to_string(&mut data)
            .unwrap();
        assert_eq!(data, "id:time\n1:1000\n");
        assert_eq!(digests.md5, hex::encode(Md5::digest(data.as_bytes())));
        assert_eq!(digests.sha1, hex::encode(Sha1::digest(data.as_bytes())));
        assert!(archive.by_name(SIG_FILENAME).is_ok());
    }

    #[test]
    fn test_empty_archive_still_has_data_entry() {
        let mut buffer = Cursor::new(Vec::new());
        ArchiveWriter::new(&mut buffer, "b").unwrap().finish().unwrap();
        let mut archive = ZipArchive::new(Cursor::new(buffer.into_inner())).unwrap();
        assert_eq!(archive.by_name(AUDITS_FILENAME).unwrap().size(), 0);
    }

    #[test]
    fn test_compression_ratio_floor() {
        let writer = ArchiveWriter::new(Cursor::new(Vec::new()), "b").unwrap();
        assert_eq!(writer.compression_ratio(), 1.0);
    }

    #[test]
    fn test_header_patching_not_double_counted() {
        let mut writer = ArchiveWriter::new(Cursor::new(Vec::new()), "b").unwrap();
        for i in 0..200 {
            writer.write_data(format!("{}:{}\n", i, i * 7).as_bytes()).unwrap();
        }
        writer.flush().unwrap();
        assert!(writer.compression_ratio() > 1.0);
        let (cursor, total) = writer.finish().unwrap();
        assert_eq!(total, cursor.get_ref().len() as u64);
    }

    #[test]
    fn test_archive_into_file() {
        let mut file = tempfile::tempfile().unwrap();
        let mut writer = ArchiveWriter::new(&mut file, "b").unwrap();
        writer.write_data(b"id\n7\n").unwrap();
        let (_, total) = writer.finish().unwrap();

        assert_eq!(file.metadata().unwrap().len(), total);
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut archive = ZipArchive::new(file).unwrap();
        assert_eq!(archive.by_name(AUDITS_FILENAME).unwrap().size(), 5);
    }
}
