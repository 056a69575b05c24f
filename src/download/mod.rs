/*!
 * Chunked download of export archives
 *
 * `open` starts one producer thread per session. The producer runs a
 * time-range export into an anonymous spool file, since the zip writer needs
 * a seekable target, then streams the finished archive into a bounded
 * [`pipe`]. The export never waits on the client, so the store is released
 * as soon as the rows are read. The caller pulls the archive with repeated
 * [`DownloadManager::next_chunk`] calls:
 *
 * - a read that hits the read timeout returns the bytes gathered so far
 *   (possibly none) and leaves the stream open;
 * - the end of the stream returns the remaining bytes, and the call after
 *   that returns `None`;
 * - a producer failure is reported by the next read, which also closes the
 *   session.
 *
 * Reads of one session are serialized. Sessions idle for longer than the
 * idle timeout are closed by a periodic sweep.
 */

pub mod pipe;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{select, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use vigil_core_audit::{AuditSigner, MessageCatalog, ServiceId};

use crate::config::DownloadConfig;
use crate::error::{Result, VigilError};
use crate::export::{CancelHandle, ExportProgress, ExportSource, Exporter};

pub use pipe::{pipe, Chunk, PipeReader, PipeWriter};

struct DownloadSession {
    reader: Mutex<PipeReader>,
    progress: Arc<ExportProgress>,
    cancel: CancelHandle,
    error: Arc<Mutex<Option<String>>>,
    last_activity: Mutex<Instant>,
    finished: AtomicBool,
}

impl DownloadSession {
    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    fn producer_error(&self) -> Option<String> {
        self.error.lock().clone()
    }
}

/// Serves export archives in pull-based chunks
pub struct DownloadManager {
    source: Arc<dyn ExportSource>,
    catalog: Arc<MessageCatalog>,
    signer: Option<AuditSigner>,
    sessions: DashMap<String, Arc<DownloadSession>>,
    chunk_size: usize,
    read_timeout: Duration,
    idle_timeout: Duration,
    reap_interval: Duration,
    pipe_blocks: usize,
}

impl DownloadManager {
    pub fn new(
        source: Arc<dyn ExportSource>,
        catalog: Arc<MessageCatalog>,
        config: &DownloadConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            source,
            catalog,
            signer: None,
            sessions: DashMap::new(),
            chunk_size: config.chunk_size,
            read_timeout: config.read_timeout(),
            idle_timeout: config.idle_timeout(),
            reap_interval: config.reap_interval(),
            pipe_blocks: config.pipe_blocks,
        })
    }

    pub fn with_signer(mut self, signer: AuditSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Start exporting `[from_time, to_time]` and return the session token
    pub fn open(
        &self,
        from_time: Option<i64>,
        to_time: Option<i64>,
        service_ids: &[ServiceId],
    ) -> Result<String> {
        let mut exporter = Exporter::new(self.source.clone(), self.catalog.clone());
        if let Some(ref signer) = self.signer {
            exporter = exporter.with_signer(signer.clone());
        }

        let token = hex::encode(rand::random::<[u8; 16]>());
        let (writer, reader) = pipe(self.pipe_blocks, self.chunk_size);
        let error = Arc::new(Mutex::new(None));
        let session = Arc::new(DownloadSession {
            reader: Mutex::new(reader),
            progress: exporter.progress(),
            cancel: exporter.cancel_handle(),
            error: error.clone(),
            last_activity: Mutex::new(Instant::now()),
            finished: AtomicBool::new(false),
        });

        let services = service_ids.to_vec();
        let name = format!("audit-download-{}", &token[..8]);
        thread::Builder::new()
            .name(name)
            .spawn(move || produce(exporter, writer, error, from_time, to_time, services))?;

        self.sessions.insert(token.clone(), session);
        info!("Opened audit download session {}", token);
        Ok(token)
    }

    fn session(&self, token: &str) -> Result<Arc<DownloadSession>> {
        self.sessions
            .get(token)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| VigilError::UnknownSession(token.to_string()))
    }

    fn fail(&self, token: &str, message: String) -> VigilError {
        self.close(token);
        VigilError::Download(message)
    }

    /// Next chunk of the archive; `None` once the stream is exhausted
    pub fn next_chunk(&self, token: &str) -> Result<Option<Vec<u8>>> {
        let session = self.session(token)?;
        session.touch();
        if let Some(message) = session.producer_error() {
            return Err(self.fail(token, message));
        }

        let chunk = {
            let mut reader = session.reader.lock();
            reader.read_chunk(self.chunk_size, Instant::now() + self.read_timeout)
        };
        session.touch();

        if let Some(message) = session.producer_error() {
            return Err(self.fail(token, message));
        }
        if chunk.eof {
            session.finished.store(true, Ordering::SeqCst);
            if chunk.data.is_empty() {
                debug!("Download session {} exhausted", token);
                return Ok(None);
            }
        }
        Ok(Some(chunk.data))
    }

    /// Row count the export expects to produce
    pub fn estimated_total(&self, token: &str) -> Result<u64> {
        Ok(self.session(token)?.progress.approx_total())
    }

    /// Rows exported so far
    pub fn downloaded_count(&self, token: &str) -> Result<u64> {
        Ok(self.session(token)?.progress.exported())
    }

    /// Cancel the producer and forget the session; `false` for unknown tokens
    pub fn close(&self, token: &str) -> bool {
        match self.sessions.remove(token) {
            Some((_, session)) => {
                if !session.finished.load(Ordering::SeqCst) {
                    session.cancel.cancel();
                }
                debug!("Closed audit download session {}", token);
                true
            }
            None => false,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Close sessions idle for longer than the idle timeout
    pub fn reap_idle(&self) -> usize {
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_for() > self.idle_timeout)
            .map(|entry| entry.key().clone())
            .collect();

        let mut reaped = 0;
        for token in stale {
            if self.close(&token) {
                info!("Reaped idle audit download session {}", token);
                reaped += 1;
            }
        }
        reaped
    }

    /// Start the periodic idle sweep
    pub fn start_reaper(self: &Arc<Self>) -> Result<ReaperHandle> {
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
        let manager = Arc::downgrade(self);
        let interval = self.reap_interval;
        let thread = thread::Builder::new()
            .name("audit-download-reaper".to_string())
            .spawn(move || {
                let ticker = crossbeam_channel::tick(interval);
                loop {
                    select! {
                        recv(shutdown_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            let Some(manager) = manager.upgrade() else {
                                break;
                            };
                            manager.reap_idle();
                        }
                    }
                }
            })?;
        Ok(ReaperHandle {
            shutdown: shutdown_tx,
            thread: Some(thread),
        })
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        for entry in self.sessions.iter() {
            entry.value().cancel.cancel();
        }
    }
}

fn produce(
    exporter: Exporter,
    mut writer: PipeWriter,
    error: Arc<Mutex<Option<String>>>,
    from_time: Option<i64>,
    to_time: Option<i64>,
    services: Vec<ServiceId>,
) {
    let cancel = exporter.cancel_handle();
    let result = tempfile::tempfile()
        .map_err(VigilError::from)
        .and_then(|mut spool| {
            let info = exporter.export_time_range(from_time, to_time, &services, &mut spool)?;
            debug!("Spooled {} audit records for download", info.records_exported);
            spool.seek(SeekFrom::Start(0))?;
            deliver(spool, &mut writer, &cancel)
        });

    match result {
        Ok(true) => {
            if let Err(e) = writer.close() {
                warn!("Download reader went away before the archive was delivered: {}", e);
            }
        }
        Ok(false) => {}
        Err(VigilError::Cancelled) => {
            debug!("Audit download cancelled");
            *error.lock() = Some("download cancelled".to_string());
        }
        Err(e) => {
            error!("Audit download export failed: {}", e);
            // Record the failure before the writer drop ends the stream
            *error.lock() = Some(e.to_string());
        }
    }
}

/// Copy the spooled archive into the pipe; `false` if the reader went away
fn deliver(mut spool: File, writer: &mut PipeWriter, cancel: &CancelHandle) -> Result<bool> {
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        if cancel.is_cancelled() {
            return Err(VigilError::Cancelled);
        }
        let n = spool.read(&mut buffer)?;
        if n == 0 {
            return Ok(true);
        }
        if let Err(e) = writer.write_all(&buffer[..n]) {
            warn!("Download reader went away before the archive was delivered: {}", e);
            return Ok(false);
        }
    }
}

/// Stops the reaper thread when dropped
pub struct ReaperHandle {
    shutdown: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl ReaperHandle {
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        let _ = self.shutdown.try_send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}
