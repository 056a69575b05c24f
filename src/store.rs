/*!
 * Record store boundary
 *
 * The pipeline never talks to a database directly. Audit contexts persist
 * through [`RecordStore::save`]/[`RecordStore::update`], the archiver reads
 * usage and deletes archived ranges, and lookups go through
 * [`RecordStore::find`]. [`MemoryStore`] is the in-process implementation
 * used by early-phase tooling and tests; the SQLite store lives in
 * [`crate::sqlite`].
 */

use std::collections::BTreeMap;

use parking_lot::Mutex;
use vigil_core_audit::{AuditLevel, AuditRecord, RecordId};

use crate::error::{Result, VigilError};

/// Persistence capability consumed by contexts, the archiver and lookups
pub trait RecordStore: Send + Sync {
    /// Insert a new record, assigning and returning its identifier
    fn save(&self, record: &mut AuditRecord) -> Result<RecordId>;

    /// Overwrite a previously saved record (identifier must be set)
    fn update(&self, record: &AuditRecord) -> Result<()>;

    /// Lowest stored identifier strictly greater than `floor`
    fn min_id_above(&self, floor: RecordId) -> Result<Option<RecordId>>;

    /// Delete every record with `start <= id <= end`, returning the count removed
    fn delete_range(&self, start: RecordId, end: RecordId) -> Result<u64>;

    /// Bytes currently used by audit data
    fn current_size(&self) -> Result<u64>;

    /// Maximum bytes available to audit data, when known
    fn max_size(&self) -> Result<Option<u64>>;

    /// Records matching `criteria`, ordered by identifier
    fn find(&self, criteria: &SearchCriteria) -> Result<Vec<AuditRecord>>;
}

/// Filter for record lookups
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchCriteria {
    /// Inclusive lower bound on record time (epoch millis)
    pub from_time: Option<i64>,
    /// Inclusive upper bound on record time (epoch millis)
    pub to_time: Option<i64>,
    pub min_level: Option<AuditLevel>,
    pub node_id: Option<String>,
    /// Record kind name: `message`, `admin` or `system`
    pub kind: Option<String>,
    pub limit: Option<usize>,
}

impl SearchCriteria {
    pub fn matches(&self, record: &AuditRecord) -> bool {
        self.from_time.map_or(true, |from| record.time_millis >= from)
            && self.to_time.map_or(true, |to| record.time_millis <= to)
            && self.min_level.map_or(true, |level| record.level >= level)
            && self
                .node_id
                .as_deref()
                .map_or(true, |node| record.node_id == node)
            && self
                .kind
                .as_deref()
                .map_or(true, |kind| record.kind_name() == kind)
    }
}

/// In-memory record store
///
/// Size accounting is an estimate: the length of each record's signable
/// rendering plus a fixed per-row overhead, unless a fixed per-record size is
/// configured. `set_reported_size` pins the reported usage for tests that
/// drive the archiver through specific usage levels.
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    max_size: Option<u64>,
    record_size: Option<u64>,
}

#[derive(Default)]
struct MemoryInner {
    records: BTreeMap<RecordId, AuditRecord>,
    next_id: RecordId,
    reported_size: Option<u64>,
    fail_saves: bool,
}

const ROW_OVERHEAD: u64 = 64;

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                next_id: 1,
                ..Default::default()
            }),
            max_size: None,
            record_size: None,
        }
    }

    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = Some(max_size);
        self
    }

    /// Account every record as exactly `bytes`
    pub fn with_record_size(mut self, bytes: u64) -> Self {
        self.record_size = Some(bytes);
        self
    }

    /// Pin the value returned by `current_size` (None restores accounting)
    pub fn set_reported_size(&self, bytes: Option<u64>) {
        self.inner.lock().reported_size = bytes;
    }

    /// Make subsequent saves fail
    pub fn set_fail_saves(&self, fail: bool) {
        self.inner.lock().fail_saves = fail;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: RecordId) -> Option<AuditRecord> {
        self.inner.lock().records.get(&id).cloned()
    }

    /// Snapshot of every stored record in identifier order
    pub fn records(&self) -> Vec<AuditRecord> {
        self.inner.lock().records.values().cloned().collect()
    }

    fn size_of(&self, record: &AuditRecord) -> u64 {
        self.record_size
            .unwrap_or_else(|| record.signable_bytes().len() as u64 + ROW_OVERHEAD)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore for MemoryStore {
    fn save(&self, record: &mut AuditRecord) -> Result<RecordId> {
        let mut inner = self.inner.lock();
        if inner.fail_saves {
            return Err(VigilError::Store("memory store rejected save".to_string()));
        }
        let id = inner.next_id;
        inner.next_id += 1;
        record.id = Some(id);
        inner.records.insert(id, record.clone());
        Ok(id)
    }

    fn update(&self, record: &AuditRecord) -> Result<()> {
        let id = record
            .id
            .ok_or_else(|| VigilError::Store("cannot update a record without an id".to_string()))?;
        let mut inner = self.inner.lock();
        match inner.records.get_mut(&id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(VigilError::Store(format!("no record with id {}", id))),
        }
    }

    fn min_id_above(&self, floor: RecordId) -> Result<Option<RecordId>> {
        let inner = self.inner.lock();
        Ok(inner
            .records
            .range((floor.saturating_add(1))..)
            .next()
            .map(|(id, _)| *id))
    }

    fn delete_range(&self, start: RecordId, end: RecordId) -> Result<u64> {
        if end < start {
            return Ok(0);
        }
        let mut inner = self.inner.lock();
        let doomed: Vec<RecordId> = inner.records.range(start..=end).map(|(id, _)| *id).collect();
        for id in &doomed {
            inner.records.remove(id);
        }
        Ok(doomed.len() as u64)
    }

    fn current_size(&self) -> Result<u64> {
        let inner = self.inner.lock();
        if let Some(size) = inner.reported_size {
            return Ok(size);
        }
        Ok(inner.records.values().map(|r| self.size_of(r)).sum())
    }

    fn max_size(&self) -> Result<Option<u64>> {
        Ok(self.max_size)
    }

    fn find(&self, criteria: &SearchCriteria) -> Result<Vec<AuditRecord>> {
        let inner = self.inner.lock();
        let limit = criteria.limit.unwrap_or(usize::MAX);
        Ok(inner
            .records
            .values()
            .filter(|record| criteria.matches(record))
            .take(limit)
            .cloned()
            .collect())
    }
}
