/*!
 * Sink and lookup policy seams
 *
 * Policy evaluation is owned by the gateway's policy engine. The pipeline only
 * sees the outcome: the policy was not configured, it ran successfully, or it
 * failed with a reason.
 */

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};
use vigil_core_audit::AuditRecord;

use crate::error::{Result, VigilError};
use crate::store::{RecordStore, SearchCriteria};

/// Outcome of running the audit sink policy against a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkOutcome {
    /// No sink policy is configured
    Unconfigured,
    /// The policy accepted the record
    Succeeded,
    /// The policy ran and failed
    Failed(String),
}

/// Routes a flushed record to an external audit sink
pub trait SinkPolicyEvaluator: Send + Sync {
    fn output_to_sink(&self, record: &AuditRecord) -> SinkOutcome;
}

/// Outcome of running the audit lookup policy
#[derive(Debug, Clone, PartialEq)]
pub enum LookupOutcome {
    Unconfigured,
    Found(Vec<AuditRecord>),
    Failed(String),
}

/// Retrieves externally stored records
pub trait LookupPolicyEvaluator: Send + Sync {
    fn lookup(&self, criteria: &SearchCriteria) -> LookupOutcome;
}

/// Search entry point honouring an optional lookup policy
///
/// With a configured lookup policy the external store is authoritative and a
/// failed lookup is an error. Otherwise the local record store is searched.
pub struct AuditLookup {
    store: Arc<dyn RecordStore>,
    lookup: Option<Arc<dyn LookupPolicyEvaluator>>,
}

impl AuditLookup {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            lookup: None,
        }
    }

    pub fn with_lookup_policy(mut self, lookup: Arc<dyn LookupPolicyEvaluator>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    pub fn find(&self, criteria: &SearchCriteria) -> Result<Vec<AuditRecord>> {
        if let Some(ref lookup) = self.lookup {
            match lookup.lookup(criteria) {
                LookupOutcome::Found(records) => {
                    debug!("Lookup policy returned {} audit records", records.len());
                    return Ok(records);
                }
                LookupOutcome::Failed(reason) => {
                    warn!("Audit lookup policy failed: {}", reason);
                    return Err(VigilError::Policy(reason));
                }
                LookupOutcome::Unconfigured => {}
            }
        }
        self.store.find(criteria)
    }
}

/// Sink policy returning a fixed outcome and recording what it saw
pub struct FixedSinkPolicy {
    outcome: SinkOutcome,
    calls: AtomicUsize,
    seen: Mutex<Vec<AuditRecord>>,
}

impl FixedSinkPolicy {
    pub fn new(outcome: SinkOutcome) -> Self {
        Self {
            outcome,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<AuditRecord> {
        self.seen.lock().clone()
    }
}

impl SinkPolicyEvaluator for FixedSinkPolicy {
    fn output_to_sink(&self, record: &AuditRecord) -> SinkOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(record.clone());
        self.outcome.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use vigil_core_audit::AuditLevel;

    struct StaticLookup(LookupOutcome);

    impl LookupPolicyEvaluator for StaticLookup {
        fn lookup(&self, _criteria: &SearchCriteria) -> LookupOutcome {
            self.0.clone()
        }
    }

    fn store_with_one() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let mut record = AuditRecord::system(AuditLevel::Info, "local", "probe", "local record");
        store.save(&mut record).unwrap();
        store
    }

    #[test]
    fn test_lookup_without_policy_uses_store() {
        let lookup = AuditLookup::new(store_with_one());
        let found = lookup.find(&SearchCriteria::default()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].message, "local record");
    }

    #[test]
    fn test_unconfigured_lookup_falls_back_to_store() {
        let lookup = AuditLookup::new(store_with_one())
            .with_lookup_policy(Arc::new(StaticLookup(LookupOutcome::Unconfigured)));
        assert_eq!(lookup.find(&SearchCriteria::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_lookup_policy_is_authoritative() {
        let external = AuditRecord::system(AuditLevel::Warning, "ext", "probe", "external record");
        let lookup = AuditLookup::new(store_with_one())
            .with_lookup_policy(Arc::new(StaticLookup(LookupOutcome::Found(vec![external]))));
        let found = lookup.find(&SearchCriteria::default()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].message, "external record");
    }

    #[test]
    fn test_failed_lookup_is_an_error() {
        let lookup = AuditLookup::new(store_with_one()).with_lookup_policy(Arc::new(StaticLookup(
            LookupOutcome::Failed("sink database offline".to_string()),
        )));
        assert!(matches!(
            lookup.find(&SearchCriteria::default()),
            Err(VigilError::Policy(_))
        ));
    }

    #[test]
    fn test_fixed_sink_records_calls() {
        let sink = FixedSinkPolicy::new(SinkOutcome::Succeeded);
        let record = AuditRecord::system(AuditLevel::Info, "c", "a", "m");
        assert_eq!(sink.output_to_sink(&record), SinkOutcome::Succeeded);
        assert_eq!(sink.calls(), 1);
        assert_eq!(sink.seen()[0].message, "m");
    }
}
