/*!
 * Audit context: one record plus its details for a single operation
 *
 * A context moves through `open -> flushed | cleared` exactly once. `flush`
 * is the only operation with side effects. It decides whether the record
 * survives the configured thresholds, renumbers the persisted details,
 * signs the record, routes it through the sink policy and persists what the
 * routing decision says to persist.
 *
 * Decision table for a record that passed its threshold:
 *
 * | sink outcome | fallback | always save | compliance | record saved | diagnostic saved |
 * |--------------|----------|-------------|------------|--------------|------------------|
 * | unconfigured | -        | -           | -          | yes          | no               |
 * | succeeded    | -        | off         | -          | no           | no               |
 * | succeeded    | -        | on          | -          | yes          | no               |
 * | failed       | on       | -           | -          | yes          | yes              |
 * | failed       | off      | off         | off        | no           | yes              |
 * | failed       | off      | on          | -          | yes          | yes              |
 * | failed       | off      | -           | on         | yes          | yes              |
 *
 * Every sink failure leaves a warning System record. Compliance mode keeps
 * the record itself even when fallback is off.
 */

use std::sync::Arc;

use tracing::{debug, error, info, trace, warn};
use vigil_core_audit::{
    messages, AuditDetail, AuditLevel, AuditRecord, AuditSigner, RecordId, RecordKind,
};

use crate::config::AuditPolicy;
use crate::error::{Result, VigilError};
use crate::policy::{SinkOutcome, SinkPolicyEvaluator};
use crate::store::RecordStore;

/// Replacement text for request/response bodies over the size limit
pub const BODY_OMITTED_PLACEHOLDER: &str = "<message body not audited: size limit exceeded>";

const SINK_DIAGNOSTIC_COMPONENT: &str = "audit-sink";

/// Everything a context needs once the pipeline is active
pub struct AuditServices {
    store: Arc<dyn RecordStore>,
    sink: Option<Arc<dyn SinkPolicyEvaluator>>,
    signer: Option<AuditSigner>,
    policy: AuditPolicy,
}

impl AuditServices {
    pub fn new(store: Arc<dyn RecordStore>, policy: AuditPolicy) -> Self {
        Self {
            store,
            sink: None,
            signer: None,
            policy,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn SinkPolicyEvaluator>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_signer(mut self, signer: AuditSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn policy(&self) -> &AuditPolicy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn signer(&self) -> Option<&AuditSigner> {
        self.signer.as_ref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContextState {
    Open,
    Flushed,
    Cleared,
}

/// What a flush did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// No record was set
    NoRecord,
    /// The pipeline is not active yet; the record was only logged
    Logged,
    /// Effective severity was below the record kind's threshold
    BelowThreshold,
    /// The record passed its threshold and was routed
    Routed {
        /// Identifier of the persisted record, if it was saved
        saved: Option<RecordId>,
        sink: SinkOutcome,
        /// Identifier of the persisted sink-failure diagnostic, if any
        diagnostic: Option<RecordId>,
    },
}

/// Per-operation accumulator of one audit record and its details
pub struct AuditContext {
    services: Option<Arc<AuditServices>>,
    record: Option<AuditRecord>,
    details: Vec<AuditDetail>,
    next_ordinal: u32,
    update: bool,
    state: ContextState,
}

impl AuditContext {
    /// Context for the active pipeline
    pub fn new(services: Arc<AuditServices>) -> Self {
        Self::with_services(Some(services))
    }

    /// Context that logs instead of persisting (before activation)
    pub fn log_only() -> Self {
        Self::with_services(None)
    }

    fn with_services(services: Option<Arc<AuditServices>>) -> Self {
        Self {
            services,
            record: None,
            details: Vec::new(),
            next_ordinal: 0,
            update: false,
            state: ContextState::Open,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            ContextState::Open => Ok(()),
            ContextState::Flushed => Err(VigilError::StateConflict("audit context already flushed")),
            ContextState::Cleared => Err(VigilError::StateConflict("audit context already cleared")),
        }
    }

    /// Set the record; details already attached to it are adopted in order
    pub fn set_record(&mut self, mut record: AuditRecord) -> Result<()> {
        self.ensure_open()?;
        if self.record.is_some() {
            return Err(VigilError::StateConflict("audit record already set"));
        }
        for detail in std::mem::take(&mut record.details) {
            self.push_detail(detail, None);
        }
        self.record = Some(record);
        Ok(())
    }

    /// Flush as an update of a previously saved record (the sink is bypassed)
    pub fn set_update(&mut self, update: bool) {
        self.update = update;
    }

    /// Attach a detail; every detail consumes an in-process ordinal
    pub fn add_detail(&mut self, detail: AuditDetail, source: Option<&str>) -> Result<()> {
        self.ensure_open()?;
        self.push_detail(detail, source);
        Ok(())
    }

    fn push_detail(&mut self, mut detail: AuditDetail, source: Option<&str>) {
        detail.ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        if let Some(source) = source {
            detail.source = Some(source.to_string());
        }
        self.details.push(detail);
    }

    pub fn record(&self) -> Option<&AuditRecord> {
        self.record.as_ref()
    }

    pub fn details(&self) -> &[AuditDetail] {
        &self.details
    }

    pub fn is_open(&self) -> bool {
        self.state == ContextState::Open
    }

    pub fn is_active(&self) -> bool {
        self.services.is_some()
    }

    /// Discard everything without persisting
    pub fn clear(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.state = ContextState::Cleared;
        self.record = None;
        self.details.clear();
        Ok(())
    }

    /// Gate, route and persist the record; callable exactly once
    pub fn flush(&mut self) -> Result<FlushOutcome> {
        self.ensure_open()?;
        self.state = ContextState::Flushed;

        let details = std::mem::take(&mut self.details);
        let Some(mut record) = self.record.take() else {
            if !details.is_empty() {
                warn!(
                    "Audit context flushed with {} detail(s) but no record; details discarded",
                    details.len()
                );
            }
            return Ok(FlushOutcome::NoRecord);
        };

        let Some(services) = self.services.clone() else {
            info!(
                level = %record.level,
                kind = record.kind_name(),
                "Audit (not persisted, pipeline inactive): {} [{} detail(s)]",
                record.message,
                details.len()
            );
            return Ok(FlushOutcome::Logged);
        };
        let policy = &services.policy;

        if let RecordKind::Admin(ref admin) = record.kind {
            if let Some(level) = policy.admin_levels.get(&admin.entity_kind) {
                record.level = *level;
            }
        }
        if record.node_id.is_empty() {
            record.node_id = policy.node_id.clone();
        }

        let mut details: Vec<AuditDetail> = details
            .into_iter()
            .filter(|detail| detail.passes(policy.detail_threshold))
            .collect();

        let effective = details
            .iter()
            .map(|detail| detail.level)
            .fold(record.level, AuditLevel::max);

        let threshold = gate_threshold(&record, policy);
        if effective < threshold {
            trace!(
                "Dropping {} audit record '{}': effective level {} below threshold {}",
                record.kind_name(),
                record.message,
                effective,
                threshold
            );
            return Ok(FlushOutcome::BelowThreshold);
        }

        if let Some(limit) = policy.message_body_limit {
            if let Some(detail) = omit_oversized_bodies(&mut record, limit) {
                if detail.passes(policy.detail_threshold) {
                    details.push(AuditDetail {
                        ordinal: self.next_ordinal,
                        ..detail
                    });
                    self.next_ordinal += 1;
                }
            }
        }

        record.details = resequence(details);

        if policy.sign_records {
            match services.signer {
                Some(ref signer) => signer.sign_record(&mut record),
                None => warn!("Audit signing is enabled but no signing key is configured"),
            }
        } else if self.update {
            record.signature = None;
        }

        if self.update {
            let saved = match services.store.update(&record) {
                Ok(()) => record.id,
                Err(e) => {
                    error!("Failed to update audit record {:?}: {}", record.id, e);
                    None
                }
            };
            return Ok(FlushOutcome::Routed {
                saved,
                sink: SinkOutcome::Unconfigured,
                diagnostic: None,
            });
        }

        let outcome = match services.sink {
            Some(ref sink) => sink.output_to_sink(&record),
            None => SinkOutcome::Unconfigured,
        };

        let (persist, diagnostic) = match outcome {
            SinkOutcome::Unconfigured => (true, None),
            SinkOutcome::Succeeded => (policy.always_save_internal, None),
            SinkOutcome::Failed(ref reason) => {
                let persist = policy.sink_fallback_on_failure
                    || policy.always_save_internal
                    || policy.compliance_mode;
                if !persist {
                    warn!(
                        "Audit sink policy failed for record '{}' and local fallback is disabled: {}",
                        record.message, reason
                    );
                }
                (persist, Some(sink_failure_record(&record, reason, persist, &services)))
            }
        };

        let saved = if persist {
            save_swallowing(&services, &mut record)
        } else {
            debug!(
                "Audit record '{}' handled by sink policy; not saved locally",
                record.message
            );
            None
        };

        let diagnostic = diagnostic.and_then(|mut diagnostic| save_swallowing(&services, &mut diagnostic));

        Ok(FlushOutcome::Routed {
            saved,
            sink: outcome,
            diagnostic,
        })
    }
}

fn gate_threshold(record: &AuditRecord, policy: &AuditPolicy) -> AuditLevel {
    match record.kind {
        RecordKind::Message(_) => policy.message_threshold,
        RecordKind::Admin(_) => policy.admin_threshold,
        RecordKind::System(ref system) if system.client_component => policy.system_client_threshold,
        RecordKind::System(ref system) if system.always_audit => AuditLevel::All,
        RecordKind::System(_) => AuditLevel::Warning,
    }
}

/// Renumber details densely from zero, keeping add order
fn resequence(mut details: Vec<AuditDetail>) -> Vec<AuditDetail> {
    details.retain(|detail| detail.persist);
    details.sort_by_key(|detail| detail.ordinal);
    for (ordinal, detail) in details.iter_mut().enumerate() {
        detail.ordinal = ordinal as u32;
    }
    details
}

/// Replace bodies over `limit` bytes, returning a detail describing the largest
fn omit_oversized_bodies(record: &mut AuditRecord, limit: usize) -> Option<AuditDetail> {
    let RecordKind::Message(ref mut message) = record.kind else {
        return None;
    };

    let mut largest = None;
    for body in [&mut message.request_body, &mut message.response_body] {
        if let Some(len) = body.as_ref().map(|b| b.len()).filter(|len| *len > limit) {
            *body = Some(BODY_OMITTED_PLACEHOLDER.to_string());
            largest = largest.max(Some(len));
        }
    }

    largest.map(|len| {
        AuditDetail::new(
            &messages::MESSAGE_TOO_LARGE,
            vec![len.to_string(), limit.to_string()],
        )
    })
}

fn sink_failure_record(
    record: &AuditRecord,
    reason: &str,
    persisted: bool,
    services: &AuditServices,
) -> AuditRecord {
    let policy = &services.policy;
    let message = if persisted {
        &messages::SINK_POLICY_FAILED
    } else {
        &messages::SINK_POLICY_FAILED_NO_FALLBACK
    };

    let mut diagnostic = AuditRecord::system(
        AuditLevel::Warning,
        SINK_DIAGNOSTIC_COMPONENT,
        "sink-failure",
        "Audit sink policy failed",
    )
    .with_node(&policy.node_id);
    diagnostic.details.push(AuditDetail::new(
        message,
        vec![record.message.clone(), reason.to_string()],
    ));

    if policy.sign_records {
        if let Some(ref signer) = services.signer {
            signer.sign_record(&mut diagnostic);
        }
    }
    diagnostic
}

fn save_swallowing(services: &AuditServices, record: &mut AuditRecord) -> Option<RecordId> {
    match services.store.save(record) {
        Ok(id) => Some(id),
        Err(e) => {
            error!("Failed to save audit record '{}': {}", record.message, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::FixedSinkPolicy;
    use crate::store::MemoryStore;
    use proptest::prelude::*;
    use vigil_core_audit::{
        AdminAction, DetailMessage, EntityKind, MessageAudit, SIGNATURE_ALGORITHM,
    };

    static FINE_DETAIL: DetailMessage = DetailMessage::new(9001, AuditLevel::Fine, "fine {0}");
    static INFO_DETAIL: DetailMessage = DetailMessage::new(9002, AuditLevel::Info, "info {0}");
    static SEVERE_DETAIL: DetailMessage = DetailMessage::new(9003, AuditLevel::Severe, "severe {0}");

    fn services(store: Arc<MemoryStore>, policy: AuditPolicy) -> Arc<AuditServices> {
        Arc::new(AuditServices::new(store, policy))
    }

    fn message_record(level: AuditLevel) -> AuditRecord {
        AuditRecord::message(level, "billing", "Message processed", MessageAudit::default())
    }

    #[test]
    fn test_set_record_twice_conflicts() {
        let mut ctx = AuditContext::log_only();
        ctx.set_record(message_record(AuditLevel::Info)).unwrap();
        assert!(matches!(
            ctx.set_record(message_record(AuditLevel::Info)),
            Err(VigilError::StateConflict(_))
        ));
    }

    #[test]
    fn test_double_flush_conflicts() {
        let mut ctx = AuditContext::log_only();
        assert_eq!(ctx.flush().unwrap(), FlushOutcome::NoRecord);
        assert!(matches!(ctx.flush(), Err(VigilError::StateConflict(_))));
        assert!(matches!(
            ctx.add_detail(AuditDetail::new(&INFO_DETAIL, vec!["x"]), None),
            Err(VigilError::StateConflict(_))
        ));
    }

    #[test]
    fn test_clear_is_terminal() {
        let mut ctx = AuditContext::log_only();
        ctx.set_record(message_record(AuditLevel::Info)).unwrap();
        ctx.clear().unwrap();
        assert!(ctx.record().is_none());
        assert!(matches!(ctx.clear(), Err(VigilError::StateConflict(_))));
        assert!(matches!(ctx.flush(), Err(VigilError::StateConflict(_))));
    }

    #[test]
    fn test_log_only_never_persists() {
        let mut ctx = AuditContext::log_only();
        ctx.set_record(message_record(AuditLevel::Severe)).unwrap();
        assert_eq!(ctx.flush().unwrap(), FlushOutcome::Logged);
    }

    #[test]
    fn test_orphaned_details_discarded() {
        let store = Arc::new(MemoryStore::new());
        let mut ctx = AuditContext::new(services(store.clone(), AuditPolicy::default()));
        ctx.add_detail(AuditDetail::new(&INFO_DETAIL, vec!["x"]), None)
            .unwrap();
        assert_eq!(ctx.flush().unwrap(), FlushOutcome::NoRecord);
        assert!(store.is_empty());
    }

    #[test]
    fn test_detail_raises_effective_level() {
        let store = Arc::new(MemoryStore::new());
        let mut ctx = AuditContext::new(services(store.clone(), AuditPolicy::default()));
        ctx.set_record(message_record(AuditLevel::Info)).unwrap();
        ctx.add_detail(AuditDetail::new(&SEVERE_DETAIL, vec!["boom"]), Some("routing"))
            .unwrap();

        let outcome = ctx.flush().unwrap();
        assert!(matches!(outcome, FlushOutcome::Routed { saved: Some(_), .. }));
        let saved = store.records();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].details[0].source.as_deref(), Some("routing"));
        assert_eq!(saved[0].level, AuditLevel::Info);
    }

    #[test]
    fn test_message_below_threshold_dropped() {
        let store = Arc::new(MemoryStore::new());
        let mut ctx = AuditContext::new(services(store.clone(), AuditPolicy::default()));
        ctx.set_record(message_record(AuditLevel::Info)).unwrap();
        ctx.add_detail(AuditDetail::new(&FINE_DETAIL, vec!["quiet"]), None)
            .unwrap();
        assert_eq!(ctx.flush().unwrap(), FlushOutcome::BelowThreshold);
        assert!(store.is_empty());
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let store = Arc::new(MemoryStore::new());
        let mut ctx = AuditContext::new(services(store.clone(), AuditPolicy::default()));
        ctx.set_record(message_record(AuditLevel::Warning)).unwrap();
        ctx.flush().unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_detail_filter_and_resequence() {
        let store = Arc::new(MemoryStore::new());
        let mut ctx = AuditContext::new(services(store.clone(), AuditPolicy::default()));
        ctx.set_record(message_record(AuditLevel::Warning)).unwrap();
        ctx.add_detail(AuditDetail::new(&FINE_DETAIL, vec!["a"]), None)
            .unwrap();
        ctx.add_detail(AuditDetail::new(&INFO_DETAIL, vec!["b"]), None)
            .unwrap();
        ctx.add_detail(AuditDetail::new(&messages::POLICY_DEBUG_TRACE, vec!["c"]), None)
            .unwrap();
        ctx.add_detail(AuditDetail::new(&SEVERE_DETAIL, vec!["d"]), None)
            .unwrap();
        assert_eq!(
            ctx.details().iter().map(|d| d.ordinal).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );

        ctx.flush().unwrap();
        let saved = &store.records()[0];
        let persisted: Vec<(i32, u32)> = saved
            .details
            .iter()
            .map(|d| (d.message_id, d.ordinal))
            .collect();
        assert_eq!(persisted, vec![(9002, 0), (9003, 1)]);
    }

    #[test]
    fn test_system_records_gating() {
        let store = Arc::new(MemoryStore::new());
        let services = services(store.clone(), AuditPolicy::default());

        let mut ctx = AuditContext::new(services.clone());
        ctx.set_record(AuditRecord::system(AuditLevel::Finest, "boot", "start", "started"))
            .unwrap();
        ctx.flush().unwrap();
        assert_eq!(store.len(), 1);

        let mut ctx = AuditContext::new(services.clone());
        ctx.set_record(AuditRecord::system(AuditLevel::Info, "boot", "poll", "polled").optional())
            .unwrap();
        assert_eq!(ctx.flush().unwrap(), FlushOutcome::BelowThreshold);

        let mut ctx = AuditContext::new(services);
        ctx.set_record(
            AuditRecord::system(AuditLevel::Info, "agent", "poll", "client").from_client_component(),
        )
        .unwrap();
        assert_eq!(ctx.flush().unwrap(), FlushOutcome::BelowThreshold);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_admin_level_override() {
        let store = Arc::new(MemoryStore::new());
        let mut policy = AuditPolicy {
            admin_threshold: AuditLevel::Warning,
            ..AuditPolicy::default()
        };
        policy
            .admin_levels
            .insert(EntityKind::PrivateKey, AuditLevel::Warning);
        let services = services(store.clone(), policy);

        let mut ctx = AuditContext::new(services.clone());
        ctx.set_record(AuditRecord::admin(
            AuditLevel::Info,
            EntityKind::PrivateKey,
            "key-1",
            AdminAction::Deleted,
            "Private key deleted",
        ))
        .unwrap();
        ctx.flush().unwrap();

        let mut ctx = AuditContext::new(services);
        ctx.set_record(AuditRecord::admin(
            AuditLevel::Info,
            EntityKind::Folder,
            "folder-1",
            AdminAction::Created,
            "Folder created",
        ))
        .unwrap();
        assert_eq!(ctx.flush().unwrap(), FlushOutcome::BelowThreshold);

        let saved = store.records();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].level, AuditLevel::Warning);
    }

    #[test]
    fn test_sink_success_without_always_save() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(FixedSinkPolicy::new(SinkOutcome::Succeeded));
        let services = Arc::new(
            AuditServices::new(store.clone(), AuditPolicy::default()).with_sink(sink.clone()),
        );
        let mut ctx = AuditContext::new(services);
        ctx.set_record(message_record(AuditLevel::Severe)).unwrap();
        let outcome = ctx.flush().unwrap();
        assert_eq!(
            outcome,
            FlushOutcome::Routed {
                saved: None,
                sink: SinkOutcome::Succeeded,
                diagnostic: None
            }
        );
        assert_eq!(sink.calls(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_sink_failure_with_fallback_saves_record_and_diagnostic() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(FixedSinkPolicy::new(SinkOutcome::Failed("jdbc down".into())));
        let services =
            Arc::new(AuditServices::new(store.clone(), AuditPolicy::default()).with_sink(sink));
        let mut ctx = AuditContext::new(services);
        ctx.set_record(message_record(AuditLevel::Severe)).unwrap();
        let outcome = ctx.flush().unwrap();
        assert!(matches!(
            outcome,
            FlushOutcome::Routed {
                saved: Some(_),
                diagnostic: Some(_),
                ..
            }
        ));

        let saved = store.records();
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[1].details[0].message_id, messages::SINK_POLICY_FAILED.id);
        assert!(saved[1].details[0].text.contains("jdbc down"));
    }

    /// Flush one severe record through a failing sink under `policy`
    fn flush_with_failing_sink(policy: AuditPolicy) -> (FlushOutcome, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(FixedSinkPolicy::new(SinkOutcome::Failed("sink down".into())));
        let services = Arc::new(AuditServices::new(store.clone(), policy).with_sink(sink));
        let mut ctx = AuditContext::new(services);
        ctx.set_record(message_record(AuditLevel::Severe)).unwrap();
        (ctx.flush().unwrap(), store)
    }

    fn no_fallback(always_save_internal: bool, compliance_mode: bool) -> AuditPolicy {
        AuditPolicy {
            sink_fallback_on_failure: false,
            always_save_internal,
            compliance_mode,
            ..AuditPolicy::default()
        }
    }

    fn diagnostic_ids(store: &MemoryStore) -> Vec<i32> {
        store
            .records()
            .iter()
            .filter(|r| matches!(r.kind, RecordKind::System(ref s) if s.component == SINK_DIAGNOSTIC_COMPONENT))
            .map(|r| r.details[0].message_id)
            .collect()
    }

    #[test]
    fn test_sink_failure_without_fallback_saves_only_diagnostic() {
        let (outcome, store) = flush_with_failing_sink(no_fallback(false, false));
        assert!(matches!(
            outcome,
            FlushOutcome::Routed {
                saved: None,
                diagnostic: Some(_),
                ..
            }
        ));
        assert_eq!(store.len(), 1);
        assert_eq!(
            diagnostic_ids(&store),
            vec![messages::SINK_POLICY_FAILED_NO_FALLBACK.id]
        );
        assert_eq!(store.records()[0].level, AuditLevel::Warning);
    }

    #[test]
    fn test_sink_failure_without_fallback_always_save_keeps_record() {
        let (outcome, store) = flush_with_failing_sink(no_fallback(true, false));
        assert!(matches!(
            outcome,
            FlushOutcome::Routed {
                saved: Some(_),
                diagnostic: Some(_),
                ..
            }
        ));
        assert_eq!(store.len(), 2);
        assert_eq!(diagnostic_ids(&store), vec![messages::SINK_POLICY_FAILED.id]);
    }

    #[test]
    fn test_sink_failure_without_fallback_compliance_keeps_record() {
        let (outcome, store) = flush_with_failing_sink(no_fallback(false, true));
        assert!(matches!(
            outcome,
            FlushOutcome::Routed {
                saved: Some(_),
                diagnostic: Some(_),
                ..
            }
        ));
        assert_eq!(store.len(), 2);
        assert_eq!(diagnostic_ids(&store), vec![messages::SINK_POLICY_FAILED.id]);
    }

    #[test]
    fn test_sink_failure_compliance_with_always_save() {
        let (outcome, store) = flush_with_failing_sink(no_fallback(true, true));
        assert!(matches!(
            outcome,
            FlushOutcome::Routed {
                saved: Some(_),
                diagnostic: Some(_),
                ..
            }
        ));
        assert_eq!(store.len(), 2);
        assert_eq!(diagnostic_ids(&store).len(), 1);
    }

    #[test]
    fn test_sink_failure_with_fallback_ignores_other_flags() {
        for (always, compliance) in [(false, false), (true, false), (false, true), (true, true)] {
            let policy = AuditPolicy {
                always_save_internal: always,
                compliance_mode: compliance,
                ..AuditPolicy::default()
            };
            let (outcome, store) = flush_with_failing_sink(policy);
            assert!(matches!(
                outcome,
                FlushOutcome::Routed {
                    saved: Some(_),
                    diagnostic: Some(_),
                    ..
                }
            ));
            assert_eq!(store.len(), 2);
            assert_eq!(diagnostic_ids(&store), vec![messages::SINK_POLICY_FAILED.id]);
        }
    }

    #[test]
    fn test_sink_success_with_always_save_persists_once() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(FixedSinkPolicy::new(SinkOutcome::Succeeded));
        let policy = AuditPolicy {
            always_save_internal: true,
            compliance_mode: true,
            ..AuditPolicy::default()
        };
        let services = Arc::new(AuditServices::new(store.clone(), policy).with_sink(sink));
        let mut ctx = AuditContext::new(services);
        ctx.set_record(message_record(AuditLevel::Severe)).unwrap();
        assert!(matches!(
            ctx.flush().unwrap(),
            FlushOutcome::Routed {
                saved: Some(_),
                diagnostic: None,
                ..
            }
        ));
        assert_eq!(store.len(), 1);
        assert!(diagnostic_ids(&store).is_empty());
    }

    #[test]
    fn test_sink_failure_with_failing_store_is_swallowed() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_saves(true);
        let sink = Arc::new(FixedSinkPolicy::new(SinkOutcome::Failed("sink down".into())));
        let services =
            Arc::new(AuditServices::new(store.clone(), no_fallback(false, true)).with_sink(sink));
        let mut ctx = AuditContext::new(services);
        ctx.set_record(message_record(AuditLevel::Severe)).unwrap();
        assert!(matches!(
            ctx.flush().unwrap(),
            FlushOutcome::Routed {
                saved: None,
                diagnostic: None,
                ..
            }
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_double_flush_on_store_backed_context() {
        let store = Arc::new(MemoryStore::new());
        let mut ctx = AuditContext::new(services(store.clone(), AuditPolicy::default()));
        ctx.set_record(message_record(AuditLevel::Severe)).unwrap();
        assert!(matches!(ctx.flush().unwrap(), FlushOutcome::Routed { saved: Some(_), .. }));
        assert!(matches!(ctx.flush(), Err(VigilError::StateConflict(_))));
        assert!(matches!(
            ctx.set_record(message_record(AuditLevel::Severe)),
            Err(VigilError::StateConflict(_))
        ));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_update_bypasses_sink_and_clears_signature() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(FixedSinkPolicy::new(SinkOutcome::Succeeded));
        let services = Arc::new(
            AuditServices::new(store.clone(), AuditPolicy::default()).with_sink(sink.clone()),
        );

        let mut record = message_record(AuditLevel::Severe);
        record.signature = Some("stale".to_string());
        store.save(&mut record).unwrap();

        let mut ctx = AuditContext::new(services);
        ctx.set_update(true);
        ctx.set_record(record).unwrap();
        let outcome = ctx.flush().unwrap();
        assert!(matches!(outcome, FlushOutcome::Routed { saved: Some(1), .. }));
        assert_eq!(sink.calls(), 0);
        assert_eq!(store.get(1).unwrap().signature, None);
    }

    #[test]
    fn test_signing_covers_persisted_content() {
        let store = Arc::new(MemoryStore::new());
        let signer = AuditSigner::from_bytes(b"context-test");
        let policy = AuditPolicy {
            sign_records: true,
            message_body_limit: Some(8),
            ..AuditPolicy::default()
        };
        let services =
            Arc::new(AuditServices::new(store.clone(), policy).with_signer(signer.clone()));

        let mut ctx = AuditContext::new(services);
        let body = MessageAudit {
            request_body: Some("<a>far too long for the limit</a>".to_string()),
            response_body: Some("<ok/>".to_string()),
            ..Default::default()
        };
        ctx.set_record(AuditRecord::message(
            AuditLevel::Severe,
            "billing",
            "Message processed",
            body,
        ))
        .unwrap();
        ctx.flush().unwrap();

        let saved = &store.records()[0];
        let RecordKind::Message(ref message) = saved.kind else {
            panic!("expected message record");
        };
        assert_eq!(message.request_body.as_deref(), Some(BODY_OMITTED_PLACEHOLDER));
        assert_eq!(message.response_body.as_deref(), Some("<ok/>"));
        assert_eq!(saved.details[0].message_id, messages::MESSAGE_TOO_LARGE.id);
        assert!(signer.verify_record(saved).is_ok());
        assert_eq!(SIGNATURE_ALGORITHM, "hmac-sha256");
    }

    #[test]
    fn test_store_failure_is_swallowed() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_saves(true);
        let mut ctx = AuditContext::new(services(store.clone(), AuditPolicy::default()));
        ctx.set_record(message_record(AuditLevel::Severe)).unwrap();
        let outcome = ctx.flush().unwrap();
        assert!(matches!(outcome, FlushOutcome::Routed { saved: None, .. }));
    }

    #[test]
    fn test_node_id_defaulted_from_policy() {
        let store = Arc::new(MemoryStore::new());
        let policy = AuditPolicy {
            node_id: "gw-3".to_string(),
            ..AuditPolicy::default()
        };
        let mut ctx = AuditContext::new(services(store.clone(), policy));
        ctx.set_record(message_record(AuditLevel::Severe)).unwrap();
        ctx.flush().unwrap();
        assert_eq!(store.records()[0].node_id, "gw-3");
    }

    fn level_strategy() -> impl Strategy<Value = AuditLevel> {
        prop_oneof![
            Just(AuditLevel::Finest),
            Just(AuditLevel::Fine),
            Just(AuditLevel::Info),
            Just(AuditLevel::Warning),
            Just(AuditLevel::Severe),
        ]
    }

    proptest! {
        #[test]
        fn prop_persisted_ordinals_dense_and_ordered(
            levels in proptest::collection::vec((level_strategy(), any::<bool>()), 0..24)
        ) {
            let store = Arc::new(MemoryStore::new());
            let mut ctx = AuditContext::new(services(store.clone(), AuditPolicy::default()));
            ctx.set_record(AuditRecord::system(AuditLevel::Severe, "c", "a", "m")).unwrap();

            for (i, (level, persist)) in levels.iter().enumerate() {
                let mut detail = AuditDetail::new(&INFO_DETAIL, vec![i.to_string()]);
                detail.level = *level;
                detail.persist = *persist;
                ctx.add_detail(detail, None).unwrap();
            }
            ctx.flush().unwrap();

            let saved = &store.records()[0];
            let expected: Vec<String> = levels
                .iter()
                .enumerate()
                .filter(|(_, (level, persist))| *persist && *level >= AuditLevel::Info)
                .map(|(i, _)| i.to_string())
                .collect();
            let actual: Vec<String> = saved.details.iter().map(|d| d.params[0].clone()).collect();
            prop_assert_eq!(actual, expected);
            for (i, detail) in saved.details.iter().enumerate() {
                prop_assert_eq!(detail.ordinal, i as u32);
            }
        }
    }
}
