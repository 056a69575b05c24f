/*!
 * Audit context factory
 *
 * Before [`AuditContextFactory::activate`] runs, every context the factory
 * hands out is log-only: records are written to the diagnostic log and never
 * persisted. Activation wires the store, sink policy, signer and resolved
 * policy exactly once; from then on contexts persist.
 *
 * Contexts are passed explicitly. [`ContextGuard`] flushes its context when
 * it goes out of scope (including during unwinding), and a nested guard
 * borrows its parent mutably, so the parent is usable again only after the
 * child has been flushed.
 */

use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tracing::{error, info};
use vigil_core_audit::{
    AdminAction, AuditDetail, AuditLevel, AuditRecord, EntityKind,
};

use crate::context::{AuditContext, AuditServices, FlushOutcome};
use crate::error::{Result, VigilError};

static GLOBAL: AuditContextFactory = AuditContextFactory::new();

/// Process-wide factory
pub fn global() -> &'static AuditContextFactory {
    &GLOBAL
}

pub struct AuditContextFactory {
    activating: AtomicBool,
    services: OnceLock<Arc<AuditServices>>,
}

impl AuditContextFactory {
    pub const fn new() -> Self {
        Self {
            activating: AtomicBool::new(false),
            services: OnceLock::new(),
        }
    }

    /// Switch from the early (log-only) phase to the active phase
    pub fn activate(&self, services: AuditServices) -> Result<()> {
        if self
            .activating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(VigilError::StateConflict("audit pipeline already activated"));
        }

        if services.policy().sign_records && services.signer().is_none() {
            error!("Audit record signing is enabled but no signing key was provided");
        }
        info!(
            node = %services.policy().node_id,
            "Audit pipeline active (message threshold {}, admin threshold {})",
            services.policy().message_threshold,
            services.policy().admin_threshold
        );

        let _ = self.services.set(Arc::new(services));
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.services.get().is_some()
    }

    pub fn services(&self) -> Option<&Arc<AuditServices>> {
        self.services.get()
    }

    /// A fresh context for the current phase
    pub fn new_context(&self) -> AuditContext {
        match self.services.get() {
            Some(services) => AuditContext::new(services.clone()),
            None => AuditContext::log_only(),
        }
    }

    /// Scope guard that flushes its context on drop
    pub fn enter(&self) -> ContextGuard<'_> {
        ContextGuard {
            factory: self,
            ctx: self.new_context(),
            _parent: PhantomData,
        }
    }

    /// Run `work` with a fresh context, flushing it exactly once afterwards
    pub fn scoped<T, F>(&self, work: F) -> T
    where
        F: FnOnce(&mut AuditContext) -> T,
    {
        let mut guard = self.enter();
        work(&mut guard)
    }

    /// Admin record at the level configured for `kind`
    pub fn admin_record(
        &self,
        kind: EntityKind,
        entity_id: &str,
        action: AdminAction,
        message: &str,
    ) -> AuditRecord {
        let (level, node) = match self.services.get() {
            Some(services) => (
                services.policy().admin_level(kind),
                services.policy().node_id.clone(),
            ),
            None => (AuditLevel::Info, String::new()),
        };
        AuditRecord::admin(level, kind, entity_id, action, message).with_node(&node)
    }

    /// Flush a one-shot system record with an optional detail
    pub fn system_event(
        &self,
        level: AuditLevel,
        component: &str,
        action: &str,
        message: &str,
        detail: Option<AuditDetail>,
    ) -> Result<FlushOutcome> {
        let mut ctx = self.new_context();
        ctx.set_record(AuditRecord::system(level, component, action, message))?;
        if let Some(detail) = detail {
            ctx.add_detail(detail, Some(component))?;
        }
        ctx.flush()
    }
}

impl Default for AuditContextFactory {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns a context for a lexical scope and flushes it on drop
pub struct ContextGuard<'a> {
    factory: &'a AuditContextFactory,
    ctx: AuditContext,
    _parent: PhantomData<&'a mut AuditContext>,
}

impl ContextGuard<'_> {
    /// Child scope; the parent is inaccessible until the child is dropped
    pub fn nested(&mut self) -> ContextGuard<'_> {
        ContextGuard {
            factory: self.factory,
            ctx: self.factory.new_context(),
            _parent: PhantomData,
        }
    }

    /// Flush now instead of at end of scope
    pub fn finish(mut self) -> Result<FlushOutcome> {
        self.ctx.flush()
    }
}

impl Deref for ContextGuard<'_> {
    type Target = AuditContext;

    fn deref(&self) -> &AuditContext {
        &self.ctx
    }
}

impl DerefMut for ContextGuard<'_> {
    fn deref_mut(&mut self) -> &mut AuditContext {
        &mut self.ctx
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        if self.ctx.is_open() {
            if let Err(e) = self.ctx.flush() {
                error!("Failed to flush audit context at end of scope: {}", e);
            }
        }
    }
}
