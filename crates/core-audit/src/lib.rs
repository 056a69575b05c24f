//! Audit record model for Vigil
//!
//! This crate holds the types every other part of the pipeline agrees on:
//! severities, records and their details, the detail message catalog, the
//! canonical signable rendering, and the HMAC signer.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │            AuditRecord              │
//! │  header (level, node, time, user)   │
//! │  kind: Message | Admin | System     │
//! │  details: [AuditDetail ...]         │
//! └──────────────┬──────────────────────┘
//!                │ signable_bytes()
//!                ▼
//! ┌─────────────────────────────────────┐
//! │           AuditSigner               │
//! │  HMAC-SHA256, hex signature         │
//! └─────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use vigil_core_audit::{messages, AuditDetail, AuditLevel, AuditRecord, AuditSigner};
//!
//! let mut record = AuditRecord::system(AuditLevel::Warning, "archiver", "halt", "Archiver halted")
//!     .with_node("node-1");
//! record.details.push(AuditDetail::new(&messages::ARCHIVER_HALTED, vec!["no maximum size"]));
//!
//! let signer = AuditSigner::from_bytes(b"secret");
//! signer.sign_record(&mut record);
//! assert!(signer.verify_record(&record).is_ok());
//! ```

pub mod catalog;
pub mod detail;
pub mod error;
pub mod level;
pub mod record;
pub mod signer;

// Re-export main types
pub use catalog::{format_message, messages, DetailMessage, MessageCatalog};
pub use detail::AuditDetail;
pub use error::{Error, Result};
pub use level::AuditLevel;
pub use record::{
    escape_field, AdminAction, AdminAudit, AuditRecord, EntityKind, MessageAudit, RecordId,
    RecordKind, ServiceId, SystemAudit, FIELD_DELIM,
};
pub use signer::{AuditSigner, SECRET_ENV_VAR, SIGNATURE_ALGORITHM};
