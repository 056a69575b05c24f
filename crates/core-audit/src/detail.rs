//! Audit details: structured sub-events attached to a record

use crate::catalog::DetailMessage;
use crate::level::AuditLevel;
use serde::{Deserialize, Serialize};

/// A structured sub-event attached to an [`crate::AuditRecord`]
///
/// `ordinal` is assigned twice: once when the detail is added to a context
/// (dense over everything added) and again at flush time, when the persisted
/// subset is renumbered densely from zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditDetail {
    pub message_id: i32,
    pub level: AuditLevel,
    pub params: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
    pub ordinal: u32,
    /// Component that raised the detail (assertion, admin API, archiver...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Formatted text, rendered from the catalog template at creation
    pub text: String,
    #[serde(skip, default = "default_true")]
    pub persist: bool,
}

fn default_true() -> bool {
    true
}

impl AuditDetail {
    /// Create a detail from a catalog entry
    pub fn new<S: Into<String>>(message: &DetailMessage, params: Vec<S>) -> Self {
        let params: Vec<String> = params.into_iter().map(Into::into).collect();
        let text = message.format(&params);
        Self {
            message_id: message.id,
            level: message.level,
            params,
            exception: None,
            ordinal: 0,
            source: None,
            text,
            persist: message.persist,
        }
    }

    /// Attach exception text
    pub fn with_exception<S: Into<String>>(mut self, exception: S) -> Self {
        self.exception = Some(exception.into());
        self
    }

    /// Whether the detail survives the associated-detail threshold
    pub fn passes(&self, threshold: AuditLevel) -> bool {
        self.level >= threshold
    }

    /// `id\:text`, the rendering shared by signing and export
    pub fn signable(&self) -> String {
        format!("{}\\:{}", self.message_id, self.text)
    }
}
