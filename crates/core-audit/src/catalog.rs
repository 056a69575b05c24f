//! Audit detail message catalog
//!
//! Every [`crate::AuditDetail`] references a catalog entry by id. The entry
//! supplies the severity, the text template and whether details of this kind
//! are written to the record store at all. Templates use positional
//! placeholders (`{0}`, `{1}`, ...).

use crate::error::{Error, Result};
use crate::level::AuditLevel;
use std::borrow::Cow;
use std::collections::BTreeMap;

/// A single catalog entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailMessage {
    pub id: i32,
    pub level: AuditLevel,
    pub template: Cow<'static, str>,
    /// `false` for details that are logged but never persisted
    pub persist: bool,
}

impl DetailMessage {
    pub const fn new(id: i32, level: AuditLevel, template: &'static str) -> Self {
        Self {
            id,
            level,
            template: Cow::Borrowed(template),
            persist: true,
        }
    }

    /// Entry whose details are dropped at flush time
    pub const fn transient(id: i32, level: AuditLevel, template: &'static str) -> Self {
        Self {
            id,
            level,
            template: Cow::Borrowed(template),
            persist: false,
        }
    }

    /// Render the template with the given parameters
    pub fn format<S: AsRef<str>>(&self, params: &[S]) -> String {
        format_message(&self.template, params)
    }
}

/// Messages emitted by the pipeline itself
pub mod messages {
    use super::DetailMessage;
    use crate::level::AuditLevel;

    pub static SINK_POLICY_FAILED: DetailMessage = DetailMessage::new(
        -5,
        AuditLevel::Warning,
        "Audit sink policy failed; record {0} handled by fallback: {1}",
    );
    pub static SINK_POLICY_FAILED_NO_FALLBACK: DetailMessage = DetailMessage::new(
        -6,
        AuditLevel::Warning,
        "Audit sink policy failed and local fallback is disabled; record {0} was not saved: {1}",
    );
    pub static MESSAGE_TOO_LARGE: DetailMessage = DetailMessage::new(
        -7,
        AuditLevel::Info,
        "Message body of {0} bytes exceeds the audit limit of {1} bytes and was not saved",
    );
    pub static ARCHIVER_SUSPENDED: DetailMessage = DetailMessage::new(
        -10,
        AuditLevel::Severe,
        "Audit store usage {0}% reached the shutdown threshold of {1}%; message processing suspended",
    );
    pub static ARCHIVER_RESUMED: DetailMessage = DetailMessage::new(
        -11,
        AuditLevel::Info,
        "Audit store usage {0}% is below the shutdown threshold of {1}%; message processing resumed",
    );
    pub static ARCHIVER_COMPLETED: DetailMessage = DetailMessage::new(
        -12,
        AuditLevel::Info,
        "Archived and removed audit records {0} to {1} ({2} records)",
    );
    pub static ARCHIVER_HALTED: DetailMessage = DetailMessage::new(
        -13,
        AuditLevel::Severe,
        "Audit archiver halted: {0}",
    );
    pub static POLICY_DEBUG_TRACE: DetailMessage =
        DetailMessage::transient(-20, AuditLevel::Fine, "Policy trace: {0}");

    pub(crate) static BUILTIN: [&DetailMessage; 8] = [
        &SINK_POLICY_FAILED,
        &SINK_POLICY_FAILED_NO_FALLBACK,
        &MESSAGE_TOO_LARGE,
        &ARCHIVER_SUSPENDED,
        &ARCHIVER_RESUMED,
        &ARCHIVER_COMPLETED,
        &ARCHIVER_HALTED,
        &POLICY_DEBUG_TRACE,
    ];
}

/// Lookup table from message id to catalog entry
#[derive(Debug, Clone, Default)]
pub struct MessageCatalog {
    entries: BTreeMap<i32, DetailMessage>,
}

impl MessageCatalog {
    /// Empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog pre-populated with the pipeline's own messages
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        for message in messages::BUILTIN {
            catalog.register(message.clone());
        }
        catalog
    }

    /// Add or replace an entry
    pub fn register(&mut self, message: DetailMessage) {
        self.entries.insert(message.id, message);
    }

    /// Builder-style [`MessageCatalog::register`]
    pub fn with(mut self, message: DetailMessage) -> Self {
        self.register(message);
        self
    }

    pub fn get(&self, id: i32) -> Option<&DetailMessage> {
        self.entries.get(&id)
    }

    pub fn require(&self, id: i32) -> Result<&DetailMessage> {
        self.get(id).ok_or(Error::UnknownMessage(id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Substitute `{n}` placeholders with positional parameters
///
/// Placeholders without a matching parameter are left untouched.
pub fn format_message<S: AsRef<str>>(template: &str, params: &[S]) -> String {
    let mut out = String::with_capacity(template.len() + 16);
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let index = &after[..close];
                match index.parse::<usize>().ok().and_then(|i| params.get(i)) {
                    Some(value) => out.push_str(value.as_ref()),
                    None => {
                        out.push('{');
                        out.push_str(index);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
