//! Audit records
//!
//! An [`AuditRecord`] is a common header plus one of three kind-specific
//! bodies. Records are built by callers, handed to an audit context, and
//! become immutable once the context flushes them (the flush assigns the
//! signature and the final detail ordinals exactly once).

use crate::detail::AuditDetail;
use crate::error::{Error, Result};
use crate::level::AuditLevel;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Store-assigned record identifier
pub type RecordId = i64;

/// Field delimiter shared by the signable rendering and the export format
pub const FIELD_DELIM: char = ':';

/// 128-bit service identifier, rendered as 32 lower-case hex characters
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceId([u8; 16]);

impl ServiceId {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn from_u128(value: u128) -> Self {
        Self(value.to_be_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ServiceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim()).map_err(|_| Error::InvalidServiceId(s.to_string()))?;
        let array: [u8; 16] = bytes
            .try_into()
            .map_err(|_| Error::InvalidServiceId(s.to_string()))?;
        Ok(Self(array))
    }
}

impl TryFrom<String> for ServiceId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ServiceId> for String {
    fn from(value: ServiceId) -> Self {
        value.to_hex()
    }
}

/// Kinds of administered entity, keyed for per-kind audit level overrides
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Service,
    Policy,
    Folder,
    User,
    Group,
    Certificate,
    PrivateKey,
    ClusterProperty,
    AuditConfiguration,
    Other,
}

impl EntityKind {
    pub fn name(self) -> &'static str {
        match self {
            EntityKind::Service => "service",
            EntityKind::Policy => "policy",
            EntityKind::Folder => "folder",
            EntityKind::User => "user",
            EntityKind::Group => "group",
            EntityKind::Certificate => "certificate",
            EntityKind::PrivateKey => "private_key",
            EntityKind::ClusterProperty => "cluster_property",
            EntityKind::AuditConfiguration => "audit_configuration",
            EntityKind::Other => "other",
        }
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "service" => Ok(EntityKind::Service),
            "policy" => Ok(EntityKind::Policy),
            "folder" => Ok(EntityKind::Folder),
            "user" => Ok(EntityKind::User),
            "group" => Ok(EntityKind::Group),
            "certificate" => Ok(EntityKind::Certificate),
            "private_key" => Ok(EntityKind::PrivateKey),
            "cluster_property" => Ok(EntityKind::ClusterProperty),
            "audit_configuration" => Ok(EntityKind::AuditConfiguration),
            "other" => Ok(EntityKind::Other),
            other => Err(Error::InvalidEntityKind(other.to_string())),
        }
    }
}

/// Administrative action recorded by an admin audit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminAction {
    Created,
    Updated,
    Deleted,
    Login,
    Logout,
    Other,
}

impl AdminAction {
    /// Single-character code stored in `audit_admin.action`
    pub fn code(self) -> char {
        match self {
            AdminAction::Created => 'C',
            AdminAction::Updated => 'U',
            AdminAction::Deleted => 'D',
            AdminAction::Login => 'L',
            AdminAction::Logout => 'X',
            AdminAction::Other => 'O',
        }
    }

    pub fn from_code(code: char) -> Self {
        match code {
            'C' => AdminAction::Created,
            'U' => AdminAction::Updated,
            'D' => AdminAction::Deleted,
            'L' => AdminAction::Login,
            'X' => AdminAction::Logout,
            _ => AdminAction::Other,
        }
    }
}

/// Body of a message-processing audit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAudit {
    pub status: i32,
    pub request_id: Option<String>,
    pub service_id: Option<ServiceId>,
    pub operation_name: Option<String>,
    pub authenticated: bool,
    pub authentication_type: Option<i32>,
    pub request_length: i64,
    pub response_length: i64,
    pub request_body: Option<String>,
    pub response_body: Option<String>,
    pub response_status: i32,
    pub routing_latency: i64,
}

/// Body of an administrative audit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminAudit {
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub action: AdminAction,
}

/// Body of a system audit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemAudit {
    pub component: String,
    pub action: String,
    /// Raised by a client-side component (gated by the system-client threshold)
    pub client_component: bool,
    /// `false` marks the record optional, gated at WARNING
    pub always_audit: bool,
}

/// Kind-specific record body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordKind {
    Message(MessageAudit),
    Admin(AdminAudit),
    System(SystemAudit),
}

/// One audit record with its details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Option<RecordId>,
    pub level: AuditLevel,
    pub node_id: String,
    /// Service, entity or component name
    pub name: String,
    pub message: String,
    /// Event time in milliseconds since the epoch
    pub time_millis: i64,
    pub ip_address: Option<String>,
    pub user_name: Option<String>,
    pub user_id: Option<String>,
    pub signature: Option<String>,
    pub details: Vec<AuditDetail>,
    pub kind: RecordKind,
}

impl AuditRecord {
    fn with_kind(level: AuditLevel, name: &str, message: &str, kind: RecordKind) -> Self {
        Self {
            id: None,
            level,
            node_id: String::new(),
            name: name.to_string(),
            message: message.to_string(),
            time_millis: Utc::now().timestamp_millis(),
            ip_address: None,
            user_name: None,
            user_id: None,
            signature: None,
            details: Vec::new(),
            kind,
        }
    }

    /// Message-processing record for a service
    pub fn message(level: AuditLevel, service_name: &str, message: &str, body: MessageAudit) -> Self {
        Self::with_kind(level, service_name, message, RecordKind::Message(body))
    }

    /// Administrative record
    pub fn admin(
        level: AuditLevel,
        entity_kind: EntityKind,
        entity_id: &str,
        action: AdminAction,
        message: &str,
    ) -> Self {
        Self::with_kind(
            level,
            entity_kind.name(),
            message,
            RecordKind::Admin(AdminAudit {
                entity_kind,
                entity_id: entity_id.to_string(),
                action,
            }),
        )
    }

    /// System record raised by a server-side component
    pub fn system(level: AuditLevel, component: &str, action: &str, message: &str) -> Self {
        Self::with_kind(
            level,
            component,
            message,
            RecordKind::System(SystemAudit {
                component: component.to_string(),
                action: action.to_string(),
                client_component: false,
                always_audit: true,
            }),
        )
    }

    pub fn with_node(mut self, node_id: &str) -> Self {
        self.node_id = node_id.to_string();
        self
    }

    pub fn with_user(mut self, user_name: &str, user_id: &str) -> Self {
        self.user_name = Some(user_name.to_string());
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn with_ip(mut self, ip_address: &str) -> Self {
        self.ip_address = Some(ip_address.to_string());
        self
    }

    pub fn with_time(mut self, time_millis: i64) -> Self {
        self.time_millis = time_millis;
        self
    }

    /// Mark a system record as raised by a client component
    pub fn from_client_component(mut self) -> Self {
        if let RecordKind::System(ref mut system) = self.kind {
            system.client_component = true;
        }
        self
    }

    /// Mark a system record optional (gated at WARNING)
    pub fn optional(mut self) -> Self {
        if let RecordKind::System(ref mut system) = self.kind {
            system.always_audit = false;
        }
        self
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            RecordKind::Message(_) => "message",
            RecordKind::Admin(_) => "admin",
            RecordKind::System(_) => "system",
        }
    }

    /// Canonical rendering covered by the record signature
    ///
    /// Field order follows the export column order. The identifier and the
    /// signature itself are excluded: the identifier is assigned after signing.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut fields: Vec<String> = vec![
            self.node_id.clone(),
            self.time_millis.to_string(),
            self.level.value().to_string(),
            self.name.clone(),
            self.message.clone(),
            opt(&self.ip_address),
            opt(&self.user_name),
            opt(&self.user_id),
        ];

        match &self.kind {
            RecordKind::Admin(admin) => {
                fields.push(admin.entity_kind.name().to_string());
                fields.push(admin.entity_id.clone());
                fields.push(admin.action.code().to_string());
            }
            RecordKind::Message(msg) => {
                fields.push(msg.status.to_string());
                fields.push(opt(&msg.request_id));
                fields.push(msg.service_id.map(|s| s.to_hex()).unwrap_or_default());
                fields.push(opt(&msg.operation_name));
                fields.push(msg.authenticated.to_string());
                fields.push(msg.authentication_type.map(|t| t.to_string()).unwrap_or_default());
                fields.push(msg.request_length.to_string());
                fields.push(msg.response_length.to_string());
                fields.push(opt(&msg.request_body));
                fields.push(opt(&msg.response_body));
                fields.push(msg.response_status.to_string());
                fields.push(msg.routing_latency.to_string());
            }
            RecordKind::System(system) => {
                fields.push(system.component.clone());
                fields.push(system.action.clone());
            }
        }

        let mut out = fields
            .iter()
            .map(|field| escape_field(field))
            .collect::<Vec<_>>()
            .join(&FIELD_DELIM.to_string());

        out.push(FIELD_DELIM);
        out.push('[');
        let details = self
            .details
            .iter()
            .map(|detail| escape_field(&detail.signable()))
            .collect::<Vec<_>>()
            .join(",");
        out.push_str(&details);
        out.push(']');
        out.into_bytes()
    }
}

fn opt(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

/// Backslash-escape the delimiter, backslashes and anything outside printable ASCII
pub fn escape_field(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c == '\\' || c == FIELD_DELIM || !(' '..='~').contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::messages;
    use proptest::prelude::*;

    fn sample_message() -> AuditRecord {
        AuditRecord::message(
            AuditLevel::Info,
            "billing",
            "Message processed",
            MessageAudit {
                status: 0,
                service_id: Some(ServiceId::from_u128(0xabc)),
                request_length: 120,
                ..Default::default()
            },
        )
        .with_node("node-1")
        .with_time(1_700_000_000_000)
    }

    #[test]
    fn test_service_id_hex_round_trip() {
        let id = ServiceId::from_u128(0x0102);
        let hex = id.to_hex();
        assert_eq!(hex.len(), 32);
        assert!(hex.ends_with("0102"));
        assert_eq!(hex.parse::<ServiceId>().unwrap(), id);
        assert!("xyz".parse::<ServiceId>().is_err());
        assert!("0102".parse::<ServiceId>().is_err());
    }

    #[test]
    fn test_escape_field() {
        assert_eq!(escape_field("a:b"), "a\\:b");
        assert_eq!(escape_field("back\\slash"), "back\\\\slash");
        assert_eq!(escape_field("line\nbreak"), "line\\\nbreak");
        assert_eq!(escape_field("plain text"), "plain text");
    }

    #[test]
    fn test_signable_bytes_stable() {
        let record = sample_message();
        assert_eq!(record.signable_bytes(), record.clone().signable_bytes());
        let text = String::from_utf8(record.signable_bytes()).unwrap();
        assert!(text.starts_with("node-1:1700000000000:800:billing:Message processed"));
        assert!(text.ends_with(":[]"));
    }

    #[test]
    fn test_signable_bytes_cover_details_and_ignore_id() {
        let mut record = sample_message();
        let before = record.signable_bytes();
        record.id = Some(42);
        assert_eq!(before, record.signable_bytes());

        record
            .details
            .push(AuditDetail::new(&messages::ARCHIVER_HALTED, vec!["reason"]));
        assert_ne!(before, record.signable_bytes());
    }

    #[test]
    fn test_system_builders() {
        let record = AuditRecord::system(AuditLevel::Info, "archiver", "usage", "check")
            .from_client_component()
            .optional();
        match record.kind {
            RecordKind::System(system) => {
                assert!(system.client_component);
                assert!(!system.always_audit);
            }
            _ => panic!("expected system record"),
        }
    }

    #[test]
    fn test_entity_kind_parse() {
        assert_eq!("policy".parse::<EntityKind>().unwrap(), EntityKind::Policy);
        assert_eq!(
            "Private_Key".parse::<EntityKind>().unwrap(),
            EntityKind::PrivateKey
        );
        assert!("spaceship".parse::<EntityKind>().is_err());
    }

    #[test]
    fn test_admin_action_codes() {
        for action in [
            AdminAction::Created,
            AdminAction::Updated,
            AdminAction::Deleted,
            AdminAction::Login,
            AdminAction::Logout,
        ] {
            assert_eq!(AdminAction::from_code(action.code()), action);
        }
    }

    proptest! {
        #[test]
        fn prop_escaped_field_has_no_bare_delimiter(raw in ".*") {
            let escaped = escape_field(&raw);
            let mut chars = escaped.chars();
            let mut restored = String::new();
            while let Some(c) = chars.next() {
                if c == '\\' {
                    let next = chars.next();
                    prop_assert!(next.is_some());
                    restored.push(next.unwrap());
                } else {
                    prop_assert!(c != FIELD_DELIM);
                    prop_assert!((' '..='~').contains(&c));
                    restored.push(c);
                }
            }
            prop_assert_eq!(restored, raw);
        }
    }
}
