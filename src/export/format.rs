//! Field rendering for `audit.dat`
//!
//! Each column value is rendered to text and then meta-quoted: backslash,
//! the field delimiter and anything outside printable ASCII get a backslash
//! prefix. `NULL` renders as an empty field.

use std::io::Read;

use vigil_core_audit::{escape_field, MessageCatalog};

use super::SqlValue;
use crate::error::{Result, VigilError};

/// Name of the aggregated detail column
pub const DETAILS_COLUMN: &str = "audit_associated_logs";
/// Name of the authentication type column
pub const AUTHENTICATION_TYPE_COLUMN: &str = "authentication_type";
pub const TIME_COLUMN: &str = "time";

/// Prefix marking the start of one detail in the aggregated column
pub const DETAIL_ID_PREFIX: &str = "ADMID:";
/// Separator between detail ids and parameters in the aggregated column
pub const DETAIL_SEPARATOR: &str = "/-/_/-/";

/// How a column is rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRole {
    /// Record identifier (first column)
    Id,
    Time,
    AuthenticationType,
    Details,
    /// zstd-compressed text
    Compressed,
    Plain,
}

impl ColumnRole {
    pub fn classify(index: usize, name: &str) -> Self {
        if index == 0 {
            ColumnRole::Id
        } else if name.eq_ignore_ascii_case(TIME_COLUMN) {
            ColumnRole::Time
        } else if name.eq_ignore_ascii_case(AUTHENTICATION_TYPE_COLUMN) {
            ColumnRole::AuthenticationType
        } else if name.eq_ignore_ascii_case(DETAILS_COLUMN) {
            ColumnRole::Details
        } else if name.contains("_zip") {
            ColumnRole::Compressed
        } else {
            ColumnRole::Plain
        }
    }
}

/// Meta-quote one field
pub fn quote_meta(raw: &str) -> String {
    escape_field(raw)
}

fn render_detail(id: &str, params: &[&str], catalog: &MessageCatalog) -> String {
    // A lone empty parameter is what the aggregation emits for a detail without any
    let params = if params == [""] { &[][..] } else { params };
    let text = match id.parse::<i32>().ok().and_then(|n| catalog.get(n)) {
        Some(message) => message.format(params),
        None => params.join(" "),
    };
    format!("{}\\:{}", id, text)
}

/// Render a value for its column role (before meta-quoting)
pub fn render_value(role: ColumnRole, value: &SqlValue, catalog: &MessageCatalog) -> Result<String> {
    let text = match (role, value) {
        (_, SqlValue::Null) => String::new(),
        (ColumnRole::Compressed, SqlValue::Blob(data)) => decompress_text(data)?,
        (ColumnRole::AuthenticationType, SqlValue::Integer(n)) => {
            authentication_type_name(*n).to_string()
        }
        (ColumnRole::Details, SqlValue::Text(raw)) => expand_details(raw, catalog),
        (_, SqlValue::Integer(n)) => n.to_string(),
        (_, SqlValue::Real(f)) => f.to_string(),
        (_, SqlValue::Text(s)) => s.clone(),
        (_, SqlValue::Blob(data)) => hex::encode(data),
    };
    Ok(text)
}

/// Inflate a stored body
pub fn decompress_text(data: &[u8]) -> Result<String> {
    let mut decoder = zstd::stream::read::Decoder::new(data)
        .map_err(|e| VigilError::Export(format!("Failed to open compressed column: {}", e)))?;
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| VigilError::Export(format!("Failed to decompress column: {}", e)))?;
    Ok(String::from_utf8_lossy(&out).into_owned())
}

/// Compress a body for storage
pub fn compress_text(text: &str) -> Result<Vec<u8>> {
    zstd::stream::encode_all(text.as_bytes(), 3)
        .map_err(|e| VigilError::Store(format!("Failed to compress message body: {}", e)))
}

/// Names of credential types recorded on message audits
pub fn authentication_type_name(value: i64) -> &'static str {
    match value {
        1 => "HTTP Basic",
        2 => "HTTP Digest",
        3 => "HTTP Client Certificate",
        4 => "SAML Assertion",
        5 => "WS-Security UsernameToken",
        6 => "WS-Security X.509 BinarySecurityToken",
        7 => "Kerberos",
        8 => "HTTP NTLM",
        9 => "SSH Credential",
        10 => "OAuth Token",
        11 => "JSON Web Token",
        _ => "Unknown",
    }
}

/// Expand `ADMID:<id>/-/_/-/<param>...` into `[id\:text,...]`
///
/// Values that do not start with the detail prefix (including records
/// without details) render as an empty field. Ids missing from the catalog
/// keep their raw parameters, space separated.
pub fn expand_details(raw: &str, catalog: &MessageCatalog) -> String {
    if !raw.starts_with(DETAIL_ID_PREFIX) {
        return String::new();
    }

    let mut rendered: Vec<String> = Vec::new();
    let mut current: Option<&str> = None;
    let mut params: Vec<&str> = Vec::new();

    for part in raw.split(DETAIL_SEPARATOR) {
        if let Some(id) = part.strip_prefix(DETAIL_ID_PREFIX) {
            if let Some(previous) = current.replace(id) {
                rendered.push(render_detail(previous, &params, catalog));
            }
            params.clear();
        } else {
            params.push(part);
        }
    }
    if let Some(last) = current {
        rendered.push(render_detail(last, &params, catalog));
    }

    format!("[{}]", rendered.join(","))
}
