//! `sig.xml`: export window, record bounds, digests and a detached signature
//!
//! The signature is an HMAC over the XML rendering of the metadata without
//! its `signature` element, so verification re-renders the parsed document
//! and compares.

use chrono::{DateTime, SecondsFormat};
use serde::{Deserialize, Serialize};
use vigil_core_audit::{AuditSigner, SIGNATURE_ALGORITHM};

use super::archive::{ArchiveDigests, AUDITS_FILENAME};
use super::ExportedInfo;
use crate::error::{Result, VigilError};

/// Version attribute of the metadata document
pub const METADATA_VERSION: &str = "1";

const XML_DECLARATION: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "AuditMetadata", rename_all = "camelCase")]
pub struct AuditMetadata {
    #[serde(rename = "@version", default)]
    pub version: String,
    pub export_process_starting: String,
    pub export_process_starting_millis: i64,
    pub export_process_finishing: String,
    pub export_process_finishing_millis: i64,
    #[serde(rename = "ExportedAuditData")]
    pub exported_audit_data: ExportedAuditData,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub signature: Option<MetadataSignature>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedAuditData {
    #[serde(rename = "@filename")]
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lowest_audit_record_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub earliest_audit_record_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub earliest_audit_record_date_millis: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub highest_audit_record_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_audit_record_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_audit_record_date_millis: Option<i64>,
    pub records_exported: u64,
    pub sha1_digest: String,
    pub md5_digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataSignature {
    #[serde(rename = "@algorithm")]
    pub algorithm: String,
    #[serde(rename = "$text")]
    pub value: String,
}

fn iso8601(millis: i64) -> String {
    DateTime::from_timestamp_millis(millis)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

impl AuditMetadata {
    pub fn new(info: &ExportedInfo, digests: &ArchiveDigests) -> Self {
        Self {
            version: METADATA_VERSION.to_string(),
            export_process_starting: iso8601(info.export_start_millis),
            export_process_starting_millis: info.export_start_millis,
            export_process_finishing: iso8601(info.export_end_millis),
            export_process_finishing_millis: info.export_end_millis,
            exported_audit_data: ExportedAuditData {
                filename: AUDITS_FILENAME.to_string(),
                lowest_audit_record_id: info.lowest_id,
                earliest_audit_record_date: info.earliest_time.map(iso8601),
                earliest_audit_record_date_millis: info.earliest_time,
                highest_audit_record_id: info.highest_id,
                latest_audit_record_date: info.latest_time.map(iso8601),
                latest_audit_record_date_millis: info.latest_time,
                records_exported: info.records_exported,
                sha1_digest: digests.sha1.clone(),
                md5_digest: digests.md5.clone(),
            },
            signature: None,
        }
    }

    fn unsigned_xml(&self) -> Result<String> {
        let unsigned = AuditMetadata {
            signature: None,
            ..self.clone()
        };
        quick_xml::se::to_string(&unsigned)
            .map_err(|e| VigilError::Export(format!("Failed to render audit metadata: {}", e)))
    }

    /// Attach a signature computed over the unsigned rendering
    pub fn sign(&mut self, signer: &AuditSigner) -> Result<()> {
        let xml = self.unsigned_xml()?;
        self.signature = Some(MetadataSignature {
            algorithm: SIGNATURE_ALGORITHM.to_string(),
            value: signer.sign(xml.as_bytes()),
        });
        Ok(())
    }

    /// Check the attached signature
    pub fn verify(&self, signer: &AuditSigner) -> Result<()> {
        let signature = self
            .signature
            .as_ref()
            .ok_or_else(|| VigilError::Integrity("audit metadata is not signed".to_string()))?;
        if signature.algorithm != SIGNATURE_ALGORITHM {
            return Err(VigilError::Integrity(format!(
                "unsupported metadata signature algorithm '{}'",
                signature.algorithm
            )));
        }
        let xml = self.unsigned_xml()?;
        signer
            .verify(xml.as_bytes(), &signature.value)
            .map_err(|_| VigilError::Integrity("audit metadata signature mismatch".to_string()))
    }

    pub fn to_xml(&self) -> Result<String> {
        let body = quick_xml::se::to_string(self)
            .map_err(|e| VigilError::Export(format!("Failed to render audit metadata: {}", e)))?;
        Ok(format!("{}{}\n", XML_DECLARATION, body))
    }

    pub fn from_xml(xml: &str) -> Result<Self> {
        quick_xml::de::from_str(xml)
            .map_err(|e| VigilError::Integrity(format!("Malformed audit metadata: {}", e)))
    }
}
