//! Record and archive signing
//!
//! `AuditSigner` wraps the HMAC-SHA256 key used to sign audit records at
//! flush time and export metadata at archive time. The key is shared behind
//! an `Arc` and never appears in `Debug` output.

use crate::error::{Error, Result};
use crate::record::AuditRecord;
use ring::hmac;
use std::sync::Arc;

/// Environment variable holding the signing secret
pub const SECRET_ENV_VAR: &str = "VIGIL_AUDIT_SECRET";

/// Algorithm label written next to detached signatures
pub const SIGNATURE_ALGORITHM: &str = "hmac-sha256";

/// Write-only wrapper for the HMAC secret key
///
/// ```
/// use vigil_core_audit::AuditSigner;
///
/// let signer = AuditSigner::from_bytes(b"test_secret_key_32_bytes_long!!!");
/// let signature = signer.sign(b"payload");
/// assert!(signer.verify(b"payload", &signature).is_ok());
/// ```
#[derive(Clone)]
pub struct AuditSigner {
    key: Arc<hmac::Key>,
}

impl AuditSigner {
    /// Load the secret from `VIGIL_AUDIT_SECRET`
    pub fn from_env() -> Result<Self> {
        let secret = std::env::var(SECRET_ENV_VAR).map_err(|_| Error::MissingSecret)?;

        if secret.is_empty() {
            return Err(Error::InvalidSecret(format!(
                "{} cannot be empty",
                SECRET_ENV_VAR
            )));
        }

        Ok(Self::from_bytes(secret.as_bytes()))
    }

    pub fn from_bytes(secret: &[u8]) -> Self {
        let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
        Self { key: Arc::new(key) }
    }

    /// Hex-encoded HMAC over `data`
    pub fn sign(&self, data: &[u8]) -> String {
        let tag = hmac::sign(&self.key, data);
        hex::encode(tag.as_ref())
    }

    /// Check a hex-encoded signature produced by [`AuditSigner::sign`]
    pub fn verify(&self, data: &[u8], signature_hex: &str) -> Result<()> {
        let tag = hex::decode(signature_hex.trim())
            .map_err(|e| Error::signature(format!("signature is not hex: {}", e)))?;
        hmac::verify(&self.key, data, &tag)
            .map_err(|_| Error::signature("signature does not match"))
    }

    /// Sign a record's canonical rendering and store the signature on it
    pub fn sign_record(&self, record: &mut AuditRecord) {
        record.signature = Some(self.sign(&record.signable_bytes()));
    }

    /// Verify a record's stored signature
    pub fn verify_record(&self, record: &AuditRecord) -> Result<()> {
        let signature = record
            .signature
            .as_deref()
            .ok_or_else(|| Error::signature("record is not signed"))?;
        self.verify(&record.signable_bytes(), signature)
    }
}

impl std::fmt::Debug for AuditSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditSigner")
            .field("key", &"<redacted>")
            .finish()
    }
}
