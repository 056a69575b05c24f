//! Audit severity levels
//!
//! Levels mirror the classic logging severities used by the gateway. They are
//! totally ordered, so threshold gates are plain `>=` comparisons.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Severity of an audit record or detail
///
/// Variants are declared in ascending order so the derived `Ord` matches the
/// numeric [`AuditLevel::value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditLevel {
    /// Threshold sentinel that admits everything
    All,
    Finest,
    Finer,
    Fine,
    Config,
    Info,
    Warning,
    Severe,
    /// Threshold sentinel that admits nothing
    Off,
}

impl AuditLevel {
    /// Numeric value as stored in the `audit_level` column
    pub fn value(self) -> i32 {
        match self {
            AuditLevel::All => i32::MIN,
            AuditLevel::Finest => 300,
            AuditLevel::Finer => 400,
            AuditLevel::Fine => 500,
            AuditLevel::Config => 700,
            AuditLevel::Info => 800,
            AuditLevel::Warning => 900,
            AuditLevel::Severe => 1000,
            AuditLevel::Off => i32::MAX,
        }
    }

    /// Map a stored numeric value back to a level
    ///
    /// Values between the named levels round down to the nearest named level.
    pub fn from_value(value: i32) -> Self {
        const ORDERED: [AuditLevel; 9] = [
            AuditLevel::Off,
            AuditLevel::Severe,
            AuditLevel::Warning,
            AuditLevel::Info,
            AuditLevel::Config,
            AuditLevel::Fine,
            AuditLevel::Finer,
            AuditLevel::Finest,
            AuditLevel::All,
        ];
        ORDERED
            .iter()
            .copied()
            .find(|level| value >= level.value())
            .unwrap_or(AuditLevel::All)
    }

    /// Upper-case name, as written in configuration files
    pub fn name(self) -> &'static str {
        match self {
            AuditLevel::All => "ALL",
            AuditLevel::Finest => "FINEST",
            AuditLevel::Finer => "FINER",
            AuditLevel::Fine => "FINE",
            AuditLevel::Config => "CONFIG",
            AuditLevel::Info => "INFO",
            AuditLevel::Warning => "WARNING",
            AuditLevel::Severe => "SEVERE",
            AuditLevel::Off => "OFF",
        }
    }
}

impl fmt::Display for AuditLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AuditLevel {
    type Err = Error;

    /// Accepts level names (case-insensitive, `WARN` as an alias) or numeric values
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if let Ok(value) = trimmed.parse::<i32>() {
            return Ok(AuditLevel::from_value(value));
        }
        match trimmed.to_ascii_uppercase().as_str() {
            "ALL" => Ok(AuditLevel::All),
            "FINEST" => Ok(AuditLevel::Finest),
            "FINER" => Ok(AuditLevel::Finer),
            "FINE" => Ok(AuditLevel::Fine),
            "CONFIG" => Ok(AuditLevel::Config),
            "INFO" => Ok(AuditLevel::Info),
            "WARNING" | "WARN" => Ok(AuditLevel::Warning),
            "SEVERE" => Ok(AuditLevel::Severe),
            "OFF" => Ok(AuditLevel::Off),
            _ => Err(Error::invalid_level(trimmed)),
        }
    }
}
