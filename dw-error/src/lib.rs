//! Unified error handling for Dimmwatch
//!
//! This crate provides a single error type used across all Dimmwatch components.
//! It uses thiserror for ergonomic error definitions with proper Display and Error trait impls.

use std::io;
use std::path::PathBuf;

/// Result type alias using DimmwatchError
pub type Result<T> = std::result::Result<T, DimmwatchError>;

/// Unified error type for all Dimmwatch operations
#[derive(thiserror::Error, Debug)]
pub enum DimmwatchError {
    // ============================================================================
    // Bus Transport Errors
    // ============================================================================
    #[error("SMBus not present (base or target address is zero)")]
    BusAbsent,

    #[error("SMBus host busy before transaction (status 0x{status:02X})")]
    BusBusy { status: u8 },

    #[error("SMBus status flags did not clear (status 0x{status:02X})")]
    StaleStatus { status: u8 },

    #[error("SMBus transaction timed out after {iterations} polls")]
    TransactionTimeout { iterations: u32 },

    #[error("SMBus transaction failed (status 0x{status:02X})")]
    Protocol { status: u8 },

    // ============================================================================
    // Arbitration Errors
    // ============================================================================
    #[error("SMBus lock not acquired within {timeout_ms} ms")]
    LockTimeout { timeout_ms: u64 },

    // ============================================================================
    // Hub Protocol Errors
    // ============================================================================
    #[error("No SPD5 hub at address 0x{address:02X}")]
    DeviceAbsent { address: u8 },

    #[error("Invalid module slot {0} (must be 0-7)")]
    InvalidSlot(u8),

    #[error("Invalid EEPROM page pointer 0x{page:02X}")]
    PageInvalid { page: u8 },

    #[error("Operation not supported by device: {0}")]
    UnsupportedDevice(String),

    #[error("Register MR{register} verify failed: wrote 0x{expected:02X}, read 0x{actual:02X}")]
    VerifyFailed {
        register: u8,
        expected: u8,
        actual: u8,
    },

    // ============================================================================
    // Platform Access Errors
    // ============================================================================
    #[error("Failed to open port device {path}: {source}")]
    PortAccess {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Firmware table error: {0}")]
    FirmwareTable(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },

    // ============================================================================
    // Generic Errors
    // ============================================================================
    #[error("{0}")]
    Generic(String),
}

impl DimmwatchError {
    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid config error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a firmware table error from a string
    pub fn firmware(msg: impl Into<String>) -> Self {
        Self::FirmwareTable(msg.into())
    }

    /// Failures that the next periodic poll may not hit again
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. } | Self::BusBusy { .. } | Self::TransactionTimeout { .. }
        )
    }
}

// Allow converting from String to DimmwatchError
impl From<String> for DimmwatchError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

// Allow converting from &str to DimmwatchError
impl From<&str> for DimmwatchError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_formats_hex_status() {
        let err = DimmwatchError::Protocol { status: 0x06 };
        assert_eq!(err.to_string(), "SMBus transaction failed (status 0x06)");

        let err = DimmwatchError::DeviceAbsent { address: 0x52 };
        assert_eq!(err.to_string(), "No SPD5 hub at address 0x52");
    }

    #[test]
    fn test_is_transient() {
        assert!(DimmwatchError::LockTimeout { timeout_ms: 50 }.is_transient());
        assert!(DimmwatchError::BusBusy { status: 1 }.is_transient());
        assert!(DimmwatchError::TransactionTimeout { iterations: 1000 }.is_transient());
        assert!(!DimmwatchError::BusAbsent.is_transient());
        assert!(!DimmwatchError::PageInvalid { page: 8 }.is_transient());
    }

    #[test]
    fn test_from_str() {
        let err: DimmwatchError = "boom".into();
        assert!(matches!(err, DimmwatchError::Generic(ref s) if s == "boom"));
    }
}
