//! Structured error types for trawl.
//!
//! `ScanError` is what the controller and the bus hand back to callers.
//! `ModuleError` is what a module returns from `setup()` when its
//! configuration cannot work.
//!
//! # The Error Boundary Rule
//!
//! Modules use `anyhow` internally (ergonomic for probes). Anything that
//! escapes a module's `handle_event` or `start` is converted into
//! [`ScanError::ModuleFailed`] at the bus boundary, so callers can pattern
//! match without downcasting.
//!
//! # Example
//!
//! ```ignore
//! use trawl::{ScanController, ScanError};
//!
//! match controller.start_scan(request).await {
//!     Ok(handle) => println!("scan {} started", handle.id()),
//!     Err(ScanError::ScanAlreadyRunning { active }) => {
//!         eprintln!("scan {} is still running", active);
//!     }
//!     Err(e) => eprintln!("scan refused: {}", e),
//! }
//! ```

use std::time::Duration;

use thiserror::Error;

use crate::scan::{ScanId, ScanStatus};
use crate::store::StoreError;
use crate::target::TargetKind;

// =============================================================================
// Scan Error
// =============================================================================

/// Structured error type for scan operations.
#[derive(Debug, Error)]
pub enum ScanError {
    /// Another scan occupies the single-flight slot.
    #[error("scan {active} is already active")]
    ScanAlreadyRunning {
        /// The scan currently holding the slot.
        active: ScanId,
    },

    /// The scan id does not refer to the active scan.
    #[error("scan {scan_id} is not active")]
    ScanNotActive {
        /// The id that was asked for.
        scan_id: ScanId,
    },

    /// A module name was requested that the registry does not know.
    #[error("unknown module {name}")]
    UnknownModule {
        /// The requested name.
        name: String,
    },

    /// Module selection came out empty.
    #[error("no modules selected for scan")]
    NoModulesSelected,

    /// The seed target could not be parsed.
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// Global or per-scan configuration is unusable.
    #[error("configuration error: {0}")]
    Config(String),

    /// A module rejected its configuration in `setup()`.
    #[error("module {module} failed setup: {source}")]
    ModuleSetup {
        /// Module name.
        module: String,
        /// What the module reported.
        #[source]
        source: ModuleError,
    },

    /// A module returned an error or panicked while handling an event or starting.
    #[error("module {module} failed: {message}")]
    ModuleFailed {
        /// Module name.
        module: String,
        /// Rendered error chain or panic message.
        message: String,
    },

    /// A module call exceeded the configured handler timeout.
    #[error("module {module} timed out after {duration:?}")]
    ModuleTimeout {
        /// Module name.
        module: String,
        /// The timeout that elapsed.
        duration: Duration,
    },

    /// The persistence collaborator failed. Always fatal.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A status change that the scan state machine does not allow.
    #[error("illegal scan status transition {from} -> {to}")]
    IllegalTransition {
        /// Current status.
        from: ScanStatus,
        /// Requested status.
        to: ScanStatus,
    },
}

impl ScanError {
    /// Returns true for errors raised by a module rather than by the core.
    pub fn is_module_error(&self) -> bool {
        matches!(
            self,
            ScanError::ModuleSetup { .. }
                | ScanError::ModuleFailed { .. }
                | ScanError::ModuleTimeout { .. }
        )
    }

    /// The module responsible for this error, if any.
    pub fn module(&self) -> Option<&str> {
        match self {
            ScanError::ModuleSetup { module, .. }
            | ScanError::ModuleFailed { module, .. }
            | ScanError::ModuleTimeout { module, .. } => Some(module),
            _ => None,
        }
    }
}

// =============================================================================
// Module Error
// =============================================================================

/// Fatal configuration errors raised by a module's `setup()`.
#[derive(Debug, Error)]
pub enum ModuleError {
    /// A required option has no value.
    #[error("missing required option {0}")]
    MissingOption(String),

    /// An option has a value the module cannot use.
    #[error("invalid option {name}: {reason}")]
    InvalidOption {
        /// Option key.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The module cannot operate on this kind of target.
    #[error("unsupported target type {0}")]
    UnsupportedTarget(TargetKind),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_running_display() {
        let active = ScanId::new();
        let err = ScanError::ScanAlreadyRunning { active };
        assert!(err.to_string().contains("already active"));
        assert!(err.to_string().contains(&active.to_string()));
    }

    #[test]
    fn test_module_setup_display_includes_source() {
        let err = ScanError::ModuleSetup {
            module: "sfp_dns".into(),
            source: ModuleError::MissingOption("api_key".into()),
        };
        let display = err.to_string();
        assert!(display.contains("sfp_dns"));
        assert!(display.contains("api_key"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_timeout_display() {
        let err = ScanError::ModuleTimeout {
            module: "slow".into(),
            duration: Duration::from_secs(30),
        };
        assert!(err.to_string().contains("timed out"));
        assert!(err.to_string().contains("30"));
    }

    #[test]
    fn test_module_errors_are_classified() {
        let failed = ScanError::ModuleFailed {
            module: "whois".into(),
            message: "boom".into(),
        };
        assert!(failed.is_module_error());
        assert_eq!(failed.module(), Some("whois"));

        let busy = ScanError::ScanAlreadyRunning {
            active: ScanId::new(),
        };
        assert!(!busy.is_module_error());
        assert_eq!(busy.module(), None);
    }

    #[test]
    fn test_store_error_converts() {
        let err: ScanError = StoreError::Backend(anyhow::anyhow!("disk full")).into();
        match &err {
            ScanError::Store(StoreError::Backend(inner)) => {
                assert!(inner.to_string().contains("disk full"));
            }
            _ => panic!("Expected Store error"),
        }
    }

    #[test]
    fn test_error_can_be_downcast_from_anyhow() {
        let err: anyhow::Error = ScanError::UnknownModule {
            name: "sfp_missing".into(),
        }
        .into();

        match err.downcast_ref::<ScanError>() {
            Some(ScanError::UnknownModule { name }) => assert_eq!(name, "sfp_missing"),
            _ => panic!("Expected UnknownModule"),
        }
    }
}
