//! Custom error types for the rig.
//!
//! This module defines the primary error type, `RigError`, used across the
//! whole crate. Using the `thiserror` crate, it gives one consistent error
//! surface for everything from configuration problems to device faults
//! reported in the middle of a run.
//!
//! ## Error Hierarchy
//!
//! Device-originated errors follow the rig's fault taxonomy:
//!
//! - **`RequestFailed`**: a device explicitly rejected or failed a command
//!   (e.g. the DLS analyzer answered `N` to a setup selection).
//! - **`UnexpectedResponse`**: the device answered outside its protocol
//!   vocabulary. Usually a firmware or wiring mismatch, not a transient fault.
//! - **`ErrorOccurred`**: a device-side alarm that must be acknowledged by an
//!   operator before anything is retried (the DLS host PC answering `E`).
//! - **`Timeout`**: no answer inside the adapter's window.
//! - **`DeviceNotFound`**: a device or pump id that is not configured.
//! - **`DeviceUnavailable`**: a configured device that failed to initialize;
//!   the manager refuses to command it for the rest of the run.
//!
//! None of these are recovered locally. They propagate out of the stage
//! action and out of `Sequencer::auto_run`, ending the run.
//!
//! The remaining variants cover configuration, stage tables, I/O and
//! serialization. By using `#[from]`, `RigError` can be created from the
//! underlying error types with the `?` operator.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the rig error type.
pub type AppResult<T> = std::result::Result<T, RigError>;

/// Primary error type for the rig.
#[derive(Error, Debug)]
pub enum RigError {
    /// The device refused or failed the command.
    #[error("{device} request failed: {message}")]
    RequestFailed {
        /// Device that reported the failure
        device: String,
        /// Device-provided or adapter-provided reason
        message: String,
    },

    /// The device replied with something outside its protocol.
    #[error("Unexpected response from {device}: {response:?}")]
    UnexpectedResponse {
        /// Device that replied
        device: String,
        /// Raw reply
        response: String,
    },

    /// Device-side fault requiring operator acknowledgment.
    #[error("{device} reported an error requiring operator attention: {message}")]
    ErrorOccurred {
        /// Device that raised the alarm
        device: String,
        /// Alarm description
        message: String,
    },

    /// No reply inside the adapter's window.
    #[error("No response from {device} within {timeout:?}")]
    Timeout {
        /// Device that stayed silent
        device: String,
        /// Window that elapsed
        timeout: Duration,
    },

    /// Requested device or pump id is not configured.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The device failed to initialize and takes no commands this run.
    #[error("Device unavailable after failed initialization: {0}")]
    DeviceUnavailable(String),

    /// The adapter has no handler for this action.
    #[error("Unsupported command '{action}' for {device}")]
    UnsupportedCommand {
        /// Device that received the command
        device: String,
        /// Action name
        action: String,
    },

    /// A command was missing a parameter or carried the wrong type.
    #[error("Invalid command parameter: {0}")]
    InvalidParameter(String),

    /// Configuration could not be parsed or extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration parsed but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File or network I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML encoding or decoding failure.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// CSV export failure.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// A sequencer was asked to run with no bottles.
    #[error("Invalid bottle capacity {0}: at least one bottle is required")]
    InvalidCapacity(usize),

    /// `fill_bottle` was called after the last configured sample.
    #[error("Sample {requested} is out of range ({available} samples configured)")]
    SampleOutOfRange {
        /// 1-based sample index that was requested
        requested: usize,
        /// Number of samples in the recipe
        available: usize,
    },

    /// Devices failed to initialize while the abort policy is active.
    #[error("Hardware initialization failed for: {}", .0.join(", "))]
    InitializationFailed(Vec<String>),

    /// Stage or transition table is malformed or unknown to the variant.
    #[error("Stage table error: {0}")]
    StageTable(String),

    /// A member of a parallel action group panicked or was cancelled.
    #[error("Parallel action did not complete: {0}")]
    Dispatch(String),

    /// One or more adapters failed to shut down.
    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<RigError>),

    /// A serial device was configured without serial support compiled in.
    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,
}

impl RigError {
    /// Whether the fault needs an operator to inspect the rig before a restart.
    pub fn requires_operator(&self) -> bool {
        matches!(
            self,
            RigError::ErrorOccurred { .. }
                | RigError::RequestFailed { .. }
                | RigError::Timeout { .. }
        )
    }

    pub(crate) fn request_failed(device: impl Into<String>, message: impl Into<String>) -> Self {
        RigError::RequestFailed {
            device: device.into(),
            message: message.into(),
        }
    }

    pub(crate) fn unexpected(device: impl Into<String>, response: impl Into<String>) -> Self {
        RigError::UnexpectedResponse {
            device: device.into(),
            response: response.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RigError::request_failed("DLS", "Measurement Setup Selection Failed");
        assert_eq!(
            err.to_string(),
            "DLS request failed: Measurement Setup Selection Failed"
        );
    }

    #[test]
    fn test_initialization_failed_lists_devices() {
        let err = RigError::InitializationFailed(vec!["Arduino".into(), "Pumps/pump2".into()]);
        assert_eq!(
            err.to_string(),
            "Hardware initialization failed for: Arduino, Pumps/pump2"
        );
    }

    #[test]
    fn test_operator_faults() {
        assert!(RigError::ErrorOccurred {
            device: "DLS".into(),
            message: "host alarm".into()
        }
        .requires_operator());
        assert!(RigError::Timeout {
            device: "Arduino".into(),
            timeout: Duration::from_secs(30)
        }
        .requires_operator());
        assert!(!RigError::DeviceNotFound("Gantry".into()).requires_operator());
        assert!(!RigError::DeviceUnavailable("DLS".into()).requires_operator());
    }

    #[test]
    fn test_shutdown_failed_error() {
        let err = RigError::ShutdownFailed(vec![
            RigError::DeviceNotFound("UV_Vis".into()),
            RigError::unexpected("Arduino", "???"),
        ]);
        assert!(err.to_string().contains("Shutdown failed"));
    }
}
