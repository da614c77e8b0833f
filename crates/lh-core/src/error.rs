//! Custom error types for the liquid-handler stack.
//!
//! This module defines the primary error type, `LiquidHandlerError`, shared by the
//! transport channel, the device driver and the pipetting engine. Using the
//! `thiserror` crate, it provides a centralized way to report everything from a
//! silent device on the bus to a droplet that will not fit in the syringe.
//!
//! ## Error Hierarchy
//!
//! - **`Connection`**: The GSIOC exchange failed. The device did not answer its
//!   address, returned nothing for a query, or echoed an unexpected byte.
//! - **`Timeout`**: An exchange did not complete within its time budget.
//! - **`InvalidParameter`**: A value was rejected before anything was written to the
//!   bus (unknown valve, zero volume, out-of-range device id, ...).
//! - **`CapacityExceeded`**: A compound pipetting request cannot fit in the syringe.
//! - **`PlaceableExhausted`** / **`NoDeckLoaded`** / **`UnknownLocation`**: Position
//!   resolution failed.
//! - **`MotorWaitTimeout`**: A device stayed busy past the motor-wait budget and the
//!   configured policy is to fail.
//! - **`OperatorAborted`**: The operator declined a confirmation prompt.
//! - **`Io`** / **`Json`**: Wrapped I/O and serialization failures.
//!
//! With `#[from]`, lower-level errors convert into `LiquidHandlerError` with `?`.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the liquid-handler error type.
pub type LhResult<T> = std::result::Result<T, LiquidHandlerError>;

/// Primary error type for the liquid-handler stack.
///
/// # Error Categories
///
/// 1. **Bus Errors** - `Connection`, `Timeout`
///    - The command may or may not have reached the device
///    - Recovery: home the arm and re-establish position
///
/// 2. **Validation Errors** - `InvalidParameter`, `CapacityExceeded`
///    - Raised before any byte is written
///    - Recovery: fix the request
///
/// 3. **Runtime Errors** - `PlaceableExhausted`, `MotorWaitTimeout`, `OperatorAborted`
///    - Raised mid-sequence; earlier operations already ran
///
/// # Example
///
/// ```rust,ignore
/// use lh_core::error::{LhResult, LiquidHandlerError};
///
/// fn check_volume(volume_ul: f64) -> LhResult<()> {
///     if volume_ul.abs() < 0.001 {
///         return Err(LiquidHandlerError::InvalidParameter(
///             "volume must be non-zero".into(),
///         ));
///     }
///     Ok(())
/// }
/// ```
#[derive(Error, Debug)]
pub enum LiquidHandlerError {
    /// The device did not respond, or responded with something unexpected.
    #[error("Connection error: {0}")]
    Connection(String),

    /// An exchange exceeded its time budget. A protocol failure like
    /// [`Connection`](Self::Connection); see [`is_protocol`](LiquidHandlerError::is_protocol).
    #[error("Timed out: {0}")]
    Timeout(String),

    /// A parameter was rejected before any communication took place.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// The requested volumes do not fit in the syringe.
    #[error("Requested volume {required_ul} uL exceeds syringe capacity {capacity_ul} uL")]
    CapacityExceeded {
        /// Total volume the request needs.
        required_ul: f64,
        /// Capacity of the installed syringe.
        capacity_ul: f64,
    },

    /// A shifting placeable was dereferenced past its last (or before its first) entry.
    #[error("Shifting placeable is exhausted")]
    PlaceableExhausted,

    /// A named position was used but no deck layout is loaded.
    #[error("No deck layout loaded; cannot resolve named position")]
    NoDeckLoaded,

    /// The deck layout has no entry for the named position.
    #[error("Unknown deck location {rack}:{vial}")]
    UnknownLocation {
        /// Rack identifier.
        rack: String,
        /// Vial identifier within the rack.
        vial: String,
    },

    /// A device remained busy past the motor-wait budget.
    #[error("Device {device} still busy after {waited:?}")]
    MotorWaitTimeout {
        /// GSIOC id of the device that stayed busy.
        device: u8,
        /// How long the driver polled.
        waited: Duration,
    },

    /// The operator declined a confirmation prompt.
    #[error("Operator aborted: {0}")]
    OperatorAborted(String),

    /// I/O failure (serial port, resource file).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LiquidHandlerError {
    /// Shorthand for a [`LiquidHandlerError::Connection`].
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Shorthand for a [`LiquidHandlerError::InvalidParameter`].
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidParameter(message.into())
    }

    /// Whether the bus exchange itself failed: no answer, a wrong echo, or a
    /// blown time budget.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }

    /// Whether the error was raised before any byte reached the bus.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidParameter(_) | Self::CapacityExceeded { .. }
        )
    }
}
