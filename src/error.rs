//! Error types for the instrument bus.
//!
//! `BusError` is the single error type used by every internal layer: transports,
//! framing policies, the registry and the session engine. Sessions never return it across
//! their command boundary. They convert it into a boolean or sentinel result, suspend the
//! device when appropriate, and keep the last error around for diagnostics
//! (see [`AsyncSession::last_error`](crate::session::AsyncSession::last_error)).
//!
//! ## Failure classes
//!
//! - **Transient** (`Io`, `Timeout`, `ShortWrite`, `TransportNotReady`): retried, then the
//!   session suspends for the default delay.
//! - **Protocol** (`ChecksumMismatch`, `MissingTerminator`, `MalformedResponse`,
//!   `AddressNotAcknowledged`): handled like transient failures.
//! - **Permanent** (`InvalidAddress`, `AddressInUse`, `UnrecognizedIdentity`):
//!   initialisation suspends for the long delay. See
//!   [`BusError::is_permanent`].
//! - **Local** (`InvalidCommand`, `Conversion`, `OutOfRange`): never touch the transport and
//!   never suspend.
//! - **Device refusals** (`DeviceError`): the device answered with an error code. Not
//!   retried and not suspended.

use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias for results using the bus error type.
pub type BusResult<T> = std::result::Result<T, BusError>;

#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum BusError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No complete response within {0:?}")]
    Timeout(Duration),

    #[error("Short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("Response is missing its terminator: {0:?}")]
    MissingTerminator(String),

    #[error("Checksum mismatch: computed {expected}, received {found}")]
    ChecksumMismatch { expected: String, found: String },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Device reported an error: {0}")]
    DeviceError(String),

    #[error("Address select for {address} not acknowledged (reply {reply:?})")]
    AddressNotAcknowledged { address: u16, reply: String },

    #[error("Address {address} on {endpoint} is already claimed by another session")]
    AddressInUse { endpoint: String, address: u16 },

    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: u16, reason: String },

    #[error("Transport {0} is not ready")]
    TransportNotReady(String),

    #[error("Unrecognised identity {0:?}")]
    UnrecognizedIdentity(String),

    #[error("Invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    #[error("Session is not ready")]
    NotReady,

    #[error("Session is closed")]
    Closed,

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Value conversion failed: {0}")]
    Conversion(String),

    #[error("Value {value} exceeds device limit {limit}")]
    OutOfRange { value: f64, limit: f64 },

    #[error("Exchange panicked: {0}")]
    Panicked(String),

    #[error("Serial support not enabled. Rebuild with --features serial")]
    SerialFeatureDisabled,

    #[error("Logging initialisation failed: {0}")]
    Logging(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl BusError {
    /// Failures that re-initialising will not fix on its own.
    ///
    /// These put the session into the long suspend window instead of the default one.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            BusError::InvalidAddress { .. }
                | BusError::AddressInUse { .. }
                | BusError::UnrecognizedIdentity(_)
        )
    }

    /// Failures detected before any byte reaches the transport.
    ///
    /// They are reported to the caller but never suspend the session.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            BusError::InvalidCommand(_) | BusError::Conversion(_) | BusError::OutOfRange { .. }
        )
    }

    /// Whether another attempt at the same exchange could succeed.
    ///
    /// A device error reply means the link works and the device refused the command.
    pub fn is_retryable(&self) -> bool {
        !self.is_local() && !self.is_permanent() && !matches!(self, BusError::DeviceError(_))
    }
}
