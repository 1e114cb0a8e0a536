//! Unified error types for the Suntrack firmware.
//!
//! One `Error` enum that every subsystem converts into keeps error handling
//! in the control loop uniform. Communication loss with the power supply is
//! deliberately *not* an `Error`: the capability contract reports it through
//! booleans and telemetry recency, and the state machine reacts on the next
//! tick.

use core::fmt;

// ---------------------------------------------------------------------------
// Top-level firmware error
// ---------------------------------------------------------------------------

/// Every fallible operation in the firmware funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A power-supply command could not be issued.
    Psu(PsuError),
    /// A configuration value or reconfiguration request is invalid.
    Config(ConfigError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Psu(e) => write!(f, "psu: {e}"),
            Self::Config(e) => write!(f, "config: {e}"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Power-supply errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsuError {
    /// No power supply has been configured; the core is in `error` state.
    NotConfigured,
    /// A setter returned failure (communication loss, device NAK).
    CommandFailed(&'static str),
}

impl fmt::Display for PsuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConfigured => write!(f, "no psu"),
            Self::CommandFailed(op) => write!(f, "{op} failed"),
        }
    }
}

impl From<PsuError> for Error {
    fn from(e: PsuError) -> Self {
        Self::Psu(e)
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Reconfiguration requests are validated *before* any teardown of the
/// previous instance — an `Err` here means nothing was replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// The named field does not exist.
    UnknownField,
    /// The field is derived/status-only and cannot be set.
    ReadOnlyField,
    /// A value failed to parse or failed range validation.
    InvalidValue(&'static str),
    /// A pin selection is unusable for its role.
    InvalidPin(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownField => write!(f, "unknown field"),
            Self::ReadOnlyField => write!(f, "field is read-only"),
            Self::InvalidValue(msg) => write!(f, "invalid value: {msg}"),
            Self::InvalidPin(msg) => write!(f, "invalid pin: {msg}"),
        }
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Firmware-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
