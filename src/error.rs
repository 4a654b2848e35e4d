//! Error handling for the mapping engine
//!
//! Two strata of failure exist in this crate. Programmer errors (an illegal
//! mapping configuration, a write of the wrong shape, an unregistered slave)
//! surface as [`ModbusMapperError`] values from the offending call.
//! Operational failures (a transport read or write that did not go through)
//! are recoverable and surface as `false` / `Ok(false)` results so the
//! polling engine can retry on the next cycle.

use thiserror::Error;

use crate::transport::TransportError;

/// Convenience result alias used throughout the crate
pub type Result<T> = std::result::Result<T, ModbusMapperError>;

/// Error type for all mapping-engine operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModbusMapperError {
    /// An illegal mapping or group configuration
    ///
    /// Raised at construction time when a mapping violates the legal
    /// combination table (register kind vs output type vs operation) or one
    /// of the flag invariants (read-restricted, repeated-write and default
    /// values require a writable register kind).
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// An API call that violates a precondition
    ///
    /// Raised by write operations handed the wrong value shape for their
    /// mapping, by codec calls with the wrong word count, and by writes
    /// addressed to a slave no registered device owns.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A transport-level failure carried across an API boundary
    ///
    /// Most transport failures stay inside the engine as recoverable
    /// `false` results; this variant exists for surfaces that need to hand
    /// the underlying cause to the caller.
    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<TransportError> for ModbusMapperError {
    fn from(err: TransportError) -> Self {
        ModbusMapperError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_converts() {
        let err: ModbusMapperError =
            TransportError::RequestFailed("boom".to_string()).into();
        assert!(matches!(err, ModbusMapperError::Transport(_)));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn error_messages_name_the_stratum() {
        let config = ModbusMapperError::InvalidConfiguration("bad".into());
        assert!(config.to_string().starts_with("Invalid configuration"));
        let arg = ModbusMapperError::InvalidArgument("bad".into());
        assert!(arg.to_string().starts_with("Invalid argument"));
    }
}
