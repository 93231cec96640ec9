//! VRRP-specific error taxonomy.
//!
//! Mirrors the error classes in RFC 5798 implementations: configuration
//! errors are reported and the offending entity is skipped; protocol errors
//! are counted and dropped; resource errors become a FAULT transition;
//! fatal errors abort startup. See `common::Error` for the shared,
//! cross-crate error type this converts into at public boundaries.

use common::Error as CommonError;

/// Errors raised by the VRRP core.
#[derive(Debug, thiserror::Error)]
pub enum VrrpError {
    /// A named entity (instance, group member) could not be resolved.
    #[error("configuration error: {0}")]
    Config(String),

    /// A received packet failed validation (VRID, TTL, checksum, family).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// VIP install/remove or socket send failed.
    #[error("resource error: {0}")]
    Resource(String),

    /// A track probe could not be evaluated.
    #[error("track error: {0}")]
    Track(String),

    /// Unrecoverable startup failure (socket bind, pid directory, etc).
    #[error("fatal error: {0}")]
    Fatal(String),
}

impl VrrpError {
    pub fn config(msg: impl std::fmt::Display) -> Self {
        VrrpError::Config(msg.to_string())
    }

    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        VrrpError::Protocol(msg.to_string())
    }

    pub fn resource(msg: impl std::fmt::Display) -> Self {
        VrrpError::Resource(msg.to_string())
    }

    pub fn track(msg: impl std::fmt::Display) -> Self {
        VrrpError::Track(msg.to_string())
    }

    pub fn fatal(msg: impl std::fmt::Display) -> Self {
        VrrpError::Fatal(msg.to_string())
    }
}

impl From<VrrpError> for CommonError {
    fn from(err: VrrpError) -> Self {
        match err {
            VrrpError::Config(msg) => CommonError::Config(msg),
            VrrpError::Track(msg) => CommonError::Track(msg),
            other => CommonError::VRRP(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, VrrpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_into_common_error() {
        let err = VrrpError::resource("vip install failed");
        let common: CommonError = err.into();
        assert!(matches!(common, CommonError::VRRP(_)));
    }

    #[test]
    fn config_error_maps_to_config_variant() {
        let err = VrrpError::config("duplicate member name");
        let common: CommonError = err.into();
        assert!(matches!(common, CommonError::Config(_)));
    }
}
