//! Channel protocol versioning
//!
//! Exchanged in the transport hello so mismatched peers fail the
//! handshake instead of misreading frames.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Current channel protocol version
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
}

impl ProtocolVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Peers interoperate when their major versions agree
    pub fn check_compatible(&self, remote: &ProtocolVersion) -> Result<()> {
        if self.major == remote.major {
            Ok(())
        } else {
            Err(Error::transport(format!(
                "protocol version mismatch: local {}, remote {}",
                self, remote
            )))
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minor_difference_is_compatible() {
        assert!(PROTOCOL_VERSION
            .check_compatible(&ProtocolVersion::new(1, 7))
            .is_ok());
    }

    #[test]
    fn test_major_difference_is_rejected() {
        let err = PROTOCOL_VERSION
            .check_compatible(&ProtocolVersion::new(2, 0))
            .unwrap_err();
        assert!(err.to_string().contains("mismatch"));
    }
}
