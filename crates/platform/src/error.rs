//! Error types for Skiff

use std::fmt;

/// Classifies a fatal connection error by the phase that produced it.
///
/// Carried by [`SkiffError::Disconnect`] so applications can distinguish a
/// failed handshake from a violation on an established connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectLevel {
    /// The connection never reached the encrypted/authenticated state.
    Handshake,
    /// The established connection violated the protocol.
    Protocol,
}

impl fmt::Display for DisconnectLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectLevel::Handshake => write!(f, "handshake"),
            DisconnectLevel::Protocol => write!(f, "protocol"),
        }
    }
}

/// Unified error type for all Skiff operations
#[derive(Debug)]
pub enum SkiffError {
    /// I/O error
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Protocol error
    Protocol(String),

    /// Security error (authentication, signature verification, etc.)
    Security(String),

    /// Fatal connection error carrying the RFC 4253 disconnect reason code
    /// that was (or would have been) sent to the peer.
    Disconnect {
        /// RFC 4253 Section 11.1 reason code.
        code: u32,
        /// Which phase of the connection failed.
        level: DisconnectLevel,
        /// Human-readable description.
        message: String,
    },

    /// Not implemented
    NotImplemented(String),

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for SkiffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkiffError::Io(e) => write!(f, "IO error: {}", e),
            SkiffError::Config(msg) => write!(f, "Configuration error: {}", msg),
            SkiffError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            SkiffError::Security(msg) => write!(f, "Security error: {}", msg),
            SkiffError::Disconnect {
                code,
                level,
                message,
            } => write!(f, "Disconnect ({}, reason {}): {}", level, code, message),
            SkiffError::NotImplemented(msg) => write!(f, "Not implemented: {}", msg),
            SkiffError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for SkiffError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SkiffError::Io(e) => Some(e),
            SkiffError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SkiffError {
    fn from(err: std::io::Error) -> Self {
        SkiffError::Io(err)
    }
}

/// Result type for Skiff operations
pub type SkiffResult<T> = Result<T, SkiffError>;
