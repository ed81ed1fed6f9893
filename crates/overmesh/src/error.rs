//! Error types for mesh operations

use thiserror::Error;

/// Errors that can occur in the mesh control and data planes
#[derive(Debug, Error)]
pub enum MeshError {
    /// Protocol-level error (bad header, oversized body, malformed JSON)
    #[error("Protocol error: {message}")]
    Protocol {
        /// Error message describing the protocol violation
        message: String,
    },

    /// Authentication error (unknown secret, edge identity not found)
    #[error("Authentication error: {reason}")]
    Auth {
        /// Reason for authentication failure
        reason: String,
    },

    /// Connection error (dial failure, reset, closed)
    #[error("Connection error: {source}")]
    Connection {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Registry error (duplicate session, edge not found, store lookup failure)
    #[error("Registry error: {message}")]
    Registry {
        /// Error message describing the registry issue
        message: String,
    },

    /// Routing error (unparseable CIDR, no route to destination)
    #[error("Route error: {message}")]
    Route {
        /// Error message describing the routing issue
        message: String,
    },

    /// Configuration error (invalid config, missing required field)
    #[error("Configuration error: {message}")]
    Config {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Tunnel device error (open failure, device closed)
    #[error("Tun device error: {message}")]
    Tun {
        /// Error message describing the device issue
        message: String,
    },

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,
}

impl MeshError {
    /// Create a new protocol error
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a new authentication error
    #[must_use]
    pub fn auth(reason: impl Into<String>) -> Self {
        Self::Auth {
            reason: reason.into(),
        }
    }

    /// Create a new registry error
    #[must_use]
    pub fn registry(message: impl Into<String>) -> Self {
        Self::Registry {
            message: message.into(),
        }
    }

    /// Create a new routing error
    #[must_use]
    pub fn route(message: impl Into<String>) -> Self {
        Self::Route {
            message: message.into(),
        }
    }

    /// Create a new configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new tunnel device error
    #[must_use]
    pub fn tun(message: impl Into<String>) -> Self {
        Self::Tun {
            message: message.into(),
        }
    }

    /// Create a new connection error with a message
    #[must_use]
    pub fn connection_msg(message: impl Into<String>) -> Self {
        Self::Connection {
            source: std::io::Error::other(message.into()),
        }
    }

    /// Create a timeout error
    #[must_use]
    pub const fn timeout() -> Self {
        Self::Timeout
    }
}

/// Result type alias for mesh operations
pub type Result<T> = std::result::Result<T, MeshError>;
