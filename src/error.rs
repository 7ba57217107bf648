use std::path::PathBuf;

use thiserror::Error;

/// Errors produced while accepting, negotiating, or relaying SSH sessions.
#[derive(Error, Debug)]
pub enum BastionError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SSH protocol error
    #[error("SSH protocol error: {0}")]
    Ssh(#[from] russh::Error),

    /// Host key file could not be read
    #[error("failed to read host key {path}: {source}")]
    HostKeyRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Host key file was read but is not a usable private key
    #[error("failed to parse host key: {0}")]
    HostKeyParse(String),

    /// Listener could not be bound
    #[error("failed to bind {address}: {source}")]
    BindFailed {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The listening socket failed while accepting
    #[error("listener failed: {0}")]
    Accept(#[source] std::io::Error),

    /// Inbound SSH handshake or session failure
    #[error("inbound handshake failed: {0}")]
    Handshake(#[source] russh::Error),

    /// Client asked for a channel type other than "session"
    #[error("unknown channel type: {0}")]
    UnknownChannelType(String),

    /// Backend could not be dialed or the handshake failed
    #[error("failed to connect to backend {address}: {source}")]
    BackendConnect {
        address: String,
        #[source]
        source: russh::Error,
    },

    /// Backend refused the configured credentials
    #[error("backend rejected credentials for user {0}")]
    BackendAuthRejected(String),

    /// The channel (or its pump task) is gone
    #[error("channel closed")]
    ChannelClosed,

    /// Request type cannot be originated towards this peer
    #[error("{0} requests cannot be sent to this peer")]
    UnsupportedRequest(&'static str),

    /// Address string could not be parsed
    #[error("invalid address {address}: {message}")]
    InvalidAddress { address: String, message: String },

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Internal task failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl BastionError {
    pub fn invalid_address(address: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address: address.into(),
            message: message.into(),
        }
    }

    pub fn backend_connect(address: impl Into<String>, source: russh::Error) -> Self {
        Self::BackendConnect {
            address: address.into(),
            source,
        }
    }
}

/// Result type alias for bastion operations
pub type BastionResult<T> = Result<T, BastionError>;
