//! Error types for discovery and the mixer session

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Connection to {addr} failed: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, NetError>;

/// Why a discovery datagram was not an announcement.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("Malformed announcement: {0}")]
    Malformed(String),
}
