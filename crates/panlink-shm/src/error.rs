//! Error types for shared memory and the instance registry

use panlink_core::ConfigError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShmError {
    #[error("Shared memory '{name}' unavailable: {reason}")]
    ChannelUnavailable { name: String, reason: String },

    #[error("Shared memory channel is not open")]
    NotOpen,

    #[error("Frame of {needed} bytes exceeds ring capacity of {capacity} bytes")]
    FrameTooLarge { needed: usize, capacity: usize },

    #[error("Audio channels have differing sample counts")]
    ChannelMismatch,

    #[error("Instance registry inconsistent: {0}")]
    RegistryInconsistency(String),

    #[error("No usable shared memory directory (last tried {0})")]
    NoDirectory(PathBuf),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShmError {
    pub(crate) fn unavailable(name: &str, reason: impl std::fmt::Display) -> Self {
        ShmError::ChannelUnavailable {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ShmError>;
