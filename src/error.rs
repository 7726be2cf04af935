//! Centralized error type for the panlink umbrella crate.
//!
//! Wraps all subsystem errors so `?` propagates naturally across crate boundaries.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] panlink_core::ConfigError),

    #[error("Shared memory: {0}")]
    Shm(#[from] panlink_shm::ShmError),

    #[error("Network: {0}")]
    Net(#[from] panlink_net::NetError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
