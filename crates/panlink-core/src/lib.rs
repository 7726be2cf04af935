//! Shared types for panlink.
//!
//! - [`PannerSettings`] - the settings snapshot carried by shared-memory frames
//!   and by protocol messages
//! - [`SettingsHandle`] - lock-free cell the plugin publishes snapshots into
//! - configuration for discovery, sessions and the instance registry

pub mod config;
pub mod error;
mod settings;

pub use config::{
    DiscoveryConfig, DiscoveryMode, LinkConfig, PreReadyPolicy, ReconnectPolicy,
    RegistryConfig, SessionConfig, DEFAULT_MULTICAST_GROUP, DEFAULT_MULTICAST_PORT,
    DEFAULT_TOOLTIP_TIMEOUT_MS, MIN_SEGMENT_SIZE,
};
pub use error::{ConfigError, Result};
pub use settings::{MonitorSettings, PannerSettings, SettingsHandle};
