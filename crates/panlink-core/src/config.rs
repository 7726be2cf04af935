//! Link configuration.

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;

pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 0, 1);
pub const DEFAULT_MULTICAST_PORT: u16 = 790;
pub const DEFAULT_TOOLTIP_TIMEOUT_MS: u32 = 3000;

/// Smallest segment the shared-memory channel accepts.
pub const MIN_SEGMENT_SIZE: usize = 4096;

/// Whether discovery keeps listening after the first valid announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DiscoveryMode {
    /// Stop once a mixer has been found; reconnection is then the session
    /// client's job.
    #[default]
    SingleShot,
    /// Keep listening so a mixer that restarts on another address is picked up.
    Continuous,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub multicast_group: Ipv4Addr,
    pub port: u16,
    pub listen_address: Ipv4Addr,
    /// Interface used to join the multicast group.
    pub interface: Ipv4Addr,
    pub mode: DiscoveryMode,
    pub max_datagram_len: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            multicast_group: DEFAULT_MULTICAST_GROUP,
            port: DEFAULT_MULTICAST_PORT,
            listen_address: Ipv4Addr::UNSPECIFIED,
            interface: Ipv4Addr::UNSPECIFIED,
            mode: DiscoveryMode::SingleShot,
            max_datagram_len: 1024,
        }
    }
}

impl DiscoveryConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.multicast_group.is_multicast() {
            return Err(ConfigError::Invalid(format!(
                "{} is not a multicast address",
                self.multicast_group
            )));
        }
        if self.max_datagram_len == 0 || self.max_datagram_len > 65_507 {
            return Err(ConfigError::Invalid(format!(
                "max_datagram_len {} out of range (1-65507)",
                self.max_datagram_len
            )));
        }
        Ok(())
    }
}

/// What happens after a session is lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconnectPolicy {
    /// Go to `Disconnected` and wait for an explicit `connect`.
    Disabled,
    /// Retry on a timer, doubling the delay up to `max_ms`. The delay resets
    /// once a handshake completes.
    Backoff { initial_ms: u64, max_ms: u64 },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Backoff {
            initial_ms: 1000,
            max_ms: 8000,
        }
    }
}

/// Treatment of updates requested before the handshake has completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreReadyPolicy {
    /// Hold up to `capacity` messages and flush them right after the handshake
    /// publish. Settings updates are coalesced into that publish; when full the
    /// oldest held message is dropped.
    Queue { capacity: usize },
    /// Discard anything sent before `Ready`.
    Drop,
}

impl Default for PreReadyPolicy {
    fn default() -> Self {
        PreReadyPolicy::Queue { capacity: 64 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub reconnect: ReconnectPolicy,
    pub pre_ready: PreReadyPolicy,
    pub max_frame_len: usize,
    pub connect_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            pre_ready: PreReadyPolicy::default(),
            max_frame_len: 64 * 1024,
            connect_timeout_ms: 3000,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if let ReconnectPolicy::Backoff { initial_ms, max_ms } = self.reconnect {
            if initial_ms == 0 || max_ms < initial_ms {
                return Err(ConfigError::Invalid(format!(
                    "reconnect backoff {}ms..{}ms is not a valid range",
                    initial_ms, max_ms
                )));
            }
        }
        if let PreReadyPolicy::Queue { capacity: 0 } = self.pre_ready {
            return Err(ConfigError::Invalid(
                "pre-ready queue capacity must be non-zero".to_string(),
            ));
        }
        if self.max_frame_len < 64 {
            return Err(ConfigError::Invalid(format!(
                "max_frame_len {} too small",
                self.max_frame_len
            )));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "connect_timeout_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Which instance group a registry binding joins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// `None` groups every instance living in this host process.
    pub group: Option<String>,
    /// Directory for the registry segment; resolved like any other segment
    /// when `None`.
    pub directory: Option<PathBuf>,
}

impl RegistryConfig {
    pub fn group_key(&self) -> String {
        match &self.group {
            Some(group) => group.clone(),
            None => format!("pid{}", std::process::id()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(group) = &self.group {
            if group.is_empty()
                || !group
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                return Err(ConfigError::Invalid(format!(
                    "registry group '{}' must be non-empty [A-Za-z0-9_-]",
                    group
                )));
            }
        }
        Ok(())
    }
}

/// Everything the orchestrator needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkConfig {
    pub discovery: DiscoveryConfig,
    pub session: SessionConfig,
    pub registry: RegistryConfig,
}

impl LinkConfig {
    pub fn validate(&self) -> Result<()> {
        self.discovery.validate()?;
        self.session.validate()?;
        self.registry.validate()
    }
}
