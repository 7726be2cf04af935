//! Builder for configuring and constructing a `ConnectionOrchestrator`.

use crate::{ConnectionOrchestrator, Result};
use panlink_core::{
    DiscoveryConfig, LinkConfig, PannerSettings, RegistryConfig, SessionConfig, SettingsHandle,
};
use panlink_shm::InstanceRegistry;
use std::path::PathBuf;

/// Joining the instance registry happens in [`build`](Self::build); a
/// corrupted registry fails the build. A discovery socket that can't be bound
/// only disables discovery.
///
/// # Example
///
/// ```ignore
/// use panlink::prelude::*;
///
/// let link = ConnectionOrchestrator::builder()
///     .registry_group("my-host")
///     .build()?;
///
/// link.update_track_info("Drums", "#ff0000");
/// for update in link.updates().try_iter() {
///     // apply mixer-side changes
/// }
/// ```
pub struct ConnectionOrchestratorBuilder {
    config: LinkConfig,
    settings: Option<SettingsHandle>,
    discovery: bool,
}

impl Default for ConnectionOrchestratorBuilder {
    fn default() -> Self {
        Self {
            config: LinkConfig::default(),
            settings: None,
            discovery: true,
        }
    }
}

impl ConnectionOrchestratorBuilder {
    pub fn config(mut self, config: LinkConfig) -> Self {
        self.config = config;
        self
    }

    pub fn discovery_config(mut self, config: DiscoveryConfig) -> Self {
        self.config.discovery = config;
        self
    }

    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.config.session = config;
        self
    }

    pub fn registry_config(mut self, config: RegistryConfig) -> Self {
        self.config.registry = config;
        self
    }

    /// Default: one group per host process
    pub fn registry_group(mut self, group: impl Into<String>) -> Self {
        self.config.registry.group = Some(group.into());
        self
    }

    pub fn registry_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.registry.directory = Some(dir.into());
        self
    }

    /// Share a settings cell the plugin already publishes into.
    pub fn settings(mut self, settings: SettingsHandle) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn initial_settings(mut self, settings: PannerSettings) -> Self {
        self.settings = Some(SettingsHandle::new(settings));
        self
    }

    /// Default: true. With discovery off, sessions start only through
    /// [`ConnectionOrchestrator::connect_to`].
    pub fn discovery(mut self, enabled: bool) -> Self {
        self.discovery = enabled;
        self
    }

    pub fn build(self) -> Result<ConnectionOrchestrator> {
        self.config.validate()?;

        let registry = InstanceRegistry::new(&self.config.registry)?;
        let settings = self
            .settings
            .unwrap_or_else(|| SettingsHandle::new(PannerSettings::default()));
        let discovery = self.discovery.then_some(self.config.discovery);

        ConnectionOrchestrator::start(registry, settings, self.config.session, discovery)
    }
}
