//! Plugin-facing facade over the registry, discovery and the mixer session.

use crate::{ConnectionOrchestratorBuilder, Result};
use crossbeam_channel::{Receiver, Sender};
use panlink_core::{DiscoveryConfig, LinkConfig, PannerSettings, SessionConfig, SettingsHandle};
use panlink_net::{DiscoveryListener, MixerEndpoint, MixerUpdate, SessionClient, SessionState};
use panlink_shm::InstanceRegistry;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

/// The one active session, shared with the discovery thread's callback.
struct SessionSlot {
    client: Mutex<Option<SessionClient>>,
    config: SessionConfig,
    settings: SettingsHandle,
    updates: Sender<MixerUpdate>,
    registry: Arc<InstanceRegistry>,
    /// Last track name, handed to clients spawned later.
    track_name: Mutex<String>,
}

impl SessionSlot {
    /// Point the session at `endpoint`, spawning the client on first use.
    fn connect(&self, endpoint: MixerEndpoint) {
        let mut slot = self.client.lock();
        let session_id = self.registry.session_id();
        let index = self.registry.instantiation_index();

        if let Some(client) = slot.as_ref() {
            client.set_identity(session_id, index);
            client.connect(endpoint);
            return;
        }

        match SessionClient::spawn(
            self.config.clone(),
            self.settings.clone(),
            self.updates.clone(),
        ) {
            Ok(client) => {
                client.set_identity(session_id, index);
                client.set_track_name(self.track_name.lock().clone());
                client.connect(endpoint);
                *slot = Some(client);
            }
            Err(e) => error!("Could not start mixer session: {}", e),
        }
    }

    fn with_client(&self, f: impl FnOnce(&SessionClient)) {
        if let Some(client) = self.client.lock().as_ref() {
            f(client);
        }
    }

    fn stop(&self) {
        let client = self.client.lock().take();
        if let Some(mut client) = client {
            client.stop();
        }
    }
}

/// Binds one plugin instance to its instance group and, once a mixer has
/// been announced, to a session with that mixer.
///
/// Update methods are fire-and-forget and do nothing until a session exists.
pub struct ConnectionOrchestrator {
    registry: Arc<InstanceRegistry>,
    settings: SettingsHandle,
    session: Arc<SessionSlot>,
    discovery: Option<Arc<DiscoveryListener>>,
    discovery_thread: Option<thread::JoinHandle<()>>,
    updates: Receiver<MixerUpdate>,
}

impl ConnectionOrchestrator {
    pub fn builder() -> ConnectionOrchestratorBuilder {
        ConnectionOrchestratorBuilder::default()
    }

    /// Join the registry and start discovery with `config`.
    pub fn new(config: LinkConfig, settings: SettingsHandle) -> Result<Self> {
        Self::builder().config(config).settings(settings).build()
    }

    pub(crate) fn start(
        registry: InstanceRegistry,
        settings: SettingsHandle,
        session_config: SessionConfig,
        discovery_config: Option<DiscoveryConfig>,
    ) -> Result<Self> {
        let registry = Arc::new(registry);
        let (updates_tx, updates) = crossbeam_channel::unbounded();
        let session = Arc::new(SessionSlot {
            client: Mutex::new(None),
            config: session_config,
            settings: settings.clone(),
            updates: updates_tx,
            registry: Arc::clone(&registry),
            track_name: Mutex::new(String::new()),
        });

        let mut orchestrator = Self {
            registry,
            settings,
            session,
            discovery: None,
            discovery_thread: None,
            updates,
        };

        if let Some(config) = discovery_config {
            orchestrator.start_discovery(&config)?;
        }

        info!(
            "Instance {} of group '{}' ready",
            orchestrator.registry.instantiation_index(),
            orchestrator.registry.group()
        );
        Ok(orchestrator)
    }

    /// A socket that can't be bound only disables discovery; thread spawn
    /// failures are returned.
    fn start_discovery(&mut self, config: &DiscoveryConfig) -> Result<()> {
        let slot = Arc::clone(&self.session);
        let listener = match DiscoveryListener::new(
            config,
            Arc::new(move |endpoint| slot.connect(endpoint)),
        ) {
            Ok(listener) => Arc::new(listener),
            Err(e) => {
                warn!("Mixer discovery unavailable: {}", e);
                return Ok(());
            }
        };

        let thread = {
            let listener = Arc::clone(&listener);
            thread::Builder::new()
                .name("panlink-discovery".to_string())
                .spawn(move || {
                    if let Err(e) = listener.start_listening() {
                        error!("Mixer discovery stopped: {}", e);
                    }
                })?
        };

        self.discovery = Some(listener);
        self.discovery_thread = Some(thread);
        Ok(())
    }

    /// Whether a valid mixer announcement has ever been received.
    pub fn is_external_mixer_available(&self) -> bool {
        self.discovery
            .as_ref()
            .is_some_and(|listener| listener.has_announcement())
    }

    /// Raw text of the last valid mixer announcement.
    pub fn last_announcement(&self) -> Option<String> {
        self.discovery.as_ref().and_then(|l| l.last_message())
    }

    /// Connect to a known mixer without waiting for discovery.
    pub fn connect_to(&self, endpoint: MixerEndpoint) {
        self.session.connect(endpoint);
    }

    /// Stop the current session. Discovery keeps running, and a later
    /// announcement or [`connect_to`](Self::connect_to) starts a new one.
    pub fn disconnect(&self) {
        self.session.stop();
    }

    pub fn session_state(&self) -> SessionState {
        self.session
            .client
            .lock()
            .as_ref()
            .map_or(SessionState::Disconnected, |c| c.state())
    }

    /// Publish the track name and color. The name is remembered and carried
    /// by every later settings publish, including the handshake one.
    pub fn update_track_info(&self, track_name: &str, color: &str) {
        *self.session.track_name.lock() = track_name.to_string();
        self.session
            .with_client(|c| c.update_track_info(track_name, color));
    }

    /// Store `settings` as the current snapshot and publish them.
    pub fn update_instance_info(&self, settings: PannerSettings) {
        self.settings.store(settings);
        self.session.with_client(|c| c.update_instance(settings));
    }

    pub fn update_tooltip(&self, message: &str, timeout_ms: u32) {
        self.session
            .with_client(|c| c.update_tooltip(message, timeout_ms));
    }

    /// Record the session id assigned by the mixer for the whole group.
    ///
    /// Only the first id in a group sticks; returns whether this one did.
    pub fn set_session_identifier(&self, id: &str) -> Result<bool> {
        let stored = self.registry.set_instance_identifier(id)?;
        if stored {
            let session_id = self.registry.session_id();
            let index = self.registry.instantiation_index();
            self.session
                .with_client(|c| c.set_identity(session_id, index));
        } else {
            debug!("Session id already set for group '{}'", self.registry.group());
        }
        Ok(stored)
    }

    pub fn session_identifier(&self) -> String {
        self.registry.session_id()
    }

    pub fn instance_index(&self) -> u32 {
        self.registry.instantiation_index()
    }

    pub fn live_instances(&self) -> u32 {
        self.registry.live_instances()
    }

    /// Settings, track names, tooltips and monitor settings pushed by the mixer.
    pub fn updates(&self) -> Receiver<MixerUpdate> {
        self.updates.clone()
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }
}

impl Drop for ConnectionOrchestrator {
    fn drop(&mut self) {
        if let Some(listener) = self.discovery.take() {
            listener.stop_listening();
        }
        if let Some(handle) = self.discovery_thread.take() {
            if handle.join().is_err() {
                error!("Discovery thread panicked");
            }
        }
        self.session.stop();
    }
}

impl std::fmt::Debug for ConnectionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionOrchestrator")
            .field("registry", &self.registry)
            .field("session", &self.session_state())
            .field("discovery", &self.discovery.is_some())
            .finish()
    }
}
