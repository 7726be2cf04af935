//! # PanLink - cross-process coordination for panner plugins
//!
//! Connects every instance of a spatial panner plugin running inside a host
//! with its siblings and with an external mixer.
//!
//! ## Architecture
//!
//! PanLink is an umbrella crate that coordinates:
//! - **panlink-core** - Settings snapshot, lock-free settings cell, configuration
//! - **panlink-shm** - Shared-memory channel (latest audio frame + settings) and
//!   the per-group instance registry
//! - **panlink-net** - Multicast mixer discovery, wire protocol, TCP session client
//!
//! [`ConnectionOrchestrator`] ties them together for one plugin instance: it
//! joins the registry, listens for mixer announcements, and runs the session
//! with whichever mixer was announced last.
//!
//! ## Quick Start
//!
//! ```ignore
//! use panlink::prelude::*;
//!
//! let link = ConnectionOrchestrator::builder()
//!     .initial_settings(PannerSettings::default())
//!     .build()?;
//!
//! // Publish from the plugin
//! link.update_instance_info(settings);
//! link.update_track_info("Vocals", "#3366ff");
//!
//! // Apply what the mixer pushed
//! for update in link.updates().try_iter() {
//!     match update {
//!         MixerUpdate::Settings { settings, .. } => { /* ... */ }
//!         MixerUpdate::Monitor(monitor) => { /* ... */ }
//!         MixerUpdate::TrackName { .. } | MixerUpdate::Tooltip { .. } => {}
//!     }
//! }
//! ```
//!
//! The audio thread talks to the helper process separately, through a
//! [`SharedMemoryChannel`]:
//!
//! ```ignore
//! let channel = SharedMemoryChannel::open("panner-1", 1 << 20, true, true)?;
//! channel.write_audio_buffer_with_settings(&[&left, &right], &settings, ts, playhead, playing)?;
//! ```

/// Re-export of panlink-core for direct access
pub use panlink_core as core;

/// Re-export of panlink-shm for direct access
pub use panlink_shm as shm;

/// Re-export of panlink-net for direct access
pub use panlink_net as net;

pub use panlink_core::{
    DiscoveryConfig, DiscoveryMode, LinkConfig, MonitorSettings, PannerSettings, PreReadyPolicy,
    ReconnectPolicy, RegistryConfig, SessionConfig, SettingsHandle,
};
pub use panlink_net::{MixerEndpoint, MixerUpdate, ProtocolMessage, SessionState};
pub use panlink_shm::{AudioBufferHeader, ChannelStats, InstanceRegistry, SharedMemoryChannel};

mod builder;
mod error;
mod orchestrator;

pub use builder::ConnectionOrchestratorBuilder;
pub use error::{Error, Result};
pub use orchestrator::ConnectionOrchestrator;

/// Convenience prelude for common imports
pub mod prelude {
    pub use crate::{ConnectionOrchestrator, ConnectionOrchestratorBuilder};

    pub use crate::core::{PannerSettings, SettingsHandle};

    pub use crate::net::{MixerEndpoint, MixerUpdate, SessionState};

    pub use crate::shm::SharedMemoryChannel;
}
