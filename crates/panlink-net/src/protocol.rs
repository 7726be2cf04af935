//! Session protocol between a plugin instance and the external mixer.

use crate::error::{NetError, Result};
use panlink_core::{MonitorSettings, PannerSettings, DEFAULT_TOOLTIP_TIMEOUT_MS};
use serde::{Deserialize, Serialize};

/// Every message either side of a session can send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProtocolMessage {
    /// First message on a new connection.
    ConnectionRequest {
        session_id: String,
        instance_index: u32,
    },
    /// Mixer's reply to `ConnectionRequest`; completes the handshake.
    Ack,
    PannerSettingsUpdate {
        settings: PannerSettings,
        /// Name the host gave this instance's track, empty if unknown.
        track_name: String,
        /// `false` for the publish that follows the handshake.
        is_update: bool,
    },
    TrackNameUpdate {
        instance_index: u32,
        track_name: String,
        color: String,
    },
    TooltipUpdate {
        message: String,
        timeout_ms: u32,
    },
    /// Mixer to plugin only.
    MonitorSettingsUpdate { monitor: MonitorSettings },
}

impl ProtocolMessage {
    pub fn tooltip(message: impl Into<String>) -> Self {
        ProtocolMessage::TooltipUpdate {
            message: message.into(),
            timeout_ms: DEFAULT_TOOLTIP_TIMEOUT_MS,
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolMessage::ConnectionRequest { .. } => "ConnectionRequest",
            ProtocolMessage::Ack => "Ack",
            ProtocolMessage::PannerSettingsUpdate { .. } => "PannerSettingsUpdate",
            ProtocolMessage::TrackNameUpdate { .. } => "TrackNameUpdate",
            ProtocolMessage::TooltipUpdate { .. } => "TooltipUpdate",
            ProtocolMessage::MonitorSettingsUpdate { .. } => "MonitorSettingsUpdate",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| NetError::MalformedMessage(e.to_string()))
    }

    /// The application-facing update carried by an inbound message, if any.
    pub fn into_update(self) -> Option<MixerUpdate> {
        match self {
            ProtocolMessage::PannerSettingsUpdate {
                settings,
                track_name,
                is_update,
            } => Some(MixerUpdate::Settings {
                settings,
                track_name,
                is_update,
            }),
            ProtocolMessage::TrackNameUpdate {
                instance_index,
                track_name,
                color,
            } => Some(MixerUpdate::TrackName {
                instance_index,
                track_name,
                color,
            }),
            ProtocolMessage::TooltipUpdate {
                message,
                timeout_ms,
            } => Some(MixerUpdate::Tooltip {
                message,
                timeout_ms,
            }),
            ProtocolMessage::MonitorSettingsUpdate { monitor } => Some(MixerUpdate::Monitor(monitor)),
            ProtocolMessage::ConnectionRequest { .. } | ProtocolMessage::Ack => None,
        }
    }
}

/// Something the mixer pushed that the plugin should apply to its own state.
#[derive(Debug, Clone, PartialEq)]
pub enum MixerUpdate {
    Settings {
        settings: PannerSettings,
        track_name: String,
        is_update: bool,
    },
    TrackName {
        instance_index: u32,
        track_name: String,
        color: String,
    },
    Tooltip {
        message: String,
        timeout_ms: u32,
    },
    Monitor(MonitorSettings),
}
