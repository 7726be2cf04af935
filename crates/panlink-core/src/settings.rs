//! Panner settings snapshot and the lock-free cell it lives in.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Snapshot of one panner instance's spatial settings.
///
/// Owned and mutated by the plugin; this crate only ever copies it, into a
/// shared-memory frame or into a protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PannerSettings {
    pub x: f32,
    pub y: f32,
    /// Degrees, -180..180.
    pub azimuth: f32,
    /// Degrees, -90..90.
    pub elevation: f32,
    pub diverge: f32,
    /// Input gain in dB.
    pub gain: f32,
    pub stereo_orbit_azimuth: f32,
    pub stereo_spread: f32,
    pub stereo_input_balance: f32,
    pub auto_orbit: bool,
    pub overlay: bool,
    pub isotropic_mode: bool,
    pub equalpower_mode: bool,
    pub gain_compensation_mode: bool,
    pub input_mode: u32,
    pub output_mode: u32,
}

impl Default for PannerSettings {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 100.0,
            azimuth: 0.0,
            elevation: 0.0,
            diverge: 50.0,
            gain: 0.0,
            stereo_orbit_azimuth: 0.0,
            stereo_spread: 50.0,
            stereo_input_balance: 0.0,
            auto_orbit: true,
            overlay: false,
            isotropic_mode: false,
            equalpower_mode: false,
            gain_compensation_mode: true,
            input_mode: 0,
            output_mode: 0,
        }
    }
}

/// Listener orientation and monitor bus layout the mixer pushes to every
/// instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorSettings {
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
    pub input_channel_count: u32,
    pub output_channel_count: u32,
}

/// Shared, lock-free holder of the current [`PannerSettings`].
///
/// The plugin stores a new snapshot whenever a parameter changes; readers on
/// other threads (the session client answering an `Ack`) load whatever is
/// current at that instant. Cloning is cheap - it's an `Arc` clone.
#[derive(Clone, Default)]
pub struct SettingsHandle {
    inner: Arc<ArcSwap<PannerSettings>>,
}

impl SettingsHandle {
    pub fn new(settings: PannerSettings) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(settings)),
        }
    }

    /// Current settings.
    pub fn snapshot(&self) -> PannerSettings {
        **self.inner.load()
    }

    pub fn store(&self, settings: PannerSettings) {
        self.inner.store(Arc::new(settings));
    }

    /// Read-modify-write helper for callers that change a single field.
    pub fn update(&self, f: impl Fn(&mut PannerSettings)) {
        self.inner.rcu(|current| {
            let mut next = **current;
            f(&mut next);
            next
        });
    }
}

impl std::fmt::Debug for SettingsHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SettingsHandle")
            .field(&self.snapshot())
            .finish()
    }
}
