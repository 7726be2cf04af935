//! Fixed layouts shared with the helper process.
//!
//! Both structs are `#[repr(C)]` with explicit reserved space, so the byte
//! layout is identical for every process on the same platform.

use panlink_core::PannerSettings;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

pub const NAME_LEN: usize = 64;

/// Control block at offset 0 of every channel segment.
///
/// Field order is part of the cross-process contract. `sequence` is a seqlock
/// word: odd while a frame is being written, bumped to the next even value
/// once it is complete.
#[repr(C)]
pub struct SharedMemoryHeader {
    pub write_index: AtomicU32,
    pub read_index: AtomicU32,
    pub data_size: AtomicU32,
    pub has_data: AtomicU32,
    pub buffer_size: AtomicU32,
    pub sample_rate: AtomicU32,
    pub num_channels: AtomicU32,
    pub samples_per_block: AtomicU32,
    pub name: [AtomicU8; NAME_LEN],
    pub sequence: AtomicU64,
    _reserved: [u8; 24],
}

pub const HEADER_SIZE: usize = std::mem::size_of::<SharedMemoryHeader>();

const _: () = assert!(HEADER_SIZE == 128);

impl SharedMemoryHeader {
    /// Copy `name` into the tag, truncated to 63 bytes and NUL-padded.
    pub fn set_name(&self, name: &str) {
        let bytes = name.as_bytes();
        let n = bytes.len().min(NAME_LEN - 1);
        for (i, slot) in self.name.iter().enumerate() {
            let b = if i < n { bytes[i] } else { 0 };
            slot.store(b, Ordering::Relaxed);
        }
    }

    pub fn name(&self) -> String {
        let bytes: Vec<u8> = self
            .name
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .take_while(|&b| b != 0)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Kind tag of a ring record.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Audio = 1,
    Data = 2,
    Text = 3,
}

impl RecordKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(RecordKind::Audio),
            2 => Some(RecordKind::Data),
            3 => Some(RecordKind::Text),
            _ => None,
        }
    }
}

/// Prefix of every record in the ring. `len` counts the payload only.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub kind: u32,
    pub len: u32,
}

pub const RECORD_HEADER_SIZE: usize = std::mem::size_of::<RecordHeader>();

/// Envelope written in front of each audio block.
///
/// Followed by `channels * samples` interleaved `f32` samples.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioBufferHeader {
    pub channels: u32,
    pub samples: u32,
    /// Host timestamp, in whatever unit the host reports (usually ms).
    pub daw_timestamp: u64,
    /// Playhead position in seconds.
    pub playhead: f64,
    pub is_playing: u32,
    pub azimuth: f32,
    pub elevation: f32,
    pub diverge: f32,
    pub gain: f32,
    pub stereo_orbit_azimuth: f32,
    pub stereo_spread: f32,
    pub stereo_input_balance: f32,
    pub auto_orbit: u32,
    pub isotropic_mode: u32,
    pub equalpower_mode: u32,
    pub gain_compensation_mode: u32,
    pub input_mode: u32,
    pub output_mode: u32,
    _reserved: [u32; 8],
}

pub const AUDIO_HEADER_SIZE: usize = std::mem::size_of::<AudioBufferHeader>();

const _: () = assert!(AUDIO_HEADER_SIZE == 112);

impl AudioBufferHeader {
    pub fn new(
        channels: u32,
        samples: u32,
        settings: &PannerSettings,
        daw_timestamp: u64,
        playhead: f64,
        is_playing: bool,
    ) -> Self {
        Self {
            channels,
            samples,
            daw_timestamp,
            playhead,
            is_playing: is_playing as u32,
            azimuth: settings.azimuth,
            elevation: settings.elevation,
            diverge: settings.diverge,
            gain: settings.gain,
            stereo_orbit_azimuth: settings.stereo_orbit_azimuth,
            stereo_spread: settings.stereo_spread,
            stereo_input_balance: settings.stereo_input_balance,
            auto_orbit: settings.auto_orbit as u32,
            isotropic_mode: settings.isotropic_mode as u32,
            equalpower_mode: settings.equalpower_mode as u32,
            gain_compensation_mode: settings.gain_compensation_mode as u32,
            input_mode: settings.input_mode,
            output_mode: settings.output_mode,
            _reserved: [0; 8],
        }
    }

    pub fn is_playing(&self) -> bool {
        self.is_playing != 0
    }

    /// Bytes of interleaved samples following this header.
    pub fn payload_len(&self) -> usize {
        self.channels as usize * self.samples as usize * std::mem::size_of::<f32>()
    }

    /// The settings carried by this frame, applied over `base`.
    ///
    /// Frames don't carry the x/y position or the overlay flag; those come
    /// from `base`.
    pub fn apply_to(&self, base: &PannerSettings) -> PannerSettings {
        PannerSettings {
            azimuth: self.azimuth,
            elevation: self.elevation,
            diverge: self.diverge,
            gain: self.gain,
            stereo_orbit_azimuth: self.stereo_orbit_azimuth,
            stereo_spread: self.stereo_spread,
            stereo_input_balance: self.stereo_input_balance,
            auto_orbit: self.auto_orbit != 0,
            isotropic_mode: self.isotropic_mode != 0,
            equalpower_mode: self.equalpower_mode != 0,
            gain_compensation_mode: self.gain_compensation_mode != 0,
            input_mode: self.input_mode,
            output_mode: self.output_mode,
            ..*base
        }
    }
}
