//! Single-writer/single-reader channel over a named segment.
//!
//! The segment is a [`SharedMemoryHeader`] followed by a byte ring. Every write
//! appends one self-describing record (`RecordHeader` + payload) at
//! `write_index`, wrapping to offset 0 when the record would run past the end.
//! The ring is a "latest state" transport: readers only ever look at the most
//! recent record, and older records are overwritten freely.
//!
//! Writer and reader synchronise through the header's `sequence` seqlock, so a
//! reader never returns a record that was still being written.

use crate::error::{Result, ShmError};
use crate::header::{
    AudioBufferHeader, RecordHeader, RecordKind, SharedMemoryHeader, AUDIO_HEADER_SIZE,
    HEADER_SIZE, RECORD_HEADER_SIZE,
};
use crate::segment::{self, Segment};
use panlink_core::{PannerSettings, MIN_SEGMENT_SIZE};
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, AtomicU64, Ordering};
use tracing::{debug, warn};

const READ_RETRIES: usize = 64;

/// One-time audio parameters stored in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u32,
    pub samples_per_block: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStats {
    /// Whole segment, header included.
    pub total_size: usize,
    /// Ring capacity.
    pub buffer_size: usize,
    /// Bytes occupied by the latest record.
    pub used: usize,
    pub available: usize,
    /// Records written through this handle.
    pub write_count: u64,
    /// Records consumed through this handle.
    pub read_count: u64,
    /// Frames written to the segment by any handle.
    pub sequence: u64,
}

pub struct SharedMemoryChannel {
    segment: Option<Segment>,
    name: String,
    path: PathBuf,
    capacity: usize,
    persistent: bool,
    last_sequence: AtomicU64,
    write_count: AtomicU64,
    read_count: AtomicU64,
}

impl SharedMemoryChannel {
    /// Create or attach to `name` in the resolved segment directory.
    pub fn open(
        name: &str,
        total_size: usize,
        persistent: bool,
        create_if_missing: bool,
    ) -> Result<Self> {
        let dir = segment::resolve_directory(None)?;
        Self::open_in(&dir, name, total_size, persistent, create_if_missing)
    }

    pub fn open_in(
        dir: &Path,
        name: &str,
        total_size: usize,
        persistent: bool,
        create_if_missing: bool,
    ) -> Result<Self> {
        if total_size < MIN_SEGMENT_SIZE {
            return Err(ShmError::unavailable(
                name,
                format!("size {} below minimum {}", total_size, MIN_SEGMENT_SIZE),
            ));
        }
        if total_size > u32::MAX as usize {
            return Err(ShmError::unavailable(
                name,
                format!("size {} exceeds 32-bit indices", total_size),
            ));
        }

        let path = segment::segment_path(dir, name);
        let segment = Segment::open(&path, name, total_size, create_if_missing)?;
        if segment.len() < MIN_SEGMENT_SIZE {
            return Err(ShmError::unavailable(
                name,
                format!("existing segment is only {} bytes", segment.len()),
            ));
        }

        let capacity = segment.len() - HEADER_SIZE;
        // SAFETY: the mapping is page aligned and at least HEADER_SIZE long.
        let header = unsafe { &*(segment.base() as *const SharedMemoryHeader) };
        match header.buffer_size.compare_exchange(
            0,
            capacity as u32,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => header.set_name(name),
            Err(stored) if stored as usize > capacity => {
                return Err(ShmError::unavailable(
                    name,
                    format!(
                        "header claims {} ring bytes but mapping holds {}",
                        stored, capacity
                    ),
                ));
            }
            Err(_) => {}
        }
        let capacity = header.buffer_size.load(Ordering::Acquire) as usize;

        debug!(
            "Shared memory channel '{}' {} ({} ring bytes, persistent={})",
            name,
            if segment.created() { "created" } else { "attached" },
            capacity,
            persistent
        );

        Ok(Self {
            segment: Some(segment),
            name: name.to_string(),
            path,
            capacity,
            persistent,
            last_sequence: AtomicU64::new(0),
            write_count: AtomicU64::new(0),
            read_count: AtomicU64::new(0),
        })
    }

    /// Remove the backing file of `name` from the resolved directory.
    ///
    /// Returns `false` if no such segment existed.
    pub fn delete_shared_memory(name: &str) -> Result<bool> {
        let dir = segment::resolve_directory(None)?;
        segment::remove_segment(&dir, name)
    }

    pub fn delete_shared_memory_in(dir: &Path, name: &str) -> Result<bool> {
        segment::remove_segment(dir, name)
    }

    fn segment(&self) -> Result<&Segment> {
        self.segment.as_ref().ok_or(ShmError::NotOpen)
    }

    fn header(segment: &Segment) -> &SharedMemoryHeader {
        // SAFETY: checked at open time; the mapping outlives the borrow.
        unsafe { &*(segment.base() as *const SharedMemoryHeader) }
    }

    fn ring(segment: &Segment) -> *mut u8 {
        // SAFETY: HEADER_SIZE < segment length.
        unsafe { segment.base().add(HEADER_SIZE) }
    }

    /// Store the one-time audio parameters. Called by whichever side created
    /// the segment.
    pub fn initialize_for_audio(
        &self,
        sample_rate: u32,
        channels: u32,
        samples_per_block: u32,
    ) -> Result<()> {
        let header = Self::header(self.segment()?);
        header.sample_rate.store(sample_rate, Ordering::Relaxed);
        header.num_channels.store(channels, Ordering::Relaxed);
        header
            .samples_per_block
            .store(samples_per_block, Ordering::Release);
        Ok(())
    }

    pub fn audio_format(&self) -> Result<AudioFormat> {
        let header = Self::header(self.segment()?);
        let samples_per_block = header.samples_per_block.load(Ordering::Acquire);
        Ok(AudioFormat {
            sample_rate: header.sample_rate.load(Ordering::Relaxed),
            channels: header.num_channels.load(Ordering::Relaxed),
            samples_per_block,
        })
    }

    /// Write one audio block with its transport state and settings snapshot.
    ///
    /// `samples` is planar (one slice per channel); the ring stores them
    /// interleaved. Never blocks and never allocates. Caller must ensure a
    /// single writer per segment.
    pub fn write_audio_buffer_with_settings(
        &self,
        samples: &[&[f32]],
        settings: &PannerSettings,
        daw_timestamp: u64,
        playhead: f64,
        is_playing: bool,
    ) -> Result<()> {
        let channels = samples.len();
        let frames = samples.first().map_or(0, |c| c.len());
        if samples.iter().any(|c| c.len() != frames) {
            return Err(ShmError::ChannelMismatch);
        }

        let header = AudioBufferHeader::new(
            channels as u32,
            frames as u32,
            settings,
            daw_timestamp,
            playhead,
            is_playing,
        );
        let payload_len = AUDIO_HEADER_SIZE + header.payload_len();

        self.write_record(RecordKind::Audio, payload_len, |dst| unsafe {
            std::ptr::write_unaligned(dst as *mut AudioBufferHeader, header);
            let out = dst.add(AUDIO_HEADER_SIZE) as *mut f32;
            for frame in 0..frames {
                for (ch, channel) in samples.iter().enumerate() {
                    std::ptr::write_unaligned(out.add(frame * channels + ch), channel[frame]);
                }
            }
        })
    }

    pub fn write_data(&self, data: &[u8]) -> Result<()> {
        self.write_record(RecordKind::Data, data.len(), |dst| unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        })
    }

    pub fn write_string(&self, text: &str) -> Result<()> {
        self.write_record(RecordKind::Text, text.len(), |dst| unsafe {
            std::ptr::copy_nonoverlapping(text.as_ptr(), dst, text.len());
        })
    }

    /// Append one record. Leaves the ring untouched if the record can't fit.
    fn write_record(
        &self,
        kind: RecordKind,
        payload_len: usize,
        fill: impl FnOnce(*mut u8),
    ) -> Result<()> {
        let segment = self.segment()?;
        let needed = RECORD_HEADER_SIZE + payload_len;
        if needed > self.capacity {
            return Err(ShmError::FrameTooLarge {
                needed,
                capacity: self.capacity,
            });
        }

        let header = Self::header(segment);
        let write_index = header.write_index.load(Ordering::Relaxed) as usize;
        let start = if write_index + needed > self.capacity {
            0
        } else {
            write_index
        };

        // Even value; a writer that died mid-frame leaves it odd.
        let stamp = header.sequence.load(Ordering::Relaxed) & !1;
        header.sequence.swap(stamp + 1, Ordering::Acquire);
        fence(Ordering::Release);

        // SAFETY: start + needed <= capacity, so the record stays in the ring.
        unsafe {
            let dst = Self::ring(segment).add(start);
            std::ptr::write_unaligned(
                dst as *mut RecordHeader,
                RecordHeader {
                    kind: kind as u32,
                    len: payload_len as u32,
                },
            );
            fill(dst.add(RECORD_HEADER_SIZE));
        }

        let next = (start + needed) % self.capacity;
        header.data_size.store(needed as u32, Ordering::Relaxed);
        header.write_index.store(next as u32, Ordering::Release);
        header.has_data.store(1, Ordering::Release);
        header.sequence.store(stamp + 2, Ordering::Release);

        self.write_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Copy out the latest audio frame if it hasn't been read through this
    /// handle yet. Samples land interleaved in `samples`.
    pub fn read_audio_buffer_with_settings(
        &self,
        samples: &mut Vec<f32>,
    ) -> Result<Option<AudioBufferHeader>> {
        self.read_record(true, |kind, payload, len| {
            let header = Self::audio_header(kind, payload, len)?;
            let count = header.channels as usize * header.samples as usize;
            samples.clear();
            samples.resize(count, 0.0);
            // SAFETY: audio_header checked the payload length.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    payload.add(AUDIO_HEADER_SIZE),
                    samples.as_mut_ptr() as *mut u8,
                    header.payload_len(),
                );
            }
            Some(header)
        })
    }

    /// Peek at the latest audio frame's header without consuming it.
    pub fn read_header_settings(&self) -> Result<Option<AudioBufferHeader>> {
        self.read_record(false, |kind, payload, len| {
            Self::audio_header(kind, payload, len)
        })
    }

    pub fn read_data(&self) -> Result<Option<Vec<u8>>> {
        self.read_record(true, |kind, payload, len| {
            if kind != RecordKind::Data {
                return None;
            }
            // SAFETY: len was bounds-checked against the ring.
            Some(unsafe { std::slice::from_raw_parts(payload, len) }.to_vec())
        })
    }

    pub fn read_string(&self) -> Result<Option<String>> {
        let bytes = self.read_record(true, |kind, payload, len| {
            if kind != RecordKind::Text {
                return None;
            }
            // SAFETY: len was bounds-checked against the ring.
            Some(unsafe { std::slice::from_raw_parts(payload, len) }.to_vec())
        })?;
        Ok(bytes.map(|b| String::from_utf8_lossy(&b).into_owned()))
    }

    fn audio_header(kind: RecordKind, payload: *const u8, len: usize) -> Option<AudioBufferHeader> {
        if kind != RecordKind::Audio || len < AUDIO_HEADER_SIZE {
            return None;
        }
        // SAFETY: at least AUDIO_HEADER_SIZE readable bytes.
        let header = unsafe { std::ptr::read_unaligned(payload as *const AudioBufferHeader) };
        (AUDIO_HEADER_SIZE + header.payload_len() == len).then_some(header)
    }

    /// Locate the latest record and hand its payload to `copy`.
    ///
    /// `copy` returns `None` for a record it doesn't want, which is reported
    /// as no data and not consumed.
    fn read_record<T>(
        &self,
        consume: bool,
        mut copy: impl FnMut(RecordKind, *const u8, usize) -> Option<T>,
    ) -> Result<Option<T>> {
        let segment = self.segment()?;
        let header = Self::header(segment);
        let capacity = self.capacity;

        for _ in 0..READ_RETRIES {
            let stamp = header.sequence.load(Ordering::Acquire);
            if stamp & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            if header.has_data.load(Ordering::Acquire) == 0 {
                return Ok(None);
            }
            if consume && stamp == self.last_sequence.load(Ordering::Relaxed) {
                return Ok(None);
            }

            let write_index = header.write_index.load(Ordering::Acquire) as usize;
            let data_size = header.data_size.load(Ordering::Acquire) as usize;

            let mut result = None;
            if data_size >= RECORD_HEADER_SIZE && data_size <= capacity && write_index < capacity
            {
                let start = (write_index + capacity - data_size) % capacity;
                if start + data_size <= capacity {
                    // SAFETY: the record lies inside the ring.
                    unsafe {
                        let src = Self::ring(segment).add(start);
                        let record = std::ptr::read_unaligned(src as *const RecordHeader);
                        if record.len as usize + RECORD_HEADER_SIZE == data_size {
                            if let Some(kind) = RecordKind::from_raw(record.kind) {
                                result = copy(kind, src.add(RECORD_HEADER_SIZE), record.len as usize);
                            }
                        }
                    }
                }
            }

            fence(Ordering::Acquire);
            if header.sequence.load(Ordering::Relaxed) != stamp {
                continue;
            }

            if result.is_some() && consume {
                self.last_sequence.store(stamp, Ordering::Relaxed);
                header.read_index.store(write_index as u32, Ordering::Release);
                self.read_count.fetch_add(1, Ordering::Relaxed);
            }
            return Ok(result);
        }

        warn!("Shared memory '{}': writer kept the frame busy, giving up", self.name);
        Ok(None)
    }

    /// Reset indices and flags. The segment itself stays.
    pub fn clear(&self) -> Result<()> {
        let header = Self::header(self.segment()?);
        let stamp = header.sequence.load(Ordering::Relaxed) & !1;
        header.sequence.swap(stamp + 1, Ordering::Acquire);
        fence(Ordering::Release);
        header.has_data.store(0, Ordering::Release);
        header.data_size.store(0, Ordering::Relaxed);
        header.write_index.store(0, Ordering::Relaxed);
        header.read_index.store(0, Ordering::Relaxed);
        header.sequence.store(stamp + 2, Ordering::Release);
        Ok(())
    }

    pub fn stats(&self) -> Result<ChannelStats> {
        let segment = self.segment()?;
        let header = Self::header(segment);
        let used = header.data_size.load(Ordering::Acquire) as usize;
        Ok(ChannelStats {
            total_size: segment.len(),
            buffer_size: self.capacity,
            used,
            available: self.capacity.saturating_sub(used),
            write_count: self.write_count.load(Ordering::Relaxed),
            read_count: self.read_count.load(Ordering::Relaxed),
            sequence: header.sequence.load(Ordering::Acquire) / 2,
        })
    }

    /// Size of the latest record in bytes, 0 when empty.
    pub fn data_size(&self) -> usize {
        self.segment
            .as_ref()
            .map_or(0, |s| Self::header(s).data_size.load(Ordering::Acquire) as usize)
    }

    pub fn is_valid(&self) -> bool {
        self.segment.is_some()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Name tag stored in the header by the creator.
    pub fn header_name(&self) -> Result<String> {
        Ok(Self::header(self.segment()?).name())
    }

    /// Unmap the segment. Non-persistent handles also remove the backing file.
    pub fn close(&mut self) {
        if let Some(segment) = self.segment.take() {
            if !self.persistent && segment.remove_file() {
                debug!("Removed shared memory {}", segment.path().display());
            }
        }
    }
}

impl Drop for SharedMemoryChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SharedMemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemoryChannel")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("capacity", &self.capacity)
            .field("open", &self.segment.is_some())
            .finish()
    }
}
