//! Shared-memory integration tests
//!
//! A plugin-side writer and a helper-side reader open the same segment
//! through separate handles, as two processes would.

use crate::helpers::*;
use panlink::prelude::*;
use panlink::shm::ShmError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const SEGMENT_SIZE: usize = 256 * 1024;

/// The reader sees the last written frame byte for byte, with its settings.
#[test]
fn test_latest_frame_is_exact_across_handles() {
    let dir = tempfile::tempdir().unwrap();
    let writer = SharedMemoryChannel::open_in(dir.path(), "latest", SEGMENT_SIZE, true, true)
        .unwrap();
    let reader = SharedMemoryChannel::open_in(dir.path(), "latest", SEGMENT_SIZE, true, false)
        .unwrap();
    writer.initialize_for_audio(48_000, 2, 256).unwrap();

    let settings = test_settings();
    for block in 0..3u64 {
        let left: Vec<f32> = test_channel(0, 256).iter().map(|s| s + block as f32).collect();
        let right: Vec<f32> = test_channel(1, 256).iter().map(|s| s + block as f32).collect();
        writer
            .write_audio_buffer_with_settings(&[&left, &right], &settings, block, block as f64 * 0.5, true)
            .unwrap();
    }

    let mut samples = Vec::new();
    let header = reader
        .read_audio_buffer_with_settings(&mut samples)
        .unwrap()
        .expect("a frame was written");

    assert_eq!(header.channels, 2);
    assert_eq!(header.samples, 256);
    assert_eq!(header.daw_timestamp, 2);
    assert_eq!(header.playhead, 1.0);
    assert!(header.is_playing());

    let applied = header.apply_to(&PannerSettings::default());
    assert_eq!(applied.azimuth, settings.azimuth);
    assert_eq!(applied.elevation, settings.elevation);
    assert_eq!(applied.gain, settings.gain);
    assert_eq!(applied.input_mode, settings.input_mode);

    let left = test_channel(0, 256);
    let right = test_channel(1, 256);
    for i in 0..256 {
        assert_eq!(samples[i * 2].to_bits(), (left[i] + 2.0).to_bits());
        assert_eq!(samples[i * 2 + 1].to_bits(), (right[i] + 2.0).to_bits());
    }

    // Consumed: nothing new until the next write.
    assert!(reader.read_audio_buffer_with_settings(&mut samples).unwrap().is_none());

    let format = reader.audio_format().unwrap();
    assert_eq!(format.sample_rate, 48_000);
    assert_eq!(format.channels, 2);
}

/// Two readers consume independently of each other.
#[test]
fn test_readers_consume_independently() {
    let dir = tempfile::tempdir().unwrap();
    let writer = SharedMemoryChannel::open_in(dir.path(), "fanout", SEGMENT_SIZE, true, true)
        .unwrap();
    let first = SharedMemoryChannel::open_in(dir.path(), "fanout", SEGMENT_SIZE, true, false)
        .unwrap();
    let second = SharedMemoryChannel::open_in(dir.path(), "fanout", SEGMENT_SIZE, true, false)
        .unwrap();

    writer.write_string("hello helper").unwrap();
    assert_eq!(first.read_string().unwrap().as_deref(), Some("hello helper"));
    assert_eq!(first.read_string().unwrap(), None);
    assert_eq!(second.read_string().unwrap().as_deref(), Some("hello helper"));
}

/// A reader never observes a frame mixing two writes.
#[test]
fn test_concurrent_reader_sees_whole_frames() {
    let dir = tempfile::tempdir().unwrap();
    let writer = SharedMemoryChannel::open_in(dir.path(), "torn", SEGMENT_SIZE, true, true)
        .unwrap();
    let reader = SharedMemoryChannel::open_in(dir.path(), "torn", SEGMENT_SIZE, true, false)
        .unwrap();
    let done = Arc::new(AtomicBool::new(false));

    let write_thread = {
        let done = Arc::clone(&done);
        std::thread::spawn(move || {
            let settings = PannerSettings::default();
            for block in 0..2_000u32 {
                let value = block as f32;
                let channel = vec![value; 512];
                writer
                    .write_audio_buffer_with_settings(&[&channel, &channel], &settings, block as u64, 0.0, false)
                    .unwrap();
            }
            done.store(true, Ordering::Release);
        })
    };

    let mut samples = Vec::new();
    let mut frames = 0;
    while !done.load(Ordering::Acquire) {
        if let Some(header) = reader.read_audio_buffer_with_settings(&mut samples).unwrap() {
            let expected = header.daw_timestamp as f32;
            assert!(samples.iter().all(|s| *s == expected), "torn frame at {}", expected);
            frames += 1;
        }
    }
    write_thread.join().unwrap();
    assert!(frames > 0 || reader.read_header_settings().unwrap().is_some());
}

#[test]
fn test_attach_to_missing_segment_fails() {
    let dir = tempfile::tempdir().unwrap();
    let err = SharedMemoryChannel::open_in(dir.path(), "absent", SEGMENT_SIZE, true, false)
        .unwrap_err();
    assert!(matches!(err, ShmError::ChannelUnavailable { .. }));
}

/// Persistent segments outlive their handles; explicit deletion removes them.
#[test]
fn test_persistent_segment_survives_close() {
    let dir = tempfile::tempdir().unwrap();
    {
        let channel = SharedMemoryChannel::open_in(dir.path(), "kept", SEGMENT_SIZE, true, true)
            .unwrap();
        channel.write_data(&[1, 2, 3]).unwrap();
    }

    let reopened = SharedMemoryChannel::open_in(dir.path(), "kept", SEGMENT_SIZE, true, false)
        .unwrap();
    assert_eq!(reopened.read_data().unwrap(), Some(vec![1, 2, 3]));
    drop(reopened);

    assert!(SharedMemoryChannel::delete_shared_memory_in(dir.path(), "kept").unwrap());
    assert!(!SharedMemoryChannel::delete_shared_memory_in(dir.path(), "kept").unwrap());
}
