//! Test helpers and fixtures for PanLink integration tests
//!
//! [`MockMixer`] stands in for the external mixer: a TCP listener speaking the
//! framed protocol, driven step by step from the test.

#![allow(dead_code)]

use panlink::net::{FrameReader, FrameWriter};
use panlink::prelude::*;
use panlink::{PreReadyPolicy, ProtocolMessage, ReconnectPolicy, SessionConfig};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;

/// Upper bound for anything a test waits on.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Route library logs to the test harness. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Short reconnect delays so reconnect tests finish quickly.
pub fn fast_session_config() -> SessionConfig {
    SessionConfig {
        reconnect: ReconnectPolicy::Backoff {
            initial_ms: 20,
            max_ms: 100,
        },
        pre_ready: PreReadyPolicy::Queue { capacity: 16 },
        ..Default::default()
    }
}

/// Settings distinguishable from the defaults.
pub fn test_settings() -> PannerSettings {
    PannerSettings {
        azimuth: -45.0,
        elevation: 12.5,
        gain: -6.0,
        input_mode: 2,
        ..Default::default()
    }
}

/// Deterministic ramp per channel, distinct across channels.
pub fn test_channel(channel: usize, samples: usize) -> Vec<f32> {
    (0..samples)
        .map(|i| channel as f32 * 1000.0 + i as f32 * 0.25)
        .collect()
}

pub struct MockMixer {
    listener: TcpListener,
}

impl MockMixer {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock mixer");
        Self { listener }
    }

    pub fn endpoint(&self) -> MixerEndpoint {
        let addr = self.listener.local_addr().expect("mock mixer address");
        MixerEndpoint::new(addr.ip().to_string(), addr.port())
    }

    pub async fn accept(&self) -> MixerConnection {
        let (stream, _) = tokio::time::timeout(TEST_TIMEOUT, self.listener.accept())
            .await
            .expect("timed out waiting for a plugin connection")
            .expect("accept failed");
        let (read, write) = stream.into_split();
        MixerConnection {
            reader: FrameReader::new(read, MAX_FRAME_LEN),
            writer: FrameWriter::new(write, MAX_FRAME_LEN),
        }
    }
}

/// Mixer side of one accepted session.
pub struct MixerConnection {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
}

impl MixerConnection {
    pub async fn recv(&mut self) -> ProtocolMessage {
        let frame = tokio::time::timeout(TEST_TIMEOUT, self.reader.next_frame())
            .await
            .expect("timed out waiting for a frame")
            .expect("read failed")
            .expect("plugin closed the connection");
        ProtocolMessage::decode(&frame).expect("undecodable frame")
    }

    /// `None` when nothing arrives within `wait`.
    pub async fn try_recv(&mut self, wait: Duration) -> Option<ProtocolMessage> {
        match tokio::time::timeout(wait, self.reader.next_frame()).await {
            Ok(Ok(Some(frame))) => ProtocolMessage::decode(&frame).ok(),
            _ => None,
        }
    }

    pub async fn send(&mut self, msg: &ProtocolMessage) {
        self.writer.send(msg).await.expect("send failed");
    }

    /// Expect a `ConnectionRequest`, acknowledge it, and return the announced
    /// identity together with the settings snapshot that follows the Ack.
    pub async fn handshake(&mut self) -> (String, u32, PannerSettings) {
        let (session_id, instance_index) = match self.recv().await {
            ProtocolMessage::ConnectionRequest {
                session_id,
                instance_index,
            } => (session_id, instance_index),
            other => panic!("expected ConnectionRequest, got {:?}", other),
        };
        self.send(&ProtocolMessage::Ack).await;

        let settings = match self.recv().await {
            ProtocolMessage::PannerSettingsUpdate {
                settings,
                is_update: false,
                ..
            } => settings,
            other => panic!("expected initial settings, got {:?}", other),
        };
        (session_id, instance_index, settings)
    }
}

/// Poll `condition` until it holds or [`TEST_TIMEOUT`] passes.
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
