//! Orchestrator integration tests
//!
//! Discovery is exercised with unicast announcements to the bound port;
//! everything else goes through `connect_to` against a mock mixer.

use crate::helpers::*;
use panlink::prelude::*;
use panlink::{DiscoveryConfig, DiscoveryMode, ProtocolMessage};
use std::net::{Ipv4Addr, UdpSocket};
use std::path::Path;
use std::time::Duration;

fn orchestrator(dir: &Path, group: &str) -> ConnectionOrchestrator {
    ConnectionOrchestrator::builder()
        .registry_directory(dir)
        .registry_group(group)
        .session_config(fast_session_config())
        .initial_settings(test_settings())
        .discovery(false)
        .build()
        .expect("Failed to build orchestrator")
}

/// Identity from the registry reaches the mixer; mixer pushes reach the plugin.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_to_forwards_both_ways() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mixer = MockMixer::bind().await;
    let _first = orchestrator(dir.path(), "forward");
    let link = orchestrator(dir.path(), "forward");
    assert_eq!(link.instance_index(), 2);
    assert_eq!(link.live_instances(), 2);

    // No session yet: nothing is sent, but the name is kept for the session.
    link.update_track_info("Pad", "#000000");
    assert_eq!(link.session_state(), SessionState::Disconnected);

    assert!(link.set_session_identifier("mix-7").unwrap());
    link.connect_to(mixer.endpoint());

    let mut conn = mixer.accept().await;
    let (session_id, index, settings) = conn.handshake().await;
    assert_eq!(session_id, "mix-7");
    assert_eq!(index, 2);
    assert_eq!(settings, test_settings());
    assert!(wait_for(|| link.session_state() == SessionState::Ready).await);

    let mut moved = test_settings();
    moved.x = 25.0;
    link.update_instance_info(moved);
    assert_eq!(link.settings().snapshot(), moved);
    assert_eq!(
        conn.recv().await,
        ProtocolMessage::PannerSettingsUpdate {
            settings: moved,
            track_name: "Pad".into(),
            is_update: true,
        }
    );

    link.update_tooltip("Solo", 3000);
    assert_eq!(
        conn.recv().await,
        ProtocolMessage::TooltipUpdate {
            message: "Solo".into(),
            timeout_ms: 3000,
        }
    );

    conn.send(&ProtocolMessage::TrackNameUpdate {
        instance_index: 2,
        track_name: "Lead".into(),
        color: "#ff8800".into(),
    })
    .await;
    let update = link.updates().recv_timeout(TEST_TIMEOUT).unwrap();
    assert_eq!(
        update,
        MixerUpdate::TrackName {
            instance_index: 2,
            track_name: "Lead".into(),
            color: "#ff8800".into(),
        }
    );
}

/// A late session id is used by the next handshake.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_session_id_set_after_connect() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mixer = MockMixer::bind().await;
    let link = orchestrator(dir.path(), "late-id");

    link.connect_to(mixer.endpoint());
    let mut conn = mixer.accept().await;
    let (session_id, _, _) = conn.handshake().await;
    assert_eq!(session_id, "");

    assert!(link.set_session_identifier("assigned").unwrap());
    assert_eq!(link.session_identifier(), "assigned");
    drop(conn);

    let mut conn = mixer.accept().await;
    let (session_id, index, _) = conn.handshake().await;
    assert_eq!(session_id, "assigned");
    assert_eq!(index, 1);
}

/// After `disconnect`, the mixer sees the connection close and updates stop.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_closes_session() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mixer = MockMixer::bind().await;
    let link = orchestrator(dir.path(), "disconnect");

    link.connect_to(mixer.endpoint());
    let mut conn = mixer.accept().await;
    conn.handshake().await;
    assert!(wait_for(|| link.session_state() == SessionState::Ready).await);

    link.disconnect();
    assert_eq!(link.session_state(), SessionState::Disconnected);
    link.update_tooltip("nobody listens", 100);
    assert_eq!(conn.try_recv(Duration::from_millis(200)).await, None);
}

/// An announcement on the discovery port starts a session with the announced mixer.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_discovery_announcement_starts_session() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mixer = MockMixer::bind().await;

    // Reserve a free UDP port for the listener.
    let port = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let link = ConnectionOrchestrator::builder()
        .registry_directory(dir.path())
        .registry_group("discovered")
        .session_config(fast_session_config())
        .discovery_config(DiscoveryConfig {
            port,
            mode: DiscoveryMode::SingleShot,
            ..Default::default()
        })
        .build()
        .unwrap();
    assert!(!link.is_external_mixer_available());

    let endpoint = mixer.endpoint();
    let announcement = serde_json::json!({ "ip": endpoint.host, "port": endpoint.port }).to_string();
    let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();

    // Resend until the listener thread has picked one up.
    let accept = mixer.accept();
    tokio::pin!(accept);
    let mut conn = loop {
        sender
            .send_to(announcement.as_bytes(), (Ipv4Addr::LOCALHOST, port))
            .unwrap();
        tokio::select! {
            conn = &mut accept => break conn,
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }
    };

    let (_, index, _) = conn.handshake().await;
    assert_eq!(index, 1);
    assert!(link.is_external_mixer_available());
    assert_eq!(link.last_announcement().as_deref(), Some(announcement.as_str()));
}
