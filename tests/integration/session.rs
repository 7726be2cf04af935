//! Session integration tests against a mock mixer
//!
//! The session client runs on its own thread; the test drives the mixer side
//! from a multi-threaded tokio runtime.

use crate::helpers::*;
use panlink::net::SessionClient;
use panlink::prelude::*;
use panlink::ProtocolMessage;
use std::time::Duration;

fn spawn_client(settings: PannerSettings) -> (SessionClient, crossbeam_channel::Receiver<MixerUpdate>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let client =
        SessionClient::spawn(fast_session_config(), SettingsHandle::new(settings), tx).unwrap();
    (client, rx)
}

/// Handshake carries the identity, then the current settings snapshot.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handshake_then_snapshot() {
    init_tracing();
    let mixer = MockMixer::bind().await;
    let (client, _updates) = spawn_client(test_settings());
    client.set_identity("abc", 3);
    client.connect(mixer.endpoint());

    let mut conn = mixer.accept().await;
    let (session_id, index, settings) = conn.handshake().await;
    assert_eq!(session_id, "abc");
    assert_eq!(index, 3);
    assert_eq!(settings, test_settings());
    assert!(wait_for(|| client.is_ready()).await);

    client.update_track_info("Bass", "#00ff00");
    assert_eq!(
        conn.recv().await,
        ProtocolMessage::TrackNameUpdate {
            instance_index: 3,
            track_name: "Bass".into(),
            color: "#00ff00".into(),
        }
    );
}

/// Losing the mixer after a handshake leads to exactly one new handshake,
/// and inbound forwarding works on the new connection.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconnect_after_mixer_restart() {
    init_tracing();
    let mixer = MockMixer::bind().await;
    let (client, updates) = spawn_client(PannerSettings::default());
    client.set_identity("s1", 1);
    client.connect(mixer.endpoint());

    let mut conn = mixer.accept().await;
    conn.handshake().await;
    assert!(wait_for(|| client.is_ready()).await);

    drop(conn);
    assert!(wait_for(|| !client.is_ready()).await);

    let mut conn = mixer.accept().await;
    let (session_id, index, _) = conn.handshake().await;
    assert_eq!((session_id.as_str(), index), ("s1", 1));
    assert!(wait_for(|| client.is_ready()).await);

    // No second ConnectionRequest on the live connection.
    assert_eq!(conn.try_recv(Duration::from_millis(100)).await, None);

    let mut pushed = test_settings();
    pushed.azimuth = 90.0;
    conn.send(&ProtocolMessage::PannerSettingsUpdate {
        settings: pushed,
        track_name: "Keys".into(),
        is_update: true,
    })
    .await;

    let update = updates.recv_timeout(TEST_TIMEOUT).unwrap();
    assert_eq!(
        update,
        MixerUpdate::Settings {
            settings: pushed,
            track_name: "Keys".into(),
            is_update: true,
        }
    );

    // Outbound updates flow on the new connection too.
    client.update_instance(pushed);
    assert_eq!(
        conn.recv().await,
        ProtocolMessage::PannerSettingsUpdate {
            settings: pushed,
            track_name: String::new(),
            is_update: true,
        }
    );
}

/// Updates made before the Ack are held and delivered after the snapshot.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pre_ready_messages_follow_snapshot() {
    init_tracing();
    let mixer = MockMixer::bind().await;
    let (client, _updates) = spawn_client(PannerSettings::default());
    client.set_identity("queued", 2);
    client.connect(mixer.endpoint());

    let mut conn = mixer.accept().await;
    match conn.recv().await {
        ProtocolMessage::ConnectionRequest { .. } => {}
        other => panic!("expected ConnectionRequest, got {:?}", other),
    }

    client.update_tooltip("Panning locked", 1500);
    client.update_instance(test_settings());
    // Give the session thread time to queue both before the Ack.
    tokio::time::sleep(Duration::from_millis(50)).await;
    conn.send(&ProtocolMessage::Ack).await;

    // The queued settings update folds into the snapshot.
    assert_eq!(
        conn.recv().await,
        ProtocolMessage::PannerSettingsUpdate {
            settings: test_settings(),
            track_name: String::new(),
            is_update: false,
        }
    );
    assert_eq!(
        conn.recv().await,
        ProtocolMessage::TooltipUpdate {
            message: "Panning locked".into(),
            timeout_ms: 1500,
        }
    );
    assert_eq!(conn.try_recv(Duration::from_millis(100)).await, None);
}
