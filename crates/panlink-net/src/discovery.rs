//! Passive discovery of the external mixer.
//!
//! The mixer multicasts small JSON announcements, `{"ip":"10.0.0.5","port":6345}`,
//! on a well-known group. [`DiscoveryListener`] joins the group and reports the
//! announced endpoint through a callback.

use crate::error::{DiscoveryError, NetError, Result};
use panlink_core::{DiscoveryConfig, DiscoveryMode};
use parking_lot::Mutex;
use serde::Deserialize;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const RECV_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Address of a running mixer, as announced.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MixerEndpoint {
    pub host: String,
    pub port: u16,
}

impl MixerEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for MixerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Deserialize)]
struct Announcement {
    ip: String,
    port: u16,
}

/// Parse one datagram.
///
/// `Ok(None)` for an empty payload, an error for anything that isn't a
/// complete announcement.
pub fn parse_announcement(
    payload: &[u8],
) -> std::result::Result<Option<MixerEndpoint>, DiscoveryError> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| DiscoveryError::Malformed("payload is not UTF-8".to_string()))?;
    let text = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    if text.is_empty() {
        return Ok(None);
    }

    let announcement: Announcement =
        serde_json::from_str(text).map_err(|e| DiscoveryError::Malformed(e.to_string()))?;
    if announcement.ip.is_empty() {
        return Err(DiscoveryError::Malformed("empty ip".to_string()));
    }
    if announcement.port == 0 {
        return Err(DiscoveryError::Malformed("port 0".to_string()));
    }
    Ok(Some(MixerEndpoint::new(announcement.ip, announcement.port)))
}

/// Back off after a receive error. Returns `true` if asked to stop meanwhile.
async fn pause_unless_stopped(shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = shutdown.changed() => true,
        _ = tokio::time::sleep(RECV_ERROR_PAUSE) => false,
    }
}

pub type EndpointCallback = Arc<dyn Fn(MixerEndpoint) + Send + Sync>;

pub struct DiscoveryListener {
    socket: UdpSocket,
    config: DiscoveryConfig,
    callback: EndpointCallback,
    last_message: Mutex<Option<String>>,
    shutdown: watch::Sender<bool>,
}

impl DiscoveryListener {
    /// Bind the discovery port and join the multicast group.
    ///
    /// A failed group join is logged and tolerated; unicast announcements to
    /// the bound port still arrive.
    pub fn new(config: &DiscoveryConfig, callback: EndpointCallback) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&SocketAddr::V4(SocketAddrV4::new(config.listen_address, config.port)).into())?;

        match socket.join_multicast_v4(&config.multicast_group, &config.interface) {
            Ok(()) => debug!(
                "Joined multicast group {} on {}",
                config.multicast_group, config.interface
            ),
            Err(e) => warn!(
                "Could not join multicast group {}: {}",
                config.multicast_group, e
            ),
        }

        let socket: UdpSocket = socket.into();
        socket.set_nonblocking(true)?;

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            socket,
            config: config.clone(),
            callback,
            last_message: Mutex::new(None),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Run the receive loop on the calling thread until
    /// [`stop_listening`](Self::stop_listening) is called, or, in single-shot
    /// mode, until the first valid announcement.
    pub fn start_listening(&self) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let socket = self.socket.try_clone()?;
        let mut shutdown = self.shutdown.subscribe();

        runtime.block_on(async move {
            let socket = tokio::net::UdpSocket::from_std(socket)?;
            let mut buf = vec![0u8; self.config.max_datagram_len];
            let mut current: Option<MixerEndpoint> = None;

            info!(
                "Listening for mixer announcements on {}:{}",
                self.config.multicast_group, self.config.port
            );

            while !*shutdown.borrow() {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    received = socket.recv_from(&mut buf) => match received {
                        Ok((n, from)) => {
                            if self.handle_datagram(&buf[..n], from, &mut current) {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Discovery receive failed: {}", e);
                            if pause_unless_stopped(&mut shutdown).await {
                                break;
                            }
                        }
                    },
                }
            }

            debug!("Discovery loop finished");
            Ok::<(), NetError>(())
        })
    }

    /// Returns `true` when the loop should stop.
    fn handle_datagram(
        &self,
        payload: &[u8],
        from: SocketAddr,
        current: &mut Option<MixerEndpoint>,
    ) -> bool {
        let endpoint = match parse_announcement(payload) {
            Ok(Some(endpoint)) => endpoint,
            Ok(None) => {
                debug!("Empty discovery datagram from {}", from);
                return false;
            }
            Err(e) => {
                warn!("Ignoring datagram from {}: {}", from, e);
                return false;
            }
        };

        *self.last_message.lock() = Some(String::from_utf8_lossy(payload).into_owned());

        if current.as_ref() != Some(&endpoint) {
            info!("Mixer announced at {}", endpoint);
            *current = Some(endpoint.clone());
            (self.callback)(endpoint);
        }

        self.config.mode == DiscoveryMode::SingleShot
    }

    /// Ask a running [`start_listening`](Self::start_listening) to return.
    /// The thread running it still has to be joined.
    pub fn stop_listening(&self) {
        self.shutdown.send_replace(true);
    }

    /// Raw text of the last valid announcement.
    pub fn last_message(&self) -> Option<String> {
        self.last_message.lock().clone()
    }

    pub fn has_announcement(&self) -> bool {
        self.last_message.lock().is_some()
    }
}

impl std::fmt::Debug for DiscoveryListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryListener")
            .field("local_addr", &self.socket.local_addr().ok())
            .field("mode", &self.config.mode)
            .finish()
    }
}
