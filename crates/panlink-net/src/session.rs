//! One outbound session to the external mixer.
//!
//! Caller threads → command channel → session thread (current-thread tokio
//! runtime) → TCP → mixer. The session thread owns the socket, the reconnect
//! timer and the queue of messages waiting for the handshake.
//!
//! States: `Disconnected → Connecting → AwaitingAck → Ready`, back to
//! `Disconnected` on any error or close.

use crate::discovery::MixerEndpoint;
use crate::error::{NetError, Result};
use crate::protocol::{MixerUpdate, ProtocolMessage};
use crate::transport::{FrameReader, FrameWriter};
use crossbeam_channel::Sender;
use panlink_core::{
    PannerSettings, PreReadyPolicy, ReconnectPolicy, SessionConfig, SettingsHandle,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected = 0,
    Connecting = 1,
    AwaitingAck = 2,
    Ready = 3,
}

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SessionState::Connecting,
            2 => SessionState::AwaitingAck,
            3 => SessionState::Ready,
            _ => SessionState::Disconnected,
        }
    }
}

/// Who this instance claims to be in `ConnectionRequest`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionIdentity {
    pub session_id: String,
    pub instance_index: u32,
}

#[derive(Debug)]
enum Command {
    Connect(MixerEndpoint),
    Send(ProtocolMessage),
    Disconnect,
}

/// How a connected session ended.
enum SessionEnd {
    Shutdown,
    Disconnect,
    /// Asked to connect somewhere else.
    Redirect(MixerEndpoint),
    Lost { handshake_completed: bool },
}

/// Why a write did not go through.
enum WriteFailure {
    Shutdown,
    Lost(NetError),
}

/// What to do after the loop has been idle or sleeping.
enum Wake {
    Shutdown,
    Connect(MixerEndpoint),
    Idle,
}

/// Handle to the session thread. All methods are non-blocking except
/// [`stop`](Self::stop). Dropping the handle stops the session.
pub struct SessionClient {
    commands: mpsc::UnboundedSender<Command>,
    shutdown: watch::Sender<bool>,
    state: Arc<AtomicU8>,
    identity: Arc<Mutex<SessionIdentity>>,
    track_name: Arc<Mutex<String>>,
    settings: SettingsHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl SessionClient {
    /// Spawn the session thread. It stays `Disconnected` until
    /// [`connect`](Self::connect).
    ///
    /// `settings` is read at every handshake; inbound mixer updates are sent
    /// to `updates`.
    pub fn spawn(
        config: SessionConfig,
        settings: SettingsHandle,
        updates: Sender<MixerUpdate>,
    ) -> Result<Self> {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let state = Arc::new(AtomicU8::new(SessionState::Disconnected as u8));
        let identity = Arc::new(Mutex::new(SessionIdentity::default()));
        let track_name = Arc::new(Mutex::new(String::new()));

        let initial_delay = match config.reconnect {
            ReconnectPolicy::Backoff { initial_ms, .. } => initial_ms,
            ReconnectPolicy::Disabled => 0,
        };
        let session = SessionLoop {
            config,
            settings: settings.clone(),
            updates,
            state: Arc::clone(&state),
            identity: Arc::clone(&identity),
            track_name: Arc::clone(&track_name),
            commands: command_rx,
            shutdown: shutdown_rx,
            endpoint: None,
            pending: VecDeque::new(),
            next_delay_ms: initial_delay,
        };

        let thread = thread::Builder::new()
            .name("panlink-session".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Failed to build session runtime: {}", e);
                        return;
                    }
                };
                runtime.block_on(session.run());
            })?;

        Ok(Self {
            commands,
            shutdown,
            state,
            identity,
            track_name,
            settings,
            thread: Some(thread),
        })
    }

    /// Identity used by the next `ConnectionRequest`.
    pub fn set_identity(&self, session_id: impl Into<String>, instance_index: u32) {
        *self.identity.lock() = SessionIdentity {
            session_id: session_id.into(),
            instance_index,
        };
    }

    pub fn identity(&self) -> SessionIdentity {
        self.identity.lock().clone()
    }

    /// Track name carried by settings publishes, without sending anything.
    pub fn set_track_name(&self, track_name: impl Into<String>) {
        *self.track_name.lock() = track_name.into();
    }

    pub fn track_name(&self) -> String {
        self.track_name.lock().clone()
    }

    /// Connect to `endpoint`, dropping any current connection to another one.
    pub fn connect(&self, endpoint: MixerEndpoint) {
        self.command(Command::Connect(endpoint));
    }

    /// Close the connection and stay `Disconnected` until the next `connect`.
    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    /// Publish changed settings. Also becomes the snapshot the next handshake
    /// publishes.
    pub fn update_instance(&self, settings: PannerSettings) {
        self.settings.store(settings);
        self.send(ProtocolMessage::PannerSettingsUpdate {
            settings,
            track_name: self.track_name(),
            is_update: true,
        });
    }

    /// Publish the track name and color. The name is also kept for later
    /// settings publishes.
    pub fn update_track_info(&self, track_name: impl Into<String>, color: impl Into<String>) {
        let track_name = track_name.into();
        self.set_track_name(track_name.clone());
        let instance_index = self.identity.lock().instance_index;
        self.send(ProtocolMessage::TrackNameUpdate {
            instance_index,
            track_name,
            color: color.into(),
        });
    }

    pub fn update_tooltip(&self, message: impl Into<String>, timeout_ms: u32) {
        self.send(ProtocolMessage::TooltipUpdate {
            message: message.into(),
            timeout_ms,
        });
    }

    /// Fire-and-forget send. Before `Ready` the pre-ready policy applies.
    pub fn send(&self, msg: ProtocolMessage) {
        self.command(Command::Send(msg));
    }

    fn command(&self, command: Command) {
        if let Err(e) = self.commands.send(command) {
            debug!("Session loop gone, dropping {:?}", e.0);
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// Close the socket, end the loop and join its thread. Idempotent.
    pub fn stop(&mut self) {
        self.shutdown.send_replace(true);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!("Session thread panicked");
            }
            self.state
                .store(SessionState::Disconnected as u8, Ordering::Release);
        }
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClient")
            .field("state", &self.state())
            .field("identity", &*self.identity.lock())
            .finish()
    }
}

struct SessionLoop {
    config: SessionConfig,
    settings: SettingsHandle,
    updates: Sender<MixerUpdate>,
    state: Arc<AtomicU8>,
    identity: Arc<Mutex<SessionIdentity>>,
    track_name: Arc<Mutex<String>>,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown: watch::Receiver<bool>,
    endpoint: Option<MixerEndpoint>,
    pending: VecDeque<ProtocolMessage>,
    next_delay_ms: u64,
}

impl SessionLoop {
    async fn run(mut self) {
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let endpoint = match self.endpoint.clone() {
                Some(endpoint) => endpoint,
                None => match self.idle(None).await {
                    Wake::Shutdown => break,
                    Wake::Connect(endpoint) => {
                        self.endpoint = Some(endpoint.clone());
                        endpoint
                    }
                    Wake::Idle => continue,
                },
            };

            match self.run_session(&endpoint).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Disconnect => {
                    info!("Disconnected from mixer at {}", endpoint);
                    self.set_state(SessionState::Disconnected);
                    self.endpoint = None;
                    self.pending.clear();
                }
                SessionEnd::Redirect(next) => {
                    info!("Switching mixer from {} to {}", endpoint, next);
                    self.set_state(SessionState::Disconnected);
                    self.endpoint = Some(next);
                    self.reset_backoff();
                }
                SessionEnd::Lost {
                    handshake_completed,
                } => {
                    self.set_state(SessionState::Disconnected);
                    if handshake_completed {
                        self.reset_backoff();
                    }
                    match self.config.reconnect {
                        ReconnectPolicy::Disabled => {
                            info!("Session to {} ended; waiting for connect", endpoint);
                            self.endpoint = None;
                        }
                        ReconnectPolicy::Backoff { max_ms, .. } => {
                            let delay = self.next_delay_ms;
                            self.next_delay_ms = (delay.saturating_mul(2)).min(max_ms);
                            info!("Reconnecting to {} in {}ms", endpoint, delay);
                            match self.idle(Some(Duration::from_millis(delay))).await {
                                Wake::Shutdown => break,
                                Wake::Connect(next) => self.endpoint = Some(next),
                                Wake::Idle => {}
                            }
                        }
                    }
                }
            }
        }

        self.set_state(SessionState::Disconnected);
        debug!("Session loop finished");
    }

    /// Wait while not connected: until `timeout` elapses (if any), a connect
    /// request, or shutdown. Messages arriving meanwhile go through the
    /// pre-ready policy.
    async fn idle(&mut self, timeout: Option<Duration>) -> Wake {
        let sleep = tokio::time::sleep(timeout.unwrap_or(Duration::MAX));
        tokio::pin!(sleep);

        loop {
            let command = tokio::select! {
                _ = self.shutdown.changed() => return Wake::Shutdown,
                _ = &mut sleep, if timeout.is_some() => return Wake::Idle,
                command = self.commands.recv() => command,
            };
            match command {
                None => return Wake::Shutdown,
                Some(Command::Connect(endpoint)) => return Wake::Connect(endpoint),
                Some(Command::Disconnect) => {
                    self.endpoint = None;
                    self.pending.clear();
                    if timeout.is_some() {
                        return Wake::Idle;
                    }
                }
                Some(Command::Send(msg)) => self.hold(msg),
            }
        }
    }

    async fn run_session(&mut self, endpoint: &MixerEndpoint) -> SessionEnd {
        self.set_state(SessionState::Connecting);
        debug!("Connecting to mixer at {}", endpoint);

        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let connect = tokio::time::timeout(
            connect_timeout,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        );
        let stream = tokio::select! {
            _ = self.shutdown.changed() => return SessionEnd::Shutdown,
            result = connect => match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    let e = NetError::ConnectionFailed { addr: endpoint.to_string(), reason: e.to_string() };
                    warn!("{}", e);
                    return SessionEnd::Lost { handshake_completed: false };
                }
                Err(_) => {
                    warn!("Connecting to {} timed out after {:?}", endpoint, connect_timeout);
                    return SessionEnd::Lost { handshake_completed: false };
                }
            },
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed: {}", e);
        }

        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half, self.config.max_frame_len);
        let mut writer = FrameWriter::new(write_half, self.config.max_frame_len);

        let identity = self.identity.lock().clone();
        let request = ProtocolMessage::ConnectionRequest {
            session_id: identity.session_id,
            instance_index: identity.instance_index,
        };
        self.set_state(SessionState::AwaitingAck);
        if let Err(failure) = self.write(&mut writer, &request).await {
            return Self::ended_by(failure, endpoint, false);
        }
        debug!("ConnectionRequest sent, awaiting Ack");

        let mut ready = false;
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => return SessionEnd::Shutdown,
                frame = reader.next_frame() => match frame {
                    Ok(Some(bytes)) => {
                        if let Err(failure) = self.on_frame(&bytes, &mut ready, &mut writer).await {
                            return Self::ended_by(failure, endpoint, ready);
                        }
                    }
                    Ok(None) => {
                        info!("Mixer at {} closed the session", endpoint);
                        return SessionEnd::Lost { handshake_completed: ready };
                    }
                    Err(e) => {
                        warn!("Session to {} lost: {}", endpoint, e);
                        return SessionEnd::Lost { handshake_completed: ready };
                    }
                },
                command = self.commands.recv() => match command {
                    None => return SessionEnd::Shutdown,
                    Some(Command::Disconnect) => return SessionEnd::Disconnect,
                    Some(Command::Connect(next)) => {
                        if next != *endpoint {
                            return SessionEnd::Redirect(next);
                        }
                        debug!("Already connected to {}", endpoint);
                    }
                    Some(Command::Send(msg)) => {
                        if !ready {
                            self.hold(msg);
                        } else if let Err(failure) = self.write(&mut writer, &msg).await {
                            return Self::ended_by(failure, endpoint, true);
                        }
                    }
                },
            }
        }
    }

    /// Send `msg` unless shutdown comes first. A message that can't be framed
    /// is logged and dropped; the connection stays up.
    async fn write(
        &mut self,
        writer: &mut FrameWriter<OwnedWriteHalf>,
        msg: &ProtocolMessage,
    ) -> std::result::Result<(), WriteFailure> {
        let result = tokio::select! {
            _ = self.shutdown.changed() => return Err(WriteFailure::Shutdown),
            result = writer.send(msg) => result,
        };
        match result {
            Ok(()) => Ok(()),
            Err(e @ (NetError::MalformedMessage(_) | NetError::Serialization(_))) => {
                warn!("Dropping outbound {}: {}", msg.kind(), e);
                Ok(())
            }
            Err(e) => Err(WriteFailure::Lost(e)),
        }
    }

    fn ended_by(
        failure: WriteFailure,
        endpoint: &MixerEndpoint,
        handshake_completed: bool,
    ) -> SessionEnd {
        match failure {
            WriteFailure::Shutdown => SessionEnd::Shutdown,
            WriteFailure::Lost(e) => {
                warn!("Writing to mixer at {} failed: {}", endpoint, e);
                SessionEnd::Lost {
                    handshake_completed,
                }
            }
        }
    }

    /// Handle one inbound frame. Errors are write failures; malformed input
    /// is dropped here.
    async fn on_frame(
        &mut self,
        bytes: &[u8],
        ready: &mut bool,
        writer: &mut FrameWriter<OwnedWriteHalf>,
    ) -> std::result::Result<(), WriteFailure> {
        let msg = match ProtocolMessage::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping inbound frame: {}", e);
                return Ok(());
            }
        };

        match msg {
            ProtocolMessage::Ack if !*ready => {
                *ready = true;
                self.set_state(SessionState::Ready);
                self.reset_backoff();
                info!("Handshake complete");

                let publish = ProtocolMessage::PannerSettingsUpdate {
                    settings: self.settings.snapshot(),
                    track_name: self.track_name.lock().clone(),
                    is_update: false,
                };
                self.write(writer, &publish).await?;
                while let Some(queued) = self.pending.pop_front() {
                    self.write(writer, &queued).await?;
                }
            }
            ProtocolMessage::Ack => debug!("Duplicate Ack ignored"),
            ProtocolMessage::ConnectionRequest { .. } => {
                warn!("Unexpected ConnectionRequest from mixer ignored");
            }
            other => {
                let kind = other.kind();
                if let Some(update) = other.into_update() {
                    if self.updates.send(update).is_err() {
                        debug!("No receiver for mixer {}", kind);
                    }
                }
            }
        }
        Ok(())
    }

    fn hold(&mut self, msg: ProtocolMessage) {
        match self.config.pre_ready {
            PreReadyPolicy::Drop => debug!("Dropping {} sent before handshake", msg.kind()),
            PreReadyPolicy::Queue { capacity } => {
                // The handshake publishes the latest snapshot anyway.
                if matches!(msg, ProtocolMessage::PannerSettingsUpdate { .. }) {
                    return;
                }
                if self.pending.len() >= capacity {
                    if let Some(dropped) = self.pending.pop_front() {
                        warn!("Pre-handshake queue full, dropped {}", dropped.kind());
                    }
                }
                self.pending.push_back(msg);
            }
        }
    }

    fn reset_backoff(&mut self) {
        if let ReconnectPolicy::Backoff { initial_ms, .. } = self.config.reconnect {
            self.next_delay_ms = initial_ms;
        }
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }
}
