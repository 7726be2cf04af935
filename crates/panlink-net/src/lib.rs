//! Network side of PanLink: finding the external mixer and talking to it.
//!
//! - [`DiscoveryListener`] - joins the mixer's multicast group and reports
//!   announced endpoints
//! - [`SessionClient`] - one TCP session: handshake, settings publish,
//!   fire-and-forget updates, reconnect with backoff
//! - [`ProtocolMessage`] - the closed set of messages on the wire

pub mod error;
pub use error::{DiscoveryError, NetError, Result};

pub mod protocol;
pub use protocol::{MixerUpdate, ProtocolMessage};

mod transport;
pub use transport::{FrameReader, FrameWriter};

mod discovery;
pub use discovery::{parse_announcement, DiscoveryListener, EndpointCallback, MixerEndpoint};

mod session;
pub use session::{SessionClient, SessionIdentity, SessionState};
