//! Named shared memory for PanLink.
//!
//! - [`SharedMemoryChannel`] - header + byte ring passing audio blocks,
//!   transport state and settings snapshots to a helper process
//! - [`InstanceRegistry`] - per-group instance counter and shared session id
//!
//! Both sit on file-backed mappings in a directory every cooperating process
//! resolves the same way (see [`resolve_directory`]).

pub mod error;
pub use error::{Result, ShmError};

mod channel;
pub use channel::{AudioFormat, ChannelStats, SharedMemoryChannel};

pub mod header;
pub use header::{AudioBufferHeader, SharedMemoryHeader};

mod registry;
pub use registry::InstanceRegistry;

mod segment;
pub use segment::{resolve_directory, segment_path, SHM_DIR_ENV};
