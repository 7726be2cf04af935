//! Integration test modules for PanLink
//!
//! - shared_memory: writer/reader handles on one segment
//! - registry: concurrent joins, session id sharing, teardown
//! - session: mock-mixer handshake and reconnect
//! - orchestrator: registry + session through `ConnectionOrchestrator`

pub mod orchestrator;
pub mod registry;
pub mod session;
pub mod shared_memory;
