//! Session registry, pairing flow and storage for QR-paired protocol sessions.
//!
//! Provides:
//! - `SessionManager` - Registry of live session handles
//! - `SessionHandle` - One connection attempt and its state machine
//! - Pairing flow delivering one QR code per attempt
//! - Cleanup of sessions that never finish pairing
//! - Storage implementations (memory, SQLite)

pub mod artifacts;
mod cleanup;
pub mod handle;
pub mod manager;
pub mod pairing;
mod relay;
pub mod storage;

#[cfg(test)]
mod testing;

pub use artifacts::ArtifactDir;
pub use handle::{ConnectionState, SessionHandle};
pub use manager::{ManagerError, SessionManager};
pub use pairing::PairingCode;
