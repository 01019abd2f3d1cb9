//! Core abstractions for QR-paired protocol sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `ProtocolClient` / `ClientFactory` - the messaging protocol seam
//! - `SessionStore` - persistence of paired sessions
//! - `SessionFeed` - Broadcast + history of session lifecycle events
//! - `PairingContext` - Deadline and cancellation for pairing attempts
//! - `PanelConfig` / `SessionConfig` - Runtime configuration

pub mod config;
pub mod context;
pub mod event;
pub mod feed;
#[cfg(feature = "sim")]
pub mod sim;
pub mod traits;

pub use config::{PanelConfig, SessionConfig};
pub use context::PairingContext;
pub use event::{ProtocolEvent, QrEvent, QrItem, SessionEvent, SessionEventKind};
pub use feed::SessionFeed;
pub use traits::{ClientFactory, ProtocolClient, SessionStore};
