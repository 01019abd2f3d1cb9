//! Core traits for the protocol client and session storage.

use std::{path::Path, str::FromStr, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{PairingContext, ProtocolEvent, QrItem};

/// Session identifier.
pub type SessionId = Uuid;

/// Callback registered with a protocol client.
///
/// Clients invoke it on their own delivery task, possibly from several
/// threads at once.
pub type EventHandler = Arc<dyn Fn(ProtocolEvent) + Send + Sync>;

/// Protocol client error.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Device store unavailable: {0}")]
    Store(String),
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("QR channel unavailable: {0}")]
    QrChannel(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Messaging protocol client bound to one device store.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Open the transport. Returns once the socket is up, pairing may still be pending.
    async fn connect(&self) -> Result<(), ProtocolError>;

    /// Close the transport. Safe to call on a closed client.
    async fn disconnect(&self);

    /// Whether the transport currently reports a live connection.
    fn is_connected(&self) -> bool;

    /// Open the raw QR event stream for an unpaired device.
    ///
    /// Must be requested before `connect` for the first code to be observed.
    async fn qr_channel(&self, ctx: &PairingContext)
    -> Result<mpsc::Receiver<QrItem>, ProtocolError>;

    /// Subscribe to protocol events.
    fn on_event(&self, handler: EventHandler);
}

/// Creates protocol clients bound to a per-session store file.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Client type produced by this factory.
    type Client: ProtocolClient + 'static;

    /// Bootstrap a fresh device store at `store_path` and return a client for it.
    async fn open(&self, store_path: &Path) -> Result<Self::Client, ProtocolError>;
}

/// Session status as persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Pairing has not completed.
    Pending,
    /// Remote device confirmed pairing.
    Paired,
    /// Authenticated and connected.
    Connected,
    /// Connection dropped.
    Disconnected,
    /// Remote party revoked the session.
    LoggedOut,
}

impl SessionStatus {
    /// Storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paired => "paired",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::LoggedOut => "logged_out",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "paired" => Ok(Self::Paired),
            "connected" => Ok(Self::Connected),
            "disconnected" => Ok(Self::Disconnected),
            "logged_out" => Ok(Self::LoggedOut),
            other => Err(StorageError::Internal(format!("unknown session status: {other}"))),
        }
    }
}

/// Account identity reported once pairing succeeds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Protocol-level address of the paired device.
    pub remote_id: String,
    /// Phone number of the paired account.
    pub phone_number: String,
}

/// Aggregate counters kept per session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub contacts: u32,
    pub groups: u32,
    pub conversations: u32,
}

/// Persisted session data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Unique session identifier.
    pub id: SessionId,
    /// Display name, may be empty.
    pub name: String,
    /// Remote device address.
    pub remote_id: String,
    /// Phone number, may be empty.
    pub phone_number: String,
    /// Current status.
    pub status: SessionStatus,
    /// Latest counters.
    pub stats: SessionStats,
    /// First connection (Unix epoch seconds).
    pub connected_at: i64,
    /// Last activity (Unix epoch seconds).
    pub last_active: i64,
    /// Creation timestamp (Unix epoch seconds).
    pub created_at: i64,
}

impl SessionRecord {
    /// Phone number, or a placeholder when unknown.
    #[must_use]
    pub fn formatted_phone(&self) -> &str {
        if self.phone_number.is_empty() {
            "unavailable"
        } else {
            &self.phone_number
        }
    }

    /// Name to show for this session.
    #[must_use]
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("Session ({})", self.formatted_phone())
        } else {
            self.name.clone()
        }
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self.status, SessionStatus::Connected | SessionStatus::Paired)
    }
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Trait for session storage backends.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Upsert a connected session.
    ///
    /// Empty `remote_id` or `phone_number` keep the values already stored.
    async fn save_session(
        &self,
        id: SessionId,
        display_name: &str,
        remote_id: &str,
        phone_number: &str,
    ) -> Result<(), StorageError>;

    /// Replace the counters of a stored session.
    async fn update_session_stats(
        &self,
        id: SessionId,
        stats: SessionStats,
    ) -> Result<(), StorageError>;

    /// Get a session by ID.
    async fn get_session(&self, id: SessionId) -> Result<Option<SessionRecord>, StorageError>;

    /// Connected sessions, most recently connected first.
    async fn list_sessions(&self) -> Result<Vec<SessionRecord>, StorageError>;

    /// Delete a session. Returns whether a record existed.
    async fn delete_session(&self, id: SessionId) -> Result<bool, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, phone: &str, status: SessionStatus) -> SessionRecord {
        SessionRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            remote_id: String::new(),
            phone_number: phone.to_string(),
            status,
            stats: SessionStats::default(),
            connected_at: 0,
            last_active: 0,
            created_at: 0,
        }
    }

    #[test]
    fn test_display_name_fallbacks() {
        assert_eq!(record("Sales", "", SessionStatus::Connected).display_name(), "Sales");
        assert_eq!(
            record("", "5511999", SessionStatus::Connected).display_name(),
            "Session (5511999)"
        );
        assert_eq!(
            record("", "", SessionStatus::Pending).display_name(),
            "Session (unavailable)"
        );
    }

    #[test]
    fn test_is_active() {
        assert!(record("", "", SessionStatus::Connected).is_active());
        assert!(record("", "", SessionStatus::Paired).is_active());
        assert!(!record("", "", SessionStatus::LoggedOut).is_active());
        assert!(!record("", "", SessionStatus::Pending).is_active());
    }

    #[test]
    fn test_unknown_status_rejected() {
        assert_eq!(
            "logged_out".parse::<SessionStatus>().unwrap(),
            SessionStatus::LoggedOut
        );
        assert!("revoked".parse::<SessionStatus>().is_err());
    }
}
