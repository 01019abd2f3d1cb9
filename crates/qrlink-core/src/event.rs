//! Protocol events and the simplified session event vocabulary.

use serde::Serialize;

use crate::traits::{DeviceIdentity, SessionId};

/// Event delivered by a protocol client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    /// Authenticated session established.
    Connected,
    /// Transport dropped.
    Disconnected,
    /// Remote party revoked the session.
    LoggedOut { reason: Option<String> },
    /// Remote device confirmed the pairing code.
    PairSuccess(DeviceIdentity),
    /// Incoming message.
    Message { chat: String, sender: String },
    /// Contact list synchronized.
    ContactsSynced { count: u32 },
    /// Group list synchronized.
    GroupsSynced { count: u32 },
    /// A QR code was rendered by the client.
    QrShown,
    /// Server rejected the connection.
    ConnectFailure { reason: String },
    /// Client version no longer accepted by the server.
    ClientOutdated,
    /// Anything else, by protocol event name.
    Other(String),
}

impl ProtocolEvent {
    /// Short name used in logs.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::LoggedOut { .. } => "logged_out",
            Self::PairSuccess(_) => "pair_success",
            Self::Message { .. } => "message",
            Self::ContactsSynced { .. } => "contacts_synced",
            Self::GroupsSynced { .. } => "groups_synced",
            Self::QrShown => "qr",
            Self::ConnectFailure { .. } => "connect_failure",
            Self::ClientOutdated => "client_outdated",
            Self::Other(kind) => kind.as_str(),
        }
    }
}

/// Kind of item on a raw QR channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QrEvent {
    /// A pairing code to display.
    Code,
    /// Pairing completed, the channel closes after this.
    Success,
    /// Codes exhausted without a scan.
    Timeout,
    /// Any other terminal or informational kind.
    Other(String),
}

impl QrEvent {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Code => "code",
            Self::Success => "success",
            Self::Timeout => "timeout",
            Self::Other(kind) => kind.as_str(),
        }
    }
}

impl From<&str> for QrEvent {
    fn from(s: &str) -> Self {
        match s {
            "code" => Self::Code,
            "success" => Self::Success,
            "timeout" => Self::Timeout,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Item read from a raw QR channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrItem {
    pub event: QrEvent,
    /// Code text, empty for non-code events.
    pub code: String,
}

impl QrItem {
    /// A pairing code item.
    #[must_use]
    pub fn code(code: impl Into<String>) -> Self {
        Self {
            event: QrEvent::Code,
            code: code.into(),
        }
    }

    /// A non-code item.
    #[must_use]
    pub const fn signal(event: QrEvent) -> Self {
        Self {
            event,
            code: String::new(),
        }
    }
}

/// Lifecycle notification published on the session feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEventKind {
    /// Handle registered.
    Created,
    /// Connect issued.
    Connecting,
    /// Connectivity flag went false to true.
    Connected,
    /// Connectivity flag went true to false.
    Disconnected,
    /// Remote party revoked the session.
    LoggedOut,
    /// Pairing code forwarded to the consumer.
    QrCode { code: String },
    /// Handle removed from the registry.
    Removed,
}

impl SessionEventKind {
    /// Name used as the SSE event type.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::LoggedOut => "logged_out",
            Self::QrCode { .. } => "qr_code",
            Self::Removed => "removed",
        }
    }
}

/// Session event with its session id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionEvent {
    pub session_id: SessionId,
    #[serde(flatten)]
    pub kind: SessionEventKind,
}

impl SessionEvent {
    /// Convert to an SSE event (requires `sse` feature).
    #[cfg(feature = "sse")]
    #[must_use]
    pub fn to_sse_event(&self) -> axum::response::sse::Event {
        let data = serde_json::to_string(self).unwrap_or_default();
        axum::response::sse::Event::default()
            .event(self.kind.name())
            .data(data)
    }
}
