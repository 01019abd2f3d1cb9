//! Runtime configuration.

use std::{path::PathBuf, time::Duration};

use thiserror::Error;

/// Grace period before an unpaired session is removed.
pub const DEFAULT_CLEANUP_GRACE: Duration = Duration::from_secs(120);
/// How long a pairing attempt waits for a code.
pub const DEFAULT_QR_TIMEOUT: Duration = Duration::from_secs(120);
/// Connection confirmation polls after `connect`.
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 10;
/// Interval between connection confirmation polls.
pub const DEFAULT_CONNECT_POLL_INTERVAL: Duration = Duration::from_secs(1);

const DEFAULT_PORT: u16 = 8080;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
    #[error("Home directory could not be determined")]
    NoHomeDir,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tunables of the session lifecycle manager.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Directory holding one device store file per session.
    pub sessions_dir: PathBuf,
    /// Unpaired sessions are removed after this long.
    pub cleanup_grace: Duration,
    /// Deadline of a pairing attempt.
    pub qr_timeout: Duration,
    /// Number of connection confirmation polls.
    pub connect_attempts: u32,
    /// Delay between confirmation polls.
    pub connect_poll_interval: Duration,
    /// Name persisted for connected sessions.
    pub display_name: String,
    /// Events retained by the session feed.
    pub feed_history: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sessions_dir: PathBuf::from("storage/sessions"),
            cleanup_grace: DEFAULT_CLEANUP_GRACE,
            qr_timeout: DEFAULT_QR_TIMEOUT,
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            connect_poll_interval: DEFAULT_CONNECT_POLL_INTERVAL,
            display_name: "WhatsApp".to_string(),
            feed_history: crate::feed::DEFAULT_HISTORY,
        }
    }
}

impl SessionConfig {
    /// Override the sessions directory.
    #[must_use]
    pub fn with_sessions_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.sessions_dir = dir.into();
        self
    }

    /// Override the cleanup grace period.
    #[must_use]
    pub const fn with_cleanup_grace(mut self, grace: Duration) -> Self {
        self.cleanup_grace = grace;
        self
    }

    /// Override the pairing deadline.
    #[must_use]
    pub const fn with_qr_timeout(mut self, timeout: Duration) -> Self {
        self.qr_timeout = timeout;
        self
    }

    /// Override connection confirmation polling.
    #[must_use]
    pub const fn with_connect_polling(mut self, attempts: u32, interval: Duration) -> Self {
        self.connect_attempts = attempts;
        self.connect_poll_interval = interval;
        self
    }
}

/// Application configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct PanelConfig {
    /// HTTP port.
    pub port: u16,
    /// Root directory for all state.
    pub store_dir: PathBuf,
    /// Path of the session metadata database.
    pub database_path: PathBuf,
    /// Session manager tunables.
    pub session: SessionConfig,
}

impl PanelConfig {
    /// Load from `.env` and the process environment, creating `store_dir`.
    ///
    /// # Errors
    /// Returns error if a value is malformed or the directory cannot be created.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Missing .env is fine.
        let _ = dotenvy::dotenv();
        let config = Self::from_lookup(|key| std::env::var(key).ok())?;
        std::fs::create_dir_all(&config.store_dir)?;
        std::fs::create_dir_all(&config.session.sessions_dir)?;
        Ok(config)
    }

    /// Build from an arbitrary key lookup without touching the filesystem.
    ///
    /// Recognized keys: `STORE_DIR`, `DB_PATH`, `PORT`,
    /// `QRLINK_CLEANUP_SECS`, `QRLINK_QR_TIMEOUT_SECS`.
    ///
    /// # Errors
    /// Returns error if a numeric value is malformed or no home directory exists.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let store_dir = match get("STORE_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir()
                .ok_or(ConfigError::NoHomeDir)?
                .join(".qrlink"),
        };

        let database_path = get("DB_PATH")
            .map_or_else(|| store_dir.join("sessions.db"), PathBuf::from);

        let port = match get("PORT") {
            Some(value) => parse_number("PORT", &value)?,
            None => DEFAULT_PORT,
        };

        let mut session = SessionConfig::default().with_sessions_dir(store_dir.join("sessions"));
        if let Some(value) = get("QRLINK_CLEANUP_SECS") {
            session.cleanup_grace = Duration::from_secs(parse_number("QRLINK_CLEANUP_SECS", &value)?);
        }
        if let Some(value) = get("QRLINK_QR_TIMEOUT_SECS") {
            session.qr_timeout =
                Duration::from_secs(parse_number("QRLINK_QR_TIMEOUT_SECS", &value)?);
        }

        Ok(Self {
            port,
            store_dir,
            database_path,
            session,
        })
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}
