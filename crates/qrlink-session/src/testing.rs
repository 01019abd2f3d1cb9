//! Shared test fixtures.

use std::sync::Arc;

use qrlink_core::{
    SessionConfig,
    sim::{SimScript, SimulatedFactory},
};
use tempfile::TempDir;

use crate::{manager::SessionManager, storage::MemoryStorage};

pub(crate) type TestManager = Arc<SessionManager<SimulatedFactory, MemoryStorage>>;

/// Manager over simulated clients with default behavior.
pub(crate) fn manager() -> (TempDir, TestManager) {
    manager_with(SimScript::default())
}

/// Manager over simulated clients following `script`.
///
/// Session stores live in the returned directory; keep it alive.
pub(crate) fn manager_with(script: SimScript) -> (TempDir, TestManager) {
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig::default().with_sessions_dir(dir.path());
    let manager = SessionManager::new(SimulatedFactory::new(script), MemoryStorage::new(), config);
    (dir, manager)
}
