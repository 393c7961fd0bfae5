//! Registry of currently connected, identified devices
//!
//! Maps a [`DeviceId`] to its live [`DeviceSession`]. Entries are added
//! only after a device passes the identification handshake and removed on
//! hot-plug removal or rejection — both done exclusively by the discovery
//! agent (`insert`/`remove` are crate-private). Everyone else gets
//! lookup-only access, so no cross-device locking is ever needed beyond
//! this one map.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::session::DeviceSession;
use crate::types::DeviceId;

/// Process-wide view of connected signing devices.
///
/// Explicitly owned and shared (`Arc<DeviceRegistry>`), not a global.
#[derive(Default)]
pub struct DeviceRegistry {
    sessions: RwLock<HashMap<DeviceId, DeviceSession>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the live session for a device, if still connected.
    pub fn get(&self, id: &DeviceId) -> Option<DeviceSession> {
        self.sessions.read().get(id).cloned()
    }

    /// Identifiers of all currently connected devices.
    pub fn ids(&self) -> Vec<DeviceId> {
        self.sessions.read().keys().cloned().collect()
    }

    /// All currently live sessions, in no particular order.
    pub fn sessions(&self) -> Vec<DeviceSession> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Publish an identified device. Discovery agent only.
    pub(crate) fn insert(&self, id: DeviceId, session: DeviceSession) {
        self.sessions.write().insert(id, session);
    }

    /// Withdraw a device. Returns the removed session, `None` if the
    /// identifier was unknown (repeat removals are no-ops).
    pub(crate) fn remove(&self, id: &DeviceId) -> Option<DeviceSession> {
        self.sessions.write().remove(id)
    }
}
