//! Peer registry: connections, negotiated identities and liveness

use crate::types::{DeviceInfo, PeerHandle, PeerId, PeerSummary, Pose};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// One link-layer connection and what we know about the peer behind it
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub handle: PeerHandle,
    /// Set once a HANDSHAKE arrives on this handle
    pub peer_id: Option<PeerId>,
    pub device: Option<DeviceInfo>,
    pub pose: Option<Pose>,
    pub last_seen: DateTime<Utc>,
}

impl PeerRecord {
    fn new(handle: PeerHandle) -> Self {
        Self {
            handle,
            peer_id: None,
            device: None,
            pose: None,
            last_seen: Utc::now(),
        }
    }

    fn summary(&self) -> Option<PeerSummary> {
        Some(PeerSummary {
            handle: self.handle.clone(),
            peer_id: self.peer_id?,
            device: self.device.clone(),
            pose: self.pose,
            last_seen: self.last_seen,
        })
    }
}

/// Result of applying a HANDSHAKE
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Identity recorded for the handle
    Confirmed {
        /// Id previously bound to this handle, if it re-handshook
        previous: Option<PeerId>,
        /// Another handle that had claimed the same id and was unbound
        displaced: Option<PeerHandle>,
    },
    /// No connection is known for the handle
    UnknownHandle,
}

/// Registry of connected peers.
///
/// Invariants: at most one record per handle, at most one confirmed record
/// per peer id.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    records: HashMap<PeerHandle, PeerRecord>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new connection. Returns false if the handle was already known.
    pub fn on_peer_connected(&mut self, handle: PeerHandle) -> bool {
        if let Some(record) = self.records.get_mut(&handle) {
            debug!("Registry: Duplicate connect for {}", handle);
            record.last_seen = Utc::now();
            return false;
        }

        info!("Registry: Connected {}", handle);
        self.records.insert(handle.clone(), PeerRecord::new(handle));
        true
    }

    /// Forget a connection, returning what was known about it
    pub fn on_peer_disconnected(&mut self, handle: &PeerHandle) -> Option<PeerRecord> {
        let removed = self.records.remove(handle);
        match &removed {
            Some(record) => info!(
                "Registry: Disconnected {} (peer {})",
                handle,
                record
                    .peer_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "unconfirmed".to_string())
            ),
            None => debug!("Registry: Disconnect for unknown handle {}", handle),
        }
        removed
    }

    /// Bind a peer id to a handle. A later handshake overwrites an earlier one.
    pub fn on_handshake(&mut self, handle: &PeerHandle, peer_id: PeerId) -> HandshakeOutcome {
        if !self.records.contains_key(handle) {
            debug!("Registry: Handshake from unknown handle {}", handle);
            return HandshakeOutcome::UnknownHandle;
        }

        let displaced = self
            .records
            .values_mut()
            .find(|r| r.peer_id == Some(peer_id) && &r.handle != handle)
            .map(|stale| {
                warn!(
                    "Registry: Peer {} moved from {} to {}",
                    peer_id, stale.handle, handle
                );
                stale.peer_id = None;
                stale.handle.clone()
            });

        let Some(record) = self.records.get_mut(handle) else {
            return HandshakeOutcome::UnknownHandle;
        };
        let previous = record.peer_id.replace(peer_id);
        record.last_seen = Utc::now();

        match previous {
            Some(old) if old != peer_id => {
                warn!("Registry: {} re-handshook as {} (was {})", handle, peer_id, old)
            }
            Some(_) => debug!("Registry: {} repeated handshake as {}", handle, peer_id),
            None => info!("Registry: {} confirmed as peer {}", handle, peer_id),
        }

        HandshakeOutcome::Confirmed {
            previous,
            displaced,
        }
    }

    /// Refresh liveness for any frame received on the handle
    pub fn touch(&mut self, handle: &PeerHandle) {
        if let Some(record) = self.records.get_mut(handle) {
            record.last_seen = Utc::now();
        }
    }

    pub fn update_pose(&mut self, peer_id: PeerId, pose: Pose) -> bool {
        match self.record_for_mut(peer_id) {
            Some(record) => {
                record.pose = Some(pose);
                true
            }
            None => false,
        }
    }

    pub fn update_device_info(&mut self, peer_id: PeerId, info: DeviceInfo) -> bool {
        match self.record_for_mut(peer_id) {
            Some(record) => {
                debug!(
                    "Registry: Peer {} is \"{}\" ({})",
                    peer_id, info.display_name, info.device_model
                );
                record.device = Some(info);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, handle: &PeerHandle) -> Option<&PeerRecord> {
        self.records.get(handle)
    }

    pub fn peer_id_for(&self, handle: &PeerHandle) -> Option<PeerId> {
        self.records.get(handle).and_then(|r| r.peer_id)
    }

    pub fn handle_for(&self, peer_id: PeerId) -> Option<&PeerHandle> {
        self.records
            .values()
            .find(|r| r.peer_id == Some(peer_id))
            .map(|r| &r.handle)
    }

    pub fn is_confirmed(&self, peer_id: PeerId) -> bool {
        self.handle_for(peer_id).is_some()
    }

    /// Ids of all handshake-confirmed peers, ascending
    pub fn confirmed_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.records.values().filter_map(|r| r.peer_id).collect();
        ids.sort();
        ids
    }

    /// Snapshot of all handshake-confirmed peers, ordered by id
    pub fn records_with_confirmed_id(&self) -> Vec<PeerSummary> {
        let mut peers: Vec<PeerSummary> = self.records.values().filter_map(PeerRecord::summary).collect();
        peers.sort_by_key(|p| p.peer_id);
        peers
    }

    pub fn confirmed_count(&self) -> usize {
        self.records.values().filter(|r| r.peer_id.is_some()).count()
    }

    /// Number of connections, confirmed or not
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    fn record_for_mut(&mut self, peer_id: PeerId) -> Option<&mut PeerRecord> {
        self.records.values_mut().find(|r| r.peer_id == Some(peer_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(s: &str) -> PeerHandle {
        PeerHandle::from(s)
    }

    #[test]
    fn test_connect_creates_unconfirmed_record() {
        let mut registry = PeerRegistry::new();
        assert!(registry.on_peer_connected(h("ep-1")));
        assert!(!registry.on_peer_connected(h("ep-1")));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.confirmed_count(), 0);
        assert!(registry.peer_id_for(&h("ep-1")).is_none());
    }

    #[test]
    fn test_handshake_confirms_peer() {
        let mut registry = PeerRegistry::new();
        registry.on_peer_connected(h("ep-1"));

        let outcome = registry.on_handshake(&h("ep-1"), PeerId(10));
        assert_eq!(
            outcome,
            HandshakeOutcome::Confirmed {
                previous: None,
                displaced: None
            }
        );
        assert_eq!(registry.handle_for(PeerId(10)), Some(&h("ep-1")));
        assert_eq!(registry.confirmed_ids(), vec![PeerId(10)]);
    }

    #[test]
    fn test_rehandshake_overwrites() {
        let mut registry = PeerRegistry::new();
        registry.on_peer_connected(h("ep-1"));
        registry.on_handshake(&h("ep-1"), PeerId(10));

        let outcome = registry.on_handshake(&h("ep-1"), PeerId(11));
        assert!(matches!(
            outcome,
            HandshakeOutcome::Confirmed {
                previous: Some(PeerId(10)),
                ..
            }
        ));
        assert!(!registry.is_confirmed(PeerId(10)));
        assert_eq!(registry.peer_id_for(&h("ep-1")), Some(PeerId(11)));
    }

    #[test]
    fn test_same_id_on_two_handles_keeps_latest() {
        let mut registry = PeerRegistry::new();
        registry.on_peer_connected(h("ep-1"));
        registry.on_peer_connected(h("ep-2"));
        registry.on_handshake(&h("ep-1"), PeerId(10));

        let outcome = registry.on_handshake(&h("ep-2"), PeerId(10));
        assert_eq!(
            outcome,
            HandshakeOutcome::Confirmed {
                previous: None,
                displaced: Some(h("ep-1"))
            }
        );
        assert_eq!(registry.confirmed_count(), 1);
        assert_eq!(registry.handle_for(PeerId(10)), Some(&h("ep-2")));
    }

    #[test]
    fn test_handshake_unknown_handle() {
        let mut registry = PeerRegistry::new();
        assert_eq!(
            registry.on_handshake(&h("ghost"), PeerId(1)),
            HandshakeOutcome::UnknownHandle
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_disconnect_removes_record() {
        let mut registry = PeerRegistry::new();
        registry.on_peer_connected(h("ep-1"));
        registry.on_handshake(&h("ep-1"), PeerId(10));

        let removed = registry.on_peer_disconnected(&h("ep-1")).unwrap();
        assert_eq!(removed.peer_id, Some(PeerId(10)));
        assert!(registry.is_empty());
        assert!(registry.on_peer_disconnected(&h("ep-1")).is_none());
    }

    #[test]
    fn test_metadata_updates_require_confirmed_id() {
        let mut registry = PeerRegistry::new();
        registry.on_peer_connected(h("ep-1"));

        let pose = Pose::position(1.0, 2.0, 3.0);
        assert!(!registry.update_pose(PeerId(10), pose));

        registry.on_handshake(&h("ep-1"), PeerId(10));
        assert!(registry.update_pose(PeerId(10), pose));
        assert!(registry.update_device_info(
            PeerId(10),
            DeviceInfo {
                display_name: "alpha".to_string(),
                device_model: "Pixel".to_string(),
            }
        ));

        let peers = registry.records_with_confirmed_id();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].pose, Some(pose));
        assert_eq!(peers[0].device.as_ref().unwrap().display_name, "alpha");
    }
}
