//! Core types for the peer mesh

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Process-wide identity of a mesh participant.
///
/// Drawn once per process from a large random space. Numeric ordering is the
/// only input to election tie-breaking; collisions are not handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u64);

impl PeerId {
    /// Generate a fresh random id using the thread RNG
    pub fn random() -> Self {
        Self::random_with(&mut rand::thread_rng())
    }

    /// Generate a random id from the given source.
    ///
    /// Values stay within the positive `i64` range so they survive any peer
    /// that reads the envelope's sender as a signed 64-bit integer.
    pub fn random_with<R: Rng + ?Sized>(rng: &mut R) -> Self {
        PeerId(rng.gen_range(1..=i64::MAX as u64))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PeerId {
    fn from(v: u64) -> Self {
        PeerId(v)
    }
}

/// Opaque link-layer connection identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerHandle(String);

impl PeerHandle {
    pub fn new(id: impl Into<String>) -> Self {
        PeerHandle(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerHandle {
    fn from(s: &str) -> Self {
        PeerHandle(s.to_string())
    }
}

/// Mesh-wide formation state of this process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MeshState {
    /// Looking for peers, formation timer running
    #[default]
    Discovering,
    /// Bully election in flight
    Electing,
    /// Coordinator known, shared-space bootstrap not yet confirmed
    Resolving,
    /// Coordinator known and synchronized
    Connected,
}

impl fmt::Display for MeshState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshState::Discovering => write!(f, "DISCOVERING"),
            MeshState::Electing => write!(f, "ELECTING"),
            MeshState::Resolving => write!(f, "RESOLVING"),
            MeshState::Connected => write!(f, "CONNECTED"),
        }
    }
}

/// Application-facing handle for one send request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryId(pub u64);

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which simulated transport a send goes through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    Reliable,
    Unreliable,
}

/// Why a delivery ended in FAILED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// No ACK after the whole retransmission budget
    RetriesExhausted { frames_sent: u32 },
    /// Destination disconnected while the delivery was outstanding
    PeerLost,
    /// Destination has no handshake-confirmed connection
    UnknownPeer,
    /// Medium-access simulation gave up after too many collisions
    MediumBusy { attempts: u32 },
    /// Link layer refused the frame
    LinkError,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::RetriesExhausted { frames_sent } => {
                write!(f, "no ack after {} frames", frames_sent)
            }
            FailureReason::PeerLost => write!(f, "peer lost"),
            FailureReason::UnknownPeer => write!(f, "unknown peer"),
            FailureReason::MediumBusy { attempts } => {
                write!(f, "medium busy after {} attempts", attempts)
            }
            FailureReason::LinkError => write!(f, "link error"),
        }
    }
}

/// Status transitions surfaced for each delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    /// Waiting for medium access or for the first ACK
    InProgress,
    /// Retransmission number `attempt` went out
    Retrying { attempt: u32 },
    /// Reliable frame acknowledged
    Delivered { rtt: Duration },
    /// Terminal failure
    Failed { reason: FailureReason },
    /// Unreliable frame handed to the link layer
    Sent,
}

impl DeliveryStatus {
    /// Whether no further transitions follow this one
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryStatus::Delivered { .. }
                | DeliveryStatus::Failed { .. }
                | DeliveryStatus::Sent
        )
    }
}

/// Position (and optionally orientation quaternion) of a peer device
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: [f32; 3],
    pub orientation: Option<[f32; 4]>,
}

impl Pose {
    pub fn position(x: f32, y: f32, z: f32) -> Self {
        Self {
            position: [x, y, z],
            orientation: None,
        }
    }

    pub fn with_orientation(mut self, q: [f32; 4]) -> Self {
        self.orientation = Some(q);
        self
    }
}

/// Human-facing metadata a peer advertises after handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub display_name: String,
    pub device_model: String,
}

/// Read-only view of a peer record for collaborators
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerSummary {
    pub handle: PeerHandle,
    pub peer_id: PeerId,
    pub device: Option<DeviceInfo>,
    pub pose: Option<Pose>,
    pub last_seen: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_peer_id_ordering_is_numeric() {
        let mut ids = vec![PeerId(50), PeerId(10), PeerId(30)];
        ids.sort();
        assert_eq!(ids, vec![PeerId(10), PeerId(30), PeerId(50)]);
        assert_eq!(ids.iter().max(), Some(&PeerId(50)));
    }

    #[test]
    fn test_random_peer_id_fits_signed_range() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            let id = PeerId::random_with(&mut rng);
            assert!(id.0 >= 1);
            assert!(id.0 <= i64::MAX as u64);
        }
    }

    #[test]
    fn test_mesh_state_serialization() {
        let json = serde_json::to_string(&MeshState::Electing).unwrap();
        assert_eq!(json, "\"ELECTING\"");
        assert_eq!(MeshState::default(), MeshState::Discovering);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!DeliveryStatus::InProgress.is_terminal());
        assert!(!DeliveryStatus::Retrying { attempt: 1 }.is_terminal());
        assert!(DeliveryStatus::Sent.is_terminal());
        assert!(DeliveryStatus::Failed {
            reason: FailureReason::PeerLost
        }
        .is_terminal());
    }
}
