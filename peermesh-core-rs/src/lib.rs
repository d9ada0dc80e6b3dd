//! Peer Mesh Core Library
//!
//! Coordination core for a small ad-hoc mesh of co-located devices.
//! Elects a coordinator with the Bully algorithm over a pluggable
//! point-to-point link layer and simulates reliable, unreliable and
//! CSMA/CD-gated delivery on top of it.

pub mod types;
pub mod error;
pub mod config;
pub mod protocol;
pub mod registry;
pub mod election;
pub mod transport;
pub mod csma;
pub mod timer;
pub mod link;
pub mod memory;
pub mod node;

pub use types::*;
pub use error::{CodecError, ConfigError, LinkError, MeshError};
pub use config::{BootstrapConfig, CsmaConfig, ElectionConfig, MeshConfig, TransportConfig};
pub use protocol::{MeshMessage, MessageType, ReliableFrame};
pub use registry::PeerRegistry;
pub use election::{ElectionEffect, ElectionEngine, ElectionTimer};
pub use transport::{RttSummary, SimTransport};
pub use csma::{CsmaPhase, CsmaSimulator, CsmaSnapshot};
pub use link::{link_channel, LinkEvent, LinkEventSink, LinkLayer};
pub use memory::{MemoryLink, MemoryNetwork, NetworkStats, WireFrame};
pub use node::{MeshHandle, MeshNode, MeshNotification, MeshSnapshot};
