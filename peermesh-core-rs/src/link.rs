//! Link layer seam
//!
//! The mesh consumes an external point-to-point link layer that discovers
//! peers, keeps byte-oriented connections and reports what happens to
//! them. Implementations report events through a [`LinkEventSink`]; the
//! node drains them on its own serialized loop.

use crate::error::LinkError;
use crate::types::PeerHandle;
use tokio::sync::mpsc;

/// Something the link layer observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    ConnectionEstablished(PeerHandle),
    ConnectionLost(PeerHandle),
    FrameReceived(PeerHandle, Vec<u8>),
}

/// Operations the mesh needs from a link layer.
///
/// Sends are non-blocking hand-offs; delivery is best effort.
pub trait LinkLayer: Send + 'static {
    fn start_discovery_and_advertising(&mut self) -> Result<(), LinkError>;

    fn stop_discovery(&mut self) -> Result<(), LinkError>;

    /// Send one frame to a connected handle
    fn send_message(&mut self, handle: &PeerHandle, bytes: Vec<u8>) -> Result<(), LinkError>;

    /// Send one frame to every connected handle
    fn broadcast_message(&mut self, bytes: Vec<u8>) -> Result<(), LinkError>;
}

/// Where a link layer posts its events
#[derive(Debug, Clone)]
pub struct LinkEventSink {
    tx: mpsc::UnboundedSender<LinkEvent>,
}

/// Create a sink and the receiver a mesh node drains
pub fn link_channel() -> (LinkEventSink, mpsc::UnboundedReceiver<LinkEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (LinkEventSink { tx }, rx)
}

impl LinkEventSink {
    pub fn post(&self, event: LinkEvent) -> Result<(), LinkError> {
        self.tx.send(event).map_err(|_| LinkError::Closed)
    }

    pub fn connection_established(&self, handle: PeerHandle) -> Result<(), LinkError> {
        self.post(LinkEvent::ConnectionEstablished(handle))
    }

    pub fn connection_lost(&self, handle: PeerHandle) -> Result<(), LinkError> {
        self.post(LinkEvent::ConnectionLost(handle))
    }

    pub fn frame_received(&self, handle: PeerHandle, bytes: Vec<u8>) -> Result<(), LinkError> {
        self.post(LinkEvent::FrameReceived(handle, bytes))
    }

    /// Whether the receiving node is gone
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
