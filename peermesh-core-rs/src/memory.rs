//! In-process link layer for tests and simulation
//!
//! A [`MemoryNetwork`] connects any number of endpoints through channels.
//! Endpoints that advertise and discover find each other automatically,
//! like radios in the same room. Faults can be injected at the network:
//! frame loss, silent partitions between endpoints, one-way blocks,
//! disconnects and crashes.

use crate::config::MeshConfig;
use crate::error::{LinkError, MeshError};
use crate::link::{link_channel, LinkEvent, LinkEventSink, LinkLayer};
use crate::node::{MeshHandle, MeshNode};
use crate::types::PeerHandle;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One frame as seen on the simulated medium
#[derive(Debug, Clone)]
pub struct WireFrame {
    pub from: String,
    pub to: String,
    pub bytes: Vec<u8>,
    /// False when loss or a partition swallowed it
    pub delivered: bool,
}

/// Counters for the whole network
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NetworkStats {
    pub frames_sent: u64,
    pub frames_delivered: u64,
    pub frames_lost: u64,
    pub connections: u64,
    pub disconnections: u64,
}

struct Endpoint {
    sink: LinkEventSink,
    generation: u64,
    discovering: bool,
    advertising: bool,
}

struct NetworkState {
    endpoints: HashMap<String, Endpoint>,
    links: HashSet<(String, String)>,
    partitions: HashSet<(String, String)>,
    /// Directed (from, to) pairs whose frames are swallowed
    blocked: HashSet<(String, String)>,
    loss_rate: f64,
    next_generation: u64,
    rng: StdRng,
    stats: NetworkStats,
    tap: Option<mpsc::UnboundedSender<WireFrame>>,
}

fn pair(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

impl NetworkState {
    fn post(&self, name: &str, event: LinkEvent) {
        if let Some(endpoint) = self.endpoints.get(name) {
            if endpoint.sink.post(event).is_err() {
                debug!("Network: {} no longer listening", name);
            }
        }
    }

    fn link_up(&mut self, a: &str, b: &str) -> bool {
        if a == b || !self.endpoints.contains_key(a) || !self.endpoints.contains_key(b) {
            return false;
        }
        if !self.links.insert(pair(a, b)) {
            return false;
        }

        self.stats.connections += 1;
        info!("Network: {} <-> {} connected", a, b);
        self.post(a, LinkEvent::ConnectionEstablished(PeerHandle::new(b)));
        self.post(b, LinkEvent::ConnectionEstablished(PeerHandle::new(a)));
        true
    }

    fn link_down(&mut self, a: &str, b: &str) -> bool {
        if !self.links.remove(&pair(a, b)) {
            return false;
        }

        self.stats.disconnections += 1;
        info!("Network: {} <-> {} disconnected", a, b);
        self.post(a, LinkEvent::ConnectionLost(PeerHandle::new(b)));
        self.post(b, LinkEvent::ConnectionLost(PeerHandle::new(a)));
        true
    }

    fn neighbours(&self, name: &str) -> Vec<String> {
        let mut out: Vec<String> = self
            .links
            .iter()
            .filter_map(|(a, b)| {
                if a == name {
                    Some(b.clone())
                } else if b == name {
                    Some(a.clone())
                } else {
                    None
                }
            })
            .collect();
        out.sort();
        out
    }

    fn remove_endpoint(&mut self, name: &str) {
        for other in self.neighbours(name) {
            self.link_down(name, &other);
        }
        self.endpoints.remove(name);
    }

    /// Pair `name` with every endpoint it can see: advertisers when it is
    /// discovering, discoverers when it is advertising
    fn discover(&mut self, name: &str) {
        let Some(me) = self.endpoints.get(name) else {
            return;
        };
        let (discovering, advertising) = (me.discovering, me.advertising);

        let candidates: Vec<String> = self
            .endpoints
            .iter()
            .filter(|(other, ep)| {
                other.as_str() != name
                    && ((discovering && ep.advertising) || (advertising && ep.discovering))
            })
            .map(|(other, _)| other.clone())
            .collect();

        for other in candidates {
            if !self.partitions.contains(&pair(name, &other)) {
                self.link_up(name, &other);
            }
        }
    }

    fn transmit(&mut self, from: &str, to: &str, bytes: Vec<u8>) -> Result<(), LinkError> {
        if !self.links.contains(&pair(from, to)) {
            return Err(LinkError::UnknownHandle(PeerHandle::new(to)));
        }

        self.stats.frames_sent += 1;
        let lost = self.partitions.contains(&pair(from, to))
            || self.blocked.contains(&(from.to_string(), to.to_string()))
            || (self.loss_rate > 0.0 && self.rng.gen_bool(self.loss_rate));

        if let Some(tap) = &self.tap {
            let _ = tap.send(WireFrame {
                from: from.to_string(),
                to: to.to_string(),
                bytes: bytes.clone(),
                delivered: !lost,
            });
        }

        if lost {
            self.stats.frames_lost += 1;
            debug!("Network: frame {} -> {} lost", from, to);
            return Ok(());
        }

        let endpoint = self
            .endpoints
            .get(to)
            .ok_or_else(|| LinkError::Unreachable(PeerHandle::new(to)))?;
        endpoint
            .sink
            .frame_received(PeerHandle::new(from), bytes)
            .map_err(|_| LinkError::Unreachable(PeerHandle::new(to)))?;
        self.stats.frames_delivered += 1;
        Ok(())
    }
}

/// Shared in-memory medium. Cloning yields another handle to the same
/// network.
#[derive(Clone)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Network whose loss rolls are reproducible
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState {
                endpoints: HashMap::new(),
                links: HashSet::new(),
                partitions: HashSet::new(),
                blocked: HashSet::new(),
                loss_rate: 0.0,
                next_generation: 1,
                rng,
                stats: NetworkStats::default(),
                tap: None,
            })),
        }
    }

    /// Attach an endpoint. Joining under a name that is in use replaces the
    /// previous endpoint, which is disconnected first.
    pub fn join(&self, name: impl Into<String>) -> (MemoryLink, mpsc::UnboundedReceiver<LinkEvent>) {
        let name = name.into();
        let (sink, events) = link_channel();

        let mut state = self.state.lock();
        if state.endpoints.contains_key(&name) {
            warn!("Network: {} rejoined, dropping previous endpoint", name);
            state.remove_endpoint(&name);
        }

        let generation = state.next_generation;
        state.next_generation += 1;
        state.endpoints.insert(
            name.clone(),
            Endpoint {
                sink,
                generation,
                discovering: false,
                advertising: false,
            },
        );
        debug!("Network: {} joined", name);

        (
            MemoryLink {
                name,
                generation,
                network: self.clone(),
            },
            events,
        )
    }

    /// Join `name` and run a mesh node on it
    pub fn spawn_node(
        &self,
        name: impl Into<String>,
        config: MeshConfig,
    ) -> Result<(MeshHandle, JoinHandle<()>), MeshError> {
        let (link, events) = self.join(name);
        MeshNode::spawn(config, link, events)
    }

    /// Connect two endpoints directly
    pub fn connect(&self, a: &str, b: &str) -> bool {
        self.state.lock().link_up(a, b)
    }

    /// Drop the connection between two endpoints. Both sides see it lost.
    pub fn disconnect(&self, a: &str, b: &str) -> bool {
        self.state.lock().link_down(a, b)
    }

    /// Remove an endpoint abruptly, as if the device powered off
    pub fn crash(&self, name: &str) {
        let mut state = self.state.lock();
        warn!("Network: {} crashed", name);
        state.remove_endpoint(name);
    }

    /// Silently drop every frame between the two groups. Connections stay
    /// up.
    pub fn partition(&self, group_a: &[&str], group_b: &[&str]) {
        let mut state = self.state.lock();
        for a in group_a {
            for b in group_b {
                if a != b {
                    state.partitions.insert(pair(a, b));
                }
            }
        }
        info!("Network: partition {:?} <-> {:?}", group_a, group_b);
    }

    /// Silently drop frames from `from` to `to` only. The reverse direction
    /// keeps working.
    pub fn block(&self, from: &str, to: &str) {
        self.state
            .lock()
            .blocked
            .insert((from.to_string(), to.to_string()));
        info!("Network: blocked {} -> {}", from, to);
    }

    /// Remove all partitions and one-way blocks
    pub fn heal(&self) {
        let mut state = self.state.lock();
        state.partitions.clear();
        state.blocked.clear();
        info!("Network: partitions healed");
    }

    /// Probability that any frame is lost on the medium. NaN counts as no
    /// loss.
    pub fn set_loss_rate(&self, rate: f64) {
        self.state.lock().loss_rate = if rate.is_nan() { 0.0 } else { rate.clamp(0.0, 1.0) };
    }

    /// Observe every frame put on the medium from now on
    pub fn tap(&self) -> mpsc::UnboundedReceiver<WireFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().tap = Some(tx);
        rx
    }

    pub fn is_connected(&self, a: &str, b: &str) -> bool {
        self.state.lock().links.contains(&pair(a, b))
    }

    pub fn neighbours(&self, name: &str) -> Vec<String> {
        self.state.lock().neighbours(name)
    }

    pub fn endpoint_count(&self) -> usize {
        self.state.lock().endpoints.len()
    }

    pub fn stats(&self) -> NetworkStats {
        self.state.lock().stats.clone()
    }
}

/// One endpoint's view of a [`MemoryNetwork`]
pub struct MemoryLink {
    name: String,
    generation: u64,
    network: MemoryNetwork,
}

impl MemoryLink {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn with_endpoint<R>(
        &self,
        f: impl FnOnce(&mut NetworkState) -> Result<R, LinkError>,
    ) -> Result<R, LinkError> {
        let mut state = self.network.state.lock();
        let current = matches!(
            state.endpoints.get(&self.name),
            Some(ep) if ep.generation == self.generation
        );
        if !current {
            return Err(LinkError::Closed);
        }
        f(&mut state)
    }
}

impl LinkLayer for MemoryLink {
    fn start_discovery_and_advertising(&mut self) -> Result<(), LinkError> {
        let name = self.name.clone();
        self.with_endpoint(|state| {
            if let Some(ep) = state.endpoints.get_mut(&name) {
                ep.discovering = true;
                ep.advertising = true;
            }
            debug!("Network: {} discovering", name);
            state.discover(&name);
            Ok(())
        })
    }

    fn stop_discovery(&mut self) -> Result<(), LinkError> {
        let name = self.name.clone();
        self.with_endpoint(|state| {
            if let Some(ep) = state.endpoints.get_mut(&name) {
                ep.discovering = false;
            }
            debug!("Network: {} stopped discovering", name);
            Ok(())
        })
    }

    fn send_message(&mut self, handle: &PeerHandle, bytes: Vec<u8>) -> Result<(), LinkError> {
        let name = self.name.clone();
        self.with_endpoint(|state| state.transmit(&name, handle.as_str(), bytes))
    }

    fn broadcast_message(&mut self, bytes: Vec<u8>) -> Result<(), LinkError> {
        let name = self.name.clone();
        self.with_endpoint(|state| {
            for other in state.neighbours(&name) {
                if let Err(e) = state.transmit(&name, &other, bytes.clone()) {
                    debug!("Network: broadcast from {} skipped {}: {}", name, other, e);
                }
            }
            Ok(())
        })
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        let mut state = self.network.state.lock();
        let current = state
            .endpoints
            .get(&self.name)
            .map(|ep| ep.generation == self.generation)
            .unwrap_or(false);
        if current {
            debug!("Network: {} left", self.name);
            state.remove_endpoint(&self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<LinkEvent>) -> Vec<LinkEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_discovery_connects_advertisers() {
        let net = MemoryNetwork::with_seed(1);
        let (mut a, mut a_rx) = net.join("a");
        let (mut b, mut b_rx) = net.join("b");

        a.start_discovery_and_advertising().unwrap();
        assert!(drain(&mut a_rx).is_empty());

        b.start_discovery_and_advertising().unwrap();
        assert!(net.is_connected("a", "b"));
        assert_eq!(
            drain(&mut a_rx),
            vec![LinkEvent::ConnectionEstablished(PeerHandle::new("b"))]
        );
        assert_eq!(
            drain(&mut b_rx),
            vec![LinkEvent::ConnectionEstablished(PeerHandle::new("a"))]
        );
    }

    #[test]
    fn test_send_requires_connection() {
        let net = MemoryNetwork::with_seed(1);
        let (mut a, _a_rx) = net.join("a");
        let (_b, _b_rx) = net.join("b");

        let err = a.send_message(&PeerHandle::new("b"), b"hi".to_vec()).unwrap_err();
        assert_eq!(err, LinkError::UnknownHandle(PeerHandle::new("b")));
    }

    #[test]
    fn test_frames_arrive_in_order() {
        let net = MemoryNetwork::with_seed(1);
        let (mut a, _a_rx) = net.join("a");
        let (_b, mut b_rx) = net.join("b");
        net.connect("a", "b");
        drain(&mut b_rx);

        for i in 0..5u8 {
            a.send_message(&PeerHandle::new("b"), vec![i]).unwrap();
        }

        let received: Vec<Vec<u8>> = drain(&mut b_rx)
            .into_iter()
            .filter_map(|e| match e {
                LinkEvent::FrameReceived(_, bytes) => Some(bytes),
                _ => None,
            })
            .collect();
        assert_eq!(received, (0..5u8).map(|i| vec![i]).collect::<Vec<_>>());
    }

    #[test]
    fn test_partition_swallows_frames_but_keeps_link() {
        let net = MemoryNetwork::with_seed(1);
        let (mut a, _a_rx) = net.join("a");
        let (_b, mut b_rx) = net.join("b");
        net.connect("a", "b");
        drain(&mut b_rx);
        let mut tap = net.tap();

        net.partition(&["a"], &["b"]);
        a.send_message(&PeerHandle::new("b"), b"x".to_vec()).unwrap();
        assert!(drain(&mut b_rx).is_empty());
        assert!(net.is_connected("a", "b"));
        assert!(!tap.try_recv().unwrap().delivered);

        net.heal();
        a.send_message(&PeerHandle::new("b"), b"y".to_vec()).unwrap();
        assert_eq!(drain(&mut b_rx).len(), 1);
        assert_eq!(net.stats().frames_lost, 1);
    }

    #[test]
    fn test_block_is_one_way() {
        let net = MemoryNetwork::with_seed(1);
        let (mut a, mut a_rx) = net.join("a");
        let (mut b, mut b_rx) = net.join("b");
        net.connect("a", "b");
        drain(&mut a_rx);
        drain(&mut b_rx);

        net.block("b", "a");
        a.send_message(&PeerHandle::new("b"), b"ping".to_vec()).unwrap();
        b.send_message(&PeerHandle::new("a"), b"pong".to_vec()).unwrap();
        assert_eq!(drain(&mut b_rx).len(), 1);
        assert!(drain(&mut a_rx).is_empty());

        net.heal();
        b.send_message(&PeerHandle::new("a"), b"pong".to_vec()).unwrap();
        assert_eq!(drain(&mut a_rx).len(), 1);
    }

    #[test]
    fn test_nan_loss_rate_means_no_loss() {
        let net = MemoryNetwork::with_seed(1);
        let (mut a, _a_rx) = net.join("a");
        let (_b, mut b_rx) = net.join("b");
        net.connect("a", "b");
        drain(&mut b_rx);

        net.set_loss_rate(f64::NAN);
        a.send_message(&PeerHandle::new("b"), b"x".to_vec()).unwrap();
        assert_eq!(drain(&mut b_rx).len(), 1);
    }

    #[test]
    fn test_stopped_discovery_only_pairs_with_discoverers() {
        let net = MemoryNetwork::with_seed(1);
        let (mut a, _a_rx) = net.join("a");
        let (_b, _b_rx) = net.join("b");
        let (mut c, _c_rx) = net.join("c");

        a.start_discovery_and_advertising().unwrap();
        a.stop_discovery().unwrap();

        // b only advertises, so neither side is looking for the other
        {
            let mut state = net.state.lock();
            if let Some(ep) = state.endpoints.get_mut("b") {
                ep.advertising = true;
            }
            state.discover("b");
        }
        assert!(!net.is_connected("a", "b"));

        // A discoverer still finds both advertisers
        c.start_discovery_and_advertising().unwrap();
        assert!(net.is_connected("a", "c"));
        assert!(net.is_connected("b", "c"));
    }

    #[test]
    fn test_full_loss_rate_drops_everything() {
        let net = MemoryNetwork::with_seed(7);
        let (mut a, _a_rx) = net.join("a");
        let (_b, mut b_rx) = net.join("b");
        net.connect("a", "b");
        drain(&mut b_rx);

        net.set_loss_rate(1.0);
        a.broadcast_message(b"z".to_vec()).unwrap();
        assert!(drain(&mut b_rx).is_empty());
    }

    #[test]
    fn test_dropping_link_disconnects_peers() {
        let net = MemoryNetwork::with_seed(1);
        let (a, _a_rx) = net.join("a");
        let (_b, mut b_rx) = net.join("b");
        net.connect("a", "b");
        drain(&mut b_rx);

        drop(a);
        assert_eq!(
            drain(&mut b_rx),
            vec![LinkEvent::ConnectionLost(PeerHandle::new("a"))]
        );
        assert_eq!(net.endpoint_count(), 1);
    }

    #[test]
    fn test_crashed_endpoint_link_reports_closed() {
        let net = MemoryNetwork::with_seed(1);
        let (mut a, _a_rx) = net.join("a");
        net.crash("a");
        assert_eq!(a.start_discovery_and_advertising(), Err(LinkError::Closed));
    }

    #[test]
    fn test_rejoin_does_not_remove_new_endpoint() {
        let net = MemoryNetwork::with_seed(1);
        let (old, _old_rx) = net.join("a");
        let (_new, _new_rx) = net.join("a");
        drop(old);
        assert_eq!(net.endpoint_count(), 1);
    }
}
