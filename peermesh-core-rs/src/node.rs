//! Mesh node runtime
//!
//! A [`MeshNode`] owns everything one participant knows: the peer registry,
//! the election engine, the simulated transport, the CSMA/CD simulator and
//! the timers driving them. Link events, timer firings and application
//! commands are all applied on the node's own task, one at a time, so none
//! of that state needs locking.
//!
//! Applications talk to a running node through a cloneable [`MeshHandle`]:
//! commands go in over a channel, state comes out as a watched
//! [`MeshSnapshot`] plus a stream of [`MeshNotification`]s.

use crate::config::MeshConfig;
use crate::csma::{CsmaOutput, CsmaSimulator, CsmaSnapshot};
use crate::election::{ElectionEffect, ElectionEngine, ElectionTimer};
use crate::error::{MeshError, Result};
use crate::link::{LinkEvent, LinkLayer};
use crate::protocol::{decode_device_info, decode_pose, MeshMessage, MessageType, ReliableFrame};
use crate::registry::{HandshakeOutcome, PeerRegistry};
use crate::timer::{TimerFired, TimerKey, Timers};
use crate::transport::{ReliableInbound, RetransmitOutcome, RttHistory, RttSummary, SimTransport};
use crate::types::{
    DeliveryId, DeliveryMode, DeliveryStatus, DeviceInfo, FailureReason, MeshState, PeerHandle,
    PeerId, PeerSummary, Pose,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const NOTIFICATION_CAPACITY: usize = 1024;

/// Something collaborators may want to react to
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MeshNotification {
    StateChanged { from: MeshState, to: MeshState },
    CoordinatorChanged(Option<PeerId>),
    PeerJoined(PeerId),
    PeerLeft(PeerId),
    DeviceInfo { peer: PeerId, info: DeviceInfo },
    PoseUpdated { peer: PeerId, pose: Pose },
    /// Status transition of one of our sends
    Delivery {
        delivery: DeliveryId,
        peer: PeerId,
        mode: DeliveryMode,
        status: DeliveryStatus,
    },
    /// Payload handed up from a peer
    Received {
        from: PeerId,
        mode: DeliveryMode,
        payload: String,
    },
    /// Unreliable frame discarded by the loss simulation
    UnreliableDropped { from: PeerId },
    Csma(CsmaSnapshot),
    ResolutionRetry { attempt: u32, max_attempts: u32 },
    ResolutionFailed { attempts: u32 },
}

/// Point-in-time view of a node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeshSnapshot {
    pub local_id: PeerId,
    pub state: MeshState,
    pub coordinator: Option<PeerId>,
    pub anchor: Option<String>,
    /// Handshake-confirmed peers
    pub peers: Vec<PeerSummary>,
    /// Open link-layer connections, confirmed or not
    pub connections: usize,
    pub pending_deliveries: usize,
    /// RTT samples per peer, oldest first
    pub rtt: BTreeMap<PeerId, Vec<Duration>>,
    pub csma: CsmaSnapshot,
}

impl MeshSnapshot {
    fn empty(local_id: PeerId) -> Self {
        Self {
            local_id,
            state: MeshState::Discovering,
            coordinator: None,
            anchor: None,
            peers: Vec::new(),
            connections: 0,
            pending_deliveries: 0,
            rtt: BTreeMap::new(),
            csma: CsmaSnapshot::default(),
        }
    }

    pub fn is_coordinator(&self) -> bool {
        self.coordinator == Some(self.local_id)
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.iter().map(|p| p.peer_id).collect()
    }

    pub fn rtt_summary(&self, peer: PeerId) -> Option<RttSummary> {
        let samples = self.rtt.get(&peer)?;
        let mut history = RttHistory::new(samples.len());
        for rtt in samples {
            history.push(*rtt);
        }
        history.summary()
    }
}

enum Command {
    Send {
        to: PeerId,
        mode: DeliveryMode,
        payload: String,
        reply: oneshot::Sender<Result<DeliveryId>>,
    },
    BroadcastPose(Pose),
    StartElection,
    ReportResolution(bool),
    Shutdown,
}

/// Application side of a running node. The node stops once every handle is
/// dropped or [`MeshHandle::shutdown`] is called.
#[derive(Clone)]
pub struct MeshHandle {
    local_id: PeerId,
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<MeshSnapshot>,
    notifications: broadcast::Sender<MeshNotification>,
}

impl MeshHandle {
    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| MeshError::Stopped)
    }

    async fn send(&self, to: PeerId, mode: DeliveryMode, payload: String) -> Result<DeliveryId> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Send {
            to,
            mode,
            payload,
            reply,
        })?;
        rx.await.map_err(|_| MeshError::Stopped)?
    }

    /// Acknowledged send with bounded retransmission. Progress is reported
    /// as [`MeshNotification::Delivery`] under the returned id.
    pub async fn send_reliable(&self, to: PeerId, payload: impl Into<String>) -> Result<DeliveryId> {
        self.send(to, DeliveryMode::Reliable, payload.into()).await
    }

    /// Fire-and-forget send
    pub async fn send_unreliable(&self, to: PeerId, payload: impl Into<String>) -> Result<DeliveryId> {
        self.send(to, DeliveryMode::Unreliable, payload.into()).await
    }

    /// Share our pose with every connected peer
    pub fn broadcast_pose(&self, pose: Pose) -> Result<()> {
        self.command(Command::BroadcastPose(pose))
    }

    /// Force a new election
    pub fn start_election(&self) -> Result<()> {
        self.command(Command::StartElection)
    }

    /// Report whether the coordinator's shared-space anchor was resolved
    pub fn report_resolution(&self, resolved: bool) -> Result<()> {
        self.command(Command::ReportResolution(resolved))
    }

    pub fn shutdown(&self) -> Result<()> {
        self.command(Command::Shutdown)
    }

    pub fn snapshot(&self) -> MeshSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<MeshSnapshot> {
        self.snapshot.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshNotification> {
        self.notifications.subscribe()
    }

    /// Wait until the node's state satisfies `predicate`
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&MeshSnapshot) -> bool,
    ) -> Result<MeshSnapshot> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(predicate)
            .await
            .map_err(|_| MeshError::Stopped)?
            .clone();
        Ok(snapshot)
    }

    pub async fn wait_for_state(&self, state: MeshState) -> Result<MeshSnapshot> {
        self.wait_for(|s| s.state == state).await
    }
}

/// A send waiting for the medium
#[derive(Debug)]
struct GatedSend {
    delivery: DeliveryId,
    to: PeerId,
    mode: DeliveryMode,
    payload: String,
}

/// One mesh participant bound to a link layer
pub struct MeshNode<L: LinkLayer> {
    local_id: PeerId,
    config: MeshConfig,
    link: L,
    registry: PeerRegistry,
    election: ElectionEngine,
    transport: SimTransport,
    csma: CsmaSimulator<GatedSend>,
    timers: Timers,
    timer_rx: mpsc::UnboundedReceiver<TimerFired>,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    snapshot_tx: watch::Sender<MeshSnapshot>,
    notifications: broadcast::Sender<MeshNotification>,
    next_delivery: u64,
}

impl<L: LinkLayer> MeshNode<L> {
    /// Build a node and its handle. Nothing happens until [`MeshNode::run`].
    pub fn new(
        config: MeshConfig,
        link: L,
        link_events: mpsc::UnboundedReceiver<LinkEvent>,
    ) -> Result<(Self, MeshHandle)> {
        let config = config.validate()?;
        let local_id = config.peer_id.unwrap_or_else(PeerId::random);

        let rng = |offset: u64| match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(offset)),
            None => StdRng::from_entropy(),
        };

        let mut election = ElectionEngine::new(local_id, config.election.clone());
        if config.bootstrap.enabled {
            election = election.with_bootstrap(config.bootstrap.max_resolve_attempts);
        }
        let transport = SimTransport::new(local_id, config.transport.clone(), rng(0));
        let csma = CsmaSimulator::new(config.csma.clone(), rng(1));
        let (timers, timer_rx) = Timers::new();
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let (snapshot_tx, snapshot) = watch::channel(MeshSnapshot::empty(local_id));

        let node = Self {
            local_id,
            config,
            link,
            registry: PeerRegistry::new(),
            election,
            transport,
            csma,
            timers,
            timer_rx,
            link_events,
            commands,
            snapshot_tx,
            notifications: notifications.clone(),
            next_delivery: 1,
        };

        let handle = MeshHandle {
            local_id,
            commands: command_tx,
            snapshot,
            notifications,
        };
        Ok((node, handle))
    }

    /// Build a node and run it on a new task
    pub fn spawn(
        config: MeshConfig,
        link: L,
        link_events: mpsc::UnboundedReceiver<LinkEvent>,
    ) -> Result<(MeshHandle, JoinHandle<()>)> {
        let (node, handle) = Self::new(config, link, link_events)?;
        Ok((handle, tokio::spawn(node.run())))
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Run until shut down
    pub async fn run(mut self) {
        info!(
            "Node: Peer {} ({}) starting",
            self.local_id, self.config.display_name
        );
        let effects = self.election.start();
        self.apply(effects);
        self.publish();

        loop {
            tokio::select! {
                Some(event) = self.link_events.recv() => self.on_link_event(event),
                Some(fired) = self.timer_rx.recv() => self.on_timer(fired),
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
            }
            self.publish();
        }

        self.teardown();
        self.publish();
    }

    // Inputs

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::ConnectionEstablished(handle) => self.on_connected(handle),
            LinkEvent::ConnectionLost(handle) => self.on_disconnected(&handle),
            LinkEvent::FrameReceived(handle, bytes) => self.on_frame(&handle, &bytes),
        }
    }

    fn on_connected(&mut self, handle: PeerHandle) {
        if !self.registry.on_peer_connected(handle.clone()) {
            return;
        }
        let hello = MeshMessage::handshake(self.local_id);
        self.send_to_handle(&handle, &hello);
    }

    fn on_disconnected(&mut self, handle: &PeerHandle) {
        let Some(record) = self.registry.on_peer_disconnected(handle) else {
            return;
        };
        if let Some(peer) = record.peer_id {
            if !self.registry.is_confirmed(peer) {
                self.on_peer_gone(peer);
            }
        }
    }

    fn on_peer_gone(&mut self, peer: PeerId) {
        self.notify(MeshNotification::PeerLeft(peer));

        for (seq, delivery) in self.transport.fail_peer(peer) {
            self.timers.cancel(TimerKey::Retransmit(seq));
            self.notify_delivery(
                delivery,
                peer,
                DeliveryMode::Reliable,
                DeliveryStatus::Failed {
                    reason: FailureReason::PeerLost,
                },
            );
        }

        let remaining = self.registry.confirmed_ids();
        let effects = self.election.on_peer_lost(peer, &remaining);
        self.apply(effects);
    }

    fn on_frame(&mut self, handle: &PeerHandle, bytes: &[u8]) {
        let message = match MeshMessage::from_bytes(bytes) {
            Ok(message) => message,
            Err(e) => {
                debug!("Node: Dropping malformed frame from {}: {}", handle, e);
                return;
            }
        };
        self.registry.touch(handle);
        let sender = message.sender_id();

        if message.kind() == MessageType::Handshake {
            self.on_handshake(handle, sender);
            return;
        }

        if self.registry.peer_id_for(handle) != Some(sender) {
            debug!(
                "Node: Dropping {} from {} before handshake (claims {})",
                message.kind(),
                handle,
                sender
            );
            return;
        }

        match message.kind() {
            MessageType::Handshake => {}
            MessageType::Election => {
                let peers = self.registry.confirmed_ids();
                let effects = self.election.on_election(sender, &peers);
                self.apply(effects);
            }
            MessageType::Ok => {
                let effects = self.election.on_ok(sender);
                self.apply(effects);
            }
            MessageType::Coordinator => {
                let effects = self.election.on_coordinator(sender, message.anchor());
                self.apply(effects);
            }
            MessageType::PoseUpdate => match decode_pose(message.data()) {
                Ok(pose) => {
                    if self.registry.update_pose(sender, pose) {
                        self.notify(MeshNotification::PoseUpdated { peer: sender, pose });
                    }
                }
                Err(e) => debug!("Node: Bad pose from {}: {}", sender, e),
            },
            MessageType::DeviceInfo => match decode_device_info(message.data()) {
                Ok(info) => {
                    if self.registry.update_device_info(sender, info.clone()) {
                        self.notify(MeshNotification::DeviceInfo { peer: sender, info });
                    }
                }
                Err(e) => debug!("Node: Bad device info from {}: {}", sender, e),
            },
            MessageType::DataReliable => self.on_reliable(handle, sender, message.data()),
            MessageType::DataUnreliable => {
                if self.transport.should_drop_unreliable() {
                    debug!("Node: Simulated loss of unreliable frame from {}", sender);
                    self.notify(MeshNotification::UnreliableDropped { from: sender });
                } else {
                    self.notify(MeshNotification::Received {
                        from: sender,
                        mode: DeliveryMode::Unreliable,
                        payload: message.data().to_string(),
                    });
                }
            }
        }
    }

    fn on_handshake(&mut self, handle: &PeerHandle, peer: PeerId) {
        if peer == self.local_id {
            warn!("Node: {} claims our own id {}, ignoring", handle, peer);
            return;
        }

        let HandshakeOutcome::Confirmed {
            previous,
            displaced,
        } = self.registry.on_handshake(handle, peer)
        else {
            return;
        };
        if previous == Some(peer) {
            return;
        }
        if let Some(old) = previous {
            if !self.registry.is_confirmed(old) {
                self.on_peer_gone(old);
            }
        }
        if displaced.is_none() {
            self.notify(MeshNotification::PeerJoined(peer));
        }

        let info = MeshMessage::device_info(self.local_id, &self.device_info());
        self.send_to_handle(handle, &info);

        let effects = self.election.on_peer_confirmed(peer);
        self.apply(effects);
    }

    fn on_reliable(&mut self, handle: &PeerHandle, sender: PeerId, data: &str) {
        let frame = match ReliableFrame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Node: Bad reliable frame from {}: {}", sender, e);
                return;
            }
        };

        match self.transport.on_reliable_frame(sender, frame, Instant::now()) {
            ReliableInbound::Deliver { ack, payload, .. } => {
                self.send_to_handle(handle, &ack);
                self.notify(MeshNotification::Received {
                    from: sender,
                    mode: DeliveryMode::Reliable,
                    payload,
                });
            }
            ReliableInbound::Acked(outcome) => {
                self.timers.cancel(TimerKey::Retransmit(outcome.seq));
                self.notify_delivery(
                    outcome.delivery,
                    outcome.destination,
                    DeliveryMode::Reliable,
                    DeliveryStatus::Delivered { rtt: outcome.rtt },
                );
            }
            ReliableInbound::StaleAck { .. } => {}
        }
    }

    fn on_timer(&mut self, fired: TimerFired) {
        if !self.timers.accept(fired) {
            return;
        }

        match fired.key {
            TimerKey::Election(ElectionTimer::Formation) => {
                let peers = self.registry.confirmed_ids();
                let effects = self.election.on_formation_timeout(&peers);
                self.apply(effects);
            }
            TimerKey::Election(ElectionTimer::Election) => {
                let effects = self.election.on_election_timeout();
                self.apply(effects);
            }
            TimerKey::Election(ElectionTimer::CoordinatorWait) => {
                let peers = self.registry.confirmed_ids();
                let effects = self.election.on_coordinator_wait_timeout(&peers);
                self.apply(effects);
            }
            TimerKey::Retransmit(seq) => self.on_retransmit(seq),
            TimerKey::Csma => {
                let output = self.csma.advance(self.registry.confirmed_count());
                self.apply_csma(output);
            }
        }
    }

    fn on_retransmit(&mut self, seq: u64) {
        match self.transport.on_retransmit_timeout(seq) {
            None => {}
            Some(RetransmitOutcome::Retry {
                delivery,
                destination,
                attempt,
                message,
            }) => {
                self.send_to_peer(destination, &message);
                self.timers
                    .schedule(TimerKey::Retransmit(seq), self.transport.ack_timeout());
                self.notify_delivery(
                    delivery,
                    destination,
                    DeliveryMode::Reliable,
                    DeliveryStatus::Retrying { attempt },
                );
            }
            Some(RetransmitOutcome::Exhausted {
                delivery,
                destination,
                frames_sent,
                last_frame,
            }) => {
                if let Some(message) = last_frame {
                    self.send_to_peer(destination, &message);
                }
                self.notify_delivery(
                    delivery,
                    destination,
                    DeliveryMode::Reliable,
                    DeliveryStatus::Failed {
                        reason: FailureReason::RetriesExhausted { frames_sent },
                    },
                );
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Send {
                to,
                mode,
                payload,
                reply,
            } => self.on_send(to, mode, payload, reply),
            Command::BroadcastPose(pose) => {
                let message = MeshMessage::pose_update(self.local_id, &pose);
                self.broadcast(&message);
            }
            Command::StartElection => {
                let peers = self.registry.confirmed_ids();
                let effects = self.election.start_election(&peers);
                self.apply(effects);
            }
            Command::ReportResolution(resolved) => {
                let effects = self.election.on_resolution(resolved);
                self.apply(effects);
            }
            Command::Shutdown => {}
        }
    }

    fn on_send(
        &mut self,
        to: PeerId,
        mode: DeliveryMode,
        payload: String,
        reply: oneshot::Sender<Result<DeliveryId>>,
    ) {
        if !self.registry.is_confirmed(to) {
            debug!("Node: Send to unknown peer {}", to);
            let _ = reply.send(Err(MeshError::UnknownPeer(to)));
            return;
        }

        let delivery = DeliveryId(self.next_delivery);
        self.next_delivery += 1;
        let _ = reply.send(Ok(delivery));
        self.notify_delivery(delivery, to, mode, DeliveryStatus::InProgress);

        let job = GatedSend {
            delivery,
            to,
            mode,
            payload,
        };
        if !self.config.csma.enabled {
            self.dispatch(job);
            return;
        }

        match self.csma.enqueue(job, self.registry.confirmed_count()) {
            Some(output) => self.apply_csma(output),
            None => self.notify(MeshNotification::Csma(self.csma.snapshot())),
        }
    }

    // Outputs

    fn dispatch(&mut self, job: GatedSend) {
        let GatedSend {
            delivery,
            to,
            mode,
            payload,
        } = job;

        let Some(handle) = self.registry.handle_for(to).cloned() else {
            self.notify_delivery(
                delivery,
                to,
                mode,
                DeliveryStatus::Failed {
                    reason: FailureReason::PeerLost,
                },
            );
            return;
        };

        match mode {
            DeliveryMode::Reliable => {
                let (seq, message) =
                    self.transport
                        .send_reliable(delivery, to, payload, Instant::now());
                self.send_to_handle(&handle, &message);
                self.timers
                    .schedule(TimerKey::Retransmit(seq), self.transport.ack_timeout());
            }
            DeliveryMode::Unreliable => {
                let message = self.transport.send_unreliable(to, payload);
                let status = if self.send_to_handle(&handle, &message) {
                    DeliveryStatus::Sent
                } else {
                    DeliveryStatus::Failed {
                        reason: FailureReason::LinkError,
                    }
                };
                self.notify_delivery(delivery, to, mode, status);
            }
        }
    }

    fn apply_csma(&mut self, output: CsmaOutput<GatedSend>) {
        if let Some(job) = output.transmit {
            self.dispatch(job);
        }
        if let Some((job, attempts)) = output.abandoned {
            self.notify_delivery(
                job.delivery,
                job.to,
                job.mode,
                DeliveryStatus::Failed {
                    reason: FailureReason::MediumBusy { attempts },
                },
            );
        }
        match output.wait {
            Some(after) => self.timers.schedule(TimerKey::Csma, after),
            None => {
                self.timers.cancel(TimerKey::Csma);
            }
        }
        self.notify(MeshNotification::Csma(self.csma.snapshot()));
    }

    fn apply(&mut self, effects: Vec<ElectionEffect>) {
        for effect in effects {
            match effect {
                ElectionEffect::StartDiscovery => {
                    if let Err(e) = self.link.start_discovery_and_advertising() {
                        warn!("Node: Could not start discovery: {}", e);
                    }
                }
                ElectionEffect::StopDiscovery => {
                    if let Err(e) = self.link.stop_discovery() {
                        warn!("Node: Could not stop discovery: {}", e);
                    }
                }
                ElectionEffect::Send { to, message } => {
                    self.send_to_peer(to, &message);
                }
                ElectionEffect::Broadcast(message) => self.broadcast(&message),
                ElectionEffect::Schedule { timer, after } => {
                    self.timers.schedule(TimerKey::Election(timer), after)
                }
                ElectionEffect::Cancel(timer) => {
                    self.timers.cancel(TimerKey::Election(timer));
                }
                ElectionEffect::StateChanged { from, to } => {
                    info!("Node: Peer {} {} → {}", self.local_id, from, to);
                    self.notify(MeshNotification::StateChanged { from, to });
                }
                ElectionEffect::CoordinatorChanged(coordinator) => {
                    self.notify(MeshNotification::CoordinatorChanged(coordinator));
                }
                ElectionEffect::ResolutionRetry {
                    attempt,
                    max_attempts,
                } => self.notify(MeshNotification::ResolutionRetry {
                    attempt,
                    max_attempts,
                }),
                ElectionEffect::ResolutionFailed { attempts } => {
                    self.notify(MeshNotification::ResolutionFailed { attempts })
                }
            }
        }
    }

    fn send_to_peer(&mut self, peer: PeerId, message: &MeshMessage) -> bool {
        match self.registry.handle_for(peer).cloned() {
            Some(handle) => self.send_to_handle(&handle, message),
            None => {
                debug!("Node: No connection to {} for {}", peer, message.kind());
                false
            }
        }
    }

    fn send_to_handle(&mut self, handle: &PeerHandle, message: &MeshMessage) -> bool {
        let bytes = match message.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Node: Could not encode {}: {}", message.kind(), e);
                return false;
            }
        };
        match self.link.send_message(handle, bytes) {
            Ok(()) => true,
            Err(e) => {
                warn!("Node: Send {} to {} failed: {}", message.kind(), handle, e);
                false
            }
        }
    }

    fn broadcast(&mut self, message: &MeshMessage) {
        match message.to_bytes() {
            Ok(bytes) => {
                if let Err(e) = self.link.broadcast_message(bytes) {
                    warn!("Node: Broadcast {} failed: {}", message.kind(), e);
                }
            }
            Err(e) => warn!("Node: Could not encode {}: {}", message.kind(), e),
        }
    }

    fn notify(&self, notification: MeshNotification) {
        // No subscribers is fine
        let _ = self.notifications.send(notification);
    }

    fn notify_delivery(
        &self,
        delivery: DeliveryId,
        peer: PeerId,
        mode: DeliveryMode,
        status: DeliveryStatus,
    ) {
        debug!("Node: Delivery {} to {} {:?}", delivery, peer, status);
        self.notify(MeshNotification::Delivery {
            delivery,
            peer,
            mode,
            status,
        });
    }

    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            display_name: self.config.display_name.clone(),
            device_model: self.config.device_model.clone(),
        }
    }

    fn snapshot(&self) -> MeshSnapshot {
        MeshSnapshot {
            local_id: self.local_id,
            state: self.election.state(),
            coordinator: self.election.coordinator(),
            anchor: self.election.anchor().map(str::to_string),
            peers: self.registry.records_with_confirmed_id(),
            connections: self.registry.len(),
            pending_deliveries: self.transport.pending_count(),
            rtt: self.transport.rtt_histories().into_iter().collect(),
            csma: self.csma.snapshot(),
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }

    fn teardown(&mut self) {
        info!("Node: Peer {} shutting down", self.local_id);
        let effects = self.election.shutdown();
        self.apply(effects);

        let outstanding = self.transport.clear();
        let unsent = self.csma.clear();
        if !outstanding.is_empty() || !unsent.is_empty() {
            debug!(
                "Node: Abandoned {} outstanding and {} queued send(s)",
                outstanding.len(),
                unsent.len()
            );
        }
        self.timers.cancel_all();
        self.registry.clear();
    }
}
