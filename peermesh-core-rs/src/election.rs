//! Bully leader election for the peer mesh.
//!
//! Implements coordinator election with:
//! - State machine: DISCOVERING → ELECTING → (RESOLVING) → CONNECTED
//! - Formation timer that waits for at least one confirmed peer
//! - ELECTION / OK / COORDINATOR exchange where the highest id always wins
//! - Re-election when the coordinator's connection is lost
//!
//! The engine performs no I/O. Every input returns a list of
//! [`ElectionEffect`]s (messages to send, timers to arm or cancel, state
//! changes) that the owning event loop applies. Timer firings are checked
//! against the session's armed flags and the current state, so a stale
//! firing is a no-op.

use crate::config::ElectionConfig;
use crate::protocol::MeshMessage;
use crate::types::{MeshState, PeerId};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Timers owned by the election engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElectionTimer {
    /// Waiting for peers before the first election
    Formation,
    /// Waiting for OK from a higher peer
    Election,
    /// Waiting for COORDINATOR after an OK
    CoordinatorWait,
}

/// Side effects requested by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum ElectionEffect {
    StartDiscovery,
    StopDiscovery,
    Send { to: PeerId, message: MeshMessage },
    Broadcast(MeshMessage),
    Schedule { timer: ElectionTimer, after: Duration },
    Cancel(ElectionTimer),
    StateChanged { from: MeshState, to: MeshState },
    CoordinatorChanged(Option<PeerId>),
    /// Shared-space resolution failed but may be retried
    ResolutionRetry { attempt: u32, max_attempts: u32 },
    /// Shared-space resolution gave up
    ResolutionFailed { attempts: u32 },
}

/// Transient per-election bookkeeping, reset whenever an election restarts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElectionSession {
    pub waiting_for_ok: bool,
    pub election_timer: bool,
    pub formation_timer: bool,
    pub coordinator_wait: bool,
}

/// Bully election state machine
pub struct ElectionEngine {
    /// Our peer id
    local_id: PeerId,
    config: ElectionConfig,
    /// Followers pass through RESOLVING when the coordinator carries an anchor
    bootstrap: bool,
    max_resolve_attempts: u32,
    state: MeshState,
    coordinator: Option<PeerId>,
    session: ElectionSession,
    /// Anchor announced by (or generated as) the coordinator
    anchor: Option<String>,
    resolve_attempts: u32,
}

impl ElectionEngine {
    pub fn new(local_id: PeerId, config: ElectionConfig) -> Self {
        Self {
            local_id,
            config,
            bootstrap: false,
            max_resolve_attempts: 1,
            state: MeshState::Discovering,
            coordinator: None,
            session: ElectionSession::default(),
            anchor: None,
            resolve_attempts: 0,
        }
    }

    /// Enable the RESOLVING phase for followers
    pub fn with_bootstrap(mut self, max_resolve_attempts: u32) -> Self {
        self.bootstrap = true;
        self.max_resolve_attempts = max_resolve_attempts.max(1);
        self
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn state(&self) -> MeshState {
        self.state
    }

    pub fn coordinator(&self) -> Option<PeerId> {
        self.coordinator
    }

    pub fn is_coordinator(&self) -> bool {
        self.coordinator == Some(self.local_id)
    }

    pub fn session(&self) -> &ElectionSession {
        &self.session
    }

    pub fn anchor(&self) -> Option<&str> {
        self.anchor.as_deref()
    }

    /// Enter DISCOVERING: start advertising and arm the formation timer
    pub fn start(&mut self) -> Vec<ElectionEffect> {
        info!("Election: Peer {} discovering", self.local_id);
        let mut effects = vec![ElectionEffect::StartDiscovery];
        self.arm(ElectionTimer::Formation, &mut effects);
        effects
    }

    /// Formation timer fired
    pub fn on_formation_timeout(&mut self, peers: &[PeerId]) -> Vec<ElectionEffect> {
        if !self.session.formation_timer {
            return Vec::new();
        }
        self.session.formation_timer = false;

        if self.state != MeshState::Discovering {
            return Vec::new();
        }

        if peers.is_empty() {
            debug!("Election: Formation timeout with no peers, extending");
            let mut effects = Vec::new();
            self.arm(ElectionTimer::Formation, &mut effects);
            return effects;
        }

        info!(
            "Election: Formation timeout with {} peer(s), starting election",
            peers.len()
        );
        self.start_election(peers)
    }

    /// Start (or restart) an election against the given confirmed peers
    pub fn start_election(&mut self, peers: &[PeerId]) -> Vec<ElectionEffect> {
        let mut effects = Vec::new();

        self.disarm(ElectionTimer::Formation, &mut effects);
        self.disarm(ElectionTimer::CoordinatorWait, &mut effects);
        self.transition(MeshState::Electing, &mut effects);
        self.set_coordinator(None, &mut effects);
        self.session.waiting_for_ok = true;

        let higher: Vec<PeerId> = peers
            .iter()
            .copied()
            .filter(|p| *p > self.local_id)
            .collect();

        if higher.is_empty() {
            info!("Election: No higher peers, {} takes over", self.local_id);
            self.become_coordinator(&mut effects);
            return effects;
        }

        info!(
            "Election: {} sending ELECTION to {} higher peer(s)",
            self.local_id,
            higher.len()
        );
        for to in higher {
            effects.push(ElectionEffect::Send {
                to,
                message: MeshMessage::election(self.local_id),
            });
        }
        self.arm(ElectionTimer::Election, &mut effects);
        effects
    }

    /// ELECTION received
    pub fn on_election(&mut self, sender: PeerId, peers: &[PeerId]) -> Vec<ElectionEffect> {
        if sender >= self.local_id {
            debug!(
                "Election: Ignoring ELECTION from {} (not lower than {})",
                sender, self.local_id
            );
            return Vec::new();
        }

        debug!("Election: ELECTION from lower peer {}, answering OK", sender);
        let mut effects = vec![ElectionEffect::Send {
            to: sender,
            message: MeshMessage::ok(self.local_id),
        }];
        effects.extend(self.start_election(peers));
        effects
    }

    /// OK received: a higher peer will take over
    pub fn on_ok(&mut self, sender: PeerId) -> Vec<ElectionEffect> {
        if self.state != MeshState::Electing || !self.session.waiting_for_ok {
            debug!("Election: Ignoring late OK from {}", sender);
            return Vec::new();
        }

        info!("Election: OK from {}, awaiting COORDINATOR", sender);
        let mut effects = Vec::new();
        self.session.waiting_for_ok = false;
        self.disarm(ElectionTimer::Election, &mut effects);
        self.arm(ElectionTimer::CoordinatorWait, &mut effects);
        effects
    }

    /// Election timer fired: nobody higher answered
    pub fn on_election_timeout(&mut self) -> Vec<ElectionEffect> {
        if !self.session.election_timer {
            return Vec::new();
        }
        self.session.election_timer = false;

        if self.state != MeshState::Electing || !self.session.waiting_for_ok {
            return Vec::new();
        }

        info!("Election: No OK before timeout, {} takes over", self.local_id);
        let mut effects = Vec::new();
        self.become_coordinator(&mut effects);
        effects
    }

    /// Coordinator-wait timer fired: the peer that answered OK never announced
    pub fn on_coordinator_wait_timeout(&mut self, peers: &[PeerId]) -> Vec<ElectionEffect> {
        if !self.session.coordinator_wait {
            return Vec::new();
        }
        self.session.coordinator_wait = false;

        if self.state != MeshState::Electing || self.coordinator.is_some() {
            return Vec::new();
        }

        warn!("Election: No COORDINATOR after OK, restarting election");
        self.start_election(peers)
    }

    /// COORDINATOR received
    pub fn on_coordinator(&mut self, leader: PeerId, anchor: Option<&str>) -> Vec<ElectionEffect> {
        let mut effects = Vec::new();

        if leader == self.local_id {
            return effects;
        }

        // Conflicting claim from a lower peer: keep the role and tell it so
        if self.is_coordinator() && leader < self.local_id {
            warn!(
                "Election: Lower peer {} claims coordinator, re-announcing {}",
                leader, self.local_id
            );
            effects.push(ElectionEffect::Send {
                to: leader,
                message: MeshMessage::coordinator(self.local_id, self.anchor.as_deref()),
            });
            return effects;
        }

        let settled = matches!(self.state, MeshState::Connected | MeshState::Resolving);
        if settled && self.coordinator == Some(leader) && self.anchor.as_deref() == anchor {
            debug!("Election: Duplicate COORDINATOR from {}", leader);
            return effects;
        }

        info!("Election: {} recognizes {} as coordinator", self.local_id, leader);
        self.session.waiting_for_ok = false;
        self.disarm(ElectionTimer::Formation, &mut effects);
        self.disarm(ElectionTimer::Election, &mut effects);
        self.disarm(ElectionTimer::CoordinatorWait, &mut effects);
        self.set_coordinator(Some(leader), &mut effects);
        self.anchor = anchor.map(str::to_string);

        if self.bootstrap && self.anchor.is_some() {
            self.resolve_attempts = 0;
            self.transition(MeshState::Resolving, &mut effects);
        } else {
            self.enter_connected(&mut effects);
        }
        effects
    }

    /// A confirmed peer appeared. The coordinator re-announces itself so a
    /// late joiner learns who leads.
    pub fn on_peer_confirmed(&mut self, peer: PeerId) -> Vec<ElectionEffect> {
        let settled = matches!(self.state, MeshState::Connected | MeshState::Resolving);
        if !self.is_coordinator() || !settled {
            return Vec::new();
        }

        debug!("Election: Re-announcing coordinator to late joiner {}", peer);
        vec![ElectionEffect::Send {
            to: peer,
            message: MeshMessage::coordinator(self.local_id, self.anchor.as_deref()),
        }]
    }

    /// A confirmed peer's connection was lost
    pub fn on_peer_lost(&mut self, peer: PeerId, remaining: &[PeerId]) -> Vec<ElectionEffect> {
        if self.coordinator != Some(peer) {
            return Vec::new();
        }

        warn!("Election: Coordinator {} lost, re-electing", peer);
        self.anchor = None;
        self.start_election(remaining)
    }

    /// Outcome of shared-space resolution reported by the application
    pub fn on_resolution(&mut self, resolved: bool) -> Vec<ElectionEffect> {
        let mut effects = Vec::new();
        if self.state != MeshState::Resolving {
            debug!("Election: Ignoring resolution report in {}", self.state);
            return effects;
        }

        if resolved {
            info!("Election: Shared space resolved");
            self.enter_connected(&mut effects);
            return effects;
        }

        if self.resolve_attempts >= self.max_resolve_attempts {
            return effects;
        }

        self.resolve_attempts += 1;
        if self.resolve_attempts < self.max_resolve_attempts {
            warn!(
                "Election: Resolution attempt {}/{} failed",
                self.resolve_attempts, self.max_resolve_attempts
            );
            effects.push(ElectionEffect::ResolutionRetry {
                attempt: self.resolve_attempts,
                max_attempts: self.max_resolve_attempts,
            });
        } else {
            warn!(
                "Election: Resolution failed after {} attempts",
                self.resolve_attempts
            );
            effects.push(ElectionEffect::ResolutionFailed {
                attempts: self.resolve_attempts,
            });
        }
        effects
    }

    /// Cancel everything before teardown
    pub fn shutdown(&mut self) -> Vec<ElectionEffect> {
        let mut effects = Vec::new();
        self.disarm(ElectionTimer::Formation, &mut effects);
        self.disarm(ElectionTimer::Election, &mut effects);
        self.disarm(ElectionTimer::CoordinatorWait, &mut effects);
        self.session.waiting_for_ok = false;
        effects.push(ElectionEffect::StopDiscovery);
        effects
    }

    fn become_coordinator(&mut self, effects: &mut Vec<ElectionEffect>) {
        self.session.waiting_for_ok = false;
        self.disarm(ElectionTimer::Formation, effects);
        self.disarm(ElectionTimer::Election, effects);
        self.disarm(ElectionTimer::CoordinatorWait, effects);

        // Re-elections keep the shared space already announced
        if !self.bootstrap {
            self.anchor = None;
        } else if self.anchor.is_none() {
            self.anchor = Some(Uuid::new_v4().to_string());
        }

        info!("Election: {} is coordinator", self.local_id);
        self.set_coordinator(Some(self.local_id), effects);
        effects.push(ElectionEffect::Broadcast(MeshMessage::coordinator(
            self.local_id,
            self.anchor.as_deref(),
        )));
        self.enter_connected(effects);
    }

    fn enter_connected(&mut self, effects: &mut Vec<ElectionEffect>) {
        self.transition(MeshState::Connected, effects);
        if self.config.stop_discovery_when_connected {
            effects.push(ElectionEffect::StopDiscovery);
        }
    }

    fn transition(&mut self, to: MeshState, effects: &mut Vec<ElectionEffect>) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        info!("Election: {} → {}", from, to);
        effects.push(ElectionEffect::StateChanged { from, to });
    }

    fn set_coordinator(&mut self, coordinator: Option<PeerId>, effects: &mut Vec<ElectionEffect>) {
        if self.coordinator != coordinator {
            self.coordinator = coordinator;
            effects.push(ElectionEffect::CoordinatorChanged(coordinator));
        }
    }

    fn arm(&mut self, timer: ElectionTimer, effects: &mut Vec<ElectionEffect>) {
        let after = match timer {
            ElectionTimer::Formation => {
                self.session.formation_timer = true;
                self.config.formation_timeout
            }
            ElectionTimer::Election => {
                self.session.election_timer = true;
                self.config.election_timeout
            }
            ElectionTimer::CoordinatorWait => {
                self.session.coordinator_wait = true;
                self.config.coordinator_timeout
            }
        };
        effects.push(ElectionEffect::Schedule { timer, after });
    }

    fn disarm(&mut self, timer: ElectionTimer, effects: &mut Vec<ElectionEffect>) {
        let flag = match timer {
            ElectionTimer::Formation => &mut self.session.formation_timer,
            ElectionTimer::Election => &mut self.session.election_timer,
            ElectionTimer::CoordinatorWait => &mut self.session.coordinator_wait,
        };
        if std::mem::take(flag) {
            effects.push(ElectionEffect::Cancel(timer));
        }
    }
}
