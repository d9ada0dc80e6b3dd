//! Predefined mesh scenarios
//!
//! Each scenario builds an in-memory cluster, drives it through one
//! situation (formation, coordinator loss, a late joiner, traffic under
//! loss or contention) and reports what the mesh did.

use peermesh_core::{
    CsmaConfig, CsmaPhase, CsmaSnapshot, DeliveryStatus, ElectionConfig, MeshConfig, MeshError,
    MeshHandle, MeshNotification, MeshSnapshot, MeshState, MemoryNetwork, NetworkStats, PeerId,
    RttSummary, TransportConfig,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Errors from scenario execution
#[derive(Error, Debug)]
pub enum ScenarioError {
    #[error("Scenario {scenario} needs at least {needed} peers, got {got}")]
    TooFewPeers {
        scenario: Scenario,
        needed: usize,
        got: usize,
    },

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Mesh error: {0}")]
    Mesh(#[from] MeshError),
}

/// Available scenarios
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Scenario {
    /// All peers start together and elect the highest id
    Election,
    /// The coordinator leaves and the rest re-elect
    Failover,
    /// A peer with the highest id joins an established mesh
    LateJoin,
    /// Reliable sends to the coordinator under medium loss
    Reliable,
    /// Unreliable sends with receiver-side drops
    Unreliable,
    /// Every follower sends through the CSMA/CD simulation at once
    Csma,
    /// Followers resolve the coordinator's shared-space anchor
    Bootstrap,
}

impl Scenario {
    pub const ALL: [Scenario; 7] = [
        Scenario::Election,
        Scenario::Failover,
        Scenario::LateJoin,
        Scenario::Reliable,
        Scenario::Unreliable,
        Scenario::Csma,
        Scenario::Bootstrap,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Scenario::Election => "election",
            Scenario::Failover => "failover",
            Scenario::LateJoin => "late-join",
            Scenario::Reliable => "reliable",
            Scenario::Unreliable => "unreliable",
            Scenario::Csma => "csma",
            Scenario::Bootstrap => "bootstrap",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Scenario::Election => "All peers start together and elect the highest id",
            Scenario::Failover => "The coordinator leaves and the rest re-elect",
            Scenario::LateJoin => "A peer with the highest id joins an established mesh",
            Scenario::Reliable => "Reliable sends to the coordinator under medium loss",
            Scenario::Unreliable => "Unreliable sends with receiver-side drops",
            Scenario::Csma => "Every follower sends through the CSMA/CD simulation at once",
            Scenario::Bootstrap => "Followers resolve the coordinator's shared-space anchor",
        }
    }

    fn min_peers(&self) -> usize {
        match self {
            Scenario::Failover => 3,
            _ => 2,
        }
    }
}

impl std::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Knobs shared by all scenarios
#[derive(Debug, Clone)]
pub struct ScenarioOptions {
    pub peers: usize,
    pub seed: u64,
    /// Sends per sending peer
    pub messages: usize,
    /// Frame loss on the simulated medium
    pub loss_rate: f64,
    /// Receiver-side drop probability for unreliable frames
    pub drop_probability: f64,
    pub formation_timeout: Duration,
    pub election_timeout: Duration,
    pub ack_timeout: Duration,
    /// Upper bound on any single wait
    pub deadline: Duration,
}

impl Default for ScenarioOptions {
    fn default() -> Self {
        Self {
            peers: 3,
            seed: 42,
            messages: 10,
            loss_rate: 0.0,
            drop_probability: 0.10,
            formation_timeout: Duration::from_secs(2),
            election_timeout: Duration::from_millis(500),
            ack_timeout: Duration::from_millis(1000),
            deadline: Duration::from_secs(60),
        }
    }
}

/// Outcome counts for sends made during a scenario
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeliveryTally {
    pub requested: usize,
    pub delivered: usize,
    pub sent: usize,
    pub retries: usize,
    pub failed: usize,
    pub received: usize,
    pub dropped: usize,
    /// Notifications a follower's receiver lagged past
    pub missed_notifications: u64,
}

impl DeliveryTally {
    /// Count one status, returning whether the delivery settled
    fn count(&mut self, status: DeliveryStatus) -> bool {
        match status {
            DeliveryStatus::InProgress => {}
            DeliveryStatus::Retrying { .. } => self.retries += 1,
            DeliveryStatus::Delivered { .. } => self.delivered += 1,
            DeliveryStatus::Sent => self.sent += 1,
            DeliveryStatus::Failed { .. } => self.failed += 1,
        }
        status.is_terminal()
    }
}

/// What a scenario observed
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub scenario: Scenario,
    pub peers: Vec<PeerId>,
    pub expected_coordinator: Option<PeerId>,
    pub coordinator: Option<PeerId>,
    pub deliveries: DeliveryTally,
    pub rtt: Option<RttSummary>,
    pub csma: Vec<CsmaSnapshot>,
    pub network: NetworkStats,
    pub duration_ms: u64,
    pub passed: bool,
}

struct Node {
    handle: MeshHandle,
    task: JoinHandle<()>,
}

struct Cluster {
    net: MemoryNetwork,
    nodes: Vec<Node>,
    options: ScenarioOptions,
    rng: StdRng,
}

impl Cluster {
    fn new(options: &ScenarioOptions) -> Self {
        let net = MemoryNetwork::with_seed(options.seed);
        net.set_loss_rate(options.loss_rate);
        Self {
            net,
            nodes: Vec::new(),
            options: options.clone(),
            rng: StdRng::seed_from_u64(options.seed),
        }
    }

    fn config(&self, id: PeerId) -> MeshConfig {
        let o = &self.options;
        MeshConfig::new(id, format!("sim-{}", id))
            .with_device_model("memory")
            .with_election(ElectionConfig {
                formation_timeout: o.formation_timeout,
                election_timeout: o.election_timeout,
                coordinator_timeout: o.election_timeout * 2,
                ..ElectionConfig::default()
            })
            .with_transport(TransportConfig {
                ack_timeout: o.ack_timeout,
                unreliable_drop_probability: o.drop_probability,
                ..TransportConfig::default()
            })
            .with_seed(o.seed ^ id.as_u64())
    }

    fn random_id(&mut self) -> PeerId {
        loop {
            let id = PeerId::random_with(&mut self.rng);
            if self.nodes.iter().all(|n| n.handle.local_id() != id) {
                return id;
            }
        }
    }

    fn spawn(&mut self, config: MeshConfig) -> Result<MeshHandle, ScenarioError> {
        let name = format!("node-{}", self.nodes.len() + 1);
        let (handle, task) = self.net.spawn_node(name, config)?;
        self.nodes.push(Node {
            handle: handle.clone(),
            task,
        });
        Ok(handle)
    }

    fn live(&self) -> impl Iterator<Item = &MeshHandle> {
        self.nodes
            .iter()
            .filter(|n| !n.task.is_finished())
            .map(|n| &n.handle)
    }

    fn ids(&self) -> Vec<PeerId> {
        self.nodes.iter().map(|n| n.handle.local_id()).collect()
    }

    fn handle(&self, id: PeerId) -> Option<MeshHandle> {
        self.live().find(|h| h.local_id() == id).cloned()
    }

    async fn wait(
        &self,
        handle: &MeshHandle,
        what: &'static str,
        predicate: impl FnMut(&MeshSnapshot) -> bool,
    ) -> Result<MeshSnapshot, ScenarioError> {
        tokio::time::timeout(self.options.deadline, handle.wait_for(predicate))
            .await
            .map_err(|_| ScenarioError::Timeout(what))?
            .map_err(ScenarioError::from)
    }

    /// Wait until every live node is settled on one coordinator
    async fn converge(&self) -> Result<Option<PeerId>, ScenarioError> {
        let live: Vec<MeshHandle> = self.live().cloned().collect();
        let Some(expected) = live.iter().map(|h| h.local_id()).max() else {
            return Ok(None);
        };

        for handle in &live {
            self.wait(handle, "convergence", |s| {
                s.coordinator == Some(expected)
                    && matches!(s.state, MeshState::Connected | MeshState::Resolving)
            })
            .await?;
        }
        Ok(Some(expected))
    }

    fn coordinator(&self) -> Option<PeerId> {
        let seen: BTreeSet<Option<PeerId>> =
            self.live().map(|h| h.snapshot().coordinator).collect();
        match seen.len() {
            1 => seen.into_iter().next().flatten(),
            _ => None,
        }
    }

    async fn shutdown(self) {
        for node in &self.nodes {
            let _ = node.handle.shutdown();
        }
        for node in self.nodes {
            let _ = node.task.await;
        }
    }
}

/// Run one scenario to completion
pub async fn run_scenario(
    scenario: Scenario,
    options: &ScenarioOptions,
) -> Result<ScenarioReport, ScenarioError> {
    if options.peers < scenario.min_peers() {
        return Err(ScenarioError::TooFewPeers {
            scenario,
            needed: scenario.min_peers(),
            got: options.peers,
        });
    }

    info!("Scenario: {} with {} peers", scenario, options.peers);
    let started = Instant::now();
    let mut cluster = Cluster::new(options);

    let mut report = ScenarioReport {
        scenario,
        peers: Vec::new(),
        expected_coordinator: None,
        coordinator: None,
        deliveries: DeliveryTally::default(),
        rtt: None,
        csma: Vec::new(),
        network: NetworkStats::default(),
        duration_ms: 0,
        passed: false,
    };

    match scenario {
        Scenario::Election => {
            spawn_many(&mut cluster, options.peers, |c| c)?;
            report.expected_coordinator = cluster.converge().await?;
        }
        Scenario::Failover => {
            spawn_many(&mut cluster, options.peers, |c| c)?;
            let first = cluster.converge().await?;
            if let Some(leader) = first.and_then(|id| cluster.handle(id)) {
                info!("Scenario: Stopping coordinator {}", leader.local_id());
                leader.shutdown()?;
            }
            // Give the stopped task a moment to tear down its link
            tokio::time::sleep(Duration::from_millis(50)).await;
            report.expected_coordinator = cluster.converge().await?;
        }
        Scenario::LateJoin => {
            spawn_many(&mut cluster, options.peers - 1, |c| c)?;
            let leader = cluster.converge().await?;
            let highest = cluster.ids().into_iter().max().map(|id| id.as_u64()).unwrap_or(0);
            let late_id = PeerId(highest.saturating_add(1));
            let late = cluster.spawn(cluster.config(late_id))?;
            cluster
                .wait(&late, "late joiner", |s| s.state == MeshState::Connected)
                .await?;
            report.expected_coordinator = leader;
        }
        Scenario::Reliable | Scenario::Unreliable => {
            spawn_many(&mut cluster, options.peers, |c| c)?;
            let leader = cluster.converge().await?;
            report.expected_coordinator = leader;
            if let Some(leader) = leader {
                report.deliveries = exchange(&cluster, leader, scenario == Scenario::Reliable).await?;
                report.rtt = rtt_towards(&cluster, leader);
            }
        }
        Scenario::Csma => {
            spawn_many(&mut cluster, options.peers, |c| {
                c.with_csma(CsmaConfig {
                    enabled: true,
                    ..CsmaConfig::default()
                })
            })?;
            let leader = cluster.converge().await?;
            report.expected_coordinator = leader;
            if let Some(leader) = leader {
                report.deliveries = exchange(&cluster, leader, true).await?;
                report.rtt = rtt_towards(&cluster, leader);
            }
            report.csma = cluster.live().map(|h| h.snapshot().csma).collect();
        }
        Scenario::Bootstrap => {
            spawn_many(&mut cluster, options.peers, |c| c.with_bootstrap(true))?;
            let leader = cluster.converge().await?;
            for handle in cluster.live() {
                if Some(handle.local_id()) != leader {
                    handle.report_resolution(true)?;
                }
            }
            for handle in cluster.live() {
                cluster
                    .wait(handle, "resolution", |s| s.state == MeshState::Connected)
                    .await?;
            }
            report.expected_coordinator = leader;
        }
    }

    report.peers = cluster.ids();
    report.coordinator = cluster.coordinator();
    report.network = cluster.net.stats();
    report.passed = report.expected_coordinator.is_some()
        && report.coordinator == report.expected_coordinator
        && traffic_ok(scenario, &report.deliveries);
    report.duration_ms = started.elapsed().as_millis() as u64;

    if report.passed {
        info!("Scenario: {} passed in {} ms", scenario, report.duration_ms);
    } else {
        warn!("Scenario: {} failed", scenario);
    }

    cluster.shutdown().await;
    Ok(report)
}

fn spawn_many(
    cluster: &mut Cluster,
    count: usize,
    customize: impl Fn(MeshConfig) -> MeshConfig,
) -> Result<(), ScenarioError> {
    for _ in 0..count {
        let id = cluster.random_id();
        let config = customize(cluster.config(id));
        cluster.spawn(config)?;
    }
    Ok(())
}

fn traffic_ok(scenario: Scenario, tally: &DeliveryTally) -> bool {
    // Settled counts are exact unless a receiver lagged
    let matches = |settled: usize| {
        settled == tally.requested
            || (tally.missed_notifications > 0 && settled <= tally.requested)
    };
    match scenario {
        Scenario::Reliable | Scenario::Csma => matches(tally.delivered + tally.failed),
        Scenario::Unreliable => {
            matches(tally.sent) && tally.received + tally.dropped <= tally.requested
        }
        _ => true,
    }
}

fn rtt_towards(cluster: &Cluster, leader: PeerId) -> Option<RttSummary> {
    cluster
        .live()
        .filter(|h| h.local_id() != leader)
        .find_map(|h| h.snapshot().rtt_summary(leader))
}

/// Every follower sends `messages` payloads to the coordinator
async fn exchange(
    cluster: &Cluster,
    leader: PeerId,
    reliable: bool,
) -> Result<DeliveryTally, ScenarioError> {
    let Some(leader_handle) = cluster.handle(leader) else {
        return Ok(DeliveryTally::default());
    };
    let followers: Vec<MeshHandle> = cluster
        .live()
        .filter(|h| h.local_id() != leader)
        .cloned()
        .collect();

    let mut inbox = leader_handle.subscribe();
    let mut outboxes: Vec<broadcast::Receiver<MeshNotification>> =
        followers.iter().map(|h| h.subscribe()).collect();

    let mut tally = DeliveryTally::default();
    for handle in &followers {
        for i in 0..cluster.options.messages {
            let payload = format!("{}:{}", handle.local_id(), i);
            if reliable {
                handle.send_reliable(leader, payload).await?;
            } else {
                handle.send_unreliable(leader, payload).await?;
            }
            tally.requested += 1;
        }
    }

    let deadline = tokio::time::Instant::now() + cluster.options.deadline;
    for (handle, outbox) in followers.iter().zip(&mut outboxes) {
        let expected = cluster.options.messages;
        let mut settled = 0;
        while settled < expected {
            let next = tokio::time::timeout_at(deadline, outbox.recv())
                .await
                .map_err(|_| ScenarioError::Timeout("deliveries"))?;
            match next {
                Ok(MeshNotification::Delivery { status, .. }) => {
                    if tally.count(status) {
                        settled += 1;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    warn!(
                        "Scenario: {} lagged by {} notification(s), settling from snapshot",
                        handle.local_id(),
                        missed
                    );
                    tally.missed_notifications += missed;
                    settle_from_snapshot(handle, outbox, &mut tally, deadline).await?;
                    break;
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    // Let the last frames reach the coordinator
    tokio::time::sleep(Duration::from_millis(50)).await;
    loop {
        match inbox.try_recv() {
            Ok(MeshNotification::Received { .. }) => tally.received += 1,
            Ok(MeshNotification::UnreliableDropped { .. }) => tally.dropped += 1,
            Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(_) => break,
        }
    }

    Ok(tally)
}

/// Wait until nothing is queued or awaiting an ACK, then count whatever
/// statuses are still buffered
async fn settle_from_snapshot(
    handle: &MeshHandle,
    outbox: &mut broadcast::Receiver<MeshNotification>,
    tally: &mut DeliveryTally,
    deadline: tokio::time::Instant,
) -> Result<(), ScenarioError> {
    let idle = handle.wait_for(|s| {
        s.pending_deliveries == 0 && s.csma.queued == 0 && s.csma.phase == CsmaPhase::Idle
    });
    tokio::time::timeout_at(deadline, idle)
        .await
        .map_err(|_| ScenarioError::Timeout("deliveries"))??;

    loop {
        match outbox.try_recv() {
            Ok(MeshNotification::Delivery { status, .. }) => {
                tally.count(status);
            }
            Ok(_) => {}
            Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                tally.missed_notifications += missed;
            }
            Err(_) => break,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> ScenarioOptions {
        ScenarioOptions {
            peers: 3,
            messages: 5,
            formation_timeout: Duration::from_millis(500),
            election_timeout: Duration::from_millis(200),
            ack_timeout: Duration::from_millis(200),
            ..ScenarioOptions::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_election_scenario_passes() {
        let report = run_scenario(Scenario::Election, &quick()).await.unwrap();
        assert!(report.passed);
        assert_eq!(report.peers.len(), 3);
        assert_eq!(report.coordinator, report.peers.iter().max().copied());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_picks_runner_up() {
        let report = run_scenario(Scenario::Failover, &quick()).await.unwrap();
        let mut ids = report.peers.clone();
        ids.sort();
        assert!(report.passed);
        assert_eq!(report.coordinator, Some(ids[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_join_keeps_leader() {
        let report = run_scenario(Scenario::LateJoin, &quick()).await.unwrap();
        assert!(report.passed);
        assert_ne!(report.coordinator, report.peers.iter().max().copied());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reliable_exchange_settles_every_send() {
        let report = run_scenario(Scenario::Reliable, &quick()).await.unwrap();
        assert!(report.passed);
        assert_eq!(report.deliveries.requested, 10);
        assert_eq!(report.deliveries.delivered, 10);
        assert!(report.rtt.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lagging_receiver_still_settles() {
        // Two notifications per send overflow the follower's buffer
        let options = ScenarioOptions {
            peers: 2,
            messages: 600,
            ..quick()
        };
        let report = run_scenario(Scenario::Unreliable, &options).await.unwrap();
        assert!(report.deliveries.missed_notifications > 0);
        assert!(report.deliveries.sent > 0);
        assert!(report.deliveries.sent <= 600);
        assert!(report.passed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_needs_three_peers() {
        let options = ScenarioOptions {
            peers: 2,
            ..quick()
        };
        let err = run_scenario(Scenario::Failover, &options).await.unwrap_err();
        assert!(matches!(err, ScenarioError::TooFewPeers { needed: 3, .. }));
    }
}
