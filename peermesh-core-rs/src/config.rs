//! Configuration for a mesh node
//!
//! Groups identity, election timing, transport behaviour, the CSMA/CD
//! simulation and shared-space bootstrap into one value.

use crate::error::ConfigError;
use crate::types::PeerId;
use std::time::Duration;

/// Complete node configuration
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Fixed identity (random when not set)
    pub peer_id: Option<PeerId>,

    /// Name advertised in DEVICE_INFO
    pub display_name: String,

    /// Model advertised in DEVICE_INFO
    pub device_model: String,

    pub election: ElectionConfig,

    pub transport: TransportConfig,

    pub csma: CsmaConfig,

    pub bootstrap: BootstrapConfig,

    /// Seed for the loss and collision simulations (entropy when not set)
    pub rng_seed: Option<u64>,
}

/// Bully election timing
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// How long to wait for peers before the first election
    pub formation_timeout: Duration,

    /// How long to wait for an OK from a higher peer
    pub election_timeout: Duration,

    /// How long to wait for COORDINATOR after an OK before retrying
    pub coordinator_timeout: Duration,

    /// Stop advertising once the mesh is connected
    pub stop_discovery_when_connected: bool,
}

/// Simulated transport behaviour
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Wait per reliable frame before retransmitting
    pub ack_timeout: Duration,

    /// Retransmissions after the original frame
    pub max_retries: u32,

    /// Probability that the receiver discards an unreliable frame
    pub unreliable_drop_probability: f64,

    /// RTT samples kept per peer
    pub rtt_history_capacity: usize,
}

/// CSMA/CD simulation parameters
#[derive(Debug, Clone)]
pub struct CsmaConfig {
    /// Gate sends through the medium-access simulation
    pub enabled: bool,
    pub sense_duration: Duration,
    pub jam_duration: Duration,
    pub slot_duration: Duration,
    pub transmit_duration: Duration,
    pub success_hold: Duration,
    /// Attempts before the send is abandoned
    pub max_attempts: u32,
    /// Exponent cap for the backoff window
    pub backoff_cap: u32,
    /// Collision probability contributed by each peer on the medium
    pub collision_probability_per_peer: f64,
    pub max_collision_probability: f64,
    /// Attempts after which collisions are no longer rolled
    pub collision_free_after: Option<u32>,
}

/// Shared-space bootstrap carried in the COORDINATOR announcement
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Followers pass through RESOLVING before CONNECTED
    pub enabled: bool,

    /// Failed resolutions reported before giving up
    pub max_resolve_attempts: u32,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            peer_id: None,
            display_name: "peer".to_string(),
            device_model: "unknown".to_string(),
            election: ElectionConfig::default(),
            transport: TransportConfig::default(),
            csma: CsmaConfig::default(),
            bootstrap: BootstrapConfig::default(),
            rng_seed: None,
        }
    }
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            formation_timeout: Duration::from_secs(30),
            election_timeout: Duration::from_secs(3),
            coordinator_timeout: Duration::from_secs(6),
            stop_discovery_when_connected: false,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(1000),
            max_retries: 3,
            unreliable_drop_probability: 0.10,
            rtt_history_capacity: 20,
        }
    }
}

impl Default for CsmaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sense_duration: Duration::from_millis(300),
            jam_duration: Duration::from_millis(200),
            slot_duration: Duration::from_millis(100),
            transmit_duration: Duration::from_millis(400),
            success_hold: Duration::from_millis(300),
            max_attempts: 10,
            backoff_cap: 10,
            collision_probability_per_peer: 0.15,
            max_collision_probability: 0.6,
            collision_free_after: Some(2),
        }
    }
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_resolve_attempts: 3,
        }
    }
}

impl MeshConfig {
    /// Create config with a fixed identity and display name
    pub fn new(peer_id: PeerId, display_name: impl Into<String>) -> Self {
        Self {
            peer_id: Some(peer_id),
            display_name: display_name.into(),
            ..Default::default()
        }
    }

    pub fn with_device_model(mut self, model: impl Into<String>) -> Self {
        self.device_model = model.into();
        self
    }

    pub fn with_election(mut self, election: ElectionConfig) -> Self {
        self.election = election;
        self
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_csma(mut self, csma: CsmaConfig) -> Self {
        self.csma = csma;
        self
    }

    pub fn with_bootstrap(mut self, enabled: bool) -> Self {
        self.bootstrap.enabled = enabled;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Check timeouts, counts and probabilities, clamping the latter into
    /// [0, 1]
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        let durations = [
            ("formation_timeout", self.election.formation_timeout),
            ("election_timeout", self.election.election_timeout),
            ("coordinator_timeout", self.election.coordinator_timeout),
            ("ack_timeout", self.transport.ack_timeout),
        ];
        for (name, d) in durations {
            if d.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }

        if self.transport.rtt_history_capacity == 0 {
            return Err(ConfigError::ZeroCount("rtt_history_capacity"));
        }
        if self.csma.max_attempts == 0 {
            return Err(ConfigError::ZeroCount("csma.max_attempts"));
        }
        if self.bootstrap.max_resolve_attempts == 0 {
            return Err(ConfigError::ZeroCount("max_resolve_attempts"));
        }

        let probabilities = [
            ("unreliable_drop_probability", self.transport.unreliable_drop_probability),
            ("csma.collision_probability_per_peer", self.csma.collision_probability_per_peer),
            ("csma.max_collision_probability", self.csma.max_collision_probability),
        ];
        for (name, p) in probabilities {
            // clamp() keeps NaN, which gen_bool rejects
            if !p.is_finite() {
                return Err(ConfigError::NotFinite(name));
            }
        }

        self.transport.unreliable_drop_probability =
            self.transport.unreliable_drop_probability.clamp(0.0, 1.0);
        self.csma.collision_probability_per_peer =
            self.csma.collision_probability_per_peer.clamp(0.0, 1.0);
        self.csma.max_collision_probability = self.csma.max_collision_probability.clamp(0.0, 1.0);

        Ok(self)
    }
}
