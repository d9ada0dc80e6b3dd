//! CSMA/CD medium-access simulation
//!
//! A timing model that gates sends: each queued job senses the medium,
//! may suffer a synthetic collision, backs off exponentially and finally
//! transmits. It does not arbitrate the real link; its only effect is to
//! delay a send or abandon it after too many collisions.
//!
//! Collisions are rolled with probability proportional to the number of
//! peers on the medium, capped, and never rolled once
//! `collision_free_after` attempts have been made, so demonstrations always
//! finish.

use crate::config::CsmaConfig;
use rand::rngs::StdRng;
use rand::Rng;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Phase of the simulated medium
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CsmaPhase {
    #[default]
    Idle,
    Sensing,
    Collision,
    Backoff { remaining_slots: u32 },
    Transmitting,
    Success,
}

impl fmt::Display for CsmaPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CsmaPhase::Idle => write!(f, "IDLE"),
            CsmaPhase::Sensing => write!(f, "SENSING"),
            CsmaPhase::Collision => write!(f, "COLLISION"),
            CsmaPhase::Backoff { remaining_slots } => write!(f, "BACKOFF({})", remaining_slots),
            CsmaPhase::Transmitting => write!(f, "TRANSMITTING"),
            CsmaPhase::Success => write!(f, "SUCCESS"),
        }
    }
}

/// Read-only view for visualization
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct CsmaSnapshot {
    pub phase: CsmaPhase,
    /// Sensing phases entered for the current job
    pub attempts: u32,
    pub collisions: u32,
    /// Window used by the most recent backoff
    pub backoff_window: Option<u32>,
    pub queued: usize,
    pub total_successes: u64,
    pub total_abandoned: u64,
}

/// Result of one simulation step
#[derive(Debug)]
pub struct CsmaOutput<T> {
    /// Phase after the step
    pub phase: CsmaPhase,
    /// Delay before the next step, `None` when the medium went idle
    pub wait: Option<Duration>,
    /// Job whose send must be performed now
    pub transmit: Option<T>,
    /// Job abandoned after this many attempts
    pub abandoned: Option<(T, u32)>,
}

impl<T> CsmaOutput<T> {
    fn new(phase: CsmaPhase) -> Self {
        Self {
            phase,
            wait: None,
            transmit: None,
            abandoned: None,
        }
    }
}

/// Medium-access simulator over queued jobs of type `T`
pub struct CsmaSimulator<T> {
    config: CsmaConfig,
    phase: CsmaPhase,
    queue: VecDeque<T>,
    active: Option<T>,
    attempts: u32,
    collisions: u32,
    backoff_window: Option<u32>,
    total_successes: u64,
    total_abandoned: u64,
    rng: StdRng,
}

impl<T> CsmaSimulator<T> {
    pub fn new(config: CsmaConfig, rng: StdRng) -> Self {
        Self {
            config,
            phase: CsmaPhase::Idle,
            queue: VecDeque::new(),
            active: None,
            attempts: 0,
            collisions: 0,
            backoff_window: None,
            total_successes: 0,
            total_abandoned: 0,
            rng,
        }
    }

    pub fn phase(&self) -> CsmaPhase {
        self.phase
    }

    pub fn snapshot(&self) -> CsmaSnapshot {
        CsmaSnapshot {
            phase: self.phase,
            attempts: self.attempts,
            collisions: self.collisions,
            backoff_window: self.backoff_window,
            queued: self.queue.len(),
            total_successes: self.total_successes,
            total_abandoned: self.total_abandoned,
        }
    }

    /// Queue a job. Starts the simulation when the medium is idle; otherwise
    /// the job waits behind the active one and `None` is returned.
    pub fn enqueue(&mut self, job: T, peer_count: usize) -> Option<CsmaOutput<T>> {
        self.queue.push_back(job);
        if self.phase == CsmaPhase::Idle && self.active.is_none() {
            Some(self.advance(peer_count))
        } else {
            debug!("CSMA: Medium busy, {} job(s) queued", self.queue.len());
            None
        }
    }

    /// Move to the next phase. Called when the previous wait elapsed.
    pub fn advance(&mut self, peer_count: usize) -> CsmaOutput<T> {
        match self.phase {
            CsmaPhase::Idle => self.start_next(),
            CsmaPhase::Sensing => self.finish_sensing(peer_count),
            CsmaPhase::Collision => self.finish_jam(),
            CsmaPhase::Backoff { remaining_slots } => {
                let remaining_slots = remaining_slots.saturating_sub(1);
                if remaining_slots == 0 {
                    self.sense()
                } else {
                    self.set_phase(CsmaPhase::Backoff { remaining_slots });
                    let mut out = CsmaOutput::new(self.phase);
                    out.wait = Some(self.config.slot_duration);
                    out
                }
            }
            CsmaPhase::Transmitting => {
                let job = self.active.take();
                self.total_successes += 1;
                info!("CSMA: Transmitted after {} attempt(s)", self.attempts);
                self.set_phase(CsmaPhase::Success);
                let mut out = CsmaOutput::new(self.phase);
                out.transmit = job;
                out.wait = Some(self.config.success_hold);
                out
            }
            CsmaPhase::Success => {
                self.set_phase(CsmaPhase::Idle);
                self.start_next()
            }
        }
    }

    /// Abandon everything (teardown). Returns the jobs that never ran.
    pub fn clear(&mut self) -> Vec<T> {
        self.phase = CsmaPhase::Idle;
        self.attempts = 0;
        self.collisions = 0;
        self.active.take().into_iter().chain(self.queue.drain(..)).collect()
    }

    /// Collision probability for the given number of peers and attempt
    pub fn collision_probability(&self, peer_count: usize, attempt: u32) -> f64 {
        if let Some(limit) = self.config.collision_free_after {
            if attempt > limit {
                return 0.0;
            }
        }
        (self.config.collision_probability_per_peer * peer_count as f64)
            .min(self.config.max_collision_probability)
            .clamp(0.0, 1.0)
    }

    /// Backoff window in slots after the given attempt collided
    pub fn backoff_window_for(&self, attempt: u32) -> u32 {
        let exp = attempt.min(self.config.backoff_cap).min(31);
        (1u32 << exp) - 1
    }

    fn start_next(&mut self) -> CsmaOutput<T> {
        match self.queue.pop_front() {
            Some(job) => {
                self.active = Some(job);
                self.attempts = 0;
                self.collisions = 0;
                self.backoff_window = None;
                self.sense()
            }
            None => {
                self.set_phase(CsmaPhase::Idle);
                CsmaOutput::new(self.phase)
            }
        }
    }

    fn sense(&mut self) -> CsmaOutput<T> {
        self.attempts += 1;
        self.set_phase(CsmaPhase::Sensing);
        let mut out = CsmaOutput::new(self.phase);
        out.wait = Some(self.config.sense_duration);
        out
    }

    fn finish_sensing(&mut self, peer_count: usize) -> CsmaOutput<T> {
        let p = self.collision_probability(peer_count, self.attempts);
        let collided = p > 0.0 && self.rng.gen_bool(p);

        if collided {
            self.collisions += 1;
            warn!(
                "CSMA: Collision on attempt {} (p={:.2})",
                self.attempts, p
            );
            self.set_phase(CsmaPhase::Collision);
            let mut out = CsmaOutput::new(self.phase);
            out.wait = Some(self.config.jam_duration);
            out
        } else {
            self.set_phase(CsmaPhase::Transmitting);
            let mut out = CsmaOutput::new(self.phase);
            out.wait = Some(self.config.transmit_duration);
            out
        }
    }

    fn finish_jam(&mut self) -> CsmaOutput<T> {
        if self.attempts >= self.config.max_attempts {
            let attempts = self.attempts;
            warn!("CSMA: Giving up after {} attempts", attempts);
            self.total_abandoned += 1;
            let job = self.active.take();
            self.set_phase(CsmaPhase::Idle);
            let mut out = self.start_next();
            out.abandoned = job.map(|j| (j, attempts));
            return out;
        }

        let window = self.backoff_window_for(self.attempts);
        let slots = self.rng.gen_range(0..=window);
        self.backoff_window = Some(window);
        debug!("CSMA: Backoff {} of {} slot(s)", slots, window);

        if slots == 0 {
            return self.sense();
        }

        self.set_phase(CsmaPhase::Backoff {
            remaining_slots: slots,
        });
        let mut out = CsmaOutput::new(self.phase);
        out.wait = Some(self.config.slot_duration);
        out
    }

    fn set_phase(&mut self, phase: CsmaPhase) {
        if self.phase != phase {
            debug!("CSMA: {} → {}", self.phase, phase);
            self.phase = phase;
        }
    }
}
