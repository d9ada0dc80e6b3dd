//! Simulated transport over the link layer
//!
//! Reliable mode tags each payload with a process-wide sequence number,
//! expects an ACK per frame and retransmits a bounded number of times.
//! Unreliable mode sends once; the receiving side drops a configured share
//! of frames to emulate loss.

use crate::config::TransportConfig;
use crate::protocol::{MeshMessage, ReliableFrame};
use crate::types::{DeliveryId, PeerId};
use rand::rngs::StdRng;
use rand::Rng;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Reliable frame awaiting its ACK
#[derive(Debug, Clone)]
pub struct PendingDelivery {
    pub delivery: DeliveryId,
    pub seq: u64,
    pub destination: PeerId,
    pub payload: String,
    /// Time the original frame went out
    pub sent_at: Instant,
    pub retries_remaining: u32,
    pub frames_sent: u32,
}

/// Bounded RTT history for one peer, oldest samples evicted first
#[derive(Debug, Clone)]
pub struct RttHistory {
    samples: VecDeque<Duration>,
    capacity: usize,
}

/// Aggregate over an [`RttHistory`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RttSummary {
    pub count: usize,
    pub min: Duration,
    pub max: Duration,
    pub mean: Duration,
    pub last: Duration,
}

impl RttHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, rtt: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(rtt);
    }

    pub fn samples(&self) -> Vec<Duration> {
        self.samples.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn summary(&self) -> Option<RttSummary> {
        let last = *self.samples.back()?;
        let min = *self.samples.iter().min()?;
        let max = *self.samples.iter().max()?;
        let total: Duration = self.samples.iter().sum();
        Some(RttSummary {
            count: self.samples.len(),
            min,
            max,
            mean: total / self.samples.len() as u32,
            last,
        })
    }
}

/// What to do when a retransmission timer fires
#[derive(Debug, Clone, PartialEq)]
pub enum RetransmitOutcome {
    /// Frame resent; re-arm the timer
    Retry {
        delivery: DeliveryId,
        destination: PeerId,
        attempt: u32,
        message: MeshMessage,
    },
    /// Budget used up. `last_frame` is the final retransmission, sent without
    /// waiting for its ACK.
    Exhausted {
        delivery: DeliveryId,
        destination: PeerId,
        frames_sent: u32,
        last_frame: Option<MeshMessage>,
    },
}

/// Matched acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckOutcome {
    pub delivery: DeliveryId,
    pub destination: PeerId,
    pub seq: u64,
    pub rtt: Duration,
}

/// Result of a DATA_RELIABLE frame arriving
#[derive(Debug, Clone, PartialEq)]
pub enum ReliableInbound {
    /// Deliver to the application after sending `ack` back
    Deliver { ack: MeshMessage, payload: String, seq: u64 },
    /// An ACK for one of our outstanding frames
    Acked(AckOutcome),
    /// An ACK nobody is waiting for (late, duplicate or after FAILED)
    StaleAck { seq: u64 },
}

/// Transport state: outstanding deliveries and RTT history
pub struct SimTransport {
    local_id: PeerId,
    config: TransportConfig,
    next_seq: u64,
    pending: HashMap<u64, PendingDelivery>,
    rtt: HashMap<PeerId, RttHistory>,
    rng: StdRng,
}

impl SimTransport {
    pub fn new(local_id: PeerId, config: TransportConfig, rng: StdRng) -> Self {
        Self {
            local_id,
            config,
            next_seq: 1,
            pending: HashMap::new(),
            rtt: HashMap::new(),
            rng,
        }
    }

    pub fn ack_timeout(&self) -> Duration {
        self.config.ack_timeout
    }

    /// Start a reliable delivery. Returns the sequence number and the frame
    /// to put on the wire; the caller arms the retransmission timer.
    pub fn send_reliable(
        &mut self,
        delivery: DeliveryId,
        destination: PeerId,
        payload: String,
        now: Instant,
    ) -> (u64, MeshMessage) {
        let seq = self.next_seq;
        self.next_seq += 1;

        let message = MeshMessage::reliable(
            self.local_id,
            &ReliableFrame::Seq {
                seq,
                payload: payload.clone(),
            },
        );

        debug!("Transport: seq {} → {} ({})", seq, destination, delivery);
        self.pending.insert(
            seq,
            PendingDelivery {
                delivery,
                seq,
                destination,
                payload,
                sent_at: now,
                retries_remaining: self.config.max_retries,
                frames_sent: 1,
            },
        );

        (seq, message)
    }

    /// Retransmission timer fired for `seq`. `None` when the delivery is
    /// already settled.
    pub fn on_retransmit_timeout(&mut self, seq: u64) -> Option<RetransmitOutcome> {
        let pending = self.pending.get_mut(&seq)?;

        if pending.retries_remaining == 0 {
            let pending = self.pending.remove(&seq)?;
            warn!(
                "Transport: seq {} to {} failed after {} frame(s)",
                seq, pending.destination, pending.frames_sent
            );
            return Some(RetransmitOutcome::Exhausted {
                delivery: pending.delivery,
                destination: pending.destination,
                frames_sent: pending.frames_sent,
                last_frame: None,
            });
        }

        pending.retries_remaining -= 1;
        pending.frames_sent += 1;
        let attempt = pending.frames_sent - 1;
        let message = MeshMessage::reliable(
            self.local_id,
            &ReliableFrame::Seq {
                seq,
                payload: pending.payload.clone(),
            },
        );

        if pending.retries_remaining > 0 {
            debug!(
                "Transport: Retransmitting seq {} to {} (attempt {})",
                seq, pending.destination, attempt
            );
            return Some(RetransmitOutcome::Retry {
                delivery: pending.delivery,
                destination: pending.destination,
                attempt,
                message,
            });
        }

        let pending = self.pending.remove(&seq)?;
        warn!(
            "Transport: seq {} to {} failed after {} frame(s)",
            seq, pending.destination, pending.frames_sent
        );
        Some(RetransmitOutcome::Exhausted {
            delivery: pending.delivery,
            destination: pending.destination,
            frames_sent: pending.frames_sent,
            last_frame: Some(message),
        })
    }

    /// Handle a DATA_RELIABLE frame from `from`
    pub fn on_reliable_frame(&mut self, from: PeerId, frame: ReliableFrame, now: Instant) -> ReliableInbound {
        match frame {
            ReliableFrame::Seq { seq, payload } => {
                debug!("Transport: seq {} from {}, acking", seq, from);
                ReliableInbound::Deliver {
                    ack: MeshMessage::reliable(self.local_id, &ReliableFrame::Ack { seq }),
                    payload,
                    seq,
                }
            }
            ReliableFrame::Ack { seq } => match self.on_ack(from, seq, now) {
                Some(outcome) => ReliableInbound::Acked(outcome),
                None => ReliableInbound::StaleAck { seq },
            },
        }
    }

    /// Match an ACK against the outstanding deliveries
    pub fn on_ack(&mut self, from: PeerId, seq: u64, now: Instant) -> Option<AckOutcome> {
        match self.pending.get(&seq) {
            Some(p) if p.destination == from => {}
            Some(p) => {
                warn!(
                    "Transport: ack {} from {} but seq was sent to {}",
                    seq, from, p.destination
                );
                return None;
            }
            None => {
                debug!("Transport: Stale ack {} from {}", seq, from);
                return None;
            }
        }

        let pending = self.pending.remove(&seq)?;
        let rtt = now.saturating_duration_since(pending.sent_at);
        self.rtt
            .entry(from)
            .or_insert_with(|| RttHistory::new(self.config.rtt_history_capacity))
            .push(rtt);

        info!("Transport: seq {} delivered to {} (rtt {:?})", seq, from, rtt);
        Some(AckOutcome {
            delivery: pending.delivery,
            destination: from,
            seq,
            rtt,
        })
    }

    /// Frame for a fire-and-forget send
    pub fn send_unreliable(&self, destination: PeerId, payload: String) -> MeshMessage {
        debug!("Transport: unreliable → {}", destination);
        MeshMessage::unreliable(self.local_id, payload)
    }

    /// Receiver-side loss roll for an unreliable frame
    pub fn should_drop_unreliable(&mut self) -> bool {
        self.rng.gen_bool(self.config.unreliable_drop_probability)
    }

    /// Fail every outstanding delivery to a peer that went away
    pub fn fail_peer(&mut self, peer: PeerId) -> Vec<(u64, DeliveryId)> {
        let seqs: Vec<u64> = self
            .pending
            .values()
            .filter(|p| p.destination == peer)
            .map(|p| p.seq)
            .collect();

        let mut failed: Vec<(u64, DeliveryId)> = seqs
            .into_iter()
            .filter_map(|seq| self.pending.remove(&seq).map(|p| (seq, p.delivery)))
            .collect();
        failed.sort();

        if !failed.is_empty() {
            warn!(
                "Transport: Peer {} lost with {} outstanding delivery(ies)",
                peer,
                failed.len()
            );
        }
        failed
    }

    /// Drop all outstanding deliveries (teardown)
    pub fn clear(&mut self) -> Vec<u64> {
        self.pending.drain().map(|(seq, _)| seq).collect()
    }

    pub fn pending(&self, seq: u64) -> Option<&PendingDelivery> {
        self.pending.get(&seq)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn rtt_history(&self, peer: PeerId) -> Option<&RttHistory> {
        self.rtt.get(&peer)
    }

    pub fn rtt_histories(&self) -> HashMap<PeerId, Vec<Duration>> {
        self.rtt.iter().map(|(p, h)| (*p, h.samples())).collect()
    }
}
