//! Property tests for the CSMA/CD simulator
//!
//! Invariants:
//! - Every job ends exactly once: transmitted or abandoned
//! - Attempts never exceed the configured ceiling
//! - Each success follows exactly one collision-free sensing phase
//! - Each collision backs off over 2^min(attempt, cap) - 1 slots, so
//!   windows strictly grow until the cap

use peermesh_core::{CsmaConfig, CsmaPhase, CsmaSimulator};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

// ============================================================================
// Strategies
// ============================================================================

fn medium() -> impl Strategy<Value = CsmaConfig> {
    (
        0.0f64..=1.0,
        1u32..=12,
        1u32..=10,
        prop::option::of(0u32..=4),
    )
        .prop_map(|(per_peer, max_attempts, backoff_cap, free_after)| CsmaConfig {
            enabled: true,
            collision_probability_per_peer: per_peer,
            max_collision_probability: 1.0,
            max_attempts,
            backoff_cap,
            collision_free_after: free_after,
            ..CsmaConfig::default()
        })
}

struct Run {
    phases: Vec<CsmaPhase>,
    transmitted: Vec<u32>,
    abandoned: Vec<(u32, u32)>,
    max_attempts_seen: u32,
    /// (attempt that collided, backoff window it got)
    windows: Vec<(u32, u32)>,
}

fn drive(config: CsmaConfig, seed: u64, peers: usize) -> Run {
    let mut sim = CsmaSimulator::new(config, StdRng::seed_from_u64(seed));
    let mut run = Run {
        phases: Vec::new(),
        transmitted: Vec::new(),
        abandoned: Vec::new(),
        max_attempts_seen: 0,
        windows: Vec::new(),
    };

    let Some(mut out) = sim.enqueue(1, peers) else {
        return run;
    };
    let mut collided_on = None;
    for _ in 0..100_000 {
        run.phases.push(out.phase);
        run.transmitted.extend(out.transmit.take());
        let gave_up = out.abandoned.is_some();
        run.abandoned.extend(out.abandoned.take());

        let snap = sim.snapshot();
        run.max_attempts_seen = run.max_attempts_seen.max(snap.attempts);

        // The step after a collision either abandons or picks the window
        if let Some(attempt) = collided_on.take() {
            if !gave_up {
                if let Some(w) = snap.backoff_window {
                    run.windows.push((attempt, w));
                }
            }
        }
        if out.phase == CsmaPhase::Collision {
            collided_on = Some(snap.attempts);
        }

        if out.wait.is_none() {
            break;
        }
        out = sim.advance(peers);
    }
    run
}

// ============================================================================
// Outcome Property Tests
// ============================================================================

proptest! {
    /// A job is either transmitted or abandoned, never both, never twice
    #[test]
    fn job_settles_exactly_once(config in medium(), seed in any::<u64>(), peers in 0usize..8) {
        let run = drive(config, seed, peers);
        prop_assert_eq!(run.transmitted.len() + run.abandoned.len(), 1);
        prop_assert_eq!(run.phases.last(), Some(&CsmaPhase::Idle));
    }

    /// Attempts stay within the ceiling and abandonment reports the ceiling
    #[test]
    fn attempts_bounded_by_ceiling(config in medium(), seed in any::<u64>(), peers in 0usize..8) {
        let max_attempts = config.max_attempts;
        let run = drive(config, seed, peers);
        prop_assert!(run.max_attempts_seen <= max_attempts);
        for (_, attempts) in &run.abandoned {
            prop_assert_eq!(*attempts, max_attempts);
        }
    }

    /// Every TRANSMITTING phase is preceded by a SENSING phase
    #[test]
    fn success_follows_clean_sensing(config in medium(), seed in any::<u64>(), peers in 0usize..8) {
        let run = drive(config, seed, peers);
        let transmitting = run.phases.iter().filter(|p| **p == CsmaPhase::Transmitting).count();
        prop_assert_eq!(transmitting, run.transmitted.len());

        for pair in run.phases.windows(2) {
            if pair[1] == CsmaPhase::Transmitting {
                prop_assert_eq!(pair[0], CsmaPhase::Sensing);
            }
        }
    }
}

// ============================================================================
// Backoff Property Tests
// ============================================================================

proptest! {
    /// Each collision's window matches its attempt and grows until capped
    #[test]
    fn backoff_windows_grow_until_cap(config in medium(), seed in any::<u64>(), peers in 1usize..8) {
        let cap = config.backoff_cap;
        let cap_window = (1u32 << cap.min(31)) - 1;
        let run = drive(config, seed, peers);

        for (attempt, w) in &run.windows {
            prop_assert_eq!(*w, (1u32 << (*attempt).min(cap).min(31)) - 1);
            prop_assert!(*w <= cap_window);
        }
        for pair in run.windows.windows(2) {
            let ((a0, w0), (a1, w1)) = (pair[0], pair[1]);
            prop_assert_eq!(a1, a0 + 1);
            if a0 < cap {
                prop_assert!(w1 > w0, "window {} after {} at attempt {}", w1, w0, a1);
            } else {
                prop_assert_eq!(w1, w0);
            }
        }
    }

    /// Window formula: 2^min(attempt, cap) - 1
    #[test]
    fn backoff_window_formula(cap in 1u32..=16, attempt in 1u32..=40) {
        let config = CsmaConfig { backoff_cap: cap, ..CsmaConfig::default() };
        let sim: CsmaSimulator<u32> = CsmaSimulator::new(config, StdRng::seed_from_u64(0));
        prop_assert_eq!(sim.backoff_window_for(attempt), (1u32 << attempt.min(cap)) - 1);
    }
}
