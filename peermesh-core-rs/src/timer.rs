//! Cancellable timers for the mesh event loop
//!
//! Each armed timer is a sleeping tokio task that posts a [`TimerFired`]
//! back to the owning loop. Timers are keyed; scheduling a key that is
//! already armed replaces it. Every firing carries the generation it was
//! armed with so the loop can drop firings that lost a race with a cancel.

use crate::election::ElectionTimer;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// Identity of a timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKey {
    Election(ElectionTimer),
    /// Retransmission for a reliable sequence number
    Retransmit(u64),
    /// Next step of the medium-access simulation
    Csma,
}

/// A timer that elapsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub key: TimerKey,
    pub generation: u64,
}

struct Armed {
    generation: u64,
    task: JoinHandle<()>,
}

/// Set of keyed timers feeding one channel
pub struct Timers {
    tx: mpsc::UnboundedSender<TimerFired>,
    armed: HashMap<TimerKey, Armed>,
    next_generation: u64,
}

impl Timers {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerFired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                armed: HashMap::new(),
                next_generation: 1,
            },
            rx,
        )
    }

    /// Arm `key` to fire after `after`, replacing any armed instance
    pub fn schedule(&mut self, key: TimerKey, after: Duration) {
        self.cancel(key);

        let generation = self.next_generation;
        self.next_generation += 1;

        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(TimerFired { key, generation });
        });

        trace!("Timer: armed {:?} gen {} for {:?}", key, generation, after);
        self.armed.insert(key, Armed { generation, task });
    }

    /// Disarm `key`. Returns whether it was armed.
    pub fn cancel(&mut self, key: TimerKey) -> bool {
        match self.armed.remove(&key) {
            Some(armed) => {
                armed.task.abort();
                true
            }
            None => false,
        }
    }

    /// Accept a firing. Returns false for firings of cancelled or replaced
    /// timers, which the caller must ignore.
    pub fn accept(&mut self, fired: TimerFired) -> bool {
        match self.armed.get(&fired.key) {
            Some(armed) if armed.generation == fired.generation => {
                self.armed.remove(&fired.key);
                true
            }
            _ => {
                trace!("Timer: dropping stale {:?} gen {}", fired.key, fired.generation);
                false
            }
        }
    }

    pub fn is_armed(&self, key: TimerKey) -> bool {
        self.armed.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    /// Abort every armed timer
    pub fn cancel_all(&mut self) {
        for (_, armed) in self.armed.drain() {
            armed.task.abort();
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
