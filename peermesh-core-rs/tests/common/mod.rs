//! Shared helpers for mesh integration tests

#![allow(dead_code)]

use peermesh_core::{
    DeliveryId, DeliveryStatus, MeshConfig, MeshHandle, MeshNotification, MemoryNetwork, PeerId,
};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn peer(id: u64) -> MeshConfig {
    MeshConfig::new(PeerId(id), format!("peer-{}", id)).with_seed(id)
}

pub struct Mesh {
    pub net: MemoryNetwork,
    pub nodes: Vec<(String, MeshHandle, JoinHandle<()>)>,
}

impl Mesh {
    pub fn new(seed: u64) -> Self {
        init_tracing();
        Self {
            net: MemoryNetwork::with_seed(seed),
            nodes: Vec::new(),
        }
    }

    pub fn spawn(&mut self, name: &str, config: MeshConfig) -> MeshHandle {
        let (handle, task) = self.net.spawn_node(name, config).unwrap();
        self.nodes.push((name.to_string(), handle.clone(), task));
        handle
    }

    pub fn handle(&self, id: u64) -> MeshHandle {
        self.nodes
            .iter()
            .find(|(_, h, _)| h.local_id() == PeerId(id))
            .map(|(_, h, _)| h.clone())
            .unwrap()
    }

    /// Wait until every running node agrees on `leader`
    pub async fn converged_on(&self, leader: u64) {
        for (_, handle, task) in &self.nodes {
            if task.is_finished() {
                continue;
            }
            handle
                .wait_for(|s| {
                    s.state == peermesh_core::MeshState::Connected
                        && s.coordinator == Some(PeerId(leader))
                })
                .await
                .unwrap();
        }
    }
}

/// Collect status transitions for one delivery until a terminal one arrives
pub async fn statuses_for(
    rx: &mut broadcast::Receiver<MeshNotification>,
    id: DeliveryId,
) -> Vec<DeliveryStatus> {
    let mut out = Vec::new();
    loop {
        let notification = tokio::time::timeout(Duration::from_secs(120), rx.recv())
            .await
            .expect("delivery never settled")
            .unwrap();
        if let MeshNotification::Delivery {
            delivery, status, ..
        } = notification
        {
            if delivery == id {
                out.push(status);
                if status.is_terminal() {
                    return out;
                }
            }
        }
    }
}
