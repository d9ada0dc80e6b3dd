//! Reliable and unreliable delivery over the in-memory network

mod common;

use common::{peer, statuses_for, Mesh};
use peermesh_core::{
    DeliveryMode, DeliveryStatus, FailureReason, MeshMessage, MeshNotification, MessageType,
    PeerId, ReliableFrame, TransportConfig,
};
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_reliable_send_is_delivered_with_rtt() {
    let mut mesh = Mesh::new(11);
    let a = mesh.spawn("a", peer(10));
    let b = mesh.spawn("b", peer(20));
    mesh.converged_on(20).await;

    let mut sent = a.subscribe();
    let mut received = b.subscribe();
    let id = a.send_reliable(PeerId(20), "hello|world").await.unwrap();

    let statuses = statuses_for(&mut sent, id).await;
    assert_eq!(statuses[0], DeliveryStatus::InProgress);
    let Some(DeliveryStatus::Delivered { rtt }) = statuses.last().copied() else {
        panic!("expected DELIVERED, got {:?}", statuses);
    };
    assert!(rtt < Duration::from_secs(1));

    loop {
        if let MeshNotification::Received { from, mode, payload } = received.recv().await.unwrap() {
            assert_eq!(from, PeerId(10));
            assert_eq!(mode, DeliveryMode::Reliable);
            assert_eq!(payload, "hello|world");
            break;
        }
    }

    let snap = a.snapshot();
    assert_eq!(snap.rtt.get(&PeerId(20)).map(Vec::len), Some(1));
    assert_eq!(snap.rtt_summary(PeerId(20)).unwrap().count, 1);
    assert_eq!(snap.pending_deliveries, 0);
}

#[tokio::test(start_paused = true)]
async fn test_unacked_send_fails_after_retry_budget() {
    let mut mesh = Mesh::new(12);
    let a = mesh.spawn("a", peer(10));
    mesh.spawn("b", peer(20));
    mesh.converged_on(20).await;

    mesh.net.partition(&["a"], &["b"]);
    let mut wire = mesh.net.tap();
    let mut events = a.subscribe();

    let start = Instant::now();
    let id = a.send_reliable(PeerId(20), "lost").await.unwrap();
    let statuses = statuses_for(&mut events, id).await;
    let elapsed = start.elapsed();

    assert_eq!(
        statuses,
        vec![
            DeliveryStatus::InProgress,
            DeliveryStatus::Retrying { attempt: 1 },
            DeliveryStatus::Retrying { attempt: 2 },
            DeliveryStatus::Failed {
                reason: FailureReason::RetriesExhausted { frames_sent: 4 }
            },
        ]
    );
    assert!(elapsed >= Duration::from_millis(3000), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(3100), "{:?}", elapsed);

    let mut data_frames = 0;
    while let Ok(frame) = wire.try_recv() {
        let message = MeshMessage::from_bytes(&frame.bytes).unwrap();
        if frame.from == "a" && message.kind() == MessageType::DataReliable {
            let decoded = ReliableFrame::decode(message.data()).unwrap();
            assert!(matches!(decoded, ReliableFrame::Seq { .. }));
            assert!(!frame.delivered);
            data_frames += 1;
        }
    }
    assert_eq!(data_frames, 4);
}

#[tokio::test(start_paused = true)]
async fn test_lost_acks_redeliver_payload() {
    let mut mesh = Mesh::new(18);
    let a = mesh.spawn("a", peer(10));
    let b = mesh.spawn("b", peer(20));
    mesh.converged_on(20).await;

    // Frames reach b, its ACKs never make it back
    mesh.net.block("b", "a");
    let mut events = a.subscribe();
    let mut received = b.subscribe();

    let id = a.send_reliable(PeerId(20), "again").await.unwrap();
    let statuses = statuses_for(&mut events, id).await;
    assert_eq!(
        statuses.last(),
        Some(&DeliveryStatus::Failed {
            reason: FailureReason::RetriesExhausted { frames_sent: 4 }
        })
    );

    tokio::time::sleep(Duration::from_millis(10)).await;
    let mut copies = 0;
    while let Ok(n) = received.try_recv() {
        if let MeshNotification::Received { from, mode, payload } = n {
            assert_eq!(from, PeerId(10));
            assert_eq!(mode, DeliveryMode::Reliable);
            assert_eq!(payload, "again");
            copies += 1;
        }
    }
    // Original plus every retransmission
    assert_eq!(copies, 4);
}

#[tokio::test(start_paused = true)]
async fn test_failed_delivery_is_reported_once() {
    let mut mesh = Mesh::new(13);
    let a = mesh.spawn("a", peer(10));
    mesh.spawn("b", peer(20));
    mesh.converged_on(20).await;

    mesh.net.partition(&["a"], &["b"]);
    let mut events = a.subscribe();
    let id = a.send_reliable(PeerId(20), "late").await.unwrap();
    statuses_for(&mut events, id).await;
    mesh.net.heal();

    // Nothing further is reported for a delivery that already failed
    tokio::time::sleep(Duration::from_secs(10)).await;
    while let Ok(n) = events.try_recv() {
        if let MeshNotification::Delivery { delivery, .. } = n {
            assert_ne!(delivery, id);
        }
    }
    assert_eq!(a.snapshot().pending_deliveries, 0);
}

#[tokio::test(start_paused = true)]
async fn test_peer_loss_fails_outstanding_delivery() {
    let mut mesh = Mesh::new(14);
    let a = mesh.spawn("a", peer(10));
    mesh.spawn("b", peer(20));
    mesh.converged_on(20).await;

    mesh.net.partition(&["a"], &["b"]);
    let mut events = a.subscribe();
    let id = a.send_reliable(PeerId(20), "doomed").await.unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    mesh.net.disconnect("a", "b");

    let statuses = statuses_for(&mut events, id).await;
    assert_eq!(
        statuses.last(),
        Some(&DeliveryStatus::Failed {
            reason: FailureReason::PeerLost
        })
    );
    assert!(statuses.contains(&DeliveryStatus::Retrying { attempt: 1 }));
}

#[tokio::test(start_paused = true)]
async fn test_unreliable_send_reports_sent() {
    let mut mesh = Mesh::new(15);
    let a = mesh.spawn("a", peer(10));
    let b = mesh.spawn("b", peer(20));
    mesh.converged_on(20).await;

    let mut events = a.subscribe();
    let mut received = b.subscribe();
    let id = a.send_unreliable(PeerId(20), "ping").await.unwrap();

    let statuses = statuses_for(&mut events, id).await;
    assert_eq!(statuses, vec![DeliveryStatus::InProgress, DeliveryStatus::Sent]);

    tokio::time::sleep(Duration::from_millis(10)).await;
    let mut outcomes = 0;
    while let Ok(n) = received.try_recv() {
        match n {
            MeshNotification::Received { mode, .. } => {
                assert_eq!(mode, DeliveryMode::Unreliable);
                outcomes += 1;
            }
            MeshNotification::UnreliableDropped { from } => {
                assert_eq!(from, PeerId(10));
                outcomes += 1;
            }
            _ => {}
        }
    }
    assert_eq!(outcomes, 1);
}

#[tokio::test(start_paused = true)]
async fn test_unreliable_loss_rate_matches_configuration() {
    let mut mesh = Mesh::new(16);
    let a = mesh.spawn("a", peer(10));
    let b = mesh.spawn("b", peer(20));
    mesh.converged_on(20).await;

    let mut received = b.subscribe();
    const SENDS: usize = 500;
    for i in 0..SENDS {
        a.send_unreliable(PeerId(20), format!("frame-{}", i))
            .await
            .unwrap();
    }

    let mut delivered = 0;
    let mut dropped = 0;
    while delivered + dropped < SENDS {
        match received.recv().await.unwrap() {
            MeshNotification::Received { .. } => delivered += 1,
            MeshNotification::UnreliableDropped { .. } => dropped += 1,
            _ => {}
        }
    }

    // Default drop probability is 10%
    assert!((20..=90).contains(&dropped), "dropped {}", dropped);
}

#[tokio::test(start_paused = true)]
async fn test_unreliable_full_loss_never_delivers() {
    let lossy = TransportConfig {
        unreliable_drop_probability: 1.0,
        ..TransportConfig::default()
    };
    let mut mesh = Mesh::new(17);
    let a = mesh.spawn("a", peer(10));
    let b = mesh.spawn("b", peer(20).with_transport(lossy));
    mesh.converged_on(20).await;

    let mut received = b.subscribe();
    for _ in 0..20 {
        a.send_unreliable(PeerId(20), "gone").await.unwrap();
    }

    let mut dropped = 0;
    while dropped < 20 {
        match received.recv().await.unwrap() {
            MeshNotification::Received { .. } => panic!("frame should have been dropped"),
            MeshNotification::UnreliableDropped { .. } => dropped += 1,
            _ => {}
        }
    }
}
