// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end cluster scenarios, wiring two or three in-process peers over
//! localhost TCP. These exercise the scenarios from the distilled spec's
//! Testable Properties: cluster formation, message ordering, and catch-up.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use chat_peer::config::{PeerConfig, SeedAddr};
use chat_peer::storage::Storage;
use chat_peer::ChatPeer;

fn config(peer_id: u64, port: u16, log_dir: &std::path::Path, seeds: Vec<SeedAddr>) -> PeerConfig {
    PeerConfig {
        peer_id,
        host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port,
        log_dir: log_dir.to_string_lossy().to_string(),
        heartbeat_interval_ms: 80,
        leader_timeout_ms: 250,
        election_timeout_ms: 150,
        max_failures: 3,
        seeds,
        scan_port_range: None,
        room_id: "general".into(),
    }
}

async fn spawn_peer(cfg: PeerConfig) -> ChatPeer {
    let peer = ChatPeer::new(cfg).await.expect("peer construction");
    let running = peer.clone();
    tokio::spawn(async move {
        let _ = running.run().await;
    });
    peer
}

/// Scenario: a lone peer with no seeds becomes leader by itself, a second
/// peer joins it as a follower via a seed, and messages submitted through
/// the follower are forwarded, sequenced, and persisted identically on
/// both peers.
#[tokio::test]
async fn two_peer_cluster_orders_messages_on_both_logs() {
    let dir = tempfile::tempdir().unwrap();
    let leader_log_dir = dir.path().join("leader");
    let follower_log_dir = dir.path().join("follower");

    let leader_port = 17001;
    let follower_port = 17002;

    let leader = spawn_peer(config(1, leader_port, &leader_log_dir, vec![])).await;
    // Give the leader's listener time to bind before the follower scans/joins it.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let follower = spawn_peer(config(
        2,
        follower_port,
        &follower_log_dir,
        vec![SeedAddr {
            host: "127.0.0.1".into(),
            port: leader_port,
        }],
    ))
    .await;

    // Let the follower complete JOIN/JOIN_ACK bootstrap (bounded ~2s wait
    // inside join_cluster) before submitting traffic.
    tokio::time::sleep(Duration::from_millis(2500)).await;

    for text in ["a", "b", "c", "d", "e"] {
        let sent = follower
            .send_chat_message(text.to_string(), "general".into())
            .await;
        assert!(sent, "follower should have a known leader to forward to");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // Allow the final SEQ_CHAT broadcasts to land and be persisted.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let leader_storage = Storage::new(&leader_log_dir, 1).unwrap();
    let follower_storage = Storage::new(&follower_log_dir, 2).unwrap();
    let leader_messages = leader_storage.load_all().await.unwrap();
    let follower_messages = follower_storage.load_all().await.unwrap();

    assert_eq!(leader_messages.len(), 5, "leader should have all 5 messages");
    assert_eq!(
        follower_messages.len(),
        5,
        "follower should have all 5 messages"
    );

    let leader_texts: Vec<&str> = leader_messages.iter().map(|m| m.text.as_str()).collect();
    let follower_texts: Vec<&str> = follower_messages.iter().map(|m| m.text.as_str()).collect();
    assert_eq!(leader_texts, vec!["a", "b", "c", "d", "e"]);
    assert_eq!(follower_texts, leader_texts);

    for (i, msg) in leader_messages.iter().enumerate() {
        assert_eq!(msg.seq_no, (i + 1) as u64);
    }
    for (i, msg) in follower_messages.iter().enumerate() {
        assert_eq!(msg.seq_no, (i + 1) as u64);
        assert_eq!(msg.text, leader_messages[i].text);
    }

    leader.shutdown();
    follower.shutdown();
}

/// Scenario: a peer joins an already-active leader that has prior
/// messages on disk. The joiner's CATCHUP_REQ/CATCHUP_RESP round trip
/// during bootstrap must bring its log to parity with the leader's,
/// without re-delivering anything out of order.
#[tokio::test]
async fn late_joiner_catches_up_to_existing_history() {
    let dir = tempfile::tempdir().unwrap();
    let leader_log_dir = dir.path().join("leader");
    let joiner_log_dir = dir.path().join("joiner");

    let leader_port = 17011;
    let joiner_port = 17012;

    let leader = spawn_peer(config(1, leader_port, &leader_log_dir, vec![])).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    for text in ["first", "second"] {
        let sent = leader
            .send_chat_message(text.to_string(), "general".into())
            .await;
        assert!(sent);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let joiner = spawn_peer(config(
        2,
        joiner_port,
        &joiner_log_dir,
        vec![SeedAddr {
            host: "127.0.0.1".into(),
            port: leader_port,
        }],
    ))
    .await;

    // join_cluster's bootstrap wait plus catch-up round trip.
    tokio::time::sleep(Duration::from_millis(2800)).await;

    let leader_storage = Storage::new(&leader_log_dir, 1).unwrap();
    let joiner_storage = Storage::new(&joiner_log_dir, 2).unwrap();
    let leader_messages = leader_storage.load_all().await.unwrap();
    let joiner_messages = joiner_storage.load_all().await.unwrap();

    assert_eq!(leader_messages.len(), 2);
    assert_eq!(
        joiner_messages.len(),
        2,
        "joiner should have caught up to both prior messages"
    );
    assert_eq!(
        joiner_messages.iter().map(|m| &m.text).collect::<Vec<_>>(),
        leader_messages.iter().map(|m| &m.text).collect::<Vec<_>>()
    );
    assert_eq!(joiner_messages[0].seq_no, 1);
    assert_eq!(joiner_messages[1].seq_no, 2);

    leader.shutdown();
    joiner.shutdown();
}

/// A peer started with neither seeds nor a scan range, and no peers ever
/// join it, must still make progress: it elects itself leader outright
/// and can serve its own client traffic.
#[tokio::test]
async fn solitary_peer_self_elects_and_serves_client() {
    let dir = tempfile::tempdir().unwrap();
    let log_dir = dir.path().join("solo");
    let peer = spawn_peer(config(9, 17021, &log_dir, vec![])).await;

    tokio::time::sleep(Duration::from_millis(300)).await;

    let sent = peer
        .send_chat_message("hello, world".into(), "general".into())
        .await;
    assert!(sent);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let storage = Storage::new(&log_dir, 9).unwrap();
    let messages = storage.load_all().await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].seq_no, 1);
    assert_eq!(messages[0].text, "hello, world");

    peer.shutdown();
}
