// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Heartbeat-based failure detection.
//!
//! Two periodic tasks, mutually exclusive by role: a leader task that
//! broadcasts HEARTBEAT and prunes unresponsive peers, and a follower task
//! that watches for a stale `last_heartbeat` and raises a leader-timeout
//! signal on an mpsc channel the orchestrator drains.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::election::Election;
use crate::membership::Membership;
use crate::transport::Transport;
use crate::wire::{PeerId, Term, WireMessage};
use tokio::sync::Mutex;

pub struct FailureDetector {
    heartbeat_interval: Duration,
    leader_timeout: Duration,
    // Monotonic ticks since construction; `i64::MIN` means "never seen".
    last_heartbeat_ticks: AtomicI64,
    started_at: Instant,
    sender_handle: Mutex<Option<JoinHandle<()>>>,
    monitor_handle: Mutex<Option<JoinHandle<()>>>,
}

impl FailureDetector {
    pub fn new(heartbeat_interval: Duration, leader_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            heartbeat_interval,
            leader_timeout,
            last_heartbeat_ticks: AtomicI64::new(i64::MIN),
            started_at: Instant::now(),
            sender_handle: Mutex::new(None),
            monitor_handle: Mutex::new(None),
        })
    }

    fn now_ticks(&self) -> i64 {
        self.started_at.elapsed().as_millis() as i64
    }

    /// Unconditionally stamp `last_heartbeat_ticks` to now. Used internally
    /// by the monitor task itself (arming and self-resetting the timer),
    /// not for gating real HEARTBEAT messages.
    fn stamp_now(&self) {
        self.last_heartbeat_ticks
            .store(self.now_ticks(), Ordering::SeqCst);
    }

    /// Record a HEARTBEAT, but only if `term >= current_term`, where
    /// `current_term` is the term observed by the caller *before* adopting
    /// the incoming one. This mirrors `failure.py`'s gate: a HEARTBEAT from
    /// a stale, partitioned former leader must not refresh the timer just
    /// because the recipient's term was bumped to match it first.
    pub fn record_heartbeat(&self, term: Term, current_term: Term) {
        if term >= current_term {
            self.stamp_now();
        }
    }

    /// Leader task: broadcast HEARTBEAT every interval and drop peers that
    /// have exceeded the transport's failure threshold.
    pub fn start_sender(
        self: &Arc<Self>,
        transport: Arc<Transport>,
        membership: Arc<Mutex<Membership>>,
        election: Arc<Mutex<Election>>,
        self_id: PeerId,
        room_id: String,
    ) {
        let interval = self.heartbeat_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let term = election.lock().await.current_term();
                let peers: Vec<(std::net::IpAddr, u16)> = {
                    let m = membership.lock().await;
                    m.others().iter().map(|p| p.addr()).collect()
                };
                let msg = WireMessage::Heartbeat {
                    sender_id: self_id,
                    term,
                    room_id: room_id.clone(),
                };
                transport.broadcast(&peers, &msg).await;
                debug!(peer_count = peers.len(), "sent heartbeat");

                let failed = transport.failed_peers().await;
                if !failed.is_empty() {
                    let mut m = membership.lock().await;
                    for (host, port) in failed {
                        if let Some(peer) = m
                            .others()
                            .into_iter()
                            .find(|p| p.host == host && p.port == port)
                        {
                            warn!(peer_id = peer.peer_id, "removing unresponsive peer");
                            m.remove(peer.peer_id);
                        }
                        transport.reset_failure_count(host, port).await;
                    }
                }
            }
        });
        // start_sender/stop_sender race only across role transitions,
        // which the orchestrator serializes; a blocking lock here would
        // also work but try_lock keeps this call synchronous-feeling.
        if let Ok(mut guard) = self.sender_handle.try_lock() {
            if let Some(old) = guard.take() {
                old.abort();
            }
            *guard = Some(handle);
        }
    }

    pub async fn stop_sender(&self) {
        if let Some(handle) = self.sender_handle.lock().await.take() {
            handle.abort();
        }
    }

    /// Follower task: watch for a stale heartbeat and emit on `tx` when
    /// `leader_timeout` has elapsed. The receiver end drives
    /// [`crate::peer::ChatPeer`]'s election start.
    pub fn start_monitor(self: &Arc<Self>) -> mpsc::UnboundedReceiver<()> {
        self.stamp_now();
        let (tx, rx) = mpsc::unbounded_channel();
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(this.heartbeat_interval).await;
                let last = this.last_heartbeat_ticks.load(Ordering::SeqCst);
                if last == i64::MIN {
                    continue;
                }
                let elapsed = Duration::from_millis((this.now_ticks() - last).max(0) as u64);
                if elapsed > this.leader_timeout {
                    warn!(elapsed_ms = elapsed.as_millis() as u64, "leader timeout");
                    // Reset before firing so we don't re-trigger every tick
                    // until a fresh heartbeat (or new election) arrives.
                    this.stamp_now();
                    if tx.send(()).is_err() {
                        break;
                    }
                }
            }
        });
        if let Ok(mut guard) = self.monitor_handle.try_lock() {
            if let Some(old) = guard.take() {
                old.abort();
            }
            *guard = Some(handle);
        }
        rx
    }

    pub async fn stop_monitor(&self) {
        if let Some(handle) = self.monitor_handle.lock().await.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_heartbeat_advances_ticks() {
        let fd = FailureDetector::new(Duration::from_millis(10), Duration::from_millis(50));
        fd.record_heartbeat(1, 1);
        assert_ne!(fd.last_heartbeat_ticks.load(Ordering::SeqCst), i64::MIN);
    }

    #[test]
    fn record_heartbeat_ignores_stale_term() {
        let fd = FailureDetector::new(Duration::from_millis(10), Duration::from_millis(50));
        fd.record_heartbeat(5, 5);
        let stamped = fd.last_heartbeat_ticks.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(5));
        // A heartbeat from a term behind the recipient's current term must
        // not refresh the timer.
        fd.record_heartbeat(3, 5);
        assert_eq!(fd.last_heartbeat_ticks.load(Ordering::SeqCst), stamped);
    }

    #[tokio::test]
    async fn monitor_fires_after_timeout() {
        let fd = FailureDetector::new(Duration::from_millis(20), Duration::from_millis(30));
        let mut rx = fd.start_monitor();
        let fired = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("should fire within timeout window");
        assert!(fired.is_some());
        fd.stop_monitor().await;
    }

    #[tokio::test]
    async fn monitor_does_not_fire_with_fresh_heartbeats() {
        let fd = FailureDetector::new(Duration::from_millis(20), Duration::from_millis(200));
        let mut rx = fd.start_monitor();
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            fd.record_heartbeat(1, 1);
        }
        let result = tokio::time::timeout(Duration::from_millis(10), rx.recv()).await;
        assert!(result.is_err(), "monitor should not have fired yet");
        fd.stop_monitor().await;
    }
}
