// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Orchestrator wiring [`transport`](crate::transport), [`storage`](crate::storage),
//! [`membership`](crate::membership), [`failure`](crate::failure),
//! [`election`](crate::election), and [`ordering`](crate::ordering) into one
//! running chat peer.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PeerConfig;
use crate::election::Election;
use crate::error::{PeerError, Result};
use crate::failure::FailureDetector;
use crate::membership::Membership;
use crate::ordering::OrderingManager;
use crate::storage::Storage;
use crate::transport::{FramedConnection, Transport};
use crate::wire::{DeliveredMessage, PeerId, PeerInfo, Term, WireMessage};

/// How long bootstrap waits for JOIN_ACK responses before deciding whether a
/// leader already exists.
const BOOTSTRAP_WAIT: Duration = Duration::from_millis(2000);
/// Extra grace period after requesting catch-up, before a leaderless
/// bootstrap calls an election.
const CATCHUP_GRACE: Duration = Duration::from_millis(1000);
/// Per-port dial timeout used while scanning for an existing cluster.
const PORT_SCAN_TIMEOUT: Duration = Duration::from_millis(500);

type MessageCallback = dyn Fn(DeliveredMessage) + Send + Sync;

/// A replicated chat log peer: both the TCP server accepting peer
/// connections and the client driving elections, ordering, and storage.
#[derive(Clone)]
pub struct ChatPeer {
    config: Arc<PeerConfig>,
    self_info: PeerInfo,
    transport: Arc<Transport>,
    storage: Arc<Storage>,
    membership: Arc<Mutex<Membership>>,
    election: Arc<Mutex<Election>>,
    ordering: Arc<Mutex<OrderingManager>>,
    failure: Arc<FailureDetector>,
    shutdown: Arc<Notify>,
    message_callback: Arc<Mutex<Option<Box<MessageCallback>>>>,
}

impl ChatPeer {
    pub async fn new(config: PeerConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| PeerError::Config(e.to_string()))?;

        let advertise_host = if config.host.is_unspecified() {
            IpAddr::from([127, 0, 0, 1])
        } else {
            config.host
        };
        let self_info = PeerInfo::new(config.peer_id, advertise_host, config.port);

        let storage = Storage::new(std::path::Path::new(&config.log_dir), config.peer_id)?;
        let transport = Transport::new(config.max_failures);
        let failure = FailureDetector::new(config.heartbeat_interval(), config.leader_timeout());

        Ok(Self {
            transport,
            storage: Arc::new(storage),
            membership: Arc::new(Mutex::new(Membership::new(self_info))),
            election: Arc::new(Mutex::new(Election::new())),
            ordering: Arc::new(Mutex::new(OrderingManager::new())),
            failure,
            shutdown: Arc::new(Notify::new()),
            message_callback: Arc::new(Mutex::new(None)),
            config: Arc::new(config),
            self_info,
        })
    }

    pub fn self_info(&self) -> PeerInfo {
        self.self_info
    }

    /// Register a callback invoked once per message, in delivery order,
    /// right after it is durably appended.
    pub async fn set_message_callback<F>(&self, callback: F)
    where
        F: Fn(DeliveredMessage) + Send + Sync + 'static,
    {
        *self.message_callback.lock().await = Some(Box::new(callback));
    }

    /// Recover state from disk, bind the listener, join (or found) the
    /// cluster, and run until `shutdown()` is called.
    pub async fn run(&self) -> Result<()> {
        let (max_seq, recovered) = self.storage.recover().await?;
        info!(
            count = recovered.len(),
            max_seq, "recovered messages from disk"
        );
        {
            let mut ordering = self.ordering.lock().await;
            ordering.seed_from_recovery(max_seq, &recovered);
        }

        let bind_addr = std::net::SocketAddr::new(self.config.host, self.config.port);
        let listener = Transport::bind(bind_addr).await?;
        info!(%bind_addr, peer_id = self.config.peer_id, "listening");

        let accept_peer = self.clone();
        let accept_shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            accept_peer.accept_loop(listener, accept_shutdown).await;
        });

        self.join_cluster().await;
        if !self.membership.lock().await.is_leader() {
            self.start_follower_monitor();
        }

        self.shutdown.notified().await;
        info!("shutdown requested");
        self.failure.stop_monitor().await;
        self.failure.stop_sender().await;
        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    async fn accept_loop(&self, listener: TcpListener, shutdown: Arc<Notify>) {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!(%peer_addr, "accepted connection");
                            let peer = self.clone();
                            tokio::spawn(async move {
                                peer.handle_connection(stream).await;
                            });
                        }
                        Err(e) => error!(error = %e, "accept failed"),
                    }
                }
                _ = shutdown.notified() => break,
            }
        }
    }

    async fn handle_connection(&self, stream: tokio::net::TcpStream) {
        let mut conn = FramedConnection::new(stream);
        loop {
            match conn.read_message().await {
                Ok(Some(msg)) => self.handle_message(msg).await,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "connection read error");
                    break;
                }
            }
        }
    }

    // ---- client-facing API -------------------------------------------------

    /// Submit a chat message as a client of this peer.
    pub async fn send_chat_message(&self, payload: String, room_id: String) -> bool {
        if self.membership.lock().await.is_leader() {
            self.handle_chat_as_leader(self.config.peer_id, payload, room_id)
                .await
        } else {
            self.forward_to_leader(payload, room_id).await
        }
    }

    async fn handle_chat_as_leader(
        &self,
        sender_id: PeerId,
        payload: String,
        room_id: String,
    ) -> bool {
        let term = self.election.lock().await.current_term();
        let msg_id = Uuid::new_v4().to_string();
        let (assigned, delivered) = {
            let mut ordering = self.ordering.lock().await;
            let assigned = ordering.assign(msg_id, sender_id, room_id, payload, term);
            let delivered = ordering.handle_seq_chat(assigned.clone());
            (assigned, delivered)
        };
        for msg in delivered {
            self.deliver(msg).await;
        }

        self.broadcast_to_all(seq_chat_wire(&assigned)).await;
        info!(seq_no = assigned.seq_no, "leader assigned sequence number");
        true
    }

    async fn forward_to_leader(&self, payload: String, room_id: String) -> bool {
        let leader = { self.membership.lock().await.leader() };
        let Some(leader) = leader else {
            warn!("no leader known, cannot send message");
            return false;
        };
        let msg = WireMessage::Chat {
            sender_id: self.config.peer_id,
            term: self.election.lock().await.current_term(),
            room_id,
            msg_id: Uuid::new_v4().to_string(),
            payload,
        };
        self.transport.send_to(leader.host, leader.port, &msg).await
    }

    // ---- bootstrap ----------------------------------------------------------

    async fn discover_by_port_scan(&self, start: u16, end: u16) -> Vec<(IpAddr, u16)> {
        info!(start, end, "scanning for existing peers");
        let mut discovered = Vec::new();
        let loopback = IpAddr::from([127, 0, 0, 1]);
        for port in start..=end {
            if port == self.config.port {
                continue;
            }
            let addr = std::net::SocketAddr::new(loopback, port);
            let connected = tokio::time::timeout(PORT_SCAN_TIMEOUT, tokio::net::TcpStream::connect(addr)).await;
            if matches!(connected, Ok(Ok(_))) {
                info!(port, "discovered peer");
                discovered.push((loopback, port));
            }
        }
        discovered
    }

    async fn resolve_seeds(&self) -> Vec<(IpAddr, u16)> {
        let mut out = Vec::new();
        for seed in &self.config.seeds {
            if let Ok(ip) = seed.host.parse::<IpAddr>() {
                out.push((ip, seed.port));
                continue;
            }
            match tokio::net::lookup_host((seed.host.as_str(), seed.port)).await {
                Ok(mut addrs) => {
                    if let Some(addr) = addrs.next() {
                        out.push((addr.ip(), seed.port));
                    }
                }
                Err(e) => warn!(host = %seed.host, error = %e, "failed to resolve seed"),
            }
        }
        out
    }

    /// Join an existing cluster or, finding none, start one.
    async fn join_cluster(&self) {
        let targets = if !self.config.seeds.is_empty() {
            self.resolve_seeds().await
        } else if let Some(range) = self.config.scan_port_range {
            self.discover_by_port_scan(range.start, range.end).await
        } else {
            Vec::new()
        };

        if targets.is_empty() {
            info!("no existing peers found, starting as first peer in new cluster");
            self.start_election().await;
            return;
        }

        info!(count = targets.len(), "found existing peer(s), joining cluster");
        let join_msg = WireMessage::Join {
            sender_id: self.config.peer_id,
            term: self.election.lock().await.current_term(),
            room_id: self.config.room_id.clone(),
            membership: vec![self.self_info],
        };
        for (host, port) in &targets {
            if self.transport.send_to(*host, *port, &join_msg).await {
                info!(%host, port, "sent JOIN");
            } else {
                warn!(%host, port, "failed to send JOIN");
            }
        }

        tokio::time::sleep(BOOTSTRAP_WAIT).await;

        let current_leader = { self.membership.lock().await.leader() };
        if let Some(leader) = current_leader {
            info!(leader_id = leader.peer_id, "discovered leader, joining as follower");
            self.request_catchup().await;
            return;
        }

        info!("no leader after JOIN, starting election");
        self.request_catchup().await;
        tokio::time::sleep(CATCHUP_GRACE).await;
        self.start_election().await;
    }

    // ---- dispatch -------------------------------------------------------------

    async fn handle_message(&self, msg: WireMessage) {
        debug!(kind = msg.kind(), sender_id = msg.sender_id(), "received message");
        match msg {
            WireMessage::Join {
                sender_id,
                membership,
                ..
            } => self.handle_join(sender_id, membership).await,
            WireMessage::JoinAck {
                term,
                membership,
                leader_id,
                ..
            } => self.handle_join_ack(term, membership, leader_id).await,
            WireMessage::Heartbeat { term, .. } => {
                // Gate against the pre-adoption term: adopting first would
                // always make this comparison vacuously true and let a
                // stale former leader's late HEARTBEAT reset the timer.
                let current_term = self.election.lock().await.current_term();
                self.failure.record_heartbeat(term, current_term);
                self.election.lock().await.adopt_term(term);
            }
            WireMessage::Election { sender_id, .. } => self.handle_election(sender_id).await,
            WireMessage::ElectionOk { .. } => {
                self.election.lock().await.record_election_ok();
            }
            WireMessage::Coordinator {
                sender_id,
                term,
                membership,
                ..
            } => self.handle_coordinator(sender_id, term, membership).await,
            WireMessage::Chat {
                sender_id,
                room_id,
                msg_id,
                payload,
                ..
            } => self.handle_chat_from_peer(sender_id, room_id, msg_id, payload).await,
            WireMessage::SeqChat {
                sender_id,
                term,
                room_id,
                seq_no,
                msg_id,
                payload,
            } => {
                self.handle_incoming_seq_chat(DeliveredMessage {
                    seq_no,
                    term,
                    msg_id,
                    sender_id,
                    room_id,
                    text: payload,
                    timestamp: now_unix(),
                })
                .await
            }
            WireMessage::CatchupReq {
                sender_id, last_seq, ..
            } => self.handle_catchup_req(sender_id, last_seq).await,
            WireMessage::CatchupResp { payload, .. } => self.handle_catchup_resp(payload).await,
        }
    }

    async fn handle_join(&self, sender_id: PeerId, membership: Vec<PeerInfo>) {
        info!(sender_id, "received JOIN");
        if !membership.is_empty() {
            self.membership.lock().await.update_from_list(&membership);
        }

        let (leader_id, all_peers, is_leader, term) = {
            let m = self.membership.lock().await;
            let e = self.election.lock().await;
            (m.leader_id(), m.all_peers(), m.is_leader(), e.current_term())
        };

        let join_ack = WireMessage::JoinAck {
            sender_id: self.config.peer_id,
            term,
            room_id: self.config.room_id.clone(),
            membership: all_peers,
            leader_id,
        };

        let sender_peer = self.membership.lock().await.get(sender_id);
        if let Some(peer) = sender_peer {
            self.transport.send_to(peer.host, peer.port, &join_ack).await;
            info!(sender_id, "sent JOIN_ACK");

            if is_leader {
                let coordinator = WireMessage::Coordinator {
                    sender_id: self.config.peer_id,
                    term,
                    room_id: self.config.room_id.clone(),
                    membership: vec![self.self_info],
                };
                self.transport.send_to(peer.host, peer.port, &coordinator).await;
                info!(sender_id, "sent COORDINATOR (already leader)");
            }
        }
    }

    async fn handle_join_ack(&self, term: Term, membership: Vec<PeerInfo>, leader_id: Option<PeerId>) {
        info!(term, "received JOIN_ACK");
        if !membership.is_empty() {
            self.membership.lock().await.update_from_list(&membership);
        }
        if let Some(leader_id) = leader_id {
            self.membership.lock().await.set_leader(leader_id);
        } else {
            debug!("JOIN_ACK did not include a leader_id");
        }
        self.election.lock().await.adopt_term(term);
    }

    async fn handle_election(&self, sender_id: PeerId) {
        if sender_id < self.config.peer_id {
            info!(sender_id, "received ELECTION from lower priority peer, replying OK");
            let term = self.election.lock().await.current_term();
            let ok_msg = WireMessage::ElectionOk {
                sender_id: self.config.peer_id,
                term,
                room_id: self.config.room_id.clone(),
            };
            if let Some(peer) = self.membership.lock().await.get(sender_id) {
                self.transport.send_to(peer.host, peer.port, &ok_msg).await;
            }
            if !self.election.lock().await.is_campaigning() {
                let peer = self.clone();
                tokio::spawn(async move { peer.start_election().await; });
            }
        }
    }

    async fn handle_coordinator(&self, sender_id: PeerId, term: Term, membership: Vec<PeerInfo>) {
        info!(sender_id, term, "received COORDINATOR");
        let accepted = self.election.lock().await.accept_coordinator(term);
        if !accepted {
            debug!(sender_id, term, "ignoring stale COORDINATOR");
            return;
        }
        if !membership.is_empty() {
            self.membership.lock().await.update_from_list(&membership);
        }
        self.membership.lock().await.set_leader(sender_id);
        self.become_follower_of(sender_id, term).await;
    }

    // The forwarded CHAT's msg_id is discarded: the leader mints a fresh
    // one via OrderingManager::assign, matching the sequence-assignment path.
    async fn handle_chat_from_peer(&self, sender_id: PeerId, room_id: String, _msg_id: String, payload: String) {
        if !self.membership.lock().await.is_leader() {
            warn!(sender_id, "received CHAT but not leader, ignoring");
            return;
        }
        self.handle_chat_as_leader(sender_id, payload, room_id).await;
    }

    async fn handle_incoming_seq_chat(&self, incoming: DeliveredMessage) {
        let delivered = self.ordering.lock().await.handle_seq_chat(incoming);
        for msg in delivered {
            self.deliver(msg).await;
        }
    }

    /// Only the current leader answers CATCHUP_REQ.
    async fn handle_catchup_req(&self, sender_id: PeerId, last_seq: u64) {
        if !self.membership.lock().await.is_leader() {
            debug!(sender_id, "not leader, ignoring CATCHUP_REQ");
            return;
        }
        let messages = match self.storage.get_after(last_seq).await {
            Ok(messages) => messages,
            Err(e) => {
                error!(error = %e, "failed to read log for catchup");
                return;
            }
        };
        info!(sender_id, count = messages.len(), last_seq, "sending catchup");
        let term = self.election.lock().await.current_term();
        let response = WireMessage::CatchupResp {
            sender_id: self.config.peer_id,
            term,
            room_id: self.config.room_id.clone(),
            payload: messages,
        };
        if let Some(peer) = self.membership.lock().await.get(sender_id) {
            self.transport.send_to(peer.host, peer.port, &response).await;
        }
    }

    async fn handle_catchup_resp(&self, payload: Vec<DeliveredMessage>) {
        if payload.is_empty() {
            info!("received CATCHUP_RESP with no messages, already up to date");
            return;
        }
        info!(count = payload.len(), "received CATCHUP_RESP");
        for msg in payload {
            let delivered = self.ordering.lock().await.handle_seq_chat(msg);
            for d in delivered {
                self.deliver(d).await;
            }
        }
        let last_seq = self.ordering.lock().await.last_seq();
        info!(last_seq, "catchup complete");
    }

    async fn request_catchup(&self) {
        let my_last_seq = self.ordering.lock().await.last_seq();
        info!(my_last_seq, "requesting catchup");
        let term = self.election.lock().await.current_term();
        let req = WireMessage::CatchupReq {
            sender_id: self.config.peer_id,
            term,
            room_id: self.config.room_id.clone(),
            last_seq: my_last_seq,
        };

        let leader = self.membership.lock().await.leader();
        if let Some(leader) = leader {
            if self.transport.send_to(leader.host, leader.port, &req).await {
                info!(leader_id = leader.peer_id, "sent CATCHUP_REQ to leader");
                return;
            }
        }

        if let Some(peer) = self.membership.lock().await.others().into_iter().next() {
            if self.transport.send_to(peer.host, peer.port, &req).await {
                info!(peer_id = peer.peer_id, "sent CATCHUP_REQ to peer");
            }
        }
    }

    // ---- election outcomes ---------------------------------------------------

    /// Run one Bully campaign. Returns `true` if this peer became leader.
    async fn start_election(&self) -> bool {
        let term = {
            let mut election = self.election.lock().await;
            match election.begin_campaign() {
                Some(term) => term,
                None => {
                    debug!("election already in progress");
                    return false;
                }
            }
        };
        info!(term, "starting election");

        let higher = self.membership.lock().await.higher_priority_peers();
        if higher.is_empty() {
            info!("no higher priority peers, declaring victory");
            self.become_leader(term).await;
            self.election.lock().await.finish_uncontested_campaign();
            return true;
        }

        let election_msg = WireMessage::Election {
            sender_id: self.config.peer_id,
            term,
            room_id: self.config.room_id.clone(),
        };
        for peer in &higher {
            self.transport.send_to(peer.host, peer.port, &election_msg).await;
            debug!(peer_id = peer.peer_id, "sent ELECTION");
        }

        let jitter_ms = rand::thread_rng().gen_range(0..200);
        tokio::time::sleep(self.config.election_timeout() + Duration::from_millis(jitter_ms)).await;

        // `resolve_timeout` returns false both for the ordinary "defer to a
        // higher peer" outcome and for a campaign already settled out from
        // under us by an intervening COORDINATOR; either way `term` (this
        // campaign's, possibly stale) must not be acted on here.
        let become_coordinator = self.election.lock().await.resolve_timeout();
        if become_coordinator {
            info!("no OK responses received, declaring victory");
            self.become_leader(term).await;
            true
        } else {
            info!("campaign resolved without becoming coordinator, standing down");
            false
        }
    }

    async fn become_leader(&self, term: Term) {
        info!(term, "became leader");
        self.membership.lock().await.set_leader(self.config.peer_id);
        self.failure.stop_monitor().await;
        self.failure.start_sender(
            self.transport.clone(),
            self.membership.clone(),
            self.election.clone(),
            self.config.peer_id,
            self.config.room_id.clone(),
        );

        let peers = self.membership.lock().await.others();
        let coordinator = WireMessage::Coordinator {
            sender_id: self.config.peer_id,
            term,
            room_id: self.config.room_id.clone(),
            membership: vec![self.self_info],
        };
        let addrs: Vec<_> = peers.iter().map(|p| p.addr()).collect();
        self.transport.broadcast(&addrs, &coordinator).await;
    }

    async fn become_follower_of(&self, leader_id: PeerId, term: Term) {
        info!(leader_id, term, "new coordinator");
        self.failure.stop_sender().await;
        self.start_follower_monitor();
    }

    /// Start (or restart) the follower heartbeat monitor and the task that
    /// turns a leader-timeout signal into a new election. Superseding a
    /// prior monitor aborts its sender task, which closes the old
    /// channel and lets its consumer loop exit cleanly.
    fn start_follower_monitor(&self) {
        let mut rx = self.failure.start_monitor();
        let peer = self.clone();
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                warn!("leader timeout detected, starting election");
                let peer = peer.clone();
                tokio::spawn(async move { peer.start_election().await; });
            }
        });
    }

    async fn broadcast_to_all(&self, msg: WireMessage) {
        let peers = self.membership.lock().await.others();
        let addrs: Vec<_> = peers.iter().map(|p| p.addr()).collect();
        self.transport.broadcast(&addrs, &msg).await;
    }

    /// Persist and hand off a message that ordering has released for
    /// delivery, in order.
    async fn deliver(&self, msg: DeliveredMessage) {
        if let Err(e) = self.storage.append(&msg).await {
            error!(seq_no = msg.seq_no, error = %e, "failed to persist delivered message");
        }
        info!(seq_no = msg.seq_no, sender_id = msg.sender_id, text = %msg.text, "delivered");
        if let Some(cb) = self.message_callback.lock().await.as_ref() {
            cb(msg);
        }
    }
}

fn seq_chat_wire(msg: &DeliveredMessage) -> WireMessage {
    WireMessage::SeqChat {
        sender_id: msg.sender_id,
        term: msg.term,
        room_id: msg.room_id.clone(),
        seq_no: msg.seq_no,
        msg_id: msg.msg_id.clone(),
        payload: msg.text.clone(),
    }
}

fn now_unix() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
