// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sequence-number assignment, gap-buffering, and idempotent in-order
//! delivery.
//!
//! The leader path assigns monotonically increasing `seq_no`s; the
//! follower path buffers out-of-order `SEQ_CHAT`s and delivers strictly in
//! order, deduplicating on `(seq_no, term)`.

use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::wire::{DeliveredMessage, PeerId, Term};

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct OrderingManager {
    last_seq: u64,
    next_expected_seq: u64,
    buffer: HashMap<u64, DeliveredMessage>,
    delivered: HashSet<(u64, Term)>,
}

impl Default for OrderingManager {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderingManager {
    pub fn new() -> Self {
        Self {
            last_seq: 0,
            next_expected_seq: 1,
            buffer: HashMap::new(),
            delivered: HashSet::new(),
        }
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn next_expected_seq(&self) -> u64 {
        self.next_expected_seq
    }

    /// Seed state from storage recovery: `last_seq` and
    /// `next_expected_seq` only ever move forward, and every recovered
    /// message is marked delivered so it is never redelivered.
    pub fn seed_from_recovery(&mut self, max_seq: u64, recovered: &[DeliveredMessage]) {
        self.last_seq = self.last_seq.max(max_seq);
        self.next_expected_seq = self.next_expected_seq.max(max_seq + 1);
        for msg in recovered {
            self.delivered.insert((msg.seq_no, msg.term));
        }
    }

    /// Leader path: atomically assign the next sequence number.
    pub fn assign(
        &mut self,
        msg_id: String,
        sender_id: PeerId,
        room_id: String,
        text: String,
        term: Term,
    ) -> DeliveredMessage {
        self.last_seq += 1;
        DeliveredMessage {
            seq_no: self.last_seq,
            term,
            msg_id,
            sender_id,
            room_id,
            text,
            timestamp: now_unix(),
        }
    }

    /// Follower path: handle an incoming `SEQ_CHAT`. Returns every message
    /// newly delivered as a result, in ascending `seq_no` order (zero, one,
    /// or many if the arrival fills a gap).
    pub fn handle_seq_chat(&mut self, incoming: DeliveredMessage) -> Vec<DeliveredMessage> {
        let key = (incoming.seq_no, incoming.term);
        if self.delivered.contains(&key) {
            return Vec::new();
        }

        if incoming.seq_no < self.next_expected_seq {
            return Vec::new();
        }

        if incoming.seq_no > self.next_expected_seq {
            self.buffer.insert(incoming.seq_no, incoming);
            return Vec::new();
        }

        let mut delivered = Vec::new();
        self.deliver(incoming, &mut delivered);
        while let Some(next) = self.buffer.remove(&self.next_expected_seq) {
            self.deliver(next, &mut delivered);
        }
        delivered
    }

    fn deliver(&mut self, msg: DeliveredMessage, out: &mut Vec<DeliveredMessage>) {
        self.delivered.insert((msg.seq_no, msg.term));
        self.next_expected_seq = msg.seq_no + 1;
        self.last_seq = self.last_seq.max(msg.seq_no);
        out.push(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(seq_no: u64, term: Term) -> DeliveredMessage {
        DeliveredMessage {
            seq_no,
            term,
            msg_id: format!("m{seq_no}"),
            sender_id: 1,
            room_id: "general".into(),
            text: format!("text-{seq_no}"),
            timestamp: 0,
        }
    }

    #[test]
    fn assign_increments_monotonically() {
        let mut ord = OrderingManager::new();
        let a = ord.assign("a".into(), 1, "general".into(), "hi".into(), 1);
        let b = ord.assign("b".into(), 1, "general".into(), "there".into(), 1);
        assert_eq!(a.seq_no, 1);
        assert_eq!(b.seq_no, 2);
    }

    #[test]
    fn in_order_delivery_is_immediate() {
        let mut ord = OrderingManager::new();
        let delivered = ord.handle_seq_chat(chat(1, 1));
        assert_eq!(delivered.len(), 1);
        assert_eq!(ord.next_expected_seq(), 2);
    }

    #[test]
    fn out_of_order_arrival_delivers_in_seq_order() {
        let mut ord = OrderingManager::new();
        assert!(ord.handle_seq_chat(chat(3, 1)).is_empty());
        assert!(ord.handle_seq_chat(chat(2, 1)).is_empty());
        let burst = ord.handle_seq_chat(chat(1, 1));
        // Delivering seq 1 should also flush buffered 2 and 3, in order.
        assert_eq!(
            burst.iter().map(|m| m.seq_no).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(ord.next_expected_seq(), 4);
    }

    #[test]
    fn duplicate_seq_chat_delivers_once() {
        let mut ord = OrderingManager::new();
        assert_eq!(ord.handle_seq_chat(chat(7, 2)).len(), 1);
        assert!(ord.handle_seq_chat(chat(7, 2)).is_empty());
        assert!(ord.handle_seq_chat(chat(7, 2)).is_empty());
        assert_eq!(ord.next_expected_seq(), 8);
    }

    #[test]
    fn stale_seq_is_dropped() {
        let mut ord = OrderingManager::new();
        ord.handle_seq_chat(chat(1, 1));
        ord.handle_seq_chat(chat(2, 1));
        assert!(ord.handle_seq_chat(chat(1, 1)).is_empty());
    }

    #[test]
    fn seed_from_recovery_advances_and_marks_delivered() {
        let mut ord = OrderingManager::new();
        let recovered = vec![chat(1, 1), chat(2, 1)];
        ord.seed_from_recovery(2, &recovered);
        assert_eq!(ord.last_seq(), 2);
        assert_eq!(ord.next_expected_seq(), 3);
        // Replaying the same SEQ_CHAT after recovery must not redeliver.
        assert!(ord.handle_seq_chat(chat(1, 1)).is_empty());
    }
}
