// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire protocol and data model.
//!
//! Every protocol message is a newline-terminated JSON object carrying
//! `type`, `sender_id`, `term`, and type-specific fields. Field presence,
//! not order, is significant: peers of different implementations must be
//! able to interoperate over this schema.

use serde::{Deserialize, Serialize};

/// Unique, totally ordered peer identifier. Higher id wins elections.
pub type PeerId = u64;

/// Monotonically non-decreasing leadership epoch.
pub type Term = u64;

/// Immutable address/identity record for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub host: std::net::IpAddr,
    pub port: u16,
}

impl PeerInfo {
    pub fn new(peer_id: PeerId, host: std::net::IpAddr, port: u16) -> Self {
        Self {
            peer_id,
            host,
            port,
        }
    }

    pub fn addr(&self) -> (std::net::IpAddr, u16) {
        (self.host, self.port)
    }
}

/// A chat message once assigned a sequence number and delivered in order.
/// Immutable after being appended to storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveredMessage {
    pub seq_no: u64,
    pub term: Term,
    pub msg_id: String,
    pub sender_id: PeerId,
    #[serde(default = "default_room")]
    pub room_id: String,
    pub text: String,
    pub timestamp: u64,
}

fn default_room() -> String {
    "general".to_string()
}

/// All protocol traffic flowing over the framed TCP transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    #[serde(rename = "JOIN")]
    Join {
        sender_id: PeerId,
        term: Term,
        #[serde(default = "default_room")]
        room_id: String,
        #[serde(default)]
        membership: Vec<PeerInfo>,
    },
    #[serde(rename = "JOIN_ACK")]
    JoinAck {
        sender_id: PeerId,
        term: Term,
        #[serde(default = "default_room")]
        room_id: String,
        membership: Vec<PeerInfo>,
        #[serde(default)]
        leader_id: Option<PeerId>,
    },
    #[serde(rename = "HEARTBEAT")]
    Heartbeat {
        sender_id: PeerId,
        term: Term,
        #[serde(default = "default_room")]
        room_id: String,
    },
    #[serde(rename = "ELECTION")]
    Election {
        sender_id: PeerId,
        term: Term,
        #[serde(default = "default_room")]
        room_id: String,
    },
    #[serde(rename = "ELECTION_OK")]
    ElectionOk {
        sender_id: PeerId,
        term: Term,
        #[serde(default = "default_room")]
        room_id: String,
    },
    #[serde(rename = "COORDINATOR")]
    Coordinator {
        sender_id: PeerId,
        term: Term,
        #[serde(default = "default_room")]
        room_id: String,
        #[serde(default)]
        membership: Vec<PeerInfo>,
    },
    #[serde(rename = "CHAT")]
    Chat {
        sender_id: PeerId,
        term: Term,
        #[serde(default = "default_room")]
        room_id: String,
        msg_id: String,
        payload: String,
    },
    #[serde(rename = "SEQ_CHAT")]
    SeqChat {
        sender_id: PeerId,
        term: Term,
        #[serde(default = "default_room")]
        room_id: String,
        seq_no: u64,
        msg_id: String,
        payload: String,
    },
    #[serde(rename = "CATCHUP_REQ")]
    CatchupReq {
        sender_id: PeerId,
        term: Term,
        #[serde(default = "default_room")]
        room_id: String,
        last_seq: u64,
    },
    #[serde(rename = "CATCHUP_RESP")]
    CatchupResp {
        sender_id: PeerId,
        term: Term,
        #[serde(default = "default_room")]
        room_id: String,
        payload: Vec<DeliveredMessage>,
    },
}

impl WireMessage {
    pub fn sender_id(&self) -> PeerId {
        match self {
            WireMessage::Join { sender_id, .. }
            | WireMessage::JoinAck { sender_id, .. }
            | WireMessage::Heartbeat { sender_id, .. }
            | WireMessage::Election { sender_id, .. }
            | WireMessage::ElectionOk { sender_id, .. }
            | WireMessage::Coordinator { sender_id, .. }
            | WireMessage::Chat { sender_id, .. }
            | WireMessage::SeqChat { sender_id, .. }
            | WireMessage::CatchupReq { sender_id, .. }
            | WireMessage::CatchupResp { sender_id, .. } => *sender_id,
        }
    }

    pub fn term(&self) -> Term {
        match self {
            WireMessage::Join { term, .. }
            | WireMessage::JoinAck { term, .. }
            | WireMessage::Heartbeat { term, .. }
            | WireMessage::Election { term, .. }
            | WireMessage::ElectionOk { term, .. }
            | WireMessage::Coordinator { term, .. }
            | WireMessage::Chat { term, .. }
            | WireMessage::SeqChat { term, .. }
            | WireMessage::CatchupReq { term, .. }
            | WireMessage::CatchupResp { term, .. } => *term,
        }
    }

    /// A short tag for logging, mirroring the `type` field on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Join { .. } => "JOIN",
            WireMessage::JoinAck { .. } => "JOIN_ACK",
            WireMessage::Heartbeat { .. } => "HEARTBEAT",
            WireMessage::Election { .. } => "ELECTION",
            WireMessage::ElectionOk { .. } => "ELECTION_OK",
            WireMessage::Coordinator { .. } => "COORDINATOR",
            WireMessage::Chat { .. } => "CHAT",
            WireMessage::SeqChat { .. } => "SEQ_CHAT",
            WireMessage::CatchupReq { .. } => "CATCHUP_REQ",
            WireMessage::CatchupResp { .. } => "CATCHUP_RESP",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_roundtrip_defaults_room() {
        let msg = WireMessage::Join {
            sender_id: 1,
            term: 0,
            room_id: "general".into(),
            membership: vec![],
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"JOIN\""));
        let back: WireMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.sender_id(), 1);
        assert_eq!(back.kind(), "JOIN");
    }

    #[test]
    fn seq_chat_carries_payload() {
        let msg = WireMessage::SeqChat {
            sender_id: 3,
            term: 2,
            room_id: "general".into(),
            seq_no: 7,
            msg_id: "abc".into(),
            payload: "hello".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: WireMessage = serde_json::from_str(&json).unwrap();
        match back {
            WireMessage::SeqChat { seq_no, payload, .. } => {
                assert_eq!(seq_no, 7);
                assert_eq!(payload, "hello");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn delivered_message_defaults_room_when_absent() {
        let json = r#"{"seq_no":1,"term":0,"msg_id":"x","sender_id":1,"text":"hi","timestamp":0}"#;
        let msg: DeliveredMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.room_id, "general");
    }
}
