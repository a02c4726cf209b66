// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Replicated chat log peer.
//!
//! Each peer is a single Tokio process composed of six cooperating
//! components: [`transport`], [`storage`], [`membership`], [`failure`],
//! [`election`], and [`ordering`], wired together by [`peer`].

pub mod config;
pub mod election;
pub mod error;
pub mod failure;
pub mod membership;
pub mod ordering;
pub mod peer;
pub mod storage;
pub mod transport;
pub mod wire;

pub use config::PeerConfig;
pub use error::{PeerError, Result};
pub use peer::ChatPeer;
pub use wire::{DeliveredMessage, PeerInfo, WireMessage};
