// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared error types for the peer's components.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PeerError>;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
