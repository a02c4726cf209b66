// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Append-only persistent log of delivered messages.
//!
//! One file per peer, one JSON-encoded [`DeliveredMessage`] per line.
//! `append` takes an exclusive lock, writes, and flushes so that a crash
//! right after return is recoverable on the next `recover()` call.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::error;

use crate::wire::DeliveredMessage;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt log line: {0}")]
    Decode(String),
    #[error("gap detected in stored sequence: expected {expected}, found {found}")]
    GapDetected { expected: u64, found: u64 },
}

pub struct Storage {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl Storage {
    pub fn new(log_dir: &Path, peer_id: u64) -> Result<Self, StorageError> {
        std::fs::create_dir_all(log_dir)?;
        let path = log_dir.join(format!("node_{peer_id}_messages.jsonl"));
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// Append a message to the log. Durability failures are logged at
    /// ERROR and returned to the caller; the in-memory delivery has
    /// already happened by the time this is called, so a failure here is
    /// a known gap versus stronger durability (see the distilled spec's
    /// Error Handling Design).
    pub async fn append(&self, msg: &DeliveredMessage) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut line = serde_json::to_string(msg)
            .map_err(|e| StorageError::Decode(format!("encode failed: {e}")))?;
        line.push('\n');

        let result = async {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            Ok::<(), std::io::Error>(())
        }
        .await;

        if let Err(e) = &result {
            error!(seq_no = msg.seq_no, error = %e, "failed to append message to log");
        }
        result.map_err(StorageError::from)
    }

    /// Read every line in file order, decoding each as a `DeliveredMessage`.
    pub async fn load_all(&self) -> Result<Vec<DeliveredMessage>, StorageError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = tokio::fs::File::open(&self.path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut out = Vec::new();
        while let Some(line) = lines.next_line().await? {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let msg: DeliveredMessage = serde_json::from_str(trimmed)
                .map_err(|e| StorageError::Decode(e.to_string()))?;
            out.push(msg);
        }
        Ok(out)
    }

    pub async fn get_after(&self, seq: u64) -> Result<Vec<DeliveredMessage>, StorageError> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .filter(|m| m.seq_no > seq)
            .collect())
    }

    /// `load_all` plus a contiguity check: `seq_no` values must be strictly
    /// increasing starting at 1 with no gaps. A gap fails startup
    /// (fail-fast), per the distilled spec's Open Question (iii).
    pub async fn recover(&self) -> Result<(u64, Vec<DeliveredMessage>), StorageError> {
        let messages = self.load_all().await?;
        let mut expected = 1u64;
        for msg in &messages {
            if msg.seq_no != expected {
                return Err(StorageError::GapDetected {
                    expected,
                    found: msg.seq_no,
                });
            }
            expected += 1;
        }
        let max_seq = messages.last().map(|m| m.seq_no).unwrap_or(0);
        Ok((max_seq, messages))
    }
}
