// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Framed, newline-delimited JSON transport over TCP.
//!
//! Each message is the JSON encoding of its fields terminated by a single
//! `\n` byte; there is no length prefix, so embedded newlines in payloads
//! must never reach the wire (the JSON encoder escapes them). A per-peer
//! outbound connection cache avoids reconnecting on every send; a failed
//! send evicts the cached connection and increments a failure counter so
//! the orchestrator can drop unresponsive peers after `max_failures`.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::debug;

use crate::wire::WireMessage;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("malformed frame: {0}")]
    Protocol(String),
    #[error("connection closed")]
    Closed,
}

/// One framed duplex connection: a newline-delimited JSON reader and
/// writer pair. Used both for cached outbound connections and for
/// connections accepted by the listener.
pub struct FramedConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    line_buf: String,
}

impl FramedConnection {
    pub fn new(stream: TcpStream) -> Self {
        let (read_half, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer,
            line_buf: String::new(),
        }
    }

    pub async fn connect(addr: SocketAddr) -> Result<Self, TransportError> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::ConnectTimeout)??;
        Ok(Self::new(stream))
    }

    /// Read one message, decoding the next newline-terminated JSON line.
    /// Returns `Ok(None)` on a clean EOF.
    pub async fn read_message(&mut self) -> Result<Option<WireMessage>, TransportError> {
        self.line_buf.clear();
        let n = self.reader.read_line(&mut self.line_buf).await?;
        if n == 0 {
            return Ok(None);
        }
        let trimmed = self.line_buf.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            return Ok(None);
        }
        let msg = serde_json::from_str(trimmed)
            .map_err(|e| TransportError::Protocol(format!("invalid JSON: {e}")))?;
        Ok(Some(msg))
    }

    pub async fn send_message(&mut self, msg: &WireMessage) -> Result<(), TransportError> {
        let mut line = serde_json::to_string(msg)
            .map_err(|e| TransportError::Protocol(format!("serialize error: {e}")))?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Per-peer outbound connection cache with failure counting.
pub struct Transport {
    max_failures: u32,
    connections: Mutex<HashMap<(IpAddr, u16), FramedConnection>>,
    failure_counts: Mutex<HashMap<(IpAddr, u16), u32>>,
}

impl Transport {
    pub fn new(max_failures: u32) -> Arc<Self> {
        Arc::new(Self {
            max_failures,
            connections: Mutex::new(HashMap::new()),
            failure_counts: Mutex::new(HashMap::new()),
        })
    }

    pub async fn bind(addr: SocketAddr) -> Result<TcpListener, TransportError> {
        Ok(TcpListener::bind(addr).await?)
    }

    /// Send a message to `(host, port)`, reusing a cached connection if one
    /// is open. Never propagates I/O errors: all failures are logged at
    /// DEBUG and reported as `false`.
    pub async fn send_to(&self, host: IpAddr, port: u16, msg: &WireMessage) -> bool {
        let key = (host, port);

        let mut conns = self.connections.lock().await;
        if !conns.contains_key(&key) {
            match FramedConnection::connect(SocketAddr::new(host, port)).await {
                Ok(conn) => {
                    conns.insert(key, conn);
                }
                Err(e) => {
                    debug!(%host, port, error = %e, "outbound connect failed");
                    drop(conns);
                    self.record_failure(key).await;
                    return false;
                }
            }
        }

        let conn = conns.get_mut(&key).expect("just inserted or present");
        match conn.send_message(msg).await {
            Ok(()) => {
                drop(conns);
                self.reset_failure_count(host, port).await;
                true
            }
            Err(e) => {
                debug!(%host, port, error = %e, "send failed, evicting connection");
                conns.remove(&key);
                drop(conns);
                self.record_failure(key).await;
                false
            }
        }
    }

    /// Fire off `send_to` against every peer concurrently; individual
    /// failures are not propagated, matching the fire-and-forget broadcast
    /// semantics of SEQ_CHAT and HEARTBEAT.
    pub async fn broadcast(&self, peers: &[(IpAddr, u16)], msg: &WireMessage) {
        let sends = peers.iter().map(|&(host, port)| self.send_to(host, port, msg));
        futures::future::join_all(sends).await;
    }

    async fn record_failure(&self, key: (IpAddr, u16)) {
        let mut counts = self.failure_counts.lock().await;
        *counts.entry(key).or_insert(0) += 1;
    }

    pub async fn reset_failure_count(&self, host: IpAddr, port: u16) {
        self.failure_counts.lock().await.remove(&(host, port));
    }

    /// Addresses that have exceeded `max_failures` consecutive send
    /// failures since their last success.
    pub async fn failed_peers(&self) -> Vec<(IpAddr, u16)> {
        self.failure_counts
            .lock()
            .await
            .iter()
            .filter(|(_, &count)| count >= self.max_failures)
            .map(|(&addr, _)| addr)
            .collect()
    }
}
