// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Peer configuration.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Seed peer address used for bootstrap.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeedAddr {
    pub host: String,
    pub port: u16,
}

/// Port range for scan-based discovery, inclusive on both ends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

/// Peer configuration, mergeable from a JSON/YAML file and overridden by
/// CLI flags (file values win over defaults, CLI flags win over the file).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub peer_id: u64,
    #[serde(default = "default_bind")]
    pub host: IpAddr,
    pub port: u16,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_leader_timeout_ms")]
    pub leader_timeout_ms: u64,
    #[serde(default = "default_election_timeout_ms")]
    pub election_timeout_ms: u64,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default)]
    pub seeds: Vec<SeedAddr>,
    #[serde(default)]
    pub scan_port_range: Option<PortRange>,
    #[serde(default = "default_room")]
    pub room_id: String,
}

fn default_bind() -> IpAddr {
    "0.0.0.0".parse().unwrap()
}
fn default_log_dir() -> String {
    "./data/logs".to_string()
}
fn default_heartbeat_interval_ms() -> u64 {
    800
}
fn default_leader_timeout_ms() -> u64 {
    2500
}
fn default_election_timeout_ms() -> u64 {
    2000
}
fn default_max_failures() -> u32 {
    3
}
fn default_room() -> String {
    "general".to_string()
}

impl PeerConfig {
    /// Load configuration from a JSON or YAML file, chosen by extension
    /// (`.yml`/`.yaml` parses as YAML, anything else as JSON).
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yml") | Some("yaml")
        );
        if is_yaml {
            serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
        } else {
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn leader_timeout(&self) -> Duration {
        Duration::from_millis(self.leader_timeout_ms)
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue("port cannot be 0".into()));
        }
        if self.log_dir.trim().is_empty() {
            return Err(ConfigError::InvalidValue("log_dir cannot be empty".into()));
        }
        if !self.seeds.is_empty() && self.scan_port_range.is_some() {
            return Err(ConfigError::InvalidValue(
                "seeds and scan_port_range are mutually exclusive".into(),
            ));
        }
        if let Some(range) = self.scan_port_range {
            if range.end < range.start {
                return Err(ConfigError::InvalidValue(
                    "scan_port_range end must be >= start".into(),
                ));
            }
        }
        if self.max_failures == 0 {
            return Err(ConfigError::InvalidValue(
                "max_failures cannot be 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(s) => write!(f, "I/O error: {}", s),
            Self::Parse(s) => write!(f, "parse error: {}", s),
            Self::InvalidValue(s) => write!(f, "invalid value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> PeerConfig {
        PeerConfig {
            peer_id: 1,
            host: default_bind(),
            port: 5001,
            log_dir: default_log_dir(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            leader_timeout_ms: default_leader_timeout_ms(),
            election_timeout_ms: default_election_timeout_ms(),
            max_failures: default_max_failures(),
            seeds: vec![],
            scan_port_range: None,
            room_id: default_room(),
        }
    }

    #[test]
    fn validate_rejects_port_zero() {
        let mut cfg = base();
        cfg.port = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_seeds_and_scan_together() {
        let mut cfg = base();
        cfg.seeds.push(SeedAddr {
            host: "127.0.0.1".into(),
            port: 5002,
        });
        cfg.scan_port_range = Some(PortRange {
            start: 6000,
            end: 6010,
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn durations_convert_from_millis() {
        let cfg = base();
        assert_eq!(cfg.heartbeat_interval(), Duration::from_millis(800));
        assert_eq!(cfg.leader_timeout(), Duration::from_millis(2500));
    }
}
