//! Server configuration.
//!
//! Loaded from a JSON file (every field optional) and then overridden by
//! command-line flags.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::discovery::PeerSource;
use crate::error::{Result, ShardStoreError};
use crate::protocol::{ShardId, DEFAULT_MAX_FRAME_SIZE, LENGTH_FIELD_SIZE};
use crate::writer::DEFAULT_CHANNEL_CAPACITY;

/// Configuration of one storage server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Own shard id.
    pub shard_id: ShardId,

    /// Client-facing listener.
    pub client_addr: String,

    /// Ip the peer listener binds.
    pub peer_bind_ip: String,

    /// Peer listener port is `peer_port_base + shard_id`; peers are dialed
    /// on `peer_port_base + their shard id`.
    pub peer_port_base: u16,

    /// Explicit peer listener address, replacing the derived one.
    pub peer_addr: Option<String>,

    /// Readiness socket; `None` disables it.
    pub ready_addr: Option<String>,

    /// Object store capacity in bytes.
    pub max_store_bytes: usize,

    /// Maximum concurrently outstanding forwarded requests.
    pub tag_capacity: usize,

    /// Deadline of a forwarded request.
    pub remote_timeout_ms: u64,

    /// Period of the deadline sweep.
    pub sweep_interval_ms: u64,

    /// Largest accepted frame length field on client connections. Peer
    /// connections accept frames one tag larger.
    pub max_frame_size: u32,

    /// Per-connection outbound queue cap, in frames. A connection that hits
    /// it is closed.
    pub outbound_queue_frames: usize,

    /// Peer dial attempts before giving up.
    pub connect_retries: u32,

    /// Pause between peer dial attempts.
    pub connect_backoff_ms: u64,

    pub peers: PeerSource,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            shard_id: 0,
            client_addr: "127.0.0.1:8080".to_string(),
            peer_bind_ip: "0.0.0.0".to_string(),
            peer_port_base: 8000,
            peer_addr: None,
            ready_addr: Some("127.0.0.1:8079".to_string()),
            max_store_bytes: 2_000_000,
            tag_capacity: 1000,
            remote_timeout_ms: 5000,
            sweep_interval_ms: 100,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            outbound_queue_frames: DEFAULT_CHANNEL_CAPACITY,
            connect_retries: 50,
            connect_backoff_ms: 100,
            peers: PeerSource::default(),
        }
    }
}

impl ServerConfig {
    /// Parse from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Port a shard's peer listener uses.
    pub fn peer_port(&self, shard: ShardId) -> Result<u16> {
        u16::try_from(shard)
            .ok()
            .and_then(|s| self.peer_port_base.checked_add(s))
            .ok_or_else(|| {
                ShardStoreError::Invalid(format!(
                    "peer port {} + {} is out of range",
                    self.peer_port_base, shard
                ))
            })
    }

    /// Address the own peer listener binds.
    pub fn peer_listen_addr(&self) -> Result<String> {
        match &self.peer_addr {
            Some(addr) => Ok(addr.clone()),
            None => Ok(format!(
                "{}:{}",
                self.peer_bind_ip,
                self.peer_port(self.shard_id)?
            )),
        }
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(ShardStoreError::Invalid(msg.to_string()));
        if self.max_store_bytes == 0 {
            return invalid("max_store_bytes must be non-zero");
        }
        if self.tag_capacity == 0 {
            return invalid("tag_capacity must be non-zero");
        }
        if (self.max_frame_size as usize) <= LENGTH_FIELD_SIZE {
            return invalid("max_frame_size must exceed the length field");
        }
        if self.outbound_queue_frames == 0 {
            return invalid("outbound_queue_frames must be non-zero");
        }
        if self.sweep_interval_ms == 0 {
            return invalid("sweep_interval_ms must be non-zero");
        }
        if let PeerSource::Coordinator { block_dim: 0, .. } = self.peers {
            return invalid("coordinator block_dim must be non-zero");
        }
        self.peer_listen_addr()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.peer_listen_addr().unwrap(), "0.0.0.0:8000");
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ServerConfig::from_json(
            r#"{"shard_id": 3, "tag_capacity": 16, "peers": {"static": {"1": "10.0.0.2"}}}"#,
        )
        .unwrap();
        assert_eq!(config.shard_id, 3);
        assert_eq!(config.tag_capacity, 16);
        assert_eq!(config.max_store_bytes, 2_000_000);
        assert_eq!(config.peer_port(3).unwrap(), 8003);
        assert!(matches!(config.peers, PeerSource::Static(ref m) if m.len() == 1));
    }

    #[test]
    fn test_peer_port_overflow() {
        let config = ServerConfig {
            peer_port_base: 65000,
            ..Default::default()
        };
        assert_eq!(config.peer_port(535).unwrap(), 65535);
        assert!(config.peer_port(536).is_err());
        assert!(config.peer_port(70_000).is_err());
    }

    #[test]
    fn test_explicit_peer_addr_wins() {
        let config = ServerConfig {
            peer_addr: Some("127.0.0.1:0".into()),
            peer_port_base: 65535,
            shard_id: 9,
            ..Default::default()
        };
        config.validate().unwrap();
        assert_eq!(config.peer_listen_addr().unwrap(), "127.0.0.1:0");
    }

    #[test]
    fn test_validate_rejects_zero_capacities() {
        let bad = [
            ServerConfig {
                tag_capacity: 0,
                ..Default::default()
            },
            ServerConfig {
                max_store_bytes: 0,
                ..Default::default()
            },
            ServerConfig {
                max_frame_size: 4,
                ..Default::default()
            },
            ServerConfig {
                peers: PeerSource::Coordinator {
                    addr: "x:1".into(),
                    block_dim: 0,
                },
                ..Default::default()
            },
        ];
        for config in bad {
            assert!(config.validate().is_err(), "{:?}", config);
        }
    }

    #[test]
    fn test_unknown_field_is_ignored_bad_type_is_not() {
        assert!(ServerConfig::from_json(r#"{"extra": 1}"#).is_ok());
        assert!(matches!(
            ServerConfig::from_json(r#"{"shard_id": "one"}"#),
            Err(ShardStoreError::Json(_))
        ));
    }
}
