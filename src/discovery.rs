//! Peer discovery.
//!
//! Produces the shard id to address map used once at startup to dial peers.
//! Either a static map from the config, or the answer of a coordinator:
//!
//! ```text
//! -> name:<own id>
//! <- addresses;<id>:<ip>;<id>:<ip>...;END
//! ```
//!
//! Only shards in the same group as this node (`id % block_dim`) are kept.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Result, ShardStoreError};
use crate::protocol::ShardId;

/// Terminator of a coordinator response.
const END_MARKER: &str = ";END";

/// Where peer addresses come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerSource {
    /// Fixed map. A value is either an ip (the peer port is derived) or a
    /// full `host:port`.
    Static(BTreeMap<ShardId, String>),
    /// Ask a coordinator service.
    Coordinator { addr: String, block_dim: u32 },
}

impl Default for PeerSource {
    fn default() -> Self {
        PeerSource::Static(BTreeMap::new())
    }
}

impl PeerSource {
    /// Resolve to shard id -> ip or address, as configured or announced.
    pub async fn discover(&self, own: ShardId) -> Result<BTreeMap<ShardId, String>> {
        match self {
            PeerSource::Static(peers) => Ok(peers
                .iter()
                .filter(|(id, _)| **id != own)
                .map(|(id, addr)| (*id, addr.clone()))
                .collect()),
            PeerSource::Coordinator { addr, block_dim } => {
                query_coordinator(addr, own, *block_dim).await
            }
        }
    }
}

/// Ask the coordinator at `addr` for the peers of `own`.
pub async fn query_coordinator(
    addr: &str,
    own: ShardId,
    block_dim: u32,
) -> Result<BTreeMap<ShardId, String>> {
    let mut stream = TcpStream::connect(addr).await?;
    stream
        .write_all(format!("name:{}", own).as_bytes())
        .await?;

    let mut response = Vec::new();
    let mut buf = vec![0u8; 4096];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(ShardStoreError::Invalid(format!(
                "coordinator {} closed before {}",
                addr, END_MARKER
            )));
        }
        response.extend_from_slice(&buf[..n]);
        if contains(&response, END_MARKER.as_bytes()) {
            break;
        }
    }

    let text = String::from_utf8_lossy(&response);
    tracing::debug!(coordinator = addr, response = %text, "peer addresses received");
    parse_peer_addresses(&text, own, block_dim)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Parse a coordinator response.
///
/// The first token (`addresses`) is skipped, as are this node's own entry and
/// shards of other groups.
pub fn parse_peer_addresses(
    response: &str,
    own: ShardId,
    block_dim: u32,
) -> Result<BTreeMap<ShardId, String>> {
    if block_dim == 0 {
        return Err(ShardStoreError::Invalid("block_dim must be non-zero".into()));
    }
    let body = match response.find(END_MARKER) {
        Some(end) => &response[..end],
        None => response,
    };

    let mut peers = BTreeMap::new();
    for entry in body.split(';').skip(1) {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (id, ip) = entry
            .split_once(':')
            .ok_or_else(|| ShardStoreError::Invalid(format!("malformed peer entry {:?}", entry)))?;
        let id: ShardId = id
            .parse()
            .map_err(|_| ShardStoreError::Invalid(format!("bad shard id in {:?}", entry)))?;

        if id == own {
            tracing::info!(shard = own, public_addr = ip, "own address announced");
            continue;
        }
        if id % block_dim != own % block_dim {
            continue;
        }
        peers.insert(id, ip.to_string());
    }
    Ok(peers)
}

/// Turn a discovered value into a dialable address.
///
/// A bare ip gets `port`; `host:port` is used as is; a bare hostname gets
/// `port` appended.
pub fn dial_address(value: &str, port: u16) -> String {
    if let Ok(ip) = value.parse::<IpAddr>() {
        return SocketAddr::new(ip, port).to_string();
    }
    if value.parse::<SocketAddr>().is_ok() || value.contains(':') {
        return value.to_string();
    }
    format!("{}:{}", value, port)
}
