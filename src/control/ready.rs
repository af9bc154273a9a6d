//! `ready` line and ready socket.

use std::net::SocketAddr;

use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::protocol::ShardId;

/// The JSON line announcing that a server is up.
///
/// ```
/// use shardstore::control::ReadyLine;
///
/// let line = ReadyLine::new(2, "127.0.0.1:8080".into(), "0.0.0.0:8002".into(), vec![0, 1]);
/// let json = serde_json::to_string(&line).unwrap();
/// assert!(json.starts_with(r#"{"event":"ready","shard_id":2"#));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadyLine {
    pub event: &'static str,
    pub shard_id: ShardId,
    pub client_addr: String,
    pub peer_addr: String,
    pub peers: Vec<ShardId>,
}

impl ReadyLine {
    pub fn new(shard_id: ShardId, client_addr: String, peer_addr: String, peers: Vec<ShardId>) -> Self {
        Self {
            event: "ready",
            shard_id,
            client_addr,
            peer_addr,
            peers,
        }
    }
}

/// Bind `addr` and accept-and-drop connections until the task is aborted.
///
/// A harness knows the server is ready once a connect succeeds.
pub async fn serve_ready_socket(addr: &str) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    tracing::info!(ready_addr = %local, "ready socket listening");

    let task = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "ready probe");
                    drop(stream);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "ready socket accept failed");
                    return;
                }
            }
        }
    });
    Ok((local, task))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    #[test]
    fn test_ready_line_fields() {
        let line = ReadyLine::new(1, "a:1".into(), "b:2".into(), vec![3]);
        let value = serde_json::to_value(&line).unwrap();
        assert_eq!(value["event"], "ready");
        assert_eq!(value["peers"][0], 3);
        assert_eq!(value["peer_addr"], "b:2");
    }

    #[tokio::test]
    async fn test_ready_socket_accepts_and_drops() {
        let (addr, task) = serve_ready_socket("127.0.0.1:0").await.unwrap();

        for _ in 0..2 {
            let mut probe = TcpStream::connect(addr).await.unwrap();
            let mut buf = [0u8; 1];
            // Server drops the socket right away.
            assert_eq!(probe.read(&mut buf).await.unwrap(), 0);
        }
        task.abort();
    }
}
