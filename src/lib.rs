//! # shardstore
//!
//! Sharded in-memory object store speaking a length-prefixed binary protocol
//! over TCP.
//!
//! ## Architecture
//!
//! - **Client plane**: Local-class messages (store, lookup, delete, and
//!   remote variants that name a shard)
//! - **Peer plane**: Remote-class messages between servers, each carrying a
//!   tag that correlates a forwarded request with its reply
//! - **Event loop**: one task owns the object store, the tag pool and every
//!   routing table; connections talk to it over channels
//!
//! ## Example
//!
//! ```ignore
//! use shardstore::{client::StoreClient, Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> shardstore::error::Result<()> {
//!     let server = Server::bind(ServerConfig::default()).await?;
//!     let handle = server.spawn();
//!
//!     let mut client = StoreClient::connect("127.0.0.1:8080").await?;
//!     client.store("quokka", "1234").await?;
//!     println!("{:?}", client.lookup("quokka").await?);
//!
//!     handle.shutdown().await
//! }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod control;
pub mod discovery;
pub mod error;
pub mod protocol;
pub mod server;
pub mod store;
pub mod tags;
pub mod writer;

pub use client::{Reply, StoreClient};
pub use config::ServerConfig;
pub use error::ShardStoreError;
pub use server::{Server, ServerHandle, ServerStats};
