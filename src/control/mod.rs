//! Control plane - readiness signal for external harnesses.
//!
//! The data plane is the framed TCP protocol. The control plane only tells
//! whoever started the server that it can take traffic:
//!
//! 1. Listeners are bound and every peer link is up
//! 2. The ready socket starts accepting (and dropping) connections
//! 3. One JSON `ready` line goes to stdout
//!
//! # Example
//!
//! ```ignore
//! use shardstore::control::{serve_ready_socket, write_stdout_json, ReadyLine};
//!
//! let (_addr, _task) = serve_ready_socket("127.0.0.1:8079").await?;
//! write_stdout_json(&ReadyLine::new(0, client_addr, peer_addr, vec![1, 2]))?;
//! ```

mod ready;
mod stdio;

pub use ready::{serve_ready_socket, ReadyLine};
pub use stdio::write_stdout_json;
