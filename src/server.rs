//! Storage server: listeners, peer links and the event loop.
//!
//! One task owns every piece of mutable state (object store, tag pool,
//! connection table, outstanding forwarded requests) and processes events
//! strictly in order, so none of it is locked. Sockets are driven by
//! per-connection reader and writer tasks that talk to the loop over
//! channels; the loop itself never waits on a socket.
//!
//! # Example
//!
//! ```no_run
//! use shardstore::{Server, ServerConfig};
//!
//! # async fn demo() -> shardstore::error::Result<()> {
//! let mut server = Server::bind(ServerConfig::default()).await?;
//! let peers = server.discover_peers().await?;
//! server.connect_peers(&peers).await?;
//! let handle = server.spawn();
//! // ...
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::ServerConfig;
use crate::connection::{read_loop, Connection, ConnectionId, ConnectionKind, Event, Slot};
use crate::discovery::dial_address;
use crate::error::{Result, ShardStoreError, StoreError};
use crate::protocol::{Message, OutboundFrame, ShardId, Tag};
use crate::store::ObjectStore;
use crate::tags::TagAllocator;
use crate::writer::spawn_writer_task;

/// Capacity of the channel from connection readers to the loop.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Reply text for the one Local opcode that is not served.
pub const REMOTE_STORE_UNSUPPORTED: &str = "LocalRemoteStore is not supported";

/// Reply text when a forwarded request passes its deadline.
pub const REMOTE_TIMEOUT: &str = "remote request timed out";

fn lossy(key: &[u8]) -> String {
    String::from_utf8_lossy(key).into_owned()
}

/// Point-in-time counters of a running server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStats {
    pub shard_id: ShardId,
    pub objects: usize,
    pub total_size: usize,
    pub max_size: usize,
    pub outstanding_tags: usize,
    pub connections: usize,
    pub peers: Vec<ShardId>,
}

/// A forwarded request waiting for its reply.
#[derive(Debug)]
struct Outstanding {
    /// Client connection and reply slot; `None` once the client is gone.
    requester: Option<(ConnectionId, Slot)>,
    /// Peer connection the request went out on.
    target: ConnectionId,
    deadline: Instant,
}

/// State owned by the event loop.
#[derive(Debug)]
pub(crate) struct Node {
    shard_id: ShardId,
    store: ObjectStore,
    tags: TagAllocator,
    connections: HashMap<ConnectionId, Connection>,
    peers: BTreeMap<ShardId, ConnectionId>,
    outstanding: HashMap<Tag, Outstanding>,
    next_conn: ConnectionId,
    events: mpsc::Sender<Event>,
    max_frame_size: u32,
    outbound_capacity: usize,
    remote_timeout: Duration,
}

impl Node {
    pub(crate) fn new(config: &ServerConfig, events: mpsc::Sender<Event>) -> Self {
        Self {
            shard_id: config.shard_id,
            store: ObjectStore::new(config.max_store_bytes),
            tags: TagAllocator::new(config.tag_capacity),
            connections: HashMap::new(),
            peers: BTreeMap::new(),
            outstanding: HashMap::new(),
            next_conn: 0,
            events,
            max_frame_size: config.max_frame_size,
            outbound_capacity: config.outbound_queue_frames,
            remote_timeout: config.remote_timeout(),
        }
    }

    /// Start reader and writer tasks for a new stream.
    pub(crate) fn register<R, W>(&mut self, reader: R, writer: W, kind: ConnectionKind) -> ConnectionId
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let id = self.next_conn;
        self.next_conn += 1;

        let (writer, writer_task) = spawn_writer_task(writer, self.outbound_capacity);
        let events = self.events.clone();
        tokio::spawn(async move {
            // A clean exit means the loop already dropped the connection.
            if let Ok(Err(error)) = writer_task.await {
                let _ = events
                    .send(Event::Closed {
                        conn: id,
                        error: Some(error),
                    })
                    .await;
            }
        });
        let class = kind.class();
        let reader = tokio::spawn(read_loop(
            id,
            class,
            reader,
            class.frame_limit(self.max_frame_size),
            self.events.clone(),
        ));
        self.connections
            .insert(id, Connection::new(id, kind, writer, reader));

        if let ConnectionKind::PeerDialed(shard) = kind {
            if let Some(old) = self.peers.insert(shard, id) {
                self.close(old, None);
            }
        }
        id
    }

    pub(crate) fn handle_event(&mut self, event: Event) {
        match event {
            Event::Message { conn, msg } => self.dispatch(conn, msg),
            Event::Closed { conn, error } => self.close(conn, error),
        }
    }

    fn dispatch(&mut self, conn: ConnectionId, msg: Message) {
        if !self.connections.contains_key(&conn) {
            // Reader events can trail a close.
            return;
        }
        tracing::debug!(conn, %msg, "dispatch");

        match msg {
            Message::LocalStore { name, object } => {
                let reply = match self
                    .store
                    .new_object_from_string(&name, Bytes::copy_from_slice(&object))
                {
                    Ok(()) => Message::local_success("made new object"),
                    Err(e) => Message::local_error(e.to_string()),
                };
                self.reply(conn, &reply);
            }
            Message::LocalLookup { name } => {
                let reply = match self.store.locate(&name) {
                    Some(blob) => Message::LocalStore {
                        object: blob.bytes(),
                        name,
                    },
                    None => Message::local_error(StoreError::NotFound(lossy(&name)).to_string()),
                };
                self.reply(conn, &reply);
            }
            Message::LocalDelete { name } => {
                let reply = match self.store.delete_object(&name) {
                    Ok(()) => Message::local_success(format!("deleted {}", lossy(&name))),
                    Err(e) => Message::local_error(e.to_string()),
                };
                self.reply(conn, &reply);
            }
            Message::LocalRemoteLookup { name, node } => {
                self.forward(conn, node, |tag| Message::RemoteLookup { tag, name });
            }
            Message::LocalRemoteDelete { name, node } => {
                self.forward(conn, node, |tag| Message::RemoteDelete { tag, name });
            }
            Message::LocalRemoteStore { name, node, .. } => {
                tracing::warn!(conn, key = %lossy(&name), shard = node, "remote store rejected");
                self.reply(conn, &Message::local_error(REMOTE_STORE_UNSUPPORTED));
            }
            Message::LocalSuccess { .. } | Message::LocalError { .. } => {
                tracing::warn!(conn, "client sent a reply message");
                self.reply(conn, &Message::local_error("unexpected reply message"));
            }

            Message::RemoteLookup { tag, name } => {
                let reply = match self.store.locate(&name) {
                    Some(blob) => Message::RemoteStore {
                        tag,
                        object: blob.bytes(),
                        name,
                    },
                    None => {
                        Message::remote_error(tag, StoreError::NotFound(lossy(&name)).to_string())
                    }
                };
                self.reply(conn, &reply);
            }
            Message::RemoteDelete { tag, name } => {
                let reply = match self.store.delete_object(&name) {
                    Ok(()) => Message::remote_success(tag, format!("deleted {}", lossy(&name))),
                    Err(e) => Message::remote_error(tag, e.to_string()),
                };
                self.reply(conn, &reply);
            }
            Message::RemoteStore { tag, name, object } => {
                self.remote_object(conn, tag, name, object);
            }
            Message::RemoteSuccess { tag, message } => {
                if let Some(entry) = self.take_outstanding(conn, tag) {
                    self.deliver(entry.requester, Message::LocalSuccess { message });
                }
            }
            Message::RemoteError { tag, message } => {
                if let Some(entry) = self.take_outstanding(conn, tag) {
                    self.deliver(entry.requester, Message::LocalError { message });
                }
            }
        }
    }

    /// Send a reply now, outside the forwarded-reply order.
    fn reply(&mut self, conn: ConnectionId, msg: &Message) {
        let result = match self.connections.get(&conn) {
            Some(c) => c.send(OutboundFrame::from_message(msg)),
            None => return,
        };
        if let Err(e) = result {
            self.close(conn, Some(e));
        }
    }

    /// Hand a forwarded reply to its requester's reassembly.
    fn deliver(&mut self, requester: Option<(ConnectionId, Slot)>, msg: Message) {
        let Some((conn, slot)) = requester else {
            tracing::debug!(%msg, "requester gone, reply dropped");
            return;
        };
        let result = match self.connections.get_mut(&conn) {
            Some(c) => c.deliver(slot, OutboundFrame::from_message(&msg)),
            None => return,
        };
        if let Err(e) = result {
            self.close(conn, Some(e));
        }
    }

    fn forward(&mut self, conn: ConnectionId, shard: ShardId, build: impl FnOnce(Tag) -> Message) {
        let Some(client) = self.connections.get_mut(&conn) else {
            return;
        };
        let slot = client.expect_reply();

        match self.start_forward(conn, slot, shard, build) {
            Ok(tag) => tracing::debug!(conn, tag, shard, "forwarded"),
            Err(e) => {
                tracing::warn!(conn, shard, error = %e, "forward failed");
                self.deliver(Some((conn, slot)), Message::local_error(e.to_string()));
            }
        }
    }

    fn start_forward(
        &mut self,
        conn: ConnectionId,
        slot: Slot,
        shard: ShardId,
        build: impl FnOnce(Tag) -> Message,
    ) -> Result<Tag> {
        let peer = *self
            .peers
            .get(&shard)
            .ok_or(ShardStoreError::UnknownPeer(shard))?;
        let tag = self.tags.emit()?;

        let frame = OutboundFrame::from_message(&build(tag));
        let sent = match self.connections.get(&peer) {
            Some(p) => p.send(frame),
            None => Err(ShardStoreError::UnknownPeer(shard)),
        };
        if let Err(e) = sent {
            self.release_tag(tag);
            let text = e.to_string();
            self.close(peer, Some(e));
            return Err(ShardStoreError::Invalid(format!(
                "connection to shard {} failed: {}",
                shard, text
            )));
        }

        self.outstanding.insert(
            tag,
            Outstanding {
                requester: Some((conn, slot)),
                target: peer,
                deadline: Instant::now() + self.remote_timeout,
            },
        );
        Ok(tag)
    }

    fn release_tag(&mut self, tag: Tag) {
        if let Err(e) = self.tags.allow(tag) {
            tracing::error!(tag, error = %e, "tag pool out of sync");
        }
    }

    /// Claim the outstanding entry a reply on `conn` answers.
    fn take_outstanding(&mut self, conn: ConnectionId, tag: Tag) -> Option<Outstanding> {
        match self.outstanding.get(&tag) {
            None => {
                tracing::warn!(conn, tag, "orphaned reply dropped");
                None
            }
            Some(entry) if entry.target != conn => {
                tracing::warn!(conn, tag, expected = entry.target, "reply on wrong connection dropped");
                None
            }
            Some(_) => {
                let entry = self.outstanding.remove(&tag)?;
                self.release_tag(tag);
                Some(entry)
            }
        }
    }

    /// A peer sent an object, normally the answer to a RemoteLookup.
    ///
    /// Remote copies are authoritative, so it is stored whether or not
    /// anybody is still waiting for it.
    fn remote_object(&mut self, conn: ConnectionId, tag: Tag, name: Bytes, object: Bytes) {
        let object = Bytes::copy_from_slice(&object);
        let stored = self.store.overwrite_from_bytes(&name, object.clone());

        let Some(entry) = self.take_outstanding(conn, tag) else {
            match stored {
                Ok(_) => tracing::info!(conn, tag, key = %lossy(&name), "unsolicited object stored"),
                Err(e) => tracing::warn!(conn, tag, error = %e, "unsolicited object rejected"),
            }
            return;
        };

        let reply = match stored {
            Ok(replaced) => {
                tracing::debug!(tag, key = %lossy(&name), size = object.len(), replaced, "remote object stored");
                Message::LocalStore { name, object }
            }
            Err(e) => Message::local_error(e.to_string()),
        };
        self.deliver(entry.requester, reply);
    }

    /// Fail every forwarded request whose deadline is at or before `now`.
    pub(crate) fn expire(&mut self, now: Instant) {
        let expired: Vec<Tag> = self
            .outstanding
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(tag, _)| *tag)
            .collect();

        for tag in expired {
            if let Some(entry) = self.outstanding.remove(&tag) {
                tracing::warn!(tag, peer = entry.target, "remote request timed out");
                self.release_tag(tag);
                self.deliver(entry.requester, Message::local_error(REMOTE_TIMEOUT));
            }
        }
    }

    /// Tear a connection down and fix up every table that refers to it.
    pub(crate) fn close(&mut self, conn: ConnectionId, error: Option<ShardStoreError>) {
        let Some(mut c) = self.connections.remove(&conn) else {
            return;
        };
        if !c.begin_close() {
            return;
        }
        let pending = c.pending_replies();
        match &error {
            None => tracing::info!(conn, kind = %c.kind(), pending, "connection closed"),
            Some(e @ ShardStoreError::Backpressure(_)) => {
                tracing::warn!(conn, kind = %c.kind(), pending, error = %e, "closing slow connection")
            }
            Some(e) => {
                tracing::warn!(conn, kind = %c.kind(), pending, error = %e, "connection failed")
            }
        }
        c.finish_close();

        match c.kind() {
            ConnectionKind::Client => {
                for entry in self.outstanding.values_mut() {
                    if matches!(entry.requester, Some((id, _)) if id == conn) {
                        entry.requester = None;
                    }
                }
            }
            ConnectionKind::PeerDialed(shard) => {
                if self.peers.get(&shard) == Some(&conn) {
                    self.peers.remove(&shard);
                }
                let lost: Vec<Tag> = self
                    .outstanding
                    .iter()
                    .filter(|(_, e)| e.target == conn)
                    .map(|(tag, _)| *tag)
                    .collect();
                let text = format!("connection to shard {} lost", shard);
                for tag in lost {
                    if let Some(entry) = self.outstanding.remove(&tag) {
                        self.release_tag(tag);
                        self.deliver(entry.requester, Message::local_error(text.clone()));
                    }
                }
            }
            ConnectionKind::PeerAccepted => {}
        }
    }

    pub(crate) fn stats(&self) -> ServerStats {
        ServerStats {
            shard_id: self.shard_id,
            objects: self.store.len(),
            total_size: self.store.total_size(),
            max_size: self.store.max_size(),
            outstanding_tags: self.tags.outstanding(),
            connections: self.connections.len(),
            peers: self.peers.keys().copied().collect(),
        }
    }

    fn shutdown(&mut self) {
        for (_, mut c) in self.connections.drain() {
            c.begin_close();
            c.finish_close();
        }
        self.peers.clear();
        self.outstanding.clear();
    }
}

/// Requests from a [`ServerHandle`] to the loop.
#[derive(Debug)]
enum Command {
    Stats(oneshot::Sender<ServerStats>),
    Shutdown,
}

/// A bound server, not yet running.
pub struct Server {
    config: ServerConfig,
    client_listener: TcpListener,
    peer_listener: TcpListener,
    node: Node,
    events: mpsc::Receiver<Event>,
    commands_tx: mpsc::Sender<Command>,
    commands: mpsc::Receiver<Command>,
}

impl Server {
    /// Validate the config and bind both listeners.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let client_listener = TcpListener::bind(&config.client_addr).await?;
        let peer_listener = TcpListener::bind(config.peer_listen_addr()?).await?;

        let (events_tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (commands_tx, commands) = mpsc::channel(16);
        let node = Node::new(&config, events_tx);

        tracing::info!(
            shard = config.shard_id,
            client_addr = %client_listener.local_addr()?,
            peer_addr = %peer_listener.local_addr()?,
            "listening"
        );

        Ok(Self {
            config,
            client_listener,
            peer_listener,
            node,
            events,
            commands_tx,
            commands,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn client_addr(&self) -> Result<SocketAddr> {
        Ok(self.client_listener.local_addr()?)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.peer_listener.local_addr()?)
    }

    /// Ask the configured peer source for this shard's peers.
    pub async fn discover_peers(&self) -> Result<BTreeMap<ShardId, String>> {
        self.config.peers.discover(self.config.shard_id).await
    }

    /// Dial every peer and index the links by shard id.
    ///
    /// Values are ips (dialed on the derived peer port) or `host:port`.
    pub async fn connect_peers(&mut self, peers: &BTreeMap<ShardId, String>) -> Result<()> {
        for (&shard, value) in peers {
            if shard == self.config.shard_id {
                continue;
            }
            let addr = dial_address(value, self.config.peer_port(shard)?);
            let stream = dial(&addr, self.config.connect_retries, self.config.connect_backoff()).await?;
            stream.set_nodelay(true)?;
            let (reader, writer) = stream.into_split();
            let conn = self
                .node
                .register(reader, writer, ConnectionKind::PeerDialed(shard));
            tracing::info!(conn, shard, %addr, "peer connected");
        }
        Ok(())
    }

    /// Shard ids with an established link.
    pub fn connected_peers(&self) -> Vec<ShardId> {
        self.node.peers.keys().copied().collect()
    }

    /// Run the loop on a new task.
    pub fn spawn(self) -> ServerHandle {
        let client_addr = self.client_listener.local_addr().ok();
        let peer_addr = self.peer_listener.local_addr().ok();
        let commands = self.commands_tx.clone();
        let task = tokio::spawn(self.run_until(std::future::pending::<()>()));
        ServerHandle {
            client_addr,
            peer_addr,
            commands,
            task,
        }
    }

    /// Run the loop until `shutdown` resolves or a handle asks to stop.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut sweep = tokio::time::interval(self.config.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.client_listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!(error = %e, "set_nodelay failed");
                        }
                        let (reader, writer) = stream.into_split();
                        let conn = self.node.register(reader, writer, ConnectionKind::Client);
                        tracing::info!(conn, %addr, "client connected");
                    }
                    Err(e) => tracing::warn!(error = %e, "client accept failed"),
                },
                accepted = self.peer_listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!(error = %e, "set_nodelay failed");
                        }
                        let (reader, writer) = stream.into_split();
                        let conn = self.node.register(reader, writer, ConnectionKind::PeerAccepted);
                        tracing::info!(conn, %addr, "peer accepted");
                    }
                    Err(e) => tracing::warn!(error = %e, "peer accept failed"),
                },
                Some(event) = self.events.recv() => self.node.handle_event(event),
                Some(command) = self.commands.recv() => match command {
                    Command::Stats(reply) => {
                        let _ = reply.send(self.node.stats());
                    }
                    Command::Shutdown => break,
                },
                _ = sweep.tick() => self.node.expire(Instant::now()),
            }
        }

        tracing::info!(shard = self.config.shard_id, "shutting down");
        self.node.shutdown();
        Ok(())
    }
}

/// Dial with a fixed pause between attempts.
async fn dial(addr: &str, retries: u32, backoff: Duration) -> Result<TcpStream> {
    let mut attempt = 0;
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) if attempt < retries => {
                attempt += 1;
                tracing::debug!(addr, attempt, error = %e, "peer dial failed, retrying");
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Handle to a spawned server. Dropping it leaves the server running.
pub struct ServerHandle {
    client_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    commands: mpsc::Sender<Command>,
    task: JoinHandle<Result<()>>,
}

impl ServerHandle {
    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.client_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub async fn stats(&self) -> Result<ServerStats> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Stats(tx))
            .await
            .map_err(|_| ShardStoreError::ConnectionClosed)?;
        rx.await.map_err(|_| ShardStoreError::ConnectionClosed)
    }

    /// Stop the loop and wait for it.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.commands.send(Command::Shutdown).await;
        self.task
            .await
            .map_err(|e| ShardStoreError::Invalid(format!("server task failed: {}", e)))?
    }
}
