//! End-to-end tests over loopback TCP.
//!
//! Each test binds real servers on ephemeral ports. Peers are either other
//! servers or a hand-driven fake that speaks the Remote class directly.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use shardstore::client::{Reply, StoreClient};
use shardstore::error::ShardStoreError;
use shardstore::protocol::{build_frame, FrameBuffer, Message, MessageClass, ShardId, Tag};
use shardstore::server::REMOTE_TIMEOUT;
use shardstore::{Server, ServerConfig, ServerHandle};

fn config(shard_id: ShardId) -> ServerConfig {
    ServerConfig {
        shard_id,
        client_addr: "127.0.0.1:0".into(),
        peer_addr: Some("127.0.0.1:0".into()),
        ready_addr: None,
        connect_retries: 0,
        sweep_interval_ms: 10,
        ..Default::default()
    }
}

async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

async fn start(config: ServerConfig) -> ServerHandle {
    Server::bind(config).await.unwrap().spawn()
}

async fn client(handle: &ServerHandle) -> StoreClient {
    StoreClient::connect(handle.client_addr().unwrap())
        .await
        .unwrap()
}

/// A peer driven by the test: accepts the server's dial and exchanges
/// Remote-class frames by hand.
struct FakePeer {
    stream: TcpStream,
    frames: FrameBuffer,
}

impl FakePeer {
    async fn recv(&mut self) -> Message {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(payload) = self.frames.try_extract_frame().unwrap() {
                return Message::decode(MessageClass::Remote, payload).unwrap();
            }
            let n = self.stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "server closed the peer link");
            self.frames.feed(&buf[..n]);
        }
    }

    async fn send(&mut self, msg: &Message) {
        self.stream.write_all(&build_frame(&msg.encode())).await.unwrap();
    }
}

/// Start shard 0 with shard 1 played by a [`FakePeer`].
async fn start_with_fake_peer(mut config: ServerConfig) -> (ServerHandle, FakePeer) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let fake_addr = listener.local_addr().unwrap().to_string();

    config.shard_id = 0;
    let mut server = Server::bind(config).await.unwrap();
    let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
    server
        .connect_peers(&BTreeMap::from([(1, fake_addr)]))
        .await
        .unwrap();
    assert_eq!(server.connected_peers(), vec![1]);

    let stream = within(accept).await.unwrap();
    let peer = FakePeer {
        stream,
        frames: FrameBuffer::new(),
    };
    (server.spawn(), peer)
}

fn tag_of(msg: &Message) -> Tag {
    msg.tag().expect("remote message")
}

#[tokio::test]
async fn test_store_then_lookup() {
    let server = start(config(0)).await;
    let mut c = client(&server).await;

    assert_eq!(
        within(c.store("quokka", "1234")).await.unwrap(),
        Reply::Success("made new object".into())
    );
    let reply = within(c.lookup("quokka")).await.unwrap();
    assert_eq!(reply.object().map(|b| &b[..]), Some(&b"1234"[..]));

    let stats = server.stats().await.unwrap();
    assert_eq!(stats.objects, 1);
    assert_eq!(stats.total_size, 4);
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_missing_key_and_duplicate_store() {
    let server = start(config(0)).await;
    let mut c = client(&server).await;

    match within(c.lookup("missing")).await.unwrap() {
        Reply::Error(text) => assert!(!text.is_empty()),
        other => panic!("unexpected {:?}", other),
    }

    c.store("k", "first").await.unwrap();
    assert!(c.store("k", "second").await.unwrap().is_error());
    let reply = c.lookup("k").await.unwrap();
    assert_eq!(reply.object().map(|b| &b[..]), Some(&b"first"[..]));
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_store_capacity_enforced() {
    let server = start(ServerConfig {
        max_store_bytes: 10,
        ..config(0)
    })
    .await;
    let mut c = client(&server).await;

    assert!(!c.store("a", "123456").await.unwrap().is_error());
    assert!(c.store("b", "12345").await.unwrap().is_error());
    assert!(!c.delete("a").await.unwrap().is_error());
    assert!(!c.store("b", "1234567890").await.unwrap().is_error());
    assert_eq!(server.stats().await.unwrap().total_size, 10);
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_two_servers_forward_lookup_and_delete() {
    let mut a = Server::bind(config(0)).await.unwrap();
    let mut b = Server::bind(config(1)).await.unwrap();
    let a_peer = a.peer_addr().unwrap().to_string();
    let b_peer = b.peer_addr().unwrap().to_string();
    a.connect_peers(&BTreeMap::from([(1, b_peer)])).await.unwrap();
    b.connect_peers(&BTreeMap::from([(0, a_peer)])).await.unwrap();
    let (a, b) = (a.spawn(), b.spawn());

    let mut cb = client(&b).await;
    cb.store("k", "data").await.unwrap();

    let mut ca = client(&a).await;
    let reply = within(ca.remote_lookup("k", 1)).await.unwrap();
    assert_eq!(reply.object().map(|b| &b[..]), Some(&b"data"[..]));

    // The fetched copy now lives on shard 0 too.
    let reply = ca.lookup("k").await.unwrap();
    assert_eq!(reply.object().map(|b| &b[..]), Some(&b"data"[..]));
    assert_eq!(a.stats().await.unwrap().outstanding_tags, 0);

    assert_eq!(
        within(ca.remote_delete("k", 1)).await.unwrap(),
        Reply::Success("deleted k".into())
    );
    assert!(cb.lookup("k").await.unwrap().is_error());

    // Missing on the far side comes back as an error with text.
    match within(ca.remote_lookup("nope", 1)).await.unwrap() {
        Reply::Error(text) => assert!(text.contains("nope")),
        other => panic!("unexpected {:?}", other),
    }

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_object_at_frame_limit_fetched_remotely() {
    let limited = |shard| ServerConfig {
        max_frame_size: 64,
        ..config(shard)
    };
    let mut a = Server::bind(limited(0)).await.unwrap();
    let b = Server::bind(limited(1)).await.unwrap();
    let b_peer = b.peer_addr().unwrap().to_string();
    a.connect_peers(&BTreeMap::from([(1, b_peer)])).await.unwrap();
    let (a, b) = (a.spawn(), b.spawn());

    // 4 + 1 + 4 + 1 + 54 bytes: a LocalStore frame exactly at the limit.
    let object = vec![b'x'; 54];
    let mut cb = client(&b).await;
    assert_eq!(
        cb.store("k", object.clone()).await.unwrap(),
        Reply::Success("made new object".into())
    );
    cb.store("s", "small").await.unwrap();

    let mut ca = client(&a).await;
    let reply = within(ca.remote_lookup("k", 1)).await.unwrap();
    assert_eq!(reply.object().map(|o| o.to_vec()), Some(object));

    // The peer link survived the tagged reply.
    let reply = within(ca.remote_lookup("s", 1)).await.unwrap();
    assert_eq!(reply.object().map(|o| &o[..]), Some(&b"small"[..]));
    assert_eq!(a.stats().await.unwrap().peers, vec![1]);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remote_replies_reassembled_in_request_order() {
    let (server, mut peer) = start_with_fake_peer(config(0)).await;
    let mut c = client(&server).await;

    for key in ["k1", "k2", "k3"] {
        c.send(&Message::LocalRemoteLookup {
            name: Bytes::from(key),
            node: 1,
        })
        .await
        .unwrap();
    }
    let mut requests = Vec::new();
    for _ in 0..3 {
        requests.push(within(peer.recv()).await);
    }

    for i in [2, 0, 1] {
        let Message::RemoteLookup { tag, name } = &requests[i] else {
            panic!("unexpected {:?}", requests[i]);
        };
        let object = Bytes::from(format!("v{}", i + 1));
        peer.send(&Message::RemoteStore {
            tag: *tag,
            name: name.clone(),
            object,
        })
        .await;
    }

    for (key, value) in [("k1", "v1"), ("k2", "v2"), ("k3", "v3")] {
        match Reply::try_from(within(c.recv()).await.unwrap()).unwrap() {
            Reply::Object { name, object } => {
                assert_eq!(&name[..], key.as_bytes());
                assert_eq!(&object[..], value.as_bytes());
            }
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(server.stats().await.unwrap().outstanding_tags, 0);
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_silent_peer_times_out() {
    let (server, mut peer) = start_with_fake_peer(ServerConfig {
        remote_timeout_ms: 50,
        ..config(0)
    })
    .await;
    let mut c = client(&server).await;

    c.send(&Message::LocalRemoteLookup {
        name: Bytes::from_static(b"k"),
        node: 1,
    })
    .await
    .unwrap();
    let request = within(peer.recv()).await;

    assert_eq!(
        Reply::try_from(within(c.recv()).await.unwrap()).unwrap(),
        Reply::Error(REMOTE_TIMEOUT.into())
    );
    assert_eq!(server.stats().await.unwrap().outstanding_tags, 0);

    // A reply after the deadline reaches nobody.
    peer.send(&Message::remote_success(tag_of(&request), "late")).await;
    assert!(!c.store("after", "x").await.unwrap().is_error());
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_peer_drop_fails_pending_requests() {
    let (server, mut peer) = start_with_fake_peer(config(0)).await;
    let mut c = client(&server).await;

    c.send(&Message::LocalRemoteDelete {
        name: Bytes::from_static(b"k"),
        node: 1,
    })
    .await
    .unwrap();
    within(peer.recv()).await;
    drop(peer);

    assert_eq!(
        Reply::try_from(within(c.recv()).await.unwrap()).unwrap(),
        Reply::Error("connection to shard 1 lost".into())
    );
    assert_eq!(
        within(c.remote_lookup("k", 1)).await.unwrap(),
        Reply::Error("no connection to shard 1".into())
    );
    let stats = server.stats().await.unwrap();
    assert!(stats.peers.is_empty());
    assert_eq!(stats.outstanding_tags, 0);
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_frame_split_across_single_byte_writes() {
    let server = start(config(0)).await;
    let mut raw = TcpStream::connect(server.client_addr().unwrap()).await.unwrap();
    raw.set_nodelay(true).unwrap();

    let msg = Message::LocalStore {
        name: Bytes::from_static(b"slow"),
        object: Bytes::from_static(b"drip"),
    };
    for byte in build_frame(&msg.encode()).iter() {
        raw.write_all(&[*byte]).await.unwrap();
        raw.flush().await.unwrap();
    }

    let mut c = StoreClient::from_stream(raw);
    assert_eq!(
        Reply::try_from(within(c.recv()).await.unwrap()).unwrap(),
        Reply::Success("made new object".into())
    );
    let reply = c.lookup("slow").await.unwrap();
    assert_eq!(reply.object().map(|b| &b[..]), Some(&b"drip"[..]));
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remote_store_request_rejected() {
    let (server, _peer) = start_with_fake_peer(config(0)).await;
    let mut c = client(&server).await;

    match within(c.remote_store("k", "v", 1)).await.unwrap() {
        Reply::Error(text) => assert!(text.contains("not supported")),
        other => panic!("unexpected {:?}", other),
    }
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_malformed_frame_closes_connection() {
    let server = start(config(0)).await;
    let mut raw = TcpStream::connect(server.client_addr().unwrap()).await.unwrap();

    // Length field 2 is smaller than the length field itself.
    raw.write_all(&2u32.to_le_bytes()).await.unwrap();

    let mut c = StoreClient::from_stream(raw);
    assert!(matches!(
        within(c.recv()).await,
        Err(ShardStoreError::ConnectionClosed) | Err(ShardStoreError::Io(_))
    ));

    // Other clients are unaffected.
    let mut other = client(&server).await;
    assert!(!other.store("k", "v").await.unwrap().is_error());
    server.shutdown().await.unwrap();
}
