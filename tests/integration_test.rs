//! Integration tests for meshtun
//!
//! Tests the full node-to-node flow including:
//! - Session dial/accept and encrypted data transfer
//! - Session multiplexing and ordering
//! - Close semantics
//! - Reconnection after link loss
//! - Channel activity pruning

use meshtun::transport::MemoryTransport;
use meshtun::{
    DialOptions, ListenOptions, Listener, Mode, Payload, Session, SessionState, Tunnel,
    TunnelError, TunnelOptions,
};
use std::future::Future;
use std::time::{Duration, Instant};

const TOKEN: &str = "integration-test-token";

fn options(transport: &MemoryTransport, address: &str) -> TunnelOptions {
    TunnelOptions::default()
        .with_address(address)
        .with_token(TOKEN)
        .with_transport(transport.clone())
}

/// Fail the test instead of hanging it
async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// A server listening on "test-tunnel" and a client linked to it
async fn server_and_client(transport: &MemoryTransport) -> (Tunnel, Listener, Tunnel) {
    let server = Tunnel::new(options(transport, "node-a")).unwrap();
    server.connect().await.unwrap();
    let listener = server
        .listen("test-tunnel", ListenOptions::default())
        .await
        .unwrap();

    let client = Tunnel::new(options(transport, "node-b").with_nodes(["node-a"])).unwrap();
    client.connect().await.unwrap();

    (server, listener, client)
}

/// Dial on the client and accept on the server
async fn session_pair(client: &Tunnel, listener: &Listener) -> (Session, Session) {
    let (dialed, accepted) = tokio::join!(
        client.dial("test-tunnel", DialOptions::default()),
        listener.accept()
    );
    (dialed.unwrap(), accepted.unwrap())
}

/// Test a full exchange: dial, accept, send with headers, reply
#[tokio::test]
async fn test_tunnel_exchange() {
    let transport = MemoryTransport::new();
    let (server, listener, client) = server_and_client(&transport).await;

    let (dialed, accepted) = within(session_pair(&client, &listener)).await;
    assert_eq!(dialed.state(), SessionState::Active);
    assert!(dialed.is_outbound());
    assert!(!accepted.is_outbound());
    assert_eq!(dialed.id(), accepted.id());
    assert_eq!(accepted.channel(), "test-tunnel");

    dialed
        .send(Payload::new("send over tunnel").with_header("test", "header"))
        .await
        .unwrap();

    let received = within(accepted.recv()).await.unwrap();
    assert_eq!(&received.body[..], b"send over tunnel");
    assert_eq!(received.header.get("test").map(String::as_str), Some("header"));
    assert_eq!(accepted.remote_tunnel_id().as_deref(), Some(client.id()));

    accepted.send(received).await.unwrap();
    let reply = within(dialed.recv()).await.unwrap();
    assert_eq!(&reply.body[..], b"send over tunnel");
    assert_eq!(reply.header["test"], "header");
    assert_eq!(dialed.remote_tunnel_id().as_deref(), Some(server.id()));

    client.close().await.unwrap();
    server.close().await.unwrap();
}

/// Test that many sessions share one link independently
#[tokio::test]
async fn test_multiple_sessions() {
    let transport = MemoryTransport::new();
    let (_server, listener, client) = server_and_client(&transport).await;

    let mut pairs = Vec::new();
    for _ in 0..5 {
        pairs.push(within(session_pair(&client, &listener)).await);
    }
    assert_eq!(client.links().len(), 1);

    for (i, (dialed, _)) in pairs.iter().enumerate() {
        dialed.send(Payload::new(format!("stream {}", i))).await.unwrap();
    }
    for (i, (_, accepted)) in pairs.iter().enumerate() {
        let payload = within(accepted.recv()).await.unwrap();
        assert_eq!(payload.body, format!("stream {}", i).as_bytes());
    }
}

/// Test that messages of one session arrive in order
#[tokio::test]
async fn test_fifo_ordering() {
    let transport = MemoryTransport::new();
    let (_server, listener, client) = server_and_client(&transport).await;
    let (dialed, accepted) = within(session_pair(&client, &listener)).await;

    let reader = tokio::spawn(async move {
        let mut bodies = Vec::new();
        for _ in 0..200 {
            bodies.push(accepted.recv().await.unwrap().body);
        }
        bodies
    });

    for i in 0..200u32 {
        dialed.send(Payload::new(i.to_be_bytes().to_vec())).await.unwrap();
    }

    let bodies = within(reader).await.unwrap();
    for (i, body) in bodies.iter().enumerate() {
        assert_eq!(&body[..], &(i as u32).to_be_bytes());
    }
}

/// Test that closing a session unblocks the peer's pending recv
#[tokio::test]
async fn test_close_unblocks_recv() {
    let transport = MemoryTransport::new();
    let (_server, listener, client) = server_and_client(&transport).await;
    let (dialed, accepted) = within(session_pair(&client, &listener)).await;

    let reader = tokio::spawn(async move { accepted.recv().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    dialed.close().await.unwrap();
    dialed.close().await.unwrap();

    let res = within(reader).await.unwrap();
    assert!(matches!(res, Err(TunnelError::Eof)));
    assert!(matches!(
        dialed.send(Payload::new("late")).await,
        Err(TunnelError::SessionClosed)
    ));
    assert!(matches!(dialed.recv().await, Err(TunnelError::Eof)));
}

/// Test that dropping every handle of a dialed session closes it for the peer
#[tokio::test]
async fn test_dropped_session_closes_peer() {
    let transport = MemoryTransport::new();
    let (_server, listener, client) = server_and_client(&transport).await;
    let (dialed, accepted) = within(session_pair(&client, &listener)).await;

    let reader = tokio::spawn(async move { accepted.recv().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    drop(dialed);
    assert!(matches!(
        within(reader).await.unwrap(),
        Err(TunnelError::Eof)
    ));
}

/// Test that closing a tunnel ends every blocked call on both sides
#[tokio::test]
async fn test_tunnel_close() {
    let transport = MemoryTransport::new();
    let (server, listener, client) = server_and_client(&transport).await;
    let (dialed, accepted) = within(session_pair(&client, &listener)).await;

    let server_reader = tokio::spawn(async move { accepted.recv().await });
    let client_reader = tokio::spawn(async move { dialed.recv().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    server.close().await.unwrap();

    assert!(matches!(
        within(server_reader).await.unwrap(),
        Err(TunnelError::Eof)
    ));
    assert!(matches!(listener.accept().await, Err(TunnelError::Eof)));

    // The client sees the link go away and ends its sessions
    assert!(matches!(
        within(client_reader).await.unwrap(),
        Err(TunnelError::Eof)
    ));
    assert!(matches!(
        server.dial("test-tunnel", DialOptions::default()).await,
        Err(TunnelError::Closed)
    ));
}

/// Test that a lost link is rebuilt and sessions can be opened again
#[tokio::test]
async fn test_reconnect() {
    let reconnect_time = Duration::from_millis(200);
    let transport = MemoryTransport::new();

    let server = Tunnel::new(options(&transport, "node-a")).unwrap();
    server.connect().await.unwrap();
    let listener = server
        .listen("test-tunnel", ListenOptions::default())
        .await
        .unwrap();

    let mut client_options = options(&transport, "node-b").with_nodes(["node-a"]);
    client_options.reconnect_time = reconnect_time;
    let client = Tunnel::new(client_options).unwrap();
    client.connect().await.unwrap();

    let first_link = client.links()[0].id.clone();
    let (dialed, accepted) = within(session_pair(&client, &listener)).await;

    // Cut the wire
    let cut = Instant::now();
    transport.disconnect_all();

    // Sessions are not migrated
    assert!(matches!(within(dialed.recv()).await, Err(TunnelError::Eof)));
    assert!(matches!(within(accepted.recv()).await, Err(TunnelError::Eof)));

    let relinked = wait_until(Duration::from_secs(3), || {
        client
            .links()
            .iter()
            .any(|link| link.connected && link.id != first_link)
    })
    .await;
    assert!(relinked);
    assert!(cut.elapsed() < reconnect_time + Duration::from_secs(1));

    let (dialed, accepted) = within(session_pair(&client, &listener)).await;
    dialed.send(Payload::new("after reconnect")).await.unwrap();
    assert_eq!(
        &within(accepted.recv()).await.unwrap().body[..],
        b"after reconnect"
    );
    assert_ne!(dialed.link_id(), Some(first_link.as_str()));
}

/// Test that a channel idle for longer than its ttl is forgotten by the link
#[tokio::test]
async fn test_channel_pruning() {
    let transport = MemoryTransport::new();
    let server = Tunnel::new(options(&transport, "node-a")).unwrap();
    server.connect().await.unwrap();
    let listener = server
        .listen("test-tunnel", ListenOptions::default())
        .await
        .unwrap();

    let mut client_options = options(&transport, "node-b").with_nodes(["node-a"]);
    client_options.link.prune_interval = Duration::from_millis(20);
    client_options.link.channel_ttl = Duration::from_millis(150);
    let client = Tunnel::new(client_options).unwrap();
    client.connect().await.unwrap();

    let (dialed, _accepted) = within(session_pair(&client, &listener)).await;
    dialed.send(Payload::new("x")).await.unwrap();

    let link_id = dialed.link_id().unwrap().to_string();
    assert!(client
        .link_channels(&link_id)
        .unwrap()
        .contains(&"test-tunnel".to_string()));

    let pruned = wait_until(Duration::from_secs(2), || {
        client.link_channels(&link_id).unwrap().is_empty()
    })
    .await;
    assert!(pruned);
}

/// Test a tunnel that links to itself
#[tokio::test]
async fn test_loopback_tunnel() {
    let transport = MemoryTransport::new();
    let tunnel = Tunnel::new(options(&transport, "node-loop").with_nodes(["node-loop"])).unwrap();
    tunnel.connect().await.unwrap();

    assert!(
        wait_until(Duration::from_secs(1), || {
            tunnel.links().iter().any(|link| link.loopback)
        })
        .await
    );

    let listener = tunnel
        .listen("test-tunnel", ListenOptions::default())
        .await
        .unwrap();
    let (dialed, accepted) = within(session_pair(&tunnel, &listener)).await;
    assert!(accepted.is_loopback());

    dialed.send(Payload::new("to myself")).await.unwrap();
    assert_eq!(&within(accepted.recv()).await.unwrap().body[..], b"to myself");

    accepted.send(Payload::new("from myself")).await.unwrap();
    assert_eq!(&within(dialed.recv()).await.unwrap().body[..], b"from myself");
}

/// Test that frames sealed with another token are dropped without killing the link
#[tokio::test]
async fn test_wrong_token_is_ignored() {
    let transport = MemoryTransport::new();
    let (server, listener, client) = server_and_client(&transport).await;

    let intruder = Tunnel::new(
        options(&transport, "node-c")
            .with_nodes(["node-a"])
            .with_token("some-other-token"),
    )
    .unwrap();
    intruder.connect().await.unwrap();

    let res = intruder
        .dial(
            "test-tunnel",
            DialOptions {
                timeout: Duration::from_millis(200),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(res, Err(TunnelError::DialTimeout)));

    // Both inbound links are still up and the honest client still works
    assert_eq!(server.links().len(), 2);
    assert!(server.links().iter().all(|link| link.connected));

    let (dialed, accepted) = within(session_pair(&client, &listener)).await;
    dialed.send(Payload::new("still here")).await.unwrap();
    assert_eq!(&within(accepted.recv()).await.unwrap().body[..], b"still here");
}

/// Test that listen timeouts apply to accepted sessions
#[tokio::test]
async fn test_read_timeout() {
    let transport = MemoryTransport::new();
    let server = Tunnel::new(options(&transport, "node-a")).unwrap();
    server.connect().await.unwrap();
    let listener = server
        .listen(
            "test-tunnel",
            ListenOptions {
                mode: Mode::Unicast,
                timeout: Some(Duration::from_millis(100)),
            },
        )
        .await
        .unwrap();

    let client = Tunnel::new(options(&transport, "node-b").with_nodes(["node-a"])).unwrap();
    client.connect().await.unwrap();

    let (_dialed, accepted) = within(session_pair(&client, &listener)).await;
    assert!(matches!(
        within(accepted.recv()).await,
        Err(TunnelError::ReadTimeout)
    ));
}

/// Test multicast sessions reach a multicast listener
#[tokio::test]
async fn test_multicast_session() {
    let transport = MemoryTransport::new();
    let server = Tunnel::new(options(&transport, "node-a")).unwrap();
    server.connect().await.unwrap();
    let listener = server
        .listen(
            "events",
            ListenOptions {
                mode: Mode::Multicast,
                timeout: None,
            },
        )
        .await
        .unwrap();

    let client = Tunnel::new(options(&transport, "node-b").with_nodes(["node-a"])).unwrap();
    client.connect().await.unwrap();

    let first = client.dial("events", DialOptions::multicast()).await.unwrap();
    let second = client.dial("events", DialOptions::multicast()).await.unwrap();
    assert_eq!(first.link_id(), None);

    first.send(Payload::new("one")).await.unwrap();
    second.send(Payload::new("two")).await.unwrap();

    // Every sender folds into the same inbound session
    let session = within(listener.accept()).await.unwrap();
    assert_eq!(session.mode(), Mode::Multicast);
    assert_eq!(&within(session.recv()).await.unwrap().body[..], b"one");
    assert_eq!(&within(session.recv()).await.unwrap().body[..], b"two");
}

#[cfg(feature = "broker")]
#[tokio::test]
async fn test_broker_publish_subscribe() {
    use meshtun::TunnelBroker;
    use std::sync::Arc;

    let transport = MemoryTransport::new();
    let subscriber = TunnelBroker::new(Arc::new(
        Tunnel::new(options(&transport, "node-a")).unwrap(),
    ));
    subscriber.connect().await.unwrap();
    let mut subscription = subscriber.subscribe("events").await.unwrap();
    assert_eq!(subscription.topic(), "events");

    let publisher = TunnelBroker::new(Arc::new(
        Tunnel::new(options(&transport, "node-b").with_nodes(["node-a"])).unwrap(),
    ));
    publisher.connect().await.unwrap();

    publisher
        .publish("events", Payload::new("first").with_header("kind", "test"))
        .await
        .unwrap();
    publisher.publish("events", Payload::new("second")).await.unwrap();

    let first = within(subscription.next()).await.unwrap();
    assert_eq!(&first.body[..], b"first");
    assert_eq!(first.header["kind"], "test");
    assert_eq!(&within(subscription.next()).await.unwrap().body[..], b"second");

    subscription.unsubscribe().await.unwrap();
    assert!(within(subscription.next()).await.is_none());

    publisher.disconnect().await.unwrap();
    subscriber.disconnect().await.unwrap();
}

#[cfg(feature = "tcp")]
#[tokio::test]
async fn test_tcp_tunnel() {
    use meshtun::transport::TcpTransport;

    let tcp = |address: &str| {
        TunnelOptions::default()
            .with_address(address)
            .with_token(TOKEN)
            .with_transport(TcpTransport::new_default())
    };

    let server = Tunnel::new(tcp("127.0.0.1:0")).unwrap();
    server.connect().await.unwrap();
    let listener = server
        .listen("test-tunnel", ListenOptions::default())
        .await
        .unwrap();

    let client = Tunnel::new(tcp("127.0.0.1:0").with_nodes([server.address()])).unwrap();
    client.connect().await.unwrap();

    let (dialed, accepted) = within(session_pair(&client, &listener)).await;

    let large = vec![0x5au8; 512 * 1024];
    dialed.send(Payload::new(large.clone())).await.unwrap();
    assert_eq!(within(accepted.recv()).await.unwrap().body.len(), large.len());

    accepted.send(Payload::new("ack")).await.unwrap();
    assert_eq!(&within(dialed.recv()).await.unwrap().body[..], b"ack");

    client.close().await.unwrap();
    server.close().await.unwrap();
}
