//! Integration tests across the core, netstack and loopback overlay.
//!
//! Every test runs two full stacks that talk through the in-memory overlay
//! link, so packets cross the link endpoint, the smoltcp interface and the
//! socket layer in both directions.

use meshstack_core::{
    LoopbackEngine, OverlayEngine, PublicKey, SessionEntry, address_for_key, sessions,
};
use meshstack_integration_tests::fixtures::{TwoStackFixture, wait_for};
use meshstack_netstack::{Connection, NetStack, StackError};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Stack construction
// ============================================================================

#[tokio::test]
async fn test_single_overlay_route_after_construction() {
    let fixture = TwoStackFixture::new().unwrap();

    for stack in [&fixture.stack_a, &fixture.stack_b] {
        let routes = stack.routes();
        assert_eq!(routes.len(), 1);
        let route = &routes[0];
        assert_eq!(route.destination, "200::".parse::<IpAddr>().unwrap());
        assert_eq!(route.prefix_len, 7);
        assert_eq!(route.nic_id, stack.nic_id());
        assert_eq!(route.via, IpAddr::V6(stack.local_addr()));
    }
    assert_ne!(fixture.stack_a.nic_id(), fixture.stack_b.nic_id());

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_stack_address_follows_engine_key() {
    let fixture = TwoStackFixture::new().unwrap();

    assert_eq!(fixture.addr_a(), address_for_key(&fixture.engine_a.public_key()).ip());
    assert_eq!(fixture.addr_b(), address_for_key(&fixture.engine_b.public_key()).ip());
    assert_eq!(
        fixture.stack_a.protocol_addresses(),
        vec![(IpAddr::V6(fixture.addr_a()), 128)]
    );

    fixture.cleanup().await;
}

// ============================================================================
// TCP
// ============================================================================

#[tokio::test]
async fn test_tcp_ping_between_stacks() {
    let fixture = TwoStackFixture::new().unwrap();
    let mut listener = fixture.stack_a.listen_tcp(fixture.endpoint_a(9000)).unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, peer) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        (peer, buf)
    });

    let ctx = CancellationToken::new();
    let mut conn = wait_for(
        "tcp dial",
        fixture.stack_b.dial_context(&ctx, "tcp", &fixture.endpoint_a_string(9000)),
    )
    .await
    .unwrap();
    assert!(matches!(conn, Connection::Tcp(_)));
    conn.write_all(b"ping").await.unwrap();

    let (peer, received) = wait_for("server read", server).await.unwrap();
    assert_eq!(&received, b"ping");
    assert_eq!(peer.ip(), IpAddr::V6(fixture.addr_b()));
    assert_eq!(conn.local_addr(), peer);

    drop(conn);
    fixture.cleanup().await;
}

#[tokio::test]
async fn test_tcp_bulk_transfer_both_directions() {
    let fixture = TwoStackFixture::new().unwrap();
    let mut listener = fixture.stack_a.listen_tcp(fixture.endpoint_a(9100)).unwrap();

    // Several times the socket buffers so the transfer spans many windows.
    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.unwrap();
        stream.write_all(&(received.len() as u64).to_be_bytes()).await.unwrap();
        stream.shutdown().await.unwrap();
        received
    });

    let mut stream = wait_for("tcp dial", fixture.stack_b.dial_tcp(fixture.endpoint_a(9100)))
        .await
        .unwrap();
    wait_for("bulk write", stream.write_all(&payload)).await.unwrap();
    stream.shutdown().await.unwrap();

    let mut len = [0u8; 8];
    wait_for("length reply", stream.read_exact(&mut len)).await.unwrap();
    assert_eq!(u64::from_be_bytes(len), payload.len() as u64);

    let received = wait_for("server finish", server).await.unwrap();
    assert_eq!(received, expected);

    drop(stream);
    fixture.cleanup().await;
}

#[tokio::test]
async fn test_dial_without_listener_is_refused() {
    let fixture = TwoStackFixture::new().unwrap();
    let ctx = CancellationToken::new();

    let err = wait_for(
        "refused dial",
        fixture.stack_b.dial_context(&ctx, "tcp", &fixture.endpoint_a_string(9200)),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, StackError::ConnectionRefused(_)), "got {err:?}");

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_cancelled_dial_releases_caller() {
    let fixture = TwoStackFixture::new().unwrap();
    // Nobody reads from A's side of the link, so the handshake never finishes.
    fixture.engine_a.loopback().shutdown();

    let ctx = CancellationToken::new();
    let canceller = {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            ctx.cancel();
        })
    };

    let err = wait_for(
        "cancelled dial",
        fixture.stack_b.dial_context(&ctx, "tcp", &fixture.endpoint_a_string(9300)),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, StackError::Cancelled));
    canceller.await.unwrap();

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_dial_rejects_bad_input() {
    let fixture = TwoStackFixture::new().unwrap();
    let ctx = CancellationToken::new();
    let stack = &fixture.stack_b;

    assert!(matches!(
        stack.dial_context(&ctx, "sctp", "[200::1]:80").await,
        Err(StackError::UnsupportedNetwork(_))
    ));
    assert!(matches!(
        stack.dial_context(&ctx, "tcp", "mesh.example:80").await,
        Err(StackError::InvalidEndpoint { .. })
    ));
    assert!(matches!(
        stack.dial_context(&ctx, "tcp", "10.0.0.1:80").await,
        Err(StackError::Ipv4Unsupported(_))
    ));
    // Well-formed but outside 200::/7: refused instead of hanging in SYN-SENT
    assert!(matches!(
        wait_for("off-overlay dial", stack.dial_context(&ctx, "tcp", "[2001:db8::1]:80")).await,
        Err(StackError::NoRoute(_))
    ));

    fixture.cleanup().await;
}

// ============================================================================
// UDP
// ============================================================================

#[tokio::test]
async fn test_udp_dial_and_listen() {
    let fixture = TwoStackFixture::new().unwrap();
    let server = fixture.stack_a.listen_udp(fixture.endpoint_a(7000)).unwrap();

    let ctx = CancellationToken::new();
    let mut conn = fixture
        .stack_b
        .dial_context(&ctx, "udp6", &fixture.endpoint_a_string(7000))
        .await
        .unwrap();
    assert_eq!(conn.peer_addr(), Some(fixture.endpoint_a(7000)));
    conn.write_all(b"hello").await.unwrap();

    let mut buf = [0u8; 64];
    let (n, from) = wait_for("datagram", server.recv_from(&mut buf)).await.unwrap();
    assert_eq!(&buf[..n], b"hello");
    assert_eq!(from, conn.local_addr());

    server.send_to(b"world", from).await.unwrap();
    let n = wait_for("reply", conn.read(&mut buf)).await.unwrap();
    assert_eq!(&buf[..n], b"world");

    drop(conn);
    drop(server);
    fixture.cleanup().await;
}

// ============================================================================
// Link failure and shutdown
// ============================================================================

async fn wait_link_down(stack: &NetStack) {
    wait_for("link down", async {
        while stack.is_link_up() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
}

#[tokio::test]
async fn test_reader_termination_marks_link_down() {
    let fixture = TwoStackFixture::new().unwrap();
    assert!(fixture.stack_a.is_link_up());

    fixture.engine_a.loopback().shutdown();
    wait_link_down(&fixture.stack_a).await;

    // The failure is permanent; the stack object stays usable for inspection.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!fixture.stack_a.is_link_up());
    assert!(!fixture.stack_a.is_closed());
    assert_eq!(fixture.stack_a.routes().len(), 1);

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_close_rejects_new_sockets() {
    let fixture = TwoStackFixture::new().unwrap();
    fixture.stack_a.close().await;
    assert!(fixture.stack_a.is_closed());

    assert!(matches!(
        fixture.stack_a.listen_tcp(fixture.endpoint_a(9400)),
        Err(StackError::Closed)
    ));
    assert!(matches!(
        fixture.stack_a.listen_udp(fixture.endpoint_a(9400)),
        Err(StackError::Closed)
    ));

    fixture.cleanup().await;
}

#[tokio::test]
async fn test_link_stats_count_traffic() {
    let fixture = TwoStackFixture::new().unwrap();
    let server = fixture.stack_a.listen_udp(fixture.endpoint_a(7100)).unwrap();
    let client = fixture.stack_b.dial_udp(fixture.endpoint_a(7100)).unwrap();

    client.send(&[0u8; 100]).await.unwrap();
    let mut buf = [0u8; 128];
    wait_for("datagram", server.recv_from(&mut buf)).await.unwrap();

    let sent = fixture.stack_b.link_stats();
    let received = fixture.stack_a.link_stats();
    assert!(sent.packets_written >= 1);
    // IPv6 + UDP headers on top of the payload
    assert!(sent.bytes_written >= 148);
    assert!(received.packets_read >= 1);
    assert_eq!(received.malformed_dropped, 0);

    drop(client);
    drop(server);
    fixture.cleanup().await;
}

// ============================================================================
// Introspection
// ============================================================================

#[tokio::test]
async fn test_sessions_use_same_derivation_as_stack() {
    let fixture = TwoStackFixture::new().unwrap();
    fixture.engine_a.set_sessions(vec![SessionEntry {
        key: fixture.engine_b.public_key(),
        rx_bytes: 10,
        tx_bytes: 20,
        uptime: Duration::from_secs(3),
    }]);

    let records = sessions(&fixture.engine_a).unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.address, fixture.addr_b());
    assert_eq!(record.public_key, fixture.engine_b.public_key());
    assert_eq!((record.rx_bytes, record.tx_bytes), (10, 20));

    fixture.cleanup().await;
}

#[test]
fn test_stack_needs_runtime() {
    let (engine, _peer) = LoopbackEngine::pair(
        PublicKey::from_bytes([1; 32]),
        PublicKey::from_bytes([2; 32]),
        1500,
    );
    let err = NetStack::new(&engine, Default::default()).unwrap_err();
    assert!(matches!(err, StackError::NoRuntime));
}

#[test]
fn test_overlay_endpoint_formatting() {
    let addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::new(0x200, 0, 0, 0, 0, 0, 0, 1)), 9000);
    assert_eq!(addr.to_string(), "[200::1]:9000");
    assert_eq!(meshstack_netstack::parse_endpoint("[200::1]:9000").unwrap(), addr);
}
