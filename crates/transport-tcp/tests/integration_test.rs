//! Integration tests for TCP transport

use std::net::SocketAddr;
use std::time::Duration;

use tether_transport::{Listener, Transport, TransportError};
use tether_transport_tcp::{TcpConfig, TcpTransport};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::info;

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

#[tokio::test]
async fn test_tcp_echo() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let transport = TcpTransport::default();
    let listener = transport
        .listen(&loopback(), 5)
        .await
        .expect("Failed to listen");
    let addr = listener.local_addr().unwrap();
    info!("Test listener on {addr}");

    let server_task = tokio::spawn(async move {
        let (mut stream, peer) = listener.accept().await.expect("Failed to accept");
        info!("Server accepted connection from {peer}");

        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        stream.write_all(&buf).await.unwrap();
        stream.flush().await.unwrap();
    });

    let mut client = transport.connect(&addr).await.expect("Failed to connect");
    client.write_all(b"hello").await.unwrap();
    client.flush().await.unwrap();

    let mut echoed = [0u8; 5];
    timeout(Duration::from_secs(1), client.read_exact(&mut echoed))
        .await
        .expect("Timeout")
        .unwrap();
    assert_eq!(&echoed, b"hello");

    server_task.await.unwrap();
}

#[tokio::test]
async fn test_connect_refused() {
    let transport = TcpTransport::default();

    // Bind and drop to get an address nobody listens on
    let addr = {
        let listener = transport.listen(&loopback(), 5).await.unwrap();
        listener.local_addr().unwrap()
    };

    let result = transport.connect(&addr).await;
    assert!(matches!(result, Err(TransportError::ConnectFailed { .. })));
}

#[tokio::test]
async fn test_address_in_use() {
    let transport = TcpTransport::new(TcpConfig {
        nodelay: true,
        reuse_addr: false,
    });

    let first = transport.listen(&loopback(), 5).await.unwrap();
    let addr = first.local_addr().unwrap();

    let second = transport.listen(&addr, 5).await;
    assert!(matches!(second, Err(TransportError::AddressInUse(_))));
}

#[tokio::test]
async fn test_peer_addresses_match() {
    let transport = TcpTransport::default();
    let listener = transport.listen(&loopback(), 5).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let accept = tokio::spawn(async move { listener.accept().await.map(|(_, peer)| peer) });
    let _client = transport.connect(&addr).await.unwrap();

    let peer = timeout(Duration::from_secs(1), accept)
        .await
        .expect("Timeout")
        .unwrap()
        .unwrap();
    assert_eq!(peer.ip(), addr.ip());
}
