//! Client/server over real TCP sockets

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_link::{
    ActionRegistry, Client, ClientConfig, Context, Envelope, HandlerError, LifecycleState,
    Message, Server, ServerConfig, SessionConfig,
};
use tether_transport_tcp::TcpTransport;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Shout {
    text: String,
}

impl Message for Shout {
    const MESSAGE_TYPE: &'static str = "shout";
}

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

#[tokio::test]
async fn test_tcp_request_reply() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let actions = ActionRegistry::new();
    actions
        .register_fn(|shout: Shout, ctx: Context| async move {
            info!("Server got {:?} from {}", shout.text, ctx.connection().peer());
            let reply = Shout {
                text: shout.text.to_uppercase(),
            };
            Ok::<_, HandlerError>(Some(Envelope::seal(&reply)?))
        })
        .unwrap();

    let server = Server::new(
        TcpTransport::default(),
        loopback(),
        actions,
        ServerConfig::default(),
    );
    let addr = server.start().await.expect("Failed to start server");
    info!("Test server on {addr}");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let client_actions = ActionRegistry::new();
    client_actions
        .register_fn(move |shout: Shout, _ctx: Context| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(shout.text);
                Ok::<_, HandlerError>(None)
            }
        })
        .unwrap();

    let client = Client::new(
        TcpTransport::default(),
        addr,
        client_actions,
        ClientConfig::default(),
    );
    client.start().await.expect("Failed to connect");

    for word in ["hello", "tether", "🦀"] {
        client
            .send(&Shout {
                text: word.to_string(),
            })
            .await
            .unwrap();

        let reply = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("Timeout")
            .expect("Channel closed");
        assert_eq!(reply, word.to_uppercase());
    }

    client.stop();
    timeout(Duration::from_secs(1), client.wait())
        .await
        .expect("Timeout");

    server.stop();
    timeout(Duration::from_secs(1), server.wait())
        .await
        .expect("Timeout");
}

#[tokio::test]
async fn test_tcp_idle_timeout() {
    let session = SessionConfig::server().with_receive_timeout(Duration::from_millis(200));
    let server = Server::new(
        TcpTransport::default(),
        loopback(),
        ActionRegistry::new(),
        ServerConfig::default().with_session(session),
    );
    let addr = server.start().await.unwrap();

    let client = Client::new(
        TcpTransport::default(),
        addr,
        ActionRegistry::new(),
        ClientConfig::default().with_session(SessionConfig::client().without_heartbeat()),
    );

    let started = Instant::now();
    client.start().await.unwrap();
    timeout(Duration::from_secs(2), client.wait())
        .await
        .expect("Timeout");

    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(client.state(), LifecycleState::Stopped);
    server.stop();
}
