//! CLI binary to run a tether echo server or line client.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_pub_crate)]

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tether_link::{
    ActionRegistry, Client, ClientConfig, Context, Envelope, HandlerError, Message, Server,
    ServerConfig, SessionConfig,
};
use tether_transport::DEFAULT_BACKLOG;
use tether_transport_tcp::TcpTransport;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};

/// CLI-specific error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Link library error
    #[error(transparent)]
    Link(#[from] tether_link::Error),

    /// Reading standard input failed
    #[error("stdin error: {0}")]
    Stdin(#[from] std::io::Error),
}

/// Demonstration message: a line of text.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Text {
    body: String,
}

impl Message for Text {
    const MESSAGE_TYPE: &'static str = "tether.text";
}

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(long, global = true, env = "TETHER_DEBUG")]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Accept connections and echo every text message back
    Server(ServerArgs),
    /// Connect to a server and send each stdin line as a text message
    Client(ClientArgs),
}

#[derive(Clone, Debug, clap::Args)]
struct ServerArgs {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0", env = "TETHER_BIND_ADDRESS")]
    bind_address: IpAddr,

    /// Port to listen on
    #[arg(long, default_value_t = 8080, env = "TETHER_PORT")]
    port: u16,

    /// Listen backlog
    #[arg(long, default_value_t = DEFAULT_BACKLOG, env = "TETHER_BACKLOG")]
    backlog: u32,

    /// Close connections that receive nothing for this many milliseconds
    #[arg(long, default_value_t = 3000, env = "TETHER_RECEIVE_TIMEOUT_MS")]
    receive_timeout_ms: u64,

    /// Maximum concurrent connections (unlimited when unset)
    #[arg(long, env = "TETHER_MAX_CONNECTIONS")]
    max_connections: Option<usize>,
}

#[derive(Clone, Debug, clap::Args)]
struct ClientArgs {
    /// Server address
    #[arg(long, default_value = "127.0.0.1:8080", env = "TETHER_SERVER_ADDRESS")]
    server: SocketAddr,

    /// Send a keep-alive after this many idle milliseconds (0 disables)
    #[arg(long, default_value_t = 2000, env = "TETHER_HEARTBEAT_INTERVAL_MS")]
    heartbeat_interval_ms: u64,

    /// Connect timeout in milliseconds
    #[arg(long, default_value_t = 5000, env = "TETHER_CONNECT_TIMEOUT_MS")]
    connect_timeout_ms: u64,
}

async fn run_server(args: ServerArgs, shutdown: CancellationToken) -> Result<(), Error> {
    let actions = ActionRegistry::new();
    actions.register_fn(|text: Text, ctx: Context| async move {
        info!(peer = ctx.connection().peer(), "Received text: {}", text.body);
        Ok::<_, HandlerError>(Some(Envelope::seal(&text)?))
    })?;

    let session =
        SessionConfig::server().with_receive_timeout(Duration::from_millis(args.receive_timeout_ms));
    let mut config = ServerConfig::default()
        .with_session(session)
        .with_backlog(args.backlog);
    if let Some(max) = args.max_connections {
        config = config.with_max_connections(max);
    }

    let server = Server::new(
        TcpTransport::default(),
        SocketAddr::new(args.bind_address, args.port),
        actions,
        config,
    );
    let addr = server.start().await?;
    info!("Echo server ready on {addr}");

    shutdown.cancelled().await;

    server.stop();
    server.wait().await;
    info!("Server stopped");
    Ok(())
}

async fn run_client(args: ClientArgs, shutdown: CancellationToken) -> Result<(), Error> {
    let actions = ActionRegistry::new();
    actions.register_fn(|text: Text, _ctx: Context| async move {
        info!("Server says: {}", text.body);
        Ok::<_, HandlerError>(None)
    })?;

    let session = match args.heartbeat_interval_ms {
        0 => SessionConfig::client().without_heartbeat(),
        ms => SessionConfig::client().with_heartbeat_interval(Duration::from_millis(ms)),
    };
    let config = ClientConfig::default()
        .with_session(session)
        .with_connect_timeout(Duration::from_millis(args.connect_timeout_ms));

    let client = Client::new(TcpTransport::default(), args.server, actions, config);
    client.start().await?;
    info!("Connected to {}, type lines to send", args.server);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = client.wait() => {
                warn!("Connection to server lost");
                break;
            }
            line = lines.next_line() => match line? {
                Some(body) => client.send(&Text { body }).await?,
                None => {
                    info!("End of input");
                    break;
                }
            },
        }
    }

    client.stop();
    client.wait().await;
    Ok(())
}

fn shutdown_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    }
                }
                Err(e) => {
                    warn!("SIGTERM handler failed: {e}");
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Received SIGINT");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received interrupt signal");
        }

        info!("Shutting down");
        token.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.debug { Level::DEBUG } else { Level::INFO })
        .init();

    let shutdown = CancellationToken::new();
    shutdown_on_signal(shutdown.clone());

    match args.command {
        Command::Server(server_args) => run_server(server_args, shutdown).await,
        Command::Client(client_args) => run_client(client_args, shutdown).await,
    }
}
