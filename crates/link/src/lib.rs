//! Typed message links between a client and a server.
//!
//! A link carries self-describing messages over any byte-stream
//! [`Transport`](tether_transport::Transport). Each connection is driven by a
//! session that decodes frames, routes messages to registered actions and
//! tracks liveness.
//!
//! # Features
//!
//! - **Typed Actions**: Handlers are registered per message type and receive
//!   the decoded value
//! - **Liveness**: Clients send keep-alives when idle; servers drop
//!   connections that go quiet
//! - **CBOR Payloads**: Messages are serialized with ciborium inside a
//!   checksummed frame
//! - **Pluggable Transports**: TCP for real networks, in-memory for tests
//!
//! # Example
//!
//! ```no_run
//! use serde::{Deserialize, Serialize};
//! use tether_link::{
//!     ActionRegistry, Client, ClientConfig, Context, Envelope, HandlerError, Message, Server,
//!     ServerConfig,
//! };
//! use tether_transport_tcp::TcpTransport;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Echo {
//!     message: String,
//! }
//!
//! impl Message for Echo {
//!     const MESSAGE_TYPE: &'static str = "echo";
//! }
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let actions = ActionRegistry::new();
//!     actions.register_fn(|echo: Echo, _ctx: Context| async move {
//!         Ok::<_, HandlerError>(Some(Envelope::seal(&echo)?))
//!     })?;
//!
//!     let server = Server::new(
//!         TcpTransport::default(),
//!         "127.0.0.1:8080".parse()?,
//!         actions,
//!         ServerConfig::default(),
//!     );
//!     let addr = server.start().await?;
//!
//!     let client = Client::new(
//!         TcpTransport::default(),
//!         addr,
//!         ActionRegistry::new(),
//!         ClientConfig::default(),
//!     );
//!     client.start().await?;
//!     client
//!         .send(&Echo {
//!             message: "Hello, tether!".to_string(),
//!         })
//!         .await?;
//!
//!     client.stop();
//!     server.stop();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod connection;
pub mod error;
pub mod heartbeat;
pub mod protocol;
pub mod registry;
pub mod role;
pub mod session;

// Re-export commonly used types
pub use config::{ClientConfig, HandlerErrorPolicy, ServerConfig, SessionConfig};
pub use connection::{Connection, ConnectionHandle, ConnectionId, ConnectionState};
pub use error::{CodecError, ConnectionError, Error, HandlerError, Result};
pub use heartbeat::HeartbeatDriver;
pub use protocol::{Envelope, KeepAlive, Message, MessageType, decode_message, encode_message};
pub use registry::{
    ActionHandler, ActionRegistry, Context, DefaultHandler, HandlerResult, LogUnhandled,
};
pub use role::{Client, LifecycleState, Role, Server};
pub use session::{Session, StopReason};

// Re-export dependencies that are part of our public API
pub use async_trait::async_trait;
pub use bytes::Bytes;
