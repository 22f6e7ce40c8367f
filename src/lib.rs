//! # agentlink
//!
//! Transport between a tracing agent and its collector: framed RPC,
//! fire-and-forget messages and multiplexed streams over one persistent
//! TCP socket.
//!
//! ## Architecture
//!
//! - **Codec** ([`protocol`]): fixed header + payload frames
//! - **Connection** ([`connection`]): reader/writer tasks, keep-alive,
//!   request correlation and stream multiplexing for one socket
//! - **Agent side** ([`client`]): connects with retries and keeps the link
//!   alive with background reconnects
//! - **Collector side** ([`server`]): accepts agents and routes their
//!   commands by payload kind
//!
//! ## Example
//!
//! ```ignore
//! use agentlink::{ClientConfig, ClientFactory, Payload};
//!
//! #[tokio::main]
//! async fn main() -> agentlink::Result<()> {
//!     let client = ClientFactory::new(ClientConfig::default())
//!         .connect("127.0.0.1:9994".parse().unwrap())
//!         .await?;
//!
//!     let response = client.request(Payload::encode(1, &"ping")?).await?.await?;
//!     println!("{:?}", response.decode::<String>()?);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod handshake;
pub mod protocol;
pub mod server;
pub mod state;
pub mod stream;
pub mod writer;

pub use client::{Client, ClientConfig, ClientFactory};
pub use connection::{Connection, ConnectionConfig};
pub use error::{Result, TransportError};
pub use protocol::Payload;
pub use server::{CommandDispatcher, ServerAcceptor};
