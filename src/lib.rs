//! A synchronous-style client for the NATS pub/sub messaging protocol.
//!
//! An application creates one [`client::NatsClient`] per connection, issues
//! publishes and subscriptions, and registers callbacks to receive inbound
//! messages. The client targets a NATS server speaking the text-line
//! protocol over TCP, optionally upgraded to TLS after negotiation.
//!
//! The crate is organized leaves-first, mirroring how a connection comes
//! together:
//!
//! * [`codec`] -- the wire codec: parses inbound bytes into [`codec::Frame`]s
//!   and serializes outbound ones.
//! * [`transport`] -- owns the TCP/TLS socket and the reader/writer tasks.
//! * [`engine`] -- drives the handshake, subscriptions, and callback dispatch.
//! * [`client`] -- the thin facade binding the three together.
//!
//! ```rust,no_run
//! use natsc::client::{ClientOptions, NatsClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = NatsClient::start(ClientOptions::new("localhost", 4222)).await?;
//!
//!     client.subscribe("greetings", None).await?;
//!     client.add_callback(
//!         std::sync::Arc::new(|frame| println!("received: {frame:?}")),
//!         "greetings",
//!     );
//!
//!     client.publish("greetings", b"hello there", None, None).await?;
//!     client.close().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod engine;
pub mod transport;

#[cfg(test)]
mod tests;

pub use client::{ClientError, ClientOptions, ClientResult, NatsClient};
pub use codec::{CodecError, Frame};
pub use engine::{Credentials, EngineState};
