//! # mqsvc - Micro-service messaging runtime
//!
//! Binds methods of plain Rust types to message-broker addresses and runs
//! them: a pluggable broker abstraction (connections, channels, consumers,
//! publishers), a dispatcher with backpressure, an address lookup service
//! and a request/reply client.
//!
//! ## Quick Start
//!
//! Declare a service with the `#[micro_service]` macro:
//!
//! ```rust,ignore
//! use mqsvc::{micro_service, Bytes, MessageContext, Result};
//!
//! pub struct Greeter;
//!
//! #[micro_service(contract = "Greeter")]
//! impl Greeter {
//!     #[binding(address = "topic://greetings/hello/greeter")]
//!     async fn hello(&self, ctx: &MessageContext, name: String) -> Result<String> {
//!         Ok(format!("hello {name} ({})", ctx.routing_key()))
//!     }
//!
//!     #[binding(address = "topic://greetings/audit.#/greeter-audit", one_way)]
//!     fn audit(&self, body: Bytes) -> Result<()> {
//!         tracing::info!(len = body.len(), "audited");
//!         Ok(())
//!     }
//! }
//! ```
//!
//! Register it with a host and start dispatching:
//!
//! ```rust,ignore
//! use mqsvc::{Disposable, MicroServiceHost, RuntimeConfig};
//!
//! #[tokio::main]
//! async fn main() -> mqsvc::Result<()> {
//!     let config = RuntimeConfig::from_toml_str(r#"
//!         [connection]
//!         url = "memory://demo"
//!     "#)?;
//!     let host = MicroServiceHost::new(config).await?;
//!     host.locator().register(|| Greeter)?;
//!     host.start().await?;
//!
//!     // ... serve until shutdown
//!
//!     host.dispose().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Addresses
//!
//! `exchangeType://exchange/routingKey/queue`, with the queue optional. A
//! bare name without `://` is a queue on the default direct exchange. Topic
//! patterns use `*` for exactly one segment and `#` for any run.
//!
//! ## Ownership
//!
//! Connections own channels; channels own consumers, publishers and RPC
//! clients. Disposing a parent disposes every child once, and any call on a
//! disposed handle fails with [`Error::Disposed`].

pub mod address;
pub mod binding;
pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod flow;
pub mod host;
pub mod invoker;
pub mod lifecycle;
pub mod locator;
pub mod lookup;
pub mod memory;
pub mod message;
pub mod plugin;
pub mod publisher;
pub mod routing;
pub mod rpc;
pub mod serializer;
pub mod service;


// Re-exports
pub use address::{ExchangeType, MqAddress, MqConsumerAddress, MqPublisherAddress};
pub use binding::{BindingDescriptor, BindingProvider, MicroServiceBinding};
pub use channel::MqChannel;
pub use config::{RuntimeConfig, DEFAULT_PAUSE_THRESHOLD};
pub use connection::MqConnection;
pub use consumer::MqConsumer;
pub use dispatcher::{MicroServiceDispatcher, UnhandledError};
pub use error::{Error, Result};
pub use host::MicroServiceHost;
pub use invoker::RemoteInvoker;
pub use lifecycle::Disposable;
pub use locator::MicroServiceLocator;
pub use lookup::{LookupOutcome, MicroServiceLookup};
pub use memory::MemoryPlugin;
pub use message::{MessageContext, MessageProperties, ReturnedMessage};
pub use plugin::{MqPlugin, PluginRegistry};
pub use publisher::MqPublisher;
pub use rpc::MqRpcClient;
pub use serializer::{Serializer, SerializerRegistry};
pub use service::{Invocation, MicroService, MicroServiceContract, Reply};

// Re-export macros when feature is enabled
#[cfg(feature = "macros")]
pub use mqsvc_macros::micro_service;

// Re-export commonly used dependencies
pub use async_trait::async_trait;
pub use bytes::Bytes;
pub use serde::{Deserialize, Serialize};
