//! Broker plugin contract
//!
//! A broker adapter provides two things: an [`MqPlugin`] that translates
//! addresses and matches routing keys, and a tree of drivers
//! ([`ConnectionDriver`] → [`ChannelDriver`] → [`ConsumerDriver`]) that do
//! the actual I/O. The lifecycle-managed wrappers in
//! [`connection`](crate::connection), [`channel`](crate::channel) and
//! [`consumer`](crate::consumer) are written against these traits only.

use crate::address::{AddressParts, MqAddress, MqConsumerAddress, MqPublisherAddress};
use crate::config::ConnectionConfig;
use crate::message::{MessageContext, MessageProperties, ReturnedMessage};
use crate::{routing, Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// One message handed to a consumer by the broker.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub body: Bytes,
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub delivery_tag: u64,
    pub redelivered: bool,
}

/// What a channel driver needs to set up one physical consumer.
#[derive(Debug, Clone)]
pub struct ConsumerSpec {
    /// Queue shared by every address below
    pub queue: String,

    /// One routing binding per address
    pub addresses: Vec<MqConsumerAddress>,

    /// Deliveries stay unacknowledged until the handler acks
    pub auto_ack_disabled: bool,

    /// Queue disappears with its last consumer
    pub auto_delete: bool,

    /// Queue is private to the declaring connection
    pub exclusive: bool,
}

#[async_trait]
pub trait ConnectionDriver: Send + Sync + 'static {
    async fn open_channel(&self) -> Result<Arc<dyn ChannelDriver>>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait ChannelDriver: Send + Sync + 'static {
    /// Declare the queue and its bindings, then start consuming.
    async fn consume(&self, spec: ConsumerSpec) -> Result<Arc<dyn ConsumerDriver>>;

    async fn publish(
        &self,
        address: &MqPublisherAddress,
        body: Bytes,
        properties: &MessageProperties,
        mandatory: bool,
    ) -> Result<()>;

    /// Unroutable mandatory publishes made through this channel.
    fn returned(&self) -> broadcast::Receiver<ReturnedMessage>;

    fn can_pause(&self) -> bool;

    fn is_paused(&self) -> bool;

    /// Stop (or resume) deliveries to every consumer of this channel.
    fn set_paused(&self, paused: bool) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait ConsumerDriver: Send + Sync + 'static {
    /// Next delivery, or `None` once the consumer is canceled.
    async fn next_delivery(&self) -> Option<Delivery>;

    /// Explicit acknowledgement; only meaningful with auto-ack disabled.
    fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn cancel(&self) -> Result<()>;
}

/// Broker-specific translation and connection factory.
#[async_trait]
pub trait MqPlugin: Send + Sync + 'static {
    /// URL scheme this plugin serves.
    fn scheme(&self) -> &'static str;

    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn ConnectionDriver>>;

    fn to_consumer_address(&self, address: &MqAddress) -> Result<MqConsumerAddress> {
        MqConsumerAddress::from_parts(address.clone(), AddressParts::parse(address)?)
    }

    fn to_publisher_address(&self, address: &MqAddress) -> Result<MqPublisherAddress> {
        Ok(MqPublisherAddress::from_parts(
            address.clone(),
            AddressParts::parse(address)?,
        ))
    }

    /// Whether a received message was routed through the binding `address`.
    fn is_match(&self, context: &MessageContext, address: &MqAddress) -> Result<bool> {
        let parts = AddressParts::parse(address)?;
        routing::matches(&parts.exchange_type, &parts.routing_key, context.routing_key())
    }
}

/// Plugins by URL scheme.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: HashMap<&'static str, Arc<dyn MqPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the in-memory broker under `memory://`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::memory::MemoryPlugin::new()));
        registry
    }

    pub fn register(&mut self, plugin: Arc<dyn MqPlugin>) {
        self.plugins.insert(plugin.scheme(), plugin);
    }

    pub fn resolve(&self, config: &ConnectionConfig) -> Result<Arc<dyn MqPlugin>> {
        let scheme = config.scheme()?;
        self.plugins.get(scheme).cloned().ok_or_else(|| {
            Error::configuration(
                format!("no broker plugin for scheme '{scheme}'"),
                Some("connection.url".to_string()),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryPlugin;

    fn received(routing_key: &str) -> MessageContext {
        MessageContext::delivered(Bytes::new(), routing_key, MessageProperties::new(), || {})
    }

    #[test]
    fn test_default_is_match_follows_exchange_type() {
        let plugin = MemoryPlugin::new();
        assert!(plugin.is_match(&received("A.B.C.D"), &"A.B.C.D".into()).unwrap());
        assert!(!plugin.is_match(&received("A.B.C.X"), &"A.B.C.D".into()).unwrap());
        assert!(plugin
            .is_match(&received("A.B.C.D"), &"topic://x/A.*.C.D".into())
            .unwrap());
        assert!(!plugin
            .is_match(&received("A.B"), &"topic://x/A.B.#".into())
            .unwrap());
        assert!(plugin
            .is_match(&received("A.B"), &"headers://x/A.B".into())
            .is_err());
    }

    #[test]
    fn test_registry_resolves_by_scheme() {
        let registry = PluginRegistry::with_defaults();
        let plugin = registry
            .resolve(&ConnectionConfig::new("memory://resolve-test"))
            .unwrap();
        assert_eq!(plugin.scheme(), "memory");

        let err = registry
            .resolve(&ConnectionConfig::new("amqp://localhost"))
            .err()
            .expect("no amqp plugin registered");
        assert!(matches!(err, Error::Configuration { .. }));
    }
}
