//! Channels: the factory for consumers, publishers and RPC clients

use crate::address::{MqAddress, MqConsumerAddress};
use crate::consumer::MqConsumer;
use crate::flow::Pausable;
use crate::lifecycle::{ChildToken, Disposable, Lifecycle};
use crate::message::ReturnedMessage;
use crate::plugin::{ChannelDriver, ConsumerSpec, MqPlugin};
use crate::publisher::MqPublisher;
use crate::rpc::MqRpcClient;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// A channel of an [`MqConnection`](crate::connection::MqConnection).
#[derive(Clone)]
pub struct MqChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    lifecycle: Arc<Lifecycle>,
    token: ChildToken,
    plugin: Arc<dyn MqPlugin>,
    driver: Arc<dyn ChannelDriver>,
}

impl MqChannel {
    pub(crate) fn new(
        plugin: Arc<dyn MqPlugin>,
        driver: Arc<dyn ChannelDriver>,
        token: ChildToken,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                lifecycle: Lifecycle::new("channel"),
                token,
                plugin,
                driver,
            }),
        }
    }

    pub(crate) fn token(&self) -> &ChildToken {
        &self.inner.token
    }

    pub(crate) fn as_disposable(&self) -> Arc<dyn Disposable> {
        self.inner.clone()
    }

    pub(crate) fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.inner.lifecycle
    }

    pub fn plugin(&self) -> &Arc<dyn MqPlugin> {
        &self.inner.plugin
    }

    /// Consumer bound to a single address.
    pub async fn create_consumer(
        &self,
        address: &MqAddress,
        auto_ack_disabled: bool,
        auto_delete: bool,
    ) -> Result<MqConsumer> {
        let mut consumers = self
            .create_consumers(std::slice::from_ref(address), auto_ack_disabled, auto_delete)
            .await?;
        consumers
            .pop()
            .ok_or_else(|| Error::invalid_address(address.as_str(), "no consumer created"))
    }

    /// One consumer per distinct queue among `addresses`; addresses that share
    /// a queue become routing bindings of the same consumer.
    pub async fn create_consumers(
        &self,
        addresses: &[MqAddress],
        auto_ack_disabled: bool,
        auto_delete: bool,
    ) -> Result<Vec<MqConsumer>> {
        self.inner.lifecycle.ensure_alive()?;

        let mut groups: Vec<(String, Vec<MqConsumerAddress>)> = Vec::new();
        for address in addresses {
            let consumer_address = self.inner.plugin.to_consumer_address(address)?;
            let key = consumer_address.source_key().to_string();
            match groups.iter_mut().find(|(queue, _)| *queue == key) {
                Some((_, members)) => {
                    if !members.contains(&consumer_address) {
                        members.push(consumer_address);
                    }
                }
                None => groups.push((key, vec![consumer_address])),
            }
        }

        let mut consumers = Vec::with_capacity(groups.len());
        for (queue, addresses) in groups {
            let spec = ConsumerSpec {
                queue,
                addresses,
                auto_ack_disabled,
                auto_delete,
                exclusive: false,
            };
            match self.consume(spec).await {
                Ok(consumer) => consumers.push(consumer),
                Err(err) => {
                    for consumer in &consumers {
                        consumer.dispose().await;
                    }
                    return Err(err);
                }
            }
        }
        Ok(consumers)
    }

    pub(crate) async fn consume(&self, spec: ConsumerSpec) -> Result<MqConsumer> {
        self.inner.lifecycle.ensure_alive()?;
        let driver = self.inner.driver.consume(spec.clone()).await?;
        let consumer = MqConsumer::new(driver, spec, self.inner.lifecycle.reserve());
        if let Err(err) = self
            .inner
            .lifecycle
            .attach(consumer.token(), consumer.as_disposable())
        {
            consumer.dispose().await;
            return Err(err);
        }
        debug!(
            queue = consumer.source_key(),
            bindings = consumer.addresses().len(),
            auto_ack_disabled = consumer.auto_ack_disabled(),
            auto_delete = consumer.auto_delete(),
            "consumer created"
        );
        Ok(consumer)
    }

    pub fn create_publisher(&self, address: &MqAddress) -> Result<MqPublisher> {
        self.inner.lifecycle.ensure_alive()?;
        let address = self.inner.plugin.to_publisher_address(address)?;
        let publisher = MqPublisher::new(
            self.inner.driver.clone(),
            address,
            self.inner.lifecycle.reserve(),
        );
        self.inner
            .lifecycle
            .attach(publisher.token(), publisher.as_disposable())?;
        Ok(publisher)
    }

    /// Request/reply client for `address` with a private reply queue.
    pub async fn create_rpc_client(&self, address: &MqAddress) -> Result<MqRpcClient> {
        MqRpcClient::create(self, address).await
    }

    /// Returned mandatory messages published through this channel.
    pub fn returned(&self) -> broadcast::Receiver<ReturnedMessage> {
        self.inner.driver.returned()
    }

    pub fn can_pause(&self) -> bool {
        self.inner.driver.can_pause()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.driver.is_paused()
    }

    /// Stop or resume deliveries to this channel's consumers.
    pub fn set_paused(&self, paused: bool) -> Result<()> {
        self.inner.lifecycle.ensure_alive()?;
        if !self.can_pause() {
            return Err(Error::not_supported("pausing this channel"));
        }
        self.inner.driver.set_paused(paused)?;
        debug!(paused, "channel pause state changed");
        Ok(())
    }

    /// Consumers, publishers and RPC clients not yet disposed.
    pub fn child_count(&self) -> usize {
        self.inner.lifecycle.live_children()
    }
}

impl Pausable for MqChannel {
    fn can_pause(&self) -> bool {
        MqChannel::can_pause(self)
    }

    fn is_paused(&self) -> bool {
        MqChannel::is_paused(self)
    }

    fn set_paused(&self, paused: bool) -> Result<()> {
        MqChannel::set_paused(self, paused)
    }
}

#[async_trait]
impl Disposable for ChannelInner {
    async fn dispose(&self) {
        if !self.lifecycle.begin_dispose().await {
            return;
        }
        self.lifecycle.dispose_children().await;
        if let Err(err) = self.driver.close().await {
            warn!(error = %err, "closing channel failed");
        }
        self.token.detach();
        self.lifecycle.finish_dispose();
        debug!("channel disposed");
    }

    fn is_disposed(&self) -> bool {
        self.lifecycle.is_disposed()
    }
}

#[async_trait]
impl Disposable for MqChannel {
    async fn dispose(&self) {
        self.inner.dispose().await
    }

    fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }
}
