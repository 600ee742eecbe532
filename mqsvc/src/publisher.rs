//! Publishers

use crate::address::MqPublisherAddress;
use crate::lifecycle::{ChildToken, Disposable, Lifecycle};
use crate::message::MessageProperties;
use crate::plugin::ChannelDriver;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::trace;

/// Sends messages to one address through its channel.
#[derive(Clone)]
pub struct MqPublisher {
    inner: Arc<PublisherInner>,
}

struct PublisherInner {
    lifecycle: Arc<Lifecycle>,
    token: ChildToken,
    driver: Arc<dyn ChannelDriver>,
    address: MqPublisherAddress,
}

impl MqPublisher {
    pub(crate) fn new(
        driver: Arc<dyn ChannelDriver>,
        address: MqPublisherAddress,
        token: ChildToken,
    ) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                lifecycle: Lifecycle::new("publisher"),
                token,
                driver,
                address,
            }),
        }
    }

    pub(crate) fn token(&self) -> &ChildToken {
        &self.inner.token
    }

    pub(crate) fn as_disposable(&self) -> Arc<dyn Disposable> {
        self.inner.clone()
    }

    pub fn address(&self) -> &MqPublisherAddress {
        &self.inner.address
    }

    /// Publish; messages nobody is bound to are dropped silently.
    pub async fn publish(&self, body: impl Into<Bytes>, properties: &MessageProperties) -> Result<()> {
        self.send(body.into(), properties, false).await
    }

    /// Publish; unroutable messages come back on the channel's returned stream.
    pub async fn publish_mandatory(
        &self,
        body: impl Into<Bytes>,
        properties: &MessageProperties,
    ) -> Result<()> {
        self.send(body.into(), properties, true).await
    }

    async fn send(&self, body: Bytes, properties: &MessageProperties, mandatory: bool) -> Result<()> {
        self.inner.lifecycle.ensure_alive()?;
        trace!(
            address = %self.inner.address,
            correlation_id = properties.correlation_id.as_deref().unwrap_or(""),
            mandatory,
            "publishing"
        );
        self.inner
            .driver
            .publish(&self.inner.address, body, properties, mandatory)
            .await
    }
}

#[async_trait]
impl Disposable for PublisherInner {
    async fn dispose(&self) {
        if !self.lifecycle.begin_dispose().await {
            return;
        }
        self.token.detach();
        self.lifecycle.finish_dispose();
        trace!(address = %self.address, "publisher disposed");
    }

    fn is_disposed(&self) -> bool {
        self.lifecycle.is_disposed()
    }
}

#[async_trait]
impl Disposable for MqPublisher {
    async fn dispose(&self) {
        self.inner.dispose().await
    }

    fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }
}
