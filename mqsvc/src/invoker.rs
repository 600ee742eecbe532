//! One-way invocation of bindings served elsewhere

use crate::address::MqAddress;
use crate::binding::MicroServiceBinding;
use crate::channel::MqChannel;
use crate::context;
use crate::lifecycle::Disposable;
use crate::message::MessageProperties;
use crate::serializer::{SerializerRegistry, TypeDescriptor};
use crate::{Error, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Publishes payloads to the address of a remote binding.
///
/// Properties are copied from the context being handled, if any, so the
/// correlation id of the inbound message follows the call. The reply-to is
/// always cleared: nothing waits for an answer.
#[derive(Clone)]
pub struct RemoteInvoker {
    channel: MqChannel,
    serializers: Arc<SerializerRegistry>,
    content_type: String,
}

impl RemoteInvoker {
    pub fn new(
        channel: MqChannel,
        serializers: Arc<SerializerRegistry>,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            serializers,
            content_type: content_type.into(),
        }
    }

    /// Invoke `binding` at its declared address.
    pub async fn invoke<T>(&self, binding: &MicroServiceBinding, payload: &T) -> Result<()>
    where
        T: Serialize + 'static,
    {
        let target = self.channel.plugin().to_publisher_address(&binding.address)?;
        self.publish(binding, target.address(), payload).await
    }

    /// Invoke `binding` on one instance, addressed by `routing_key` on the
    /// binding's exchange.
    pub async fn invoke_on<T>(
        &self,
        routing_key: &str,
        binding: &MicroServiceBinding,
        payload: &T,
    ) -> Result<()>
    where
        T: Serialize + 'static,
    {
        let target = self
            .channel
            .plugin()
            .to_publisher_address(&binding.address)?
            .with_routing_key(routing_key);
        self.publish(binding, target.address(), payload).await
    }

    async fn publish<T>(
        &self,
        binding: &MicroServiceBinding,
        target: &MqAddress,
        payload: &T,
    ) -> Result<()>
    where
        T: Serialize + 'static,
    {
        if !binding.one_way {
            return Err(Error::not_supported(format!(
                "{}.{} expects a reply; remote invocation is one-way only",
                binding.contract, binding.method
            )));
        }

        let mut properties = context::current()
            .map(|ctx| ctx.properties().clone())
            .unwrap_or_else(MessageProperties::new);
        properties.set_reply_to(None);
        if !TypeDescriptor::of::<T>().is_raw() {
            properties.content_type = Some(self.content_type.clone());
        }
        let body = self.serializers.serialize(payload, &self.content_type)?;

        let publisher = self.channel.create_publisher(target)?;
        let published = publisher.publish(body, &properties).await;
        publisher.dispose().await;
        debug!(
            contract = %binding.contract,
            method = %binding.method,
            address = %target,
            correlation_id = properties.correlation_id.as_deref().unwrap_or(""),
            "remote invocation published"
        );
        published
    }
}
