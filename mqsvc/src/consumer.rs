//! Consumers and their received handlers

use crate::address::MqConsumerAddress;
use crate::lifecycle::{ChildToken, Disposable, Lifecycle};
use crate::message::MessageContext;
use crate::plugin::{ConsumerDriver, ConsumerSpec, Delivery};
use crate::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Callback fired once per inbound message.
pub type ReceivedHandler = Arc<dyn Fn(MessageContext) + Send + Sync>;

/// Identifies a handler registered with [`MqConsumer::on_received`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// A consumer on one queue, possibly bound to several addresses.
///
/// Deliveries start flowing when the first handler is registered and are
/// handed to handlers in arrival order.
#[derive(Clone)]
pub struct MqConsumer {
    inner: Arc<ConsumerInner>,
}

struct ConsumerInner {
    lifecycle: Arc<Lifecycle>,
    token: ChildToken,
    driver: Arc<dyn ConsumerDriver>,
    spec: ConsumerSpec,
    handlers: Arc<DashMap<u64, ReceivedHandler>>,
    next_handler: AtomicU64,
    pumping: AtomicBool,
}

impl MqConsumer {
    pub(crate) fn new(driver: Arc<dyn ConsumerDriver>, spec: ConsumerSpec, token: ChildToken) -> Self {
        Self {
            inner: Arc::new(ConsumerInner {
                lifecycle: Lifecycle::new("consumer"),
                token,
                driver,
                spec,
                handlers: Arc::new(DashMap::new()),
                next_handler: AtomicU64::new(1),
                pumping: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn token(&self) -> &ChildToken {
        &self.inner.token
    }

    pub(crate) fn as_disposable(&self) -> Arc<dyn Disposable> {
        self.inner.clone()
    }

    pub fn addresses(&self) -> &[MqConsumerAddress] {
        &self.inner.spec.addresses
    }

    /// Queue identity shared by every address of this consumer.
    pub fn source_key(&self) -> &str {
        &self.inner.spec.queue
    }

    pub fn auto_ack_disabled(&self) -> bool {
        self.inner.spec.auto_ack_disabled
    }

    pub fn auto_delete(&self) -> bool {
        self.inner.spec.auto_delete
    }

    /// Register `handler`; the first registration starts delivery.
    pub fn on_received<F>(&self, handler: F) -> Result<HandlerId>
    where
        F: Fn(MessageContext) + Send + Sync + 'static,
    {
        self.inner.lifecycle.ensure_alive()?;
        let id = self.inner.next_handler.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.insert(id, Arc::new(handler));
        if !self.inner.pumping.swap(true, Ordering::AcqRel) {
            self.start_pump();
        }
        Ok(HandlerId(id))
    }

    pub fn remove_handler(&self, id: HandlerId) -> bool {
        self.inner.handlers.remove(&id.0).is_some()
    }

    pub fn handler_count(&self) -> usize {
        self.inner.handlers.len()
    }

    fn start_pump(&self) {
        let driver = self.inner.driver.clone();
        let handlers = self.inner.handlers.clone();
        let auto_ack_disabled = self.inner.spec.auto_ack_disabled;
        let queue = self.inner.spec.queue.clone();

        tokio::spawn(async move {
            debug!(queue = %queue, "consumer started");
            while let Some(delivery) = driver.next_delivery().await {
                trace!(
                    queue = %queue,
                    routing_key = %delivery.routing_key,
                    delivery_tag = delivery.delivery_tag,
                    "message received"
                );
                let context = into_context(&driver, delivery, auto_ack_disabled);
                let snapshot: Vec<ReceivedHandler> =
                    handlers.iter().map(|entry| entry.value().clone()).collect();
                for handler in snapshot {
                    handler(context.clone());
                }
            }
            debug!(queue = %queue, "consumer stopped");
        });
    }
}

fn into_context(
    driver: &Arc<dyn ConsumerDriver>,
    delivery: Delivery,
    auto_ack_disabled: bool,
) -> MessageContext {
    let Delivery {
        body,
        routing_key,
        properties,
        delivery_tag,
        ..
    } = delivery;

    if auto_ack_disabled {
        let driver = driver.clone();
        MessageContext::delivered(body, routing_key, properties, move || {
            if let Err(err) = driver.ack(delivery_tag) {
                warn!(delivery_tag, error = %err, "acknowledgement failed");
            }
        })
    } else {
        MessageContext::delivered(body, routing_key, properties, || {})
    }
}

#[async_trait]
impl Disposable for ConsumerInner {
    async fn dispose(&self) {
        if !self.lifecycle.begin_dispose().await {
            return;
        }
        if let Err(err) = self.driver.cancel().await {
            warn!(queue = %self.spec.queue, error = %err, "canceling consumer failed");
        }
        self.handlers.clear();
        self.token.detach();
        self.lifecycle.finish_dispose();
        debug!(queue = %self.spec.queue, "consumer disposed");
    }

    fn is_disposed(&self) -> bool {
        self.lifecycle.is_disposed()
    }
}

#[async_trait]
impl Disposable for MqConsumer {
    async fn dispose(&self) {
        self.inner.dispose().await
    }

    fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }
}
