//! In-memory broker
//!
//! A process-local broker reachable as `memory://{name}`. Brokers are kept in
//! a static registry keyed by name, so every connection opened with the same
//! URL sees the same exchanges and queues; tests use a distinct name each to
//! stay isolated.
//!
//! Supported topology: direct, topic and fanout exchanges (declared
//! implicitly by the bindings that use them), queues with competing
//! consumers, auto-delete queues removed with their last consumer, and
//! exclusive queues owned by one connection. Unacknowledged deliveries of a
//! manual-ack consumer are requeued as redelivered when it is canceled.

use crate::address::{ExchangeType, MqPublisherAddress};
use crate::config::ConnectionConfig;
use crate::message::{MessageProperties, ReturnedMessage, REPLY_CODE_NO_ROUTE};
use crate::plugin::{ChannelDriver, ConnectionDriver, ConsumerDriver, ConsumerSpec, Delivery, MqPlugin};
use crate::{routing, Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, trace};

/// Named brokers of this process
static BROKERS: Lazy<Mutex<HashMap<String, Arc<MemoryBroker>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

const RETURNED_CAPACITY: usize = 256;

/// Plugin serving the `memory` scheme.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryPlugin;

impl MemoryPlugin {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MqPlugin for MemoryPlugin {
    fn scheme(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn ConnectionDriver>> {
        let broker = MemoryBroker::named(config.host());
        let id = broker.next_connection.fetch_add(1, Ordering::Relaxed);
        info!(
            broker = %broker.name,
            connection_id = id,
            name = config.name.as_deref().unwrap_or(""),
            "connected to in-memory broker"
        );
        Ok(Arc::new(MemoryConnection {
            broker,
            id,
            closed: AtomicBool::new(false),
            channels: Mutex::new(Vec::new()),
        }))
    }
}

#[derive(Clone)]
struct Enqueued {
    body: Bytes,
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    redelivered: bool,
}

struct MemoryQueue {
    name: String,
    auto_delete: bool,
    exclusive_owner: Option<u64>,
    sender: mpsc::UnboundedSender<Enqueued>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Enqueued>>,
    depth: AtomicUsize,
}

impl MemoryQueue {
    fn push(&self, message: Enqueued) {
        // The receiver lives as long as the queue, so the send cannot fail.
        if self.sender.send(message).is_ok() {
            self.depth.fetch_add(1, Ordering::AcqRel);
        }
    }
}

#[derive(PartialEq, Eq)]
struct QueueBinding {
    queue: String,
    exchange_type: ExchangeType,
    exchange: String,
    pattern: String,
}

#[derive(Default)]
struct Topology {
    queues: HashMap<String, Arc<MemoryQueue>>,
    consumers: HashMap<String, usize>,
    bindings: Vec<QueueBinding>,
}

impl Topology {
    fn remove_queue(&mut self, queue: &str) {
        self.queues.remove(queue);
        self.consumers.remove(queue);
        self.bindings.retain(|binding| binding.queue != queue);
    }
}

/// One named in-memory broker.
pub struct MemoryBroker {
    name: String,
    topology: Mutex<Topology>,
    next_connection: AtomicU64,
}

impl MemoryBroker {
    /// The broker registered under `name`, created on first use.
    pub fn named(name: &str) -> Arc<Self> {
        let mut brokers = BROKERS.lock();
        brokers
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(broker = name, "created in-memory broker");
                Arc::new(Self {
                    name: name.to_string(),
                    topology: Mutex::new(Topology::default()),
                    next_connection: AtomicU64::new(1),
                })
            })
            .clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.topology.lock().queues.contains_key(queue)
    }

    /// Messages waiting in `queue`, not counting unacknowledged deliveries.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.topology
            .lock()
            .queues
            .get(queue)
            .map(|q| q.depth.load(Ordering::Acquire))
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.topology
            .lock()
            .consumers
            .get(queue)
            .copied()
            .unwrap_or(0)
    }

    pub fn binding_count(&self, queue: &str) -> usize {
        self.topology
            .lock()
            .bindings
            .iter()
            .filter(|binding| binding.queue == queue)
            .count()
    }

    fn declare(&self, spec: &ConsumerSpec, connection_id: u64) -> Result<Arc<MemoryQueue>> {
        let mut guard = self.topology.lock();
        let topology = &mut *guard;

        let queue = match topology.queues.get(&spec.queue) {
            Some(existing) => {
                if existing.auto_delete != spec.auto_delete {
                    return Err(Error::queue_properties_mismatch(
                        &spec.queue,
                        format!(
                            "declared with auto_delete={}, requested auto_delete={}",
                            existing.auto_delete, spec.auto_delete
                        ),
                    ));
                }
                if let Some(owner) = existing.exclusive_owner {
                    if owner != connection_id {
                        return Err(Error::queue_properties_mismatch(
                            &spec.queue,
                            "queue is exclusive to another connection",
                        ));
                    }
                }
                existing.clone()
            }
            None => {
                let (sender, receiver) = mpsc::unbounded_channel();
                let queue = Arc::new(MemoryQueue {
                    name: spec.queue.clone(),
                    auto_delete: spec.auto_delete,
                    exclusive_owner: spec.exclusive.then_some(connection_id),
                    sender,
                    receiver: tokio::sync::Mutex::new(receiver),
                    depth: AtomicUsize::new(0),
                });
                topology.queues.insert(spec.queue.clone(), queue.clone());
                debug!(
                    broker = %self.name,
                    queue = %spec.queue,
                    auto_delete = spec.auto_delete,
                    exclusive = spec.exclusive,
                    "declared queue"
                );
                queue
            }
        };

        for address in &spec.addresses {
            let binding = QueueBinding {
                queue: spec.queue.clone(),
                exchange_type: address.exchange_type.clone(),
                exchange: address.exchange.clone(),
                pattern: address.routing_key.clone(),
            };
            if !topology.bindings.contains(&binding) {
                topology.bindings.push(binding);
            }
        }

        *topology.consumers.entry(spec.queue.clone()).or_insert(0) += 1;
        Ok(queue)
    }

    fn release_consumer(&self, queue: &str) {
        let mut topology = self.topology.lock();
        let remaining = match topology.consumers.get_mut(queue) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => return,
        };
        let auto_delete = topology.queues.get(queue).is_some_and(|q| q.auto_delete);
        if remaining == 0 && auto_delete {
            topology.remove_queue(queue);
            debug!(broker = %self.name, queue, "deleted auto-delete queue");
        }
    }

    fn drop_exclusive(&self, connection_id: u64) {
        let mut topology = self.topology.lock();
        let owned: Vec<String> = topology
            .queues
            .values()
            .filter(|q| q.exclusive_owner == Some(connection_id))
            .map(|q| q.name.clone())
            .collect();
        for queue in owned {
            topology.remove_queue(&queue);
            debug!(broker = %self.name, queue = %queue, "deleted exclusive queue");
        }
    }

    /// Enqueue a copy on every queue bound to `address`. Returns the number of queues.
    fn route(
        &self,
        address: &MqPublisherAddress,
        body: &Bytes,
        properties: &MessageProperties,
    ) -> Result<usize> {
        if !matches!(
            address.exchange_type,
            ExchangeType::Direct | ExchangeType::Topic | ExchangeType::Fanout
        ) {
            return Err(Error::not_supported(format!(
                "in-memory exchange of type '{}'",
                address.exchange_type
            )));
        }

        let topology = self.topology.lock();
        let mut targets: HashSet<&str> = HashSet::new();
        for binding in &topology.bindings {
            if binding.exchange == address.exchange
                && binding.exchange_type == address.exchange_type
                && routing::matches(&binding.exchange_type, &binding.pattern, &address.routing_key)?
            {
                targets.insert(&binding.queue);
            }
        }
        // The default exchange also reaches every queue by its name.
        if address.exchange.is_empty()
            && address.exchange_type == ExchangeType::Direct
            && topology.queues.contains_key(&address.routing_key)
        {
            targets.insert(&address.routing_key);
        }

        for queue in &targets {
            if let Some(queue) = topology.queues.get(*queue) {
                queue.push(Enqueued {
                    body: body.clone(),
                    exchange: address.exchange.clone(),
                    routing_key: address.routing_key.clone(),
                    properties: properties.clone(),
                    redelivered: false,
                });
            }
        }
        trace!(address = %address, queues = targets.len(), "routed message");
        Ok(targets.len())
    }
}

struct MemoryConnection {
    broker: Arc<MemoryBroker>,
    id: u64,
    closed: AtomicBool,
    channels: Mutex<Vec<Weak<MemoryChannel>>>,
}

#[async_trait]
impl ConnectionDriver for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn ChannelDriver>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::connection_msg("connection is closed"));
        }
        let (paused, _) = watch::channel(false);
        let (returned, _) = broadcast::channel(RETURNED_CAPACITY);
        let channel = Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            connection_id: self.id,
            next_tag: Arc::new(AtomicU64::new(1)),
            paused: Arc::new(paused),
            returned,
            consumers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        let mut channels = self.channels.lock();
        channels.retain(|weak| weak.strong_count() > 0);
        channels.push(Arc::downgrade(&channel));
        Ok(channel)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let channels: Vec<_> = self
            .channels
            .lock()
            .drain(..)
            .filter_map(|weak| weak.upgrade())
            .collect();
        for channel in channels {
            channel.close().await?;
        }
        self.broker.drop_exclusive(self.id);
        debug!(broker = %self.broker.name, connection_id = self.id, "closed in-memory connection");
        Ok(())
    }
}

struct MemoryChannel {
    broker: Arc<MemoryBroker>,
    connection_id: u64,
    next_tag: Arc<AtomicU64>,
    paused: Arc<watch::Sender<bool>>,
    returned: broadcast::Sender<ReturnedMessage>,
    consumers: Mutex<Vec<Weak<MemoryConsumer>>>,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::transport_msg("channel is closed"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ChannelDriver for MemoryChannel {
    async fn consume(&self, spec: ConsumerSpec) -> Result<Arc<dyn ConsumerDriver>> {
        self.ensure_open()?;
        let queue = self.broker.declare(&spec, self.connection_id)?;
        let (canceled, _) = watch::channel(false);
        let consumer = Arc::new(MemoryConsumer {
            broker: self.broker.clone(),
            queue,
            auto_ack: !spec.auto_ack_disabled,
            next_tag: self.next_tag.clone(),
            paused: self.paused.clone(),
            canceled,
            unacked: Mutex::new(HashMap::new()),
            released: AtomicBool::new(false),
        });
        let mut consumers = self.consumers.lock();
        consumers.retain(|weak| weak.strong_count() > 0);
        consumers.push(Arc::downgrade(&consumer));
        Ok(consumer)
    }

    async fn publish(
        &self,
        address: &MqPublisherAddress,
        body: Bytes,
        properties: &MessageProperties,
        mandatory: bool,
    ) -> Result<()> {
        self.ensure_open()?;
        let routed = self.broker.route(address, &body, properties)?;
        if routed == 0 && mandatory {
            debug!(address = %address, "returning unroutable mandatory message");
            // Nobody listening for returns is not an error.
            let _ = self.returned.send(ReturnedMessage {
                address: address.address().clone(),
                body,
                properties: properties.clone(),
                reply_code: REPLY_CODE_NO_ROUTE,
                reply_text: "NO_ROUTE".to_string(),
            });
        }
        Ok(())
    }

    fn returned(&self) -> broadcast::Receiver<ReturnedMessage> {
        self.returned.subscribe()
    }

    fn can_pause(&self) -> bool {
        true
    }

    fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    fn set_paused(&self, paused: bool) -> Result<()> {
        self.ensure_open()?;
        self.paused.send_replace(paused);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let consumers: Vec<_> = self
            .consumers
            .lock()
            .drain(..)
            .filter_map(|weak| weak.upgrade())
            .collect();
        for consumer in consumers {
            consumer.cancel().await?;
        }
        Ok(())
    }
}

struct MemoryConsumer {
    broker: Arc<MemoryBroker>,
    queue: Arc<MemoryQueue>,
    auto_ack: bool,
    next_tag: Arc<AtomicU64>,
    paused: Arc<watch::Sender<bool>>,
    canceled: watch::Sender<bool>,
    unacked: Mutex<HashMap<u64, Enqueued>>,
    released: AtomicBool,
}

impl MemoryConsumer {
    async fn receive(&self) -> Option<Enqueued> {
        self.queue.receiver.lock().await.recv().await
    }
}

#[async_trait]
impl ConsumerDriver for MemoryConsumer {
    async fn next_delivery(&self) -> Option<Delivery> {
        let mut paused = self.paused.subscribe();
        let mut canceled = self.canceled.subscribe();

        let message = loop {
            if *canceled.borrow() {
                return None;
            }
            if *paused.borrow_and_update() {
                tokio::select! {
                    result = paused.changed() => result.ok()?,
                    result = canceled.changed() => result.ok()?,
                }
                continue;
            }
            tokio::select! {
                biased;
                result = canceled.changed() => result.ok()?,
                result = paused.changed() => result.ok()?,
                message = self.receive() => break message?,
            }
        };

        self.queue.depth.fetch_sub(1, Ordering::AcqRel);
        let delivery_tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        if !self.auto_ack {
            self.unacked.lock().insert(delivery_tag, message.clone());
        }
        Some(Delivery {
            body: message.body,
            exchange: message.exchange,
            routing_key: message.routing_key,
            properties: message.properties,
            delivery_tag,
            redelivered: message.redelivered,
        })
    }

    fn ack(&self, delivery_tag: u64) -> Result<()> {
        if self.auto_ack {
            return Ok(());
        }
        match self.unacked.lock().remove(&delivery_tag) {
            Some(_) => Ok(()),
            None => Err(Error::transport_msg(format!(
                "unknown delivery tag {delivery_tag}"
            ))),
        }
    }

    async fn cancel(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.canceled.send_replace(true);

        let mut unacked: Vec<(u64, Enqueued)> = self.unacked.lock().drain().collect();
        unacked.sort_by_key(|(tag, _)| *tag);
        if !unacked.is_empty() {
            debug!(queue = %self.queue.name, count = unacked.len(), "requeueing unacknowledged deliveries");
        }
        for (_, mut message) in unacked {
            message.redelivered = true;
            self.queue.push(message);
        }

        self.broker.release_consumer(&self.queue.name);
        Ok(())
    }
}
