//! Micro-service dispatcher
//!
//! Binds every discovered binding to a consumer and runs the
//! receive → deserialize → invoke → serialize → reply pipeline.
//!
//! Consumers only enqueue: every received message goes onto one unbounded
//! queue drained by a single dispatch task, so service methods of one
//! dispatcher never run concurrently and per-consumer order is kept. The
//! number of messages between receipt and the end of their dispatch drives
//! channel pausing (see [`Backpressure`]).

use crate::address::MqAddress;
use crate::binding::{group_bindings, BindingGroup, MicroServiceBinding};
use crate::channel::MqChannel;
use crate::config::DispatcherConfig;
use crate::connection::MqConnection;
use crate::consumer::MqConsumer;
use crate::context;
use crate::flow::Backpressure;
use crate::lifecycle::Disposable;
use crate::locator::MicroServiceLocator;
use crate::lookup::{LookupOutcome, MicroServiceLookup};
use crate::message::{MessageContext, MessageProperties};
use crate::plugin::MqPlugin;
use crate::serializer::SerializerRegistry;
use crate::service::Invocation;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, trace, warn};

const UNHANDLED_CAPACITY: usize = 64;

/// A dispatch failure, published to [`MicroServiceDispatcher::subscribe_unhandled`].
#[derive(Debug, Clone)]
pub struct UnhandledError {
    pub routing_key: String,
    pub correlation_id: Option<String>,
    /// `(contract, method)` when a binding was selected
    pub binding: Option<(String, String)>,
    pub error: Arc<Error>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Created,
    Started,
    Stopped,
    Disposed,
}

struct Job {
    context: MessageContext,
    candidates: Arc<[Arc<MicroServiceBinding>]>,
    channel: MqChannel,
}

struct ActiveConsumer {
    consumer: MqConsumer,
    bindings: Arc<[Arc<MicroServiceBinding>]>,
}

/// Dispatches messages to the micro-services of a locator.
#[derive(Clone)]
pub struct MicroServiceDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    connection: MqConnection,
    locator: Arc<MicroServiceLocator>,
    serializers: Arc<SerializerRegistry>,
    options: DispatcherConfig,
    lookup: RwLock<Option<Arc<MicroServiceLookup>>>,
    // Serializes start, stop and dispose; never taken by the dispatch path.
    control: tokio::sync::Mutex<()>,
    state: Mutex<DispatcherState>,
    channel: Mutex<Option<MqChannel>>,
    consumers: Mutex<Vec<ActiveConsumer>>,
    jobs: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    flow: Backpressure,
    unhandled: broadcast::Sender<UnhandledError>,
}

impl MicroServiceDispatcher {
    pub fn new(connection: MqConnection, locator: Arc<MicroServiceLocator>) -> Self {
        Self::with_options(
            connection,
            locator,
            Arc::new(SerializerRegistry::with_defaults()),
            DispatcherConfig::default(),
        )
    }

    pub fn with_options(
        connection: MqConnection,
        locator: Arc<MicroServiceLocator>,
        serializers: Arc<SerializerRegistry>,
        options: DispatcherConfig,
    ) -> Self {
        let (unhandled, _) = broadcast::channel(UNHANDLED_CAPACITY);
        Self {
            inner: Arc::new(DispatcherInner {
                connection,
                locator,
                serializers,
                flow: Backpressure::new(options.pause_threshold),
                options,
                lookup: RwLock::new(None),
                control: tokio::sync::Mutex::new(()),
                state: Mutex::new(DispatcherState::Created),
                channel: Mutex::new(None),
                consumers: Mutex::new(Vec::new()),
                jobs: Mutex::new(None),
                unhandled,
            }),
        }
    }

    /// Resolve outbound addresses through `lookup` in [`send`](Self::send).
    pub fn set_lookup(&self, lookup: Arc<MicroServiceLookup>) {
        *self.inner.lookup.write() = Some(lookup);
    }

    pub fn state(&self) -> DispatcherState {
        *self.inner.state.lock()
    }

    pub fn connection(&self) -> &MqConnection {
        &self.inner.connection
    }

    pub fn locator(&self) -> &Arc<MicroServiceLocator> {
        &self.inner.locator
    }

    pub fn serializers(&self) -> &Arc<SerializerRegistry> {
        &self.inner.serializers
    }

    pub fn options(&self) -> &DispatcherConfig {
        &self.inner.options
    }

    /// Channel used for consuming and publishing, once opened.
    pub fn channel(&self) -> Option<MqChannel> {
        self.inner.channel.lock().clone()
    }

    /// Messages received but not yet fully dispatched.
    pub fn in_flight(&self) -> usize {
        self.inner.flow.in_flight()
    }

    pub fn consumer_count(&self) -> usize {
        self.inner.consumers.lock().len()
    }

    /// Bindings served by each active consumer, keyed by queue.
    pub fn active_bindings(&self) -> Vec<(String, Vec<Arc<MicroServiceBinding>>)> {
        self.inner
            .consumers
            .lock()
            .iter()
            .map(|active| {
                (
                    active.consumer.source_key().to_string(),
                    active.bindings.to_vec(),
                )
            })
            .collect()
    }

    pub fn subscribe_unhandled(&self) -> broadcast::Receiver<UnhandledError> {
        self.inner.unhandled.subscribe()
    }

    /// Discover bindings and start consuming.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let _control = inner.control.lock().await;
        match inner.state() {
            DispatcherState::Disposed => return Err(Error::disposed("dispatcher")),
            DispatcherState::Started => {
                return Err(Error::invalid_state("dispatcher", "already started"))
            }
            DispatcherState::Created | DispatcherState::Stopped => {}
        }

        let channel = inner.ensure_channel().await?;
        let bindings = inner.locator.refresh()?;
        let groups = group_bindings(inner.connection.plugin().as_ref(), &bindings)?;
        let jobs = DispatcherInner::ensure_worker(inner);

        let mut active: Vec<ActiveConsumer> = Vec::new();
        for group in &groups {
            match DispatcherInner::subscribe(inner, &channel, group, &jobs).await {
                Ok(mut consumers) => active.append(&mut consumers),
                Err(err) => {
                    for started in &active {
                        started.consumer.dispose().await;
                    }
                    error!(queue = %group.queue, error = %err, "dispatcher start failed");
                    return Err(err);
                }
            }
        }

        let consumers = active.len();
        *inner.consumers.lock() = active;
        inner.set_state(DispatcherState::Started);
        info!(
            bindings = bindings.len(),
            consumers,
            "dispatcher started"
        );
        Ok(())
    }

    /// Dispose every consumer; the channel is kept for the next start.
    pub async fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        let _control = inner.control.lock().await;
        match inner.state() {
            DispatcherState::Started => {}
            DispatcherState::Disposed => return Err(Error::disposed("dispatcher")),
            DispatcherState::Created | DispatcherState::Stopped => {
                return Err(Error::invalid_state(
                    "dispatcher",
                    "stop requires a started dispatcher",
                ))
            }
        }

        inner.dispose_consumers().await;
        inner.set_state(DispatcherState::Stopped);
        info!("dispatcher stopped");
        Ok(())
    }

    /// Publish `body` to `address`.
    ///
    /// With `enable_lookup` and a lookup attached, the address is resolved
    /// first; an unresolved or timed-out lookup falls back to `address`.
    pub async fn send(
        &self,
        address: &MqAddress,
        body: impl Into<Bytes>,
        properties: MessageProperties,
        enable_lookup: bool,
    ) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_not_disposed()?;

        let target = if enable_lookup {
            inner.resolve_target(address).await?
        } else {
            address.clone()
        };

        let channel = {
            let _control = inner.control.lock().await;
            inner.ensure_not_disposed()?;
            inner.ensure_channel().await?
        };
        let publisher = channel.create_publisher(&target)?;
        let published = publisher.publish(body, &properties).await;
        publisher.dispose().await;
        trace!(address = %target, "message sent");
        published
    }
}

impl DispatcherInner {
    fn state(&self) -> DispatcherState {
        *self.state.lock()
    }

    fn set_state(&self, state: DispatcherState) {
        *self.state.lock() = state;
    }

    fn ensure_not_disposed(&self) -> Result<()> {
        if self.state() == DispatcherState::Disposed {
            Err(Error::disposed("dispatcher"))
        } else {
            Ok(())
        }
    }

    /// Caller holds `control`.
    async fn ensure_channel(&self) -> Result<MqChannel> {
        if let Some(channel) = self.channel.lock().clone() {
            if !channel.is_disposed() {
                return Ok(channel);
            }
        }
        let channel = self.connection.create_channel().await?;
        *self.channel.lock() = Some(channel.clone());
        Ok(channel)
    }

    /// Caller holds `control`.
    fn ensure_worker(this: &Arc<Self>) -> mpsc::UnboundedSender<Job> {
        let mut jobs = this.jobs.lock();
        if let Some(sender) = jobs.as_ref() {
            return sender.clone();
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run_dispatch_loop(Arc::downgrade(this), receiver));
        *jobs = Some(sender.clone());
        sender
    }

    async fn subscribe(
        this: &Arc<Self>,
        channel: &MqChannel,
        group: &BindingGroup,
        jobs: &mpsc::UnboundedSender<Job>,
    ) -> Result<Vec<ActiveConsumer>> {
        let consumers = channel
            .create_consumers(&group.addresses, group.auto_ack_disabled, group.auto_delete)
            .await?;
        let candidates: Arc<[Arc<MicroServiceBinding>]> = group.bindings.clone().into();

        let mut active: Vec<ActiveConsumer> = Vec::with_capacity(consumers.len());
        for consumer in consumers {
            let dispatcher = Arc::downgrade(this);
            let jobs = jobs.clone();
            let bindings = candidates.clone();
            let target = channel.clone();
            let registered = consumer.on_received(move |context| {
                let Some(dispatcher) = dispatcher.upgrade() else {
                    return;
                };
                dispatcher.flow.enter(&target);
                let job = Job {
                    context,
                    candidates: bindings.clone(),
                    channel: target.clone(),
                };
                if jobs.send(job).is_err() {
                    dispatcher.flow.leave(&target);
                }
            });
            if let Err(err) = registered {
                consumer.dispose().await;
                for started in &active {
                    started.consumer.dispose().await;
                }
                return Err(err);
            }
            debug!(
                queue = consumer.source_key(),
                bindings = candidates.len(),
                "consumer bound"
            );
            active.push(ActiveConsumer {
                consumer,
                bindings: candidates.clone(),
            });
        }
        Ok(active)
    }

    async fn dispose_consumers(&self) {
        let consumers = std::mem::take(&mut *self.consumers.lock());
        for active in consumers {
            active.consumer.dispose().await;
        }
    }

    async fn resolve_target(&self, address: &MqAddress) -> Result<MqAddress> {
        let lookup = self.lookup.read().clone();
        let Some(lookup) = lookup else {
            return Ok(address.clone());
        };
        match lookup.resolve(address).await? {
            LookupOutcome::Resolved(resolved) => {
                debug!(address = %address, resolved = %resolved, "address resolved");
                Ok(resolved)
            }
            LookupOutcome::Unresolved => {
                debug!(address = %address, "address unresolved, sending as is");
                Ok(address.clone())
            }
            LookupOutcome::TimedOut => {
                warn!(address = %address, "lookup timed out, sending as is");
                Ok(address.clone())
            }
            LookupOutcome::Canceled => Err(Error::canceled(format!("lookup of {address}"))),
        }
    }

    async fn dispatch(&self, job: &Job) {
        let plugin = self.connection.plugin();
        let binding = match select_binding(plugin.as_ref(), &job.candidates, &job.context) {
            Ok(binding) => binding,
            Err(err) => return self.report(&job.context, None, err),
        };
        if let Err(err) = self.invoke(&binding, &job.context, &job.channel).await {
            self.report(&job.context, Some(&binding), err);
        }
    }

    async fn invoke(
        &self,
        binding: &MicroServiceBinding,
        context: &MessageContext,
        channel: &MqChannel,
    ) -> Result<()> {
        let lease = self.locator.resolve(&binding.contract)?;
        let invocation = Invocation::new(
            context.clone(),
            self.serializers.clone(),
            &self.options.default_content_type,
        );
        if !binding.parameter.is_raw() {
            self.serializers.find_deserializer(
                &binding.parameter,
                context.body(),
                invocation.content_type(),
            )?;
        }

        trace!(
            contract = %binding.contract,
            method = %binding.method,
            routing_key = %context.routing_key(),
            "invoking"
        );
        let reply = context::scope(context.clone(), lease.invoke(&binding.method, invocation)).await?;
        drop(lease);

        let Some(reply_to) = context.reply_to() else {
            return Ok(());
        };
        if binding.one_way {
            debug!(method = %binding.method, reply_to = %reply_to, "one-way binding, reply-to ignored");
            return Ok(());
        }

        let mut properties = MessageProperties::new();
        properties.correlation_id = context.correlation_id().map(str::to_string);
        properties.content_type = reply.content_type().map(str::to_string);
        let publisher = channel.create_publisher(reply_to)?;
        let published = publisher.publish(reply.body().clone(), &properties).await;
        publisher.dispose().await;
        published
    }

    fn report(&self, context: &MessageContext, binding: Option<&MicroServiceBinding>, err: Error) {
        error!(
            routing_key = %context.routing_key(),
            contract = binding.map(|b| b.contract.as_str()).unwrap_or(""),
            method = binding.map(|b| b.method.as_str()).unwrap_or(""),
            error = %err,
            "unhandled dispatch error"
        );
        // No subscribers is fine.
        let _ = self.unhandled.send(UnhandledError {
            routing_key: context.routing_key().to_string(),
            correlation_id: context.correlation_id().map(str::to_string),
            binding: binding.map(|b| (b.contract.clone(), b.method.clone())),
            error: Arc::new(err),
        });
    }
}

/// First candidate whose address matches the message's routing key.
fn select_binding(
    plugin: &dyn MqPlugin,
    candidates: &[Arc<MicroServiceBinding>],
    context: &MessageContext,
) -> Result<Arc<MicroServiceBinding>> {
    for binding in candidates {
        if plugin.is_match(context, &binding.address)? {
            return Ok(binding.clone());
        }
    }
    Err(Error::binding_not_found(context.routing_key()))
}

async fn run_dispatch_loop(dispatcher: Weak<DispatcherInner>, mut jobs: mpsc::UnboundedReceiver<Job>) {
    debug!("dispatch loop started");
    while let Some(job) = jobs.recv().await {
        let Some(inner) = dispatcher.upgrade() else {
            break;
        };
        if inner.state() != DispatcherState::Disposed {
            inner.dispatch(&job).await;
        }
        inner.flow.leave(&job.channel);
    }
    debug!("dispatch loop ended");
}

#[async_trait]
impl Disposable for MicroServiceDispatcher {
    async fn dispose(&self) {
        let inner = &self.inner;
        let _control = inner.control.lock().await;
        if inner.state() == DispatcherState::Disposed {
            return;
        }
        inner.set_state(DispatcherState::Disposed);

        inner.dispose_consumers().await;
        inner.jobs.lock().take();
        let channel = inner.channel.lock().take();
        if let Some(channel) = channel {
            channel.dispose().await;
        }
        info!("dispatcher disposed");
    }

    fn is_disposed(&self) -> bool {
        self.state() == DispatcherState::Disposed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::BindingDescriptor;
    use crate::memory::MemoryPlugin;

    fn binding(method: &'static str, address: &str) -> Arc<MicroServiceBinding> {
        let descriptor = BindingDescriptor::new(method, address).parameter::<Bytes>();
        Arc::new(MicroServiceBinding::from_descriptor("Helper", &descriptor).unwrap())
    }

    fn received(routing_key: &str) -> MessageContext {
        MessageContext::delivered(Bytes::new(), routing_key, MessageProperties::new(), || {})
    }

    #[test]
    fn test_first_matching_binding_wins() {
        let candidates = [
            binding("created", "topic://orders/order.created/orders"),
            binding("any", "topic://orders/order.*/orders"),
        ];
        let plugin = MemoryPlugin::new();

        let picked = select_binding(&plugin, &candidates, &received("order.created")).unwrap();
        assert_eq!(picked.method, "created");
        let picked = select_binding(&plugin, &candidates, &received("order.deleted")).unwrap();
        assert_eq!(picked.method, "any");

        let err = select_binding(&plugin, &candidates, &received("invoice.created")).unwrap_err();
        assert!(matches!(err, Error::BindingNotFound { .. }));
    }

    #[tokio::test]
    async fn test_state_machine() {
        let connection = MqConnection::open_url("memory://dispatcher-unit-state")
            .await
            .unwrap();
        let dispatcher =
            MicroServiceDispatcher::new(connection.clone(), Arc::new(MicroServiceLocator::new()));
        assert_eq!(dispatcher.state(), DispatcherState::Created);

        let err = dispatcher.stop().await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));

        dispatcher.start().await.unwrap();
        let err = dispatcher.start().await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));

        dispatcher.stop().await.unwrap();
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
        let channel = dispatcher.channel().unwrap();
        dispatcher.start().await.unwrap();
        assert!(!channel.is_disposed());

        dispatcher.dispose().await;
        assert!(channel.is_disposed());
        assert!(matches!(
            dispatcher.start().await.unwrap_err(),
            Error::Disposed { .. }
        ));
        assert!(matches!(
            dispatcher
                .send(&"anywhere".into(), Bytes::new(), MessageProperties::new(), false)
                .await
                .unwrap_err(),
            Error::Disposed { .. }
        ));
        connection.dispose().await;
    }
}
