//! Request/reply over a private reply queue

use crate::address::MqAddress;
use crate::channel::MqChannel;
use crate::consumer::MqConsumer;
use crate::lifecycle::{ChildToken, Disposable, Lifecycle};
use crate::message::{MessageContext, MessageProperties, ReturnedMessage};
use crate::plugin::ConsumerSpec;
use crate::publisher::MqPublisher;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

enum RpcOutcome {
    Reply(MessageContext),
    Returned(ReturnedMessage),
}

type PendingCalls = Arc<DashMap<String, oneshot::Sender<RpcOutcome>>>;

/// Fire-and-forget and request/reply messaging to one address.
///
/// Replies arrive on an exclusive auto-delete queue owned by the client and
/// are matched to calls by correlation id.
#[derive(Clone)]
pub struct MqRpcClient {
    inner: Arc<RpcInner>,
}

struct RpcInner {
    lifecycle: Arc<Lifecycle>,
    token: ChildToken,
    reply_address: MqAddress,
    publisher: MqPublisher,
    reply_consumer: MqConsumer,
    pending: PendingCalls,
    returned_listener: JoinHandle<()>,
}

/// Removes a pending call on every exit path, including a dropped future.
struct PendingGuard<'a> {
    pending: &'a PendingCalls,
    correlation_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.correlation_id);
    }
}

impl MqRpcClient {
    pub(crate) async fn create(channel: &MqChannel, address: &MqAddress) -> Result<Self> {
        channel.lifecycle().ensure_alive()?;
        let publisher = channel.create_publisher(address)?;

        let queue = format!("rpc-reply-{}", Uuid::new_v4().simple());
        let reply_address = MqAddress::new(queue.clone());
        let spec = ConsumerSpec {
            queue,
            addresses: vec![channel.plugin().to_consumer_address(&reply_address)?],
            auto_ack_disabled: false,
            auto_delete: true,
            exclusive: true,
        };
        let reply_consumer = match channel.consume(spec).await {
            Ok(consumer) => consumer,
            Err(err) => {
                publisher.dispose().await;
                return Err(err);
            }
        };

        let pending: PendingCalls = Arc::new(DashMap::new());
        let replies = pending.clone();
        let registered = reply_consumer.on_received(move |context| {
            let Some(correlation_id) = context.correlation_id() else {
                debug!("reply without correlation id dropped");
                return;
            };
            match replies.remove(correlation_id) {
                Some((_, waiter)) => {
                    let _ = waiter.send(RpcOutcome::Reply(context));
                }
                None => debug!(correlation_id, "late or unknown reply dropped"),
            }
        });
        if let Err(err) = registered {
            reply_consumer.dispose().await;
            publisher.dispose().await;
            return Err(err);
        }

        let returned_listener = tokio::spawn(listen_returned(channel.returned(), pending.clone()));

        let client = Self {
            inner: Arc::new(RpcInner {
                lifecycle: Lifecycle::new("rpc client"),
                token: channel.lifecycle().reserve(),
                reply_address,
                publisher,
                reply_consumer,
                pending,
                returned_listener,
            }),
        };
        let child: Arc<dyn Disposable> = client.inner.clone();
        if let Err(err) = channel.lifecycle().attach(&client.inner.token, child) {
            client.dispose().await;
            return Err(err);
        }
        debug!(address = %address, reply_to = %client.inner.reply_address, "rpc client created");
        Ok(client)
    }

    pub fn address(&self) -> &MqAddress {
        self.inner.publisher.address().address()
    }

    /// Private address replies are sent to.
    pub fn reply_address(&self) -> &MqAddress {
        &self.inner.reply_address
    }

    /// Publish without waiting for anything.
    pub async fn cast(&self, body: impl Into<Bytes>, properties: MessageProperties) -> Result<()> {
        self.inner.lifecycle.ensure_alive()?;
        self.inner.publisher.publish(body, &properties).await
    }

    /// Publish with a fresh correlation id and wait for the matching reply.
    ///
    /// Fails with [`Error::Timeout`] when nothing arrives in time,
    /// [`Error::Canceled`] when the client is disposed meanwhile, and
    /// [`Error::Unroutable`] when the broker returns the request.
    pub async fn call(
        &self,
        body: impl Into<Bytes>,
        properties: MessageProperties,
        timeout: Duration,
    ) -> Result<MessageContext> {
        self.inner.lifecycle.ensure_alive()?;

        let correlation_id = Uuid::new_v4().simple().to_string();
        let properties = properties
            .with_correlation_id(correlation_id.clone())
            .with_reply_to(self.inner.reply_address.clone());

        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(correlation_id.clone(), tx);
        let _guard = PendingGuard {
            pending: &self.inner.pending,
            correlation_id: &correlation_id,
        };
        if self.inner.lifecycle.is_disposed() {
            return Err(Error::canceled("rpc call"));
        }

        self.inner.publisher.publish_mandatory(body, &properties).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(RpcOutcome::Reply(context))) => Ok(context),
            Ok(Ok(RpcOutcome::Returned(returned))) => Err(Error::unroutable(
                returned.address.as_str(),
                returned.reply_code,
                returned.reply_text,
            )),
            Ok(Err(_)) => Err(Error::canceled("rpc call")),
            Err(_) => Err(Error::timeout(
                format!("rpc call to {}", self.address()),
                u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            )),
        }
    }

    /// Calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }
}

async fn listen_returned(mut returned: broadcast::Receiver<ReturnedMessage>, pending: PendingCalls) {
    loop {
        match returned.recv().await {
            Ok(message) => {
                let Some(correlation_id) = message.properties.correlation_id.clone() else {
                    continue;
                };
                if let Some((_, waiter)) = pending.remove(&correlation_id) {
                    let _ = waiter.send(RpcOutcome::Returned(message));
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "rpc client missed returned messages");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[async_trait]
impl Disposable for RpcInner {
    async fn dispose(&self) {
        if !self.lifecycle.begin_dispose().await {
            return;
        }
        // Dropping the senders wakes every waiter with a cancellation.
        self.pending.clear();
        self.returned_listener.abort();
        self.reply_consumer.dispose().await;
        self.publisher.dispose().await;
        self.token.detach();
        self.lifecycle.finish_dispose();
        debug!(reply_to = %self.reply_address, "rpc client disposed");
    }

    fn is_disposed(&self) -> bool {
        self.lifecycle.is_disposed()
    }
}

#[async_trait]
impl Disposable for MqRpcClient {
    async fn dispose(&self) {
        self.inner.dispose().await
    }

    fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }
}
