//! Address lookup over the broker
//!
//! A logical address is resolved by publishing a query for its stable id
//! and waiting for a reply, a matching update, or the broker returning the
//! query because nobody advertises that id. Answers are cached, so each
//! address costs at most one round trip per process.
//!
//! Wire layout under the configured prefix `P`:
//!
//! | routing key    | payload       | direction                              |
//! |----------------|---------------|----------------------------------------|
//! | `P query.{id}` | `LookupQuery` | resolver → advertiser, reply-to set    |
//! | `P reply.{id}` | `LookupEntry` | advertiser → resolver, correlated      |
//! | `P update.{id}`| `LookupEntry` | advertiser → everyone, on (un)advertise|

use crate::address::MqAddress;
use crate::binding::BindingDescriptor;
use crate::channel::MqChannel;
use crate::config::{LookupConfig, DEFAULT_CONTENT_TYPE};
use crate::connection::MqConnection;
use crate::consumer::MqConsumer;
use crate::lifecycle::Disposable;
use crate::locator::{MicroServiceLocator, ServiceFactory};
use crate::message::{MessageContext, MessageProperties, ReturnedMessage};
use crate::serializer::SerializerRegistry;
use crate::service::{Invocation, MicroService, Reply};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Contract name the lookup endpoint registers under.
pub const LOOKUP_CONTRACT: &str = "MicroServiceLookup";

/// How a cached entry was learned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LookupResultKind {
    Reply,
    Returned,
    Update,
}

/// Resolution of one id; `address` is `None` when nobody serves it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupEntry {
    pub id: String,
    pub address: Option<MqAddress>,
    pub kind: LookupResultKind,
}

impl LookupEntry {
    pub fn outcome(&self) -> LookupOutcome {
        match &self.address {
            Some(address) => LookupOutcome::Resolved(address.clone()),
            None => LookupOutcome::Unresolved,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupQuery {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupOutcome {
    Resolved(MqAddress),
    Unresolved,
    TimedOut,
    Canceled,
}

/// Stable id of a logical address: a name-based UUID of its string form.
pub fn lookup_id(address: &MqAddress) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, address.as_str().as_bytes())
        .simple()
        .to_string()
}

struct PendingLookup {
    id: String,
    correlation_id: String,
    completion: Option<oneshot::Sender<LookupOutcome>>,
}

#[derive(Default)]
struct LookupState {
    cache: HashMap<String, LookupEntry>,
    pending: Vec<PendingLookup>,
    disposed: bool,
}

impl LookupState {
    fn complete<P>(&mut self, outcome: &LookupOutcome, mut predicate: P) -> usize
    where
        P: FnMut(&PendingLookup) -> bool,
    {
        let mut completed = 0;
        for pending in self.pending.iter_mut().filter(|p| predicate(p)) {
            if let Some(completion) = pending.completion.take() {
                let _ = completion.send(outcome.clone());
                completed += 1;
            }
        }
        completed
    }
}

struct Advert {
    resolved: MqAddress,
    consumer: MqConsumer,
}

/// Resolves logical addresses and answers queries for advertised ones.
pub struct MicroServiceLookup {
    config: LookupConfig,
    queue: String,
    channel: MqChannel,
    serializers: Arc<SerializerRegistry>,
    state: Mutex<LookupState>,
    adverts: Mutex<HashMap<String, Advert>>,
    returned_listener: Mutex<Option<JoinHandle<()>>>,
}

/// Drops the pending entry however `resolve` exits.
struct PendingRegistration<'a> {
    lookup: &'a MicroServiceLookup,
    correlation_id: &'a str,
}

impl Drop for PendingRegistration<'_> {
    fn drop(&mut self) {
        self.lookup
            .state
            .lock()
            .pending
            .retain(|p| p.correlation_id != self.correlation_id);
    }
}

impl MicroServiceLookup {
    pub async fn new(connection: &MqConnection, config: LookupConfig) -> Result<Arc<Self>> {
        let channel = connection.create_channel().await?;
        let lookup = Arc::new(Self {
            queue: format!("medseek-lookup-{}", Uuid::new_v4().simple()),
            config,
            channel,
            serializers: Arc::new(SerializerRegistry::with_defaults()),
            state: Mutex::new(LookupState::default()),
            adverts: Mutex::new(HashMap::new()),
            returned_listener: Mutex::new(None),
        });

        let listener = tokio::spawn(listen_returned(
            lookup.channel.returned(),
            Arc::downgrade(&lookup),
        ));
        *lookup.returned_listener.lock() = Some(listener);
        debug!(queue = %lookup.queue, "lookup created");
        Ok(lookup)
    }

    pub fn config(&self) -> &LookupConfig {
        &self.config
    }

    /// Private queue the reply and update bindings share.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    fn address(&self, kind: &str, id: &str) -> MqAddress {
        MqAddress::new(format!("{}{kind}.{id}", self.config.prefix))
    }

    /// Register the reply and update endpoints with `locator`.
    ///
    /// Both are one-way bindings on an auto-delete queue private to this
    /// instance; the dispatcher serving `locator` delivers them.
    pub fn register(self: &Arc<Self>, locator: &MicroServiceLocator) -> Result<()> {
        let prefix = &self.config.prefix;
        let descriptors = vec![
            BindingDescriptor::new("reply", format!("{prefix}reply.#/{}", self.queue))
                .one_way(true)
                .auto_delete(true)
                .parameter::<LookupEntry>(),
            BindingDescriptor::new("update", format!("{prefix}update.#/{}", self.queue))
                .one_way(true)
                .auto_delete(true)
                .parameter::<LookupEntry>(),
        ];
        let lookup = Arc::downgrade(self);
        let factory: ServiceFactory = Arc::new(move || {
            let endpoint: Arc<dyn MicroService> = Arc::new(LookupEndpoint {
                lookup: lookup.clone(),
            });
            Ok(endpoint)
        });
        locator.register_with(LOOKUP_CONTRACT, descriptors, factory, None)
    }

    /// Resolve `address` within the configured timeout.
    ///
    /// Fails with [`Error::Disposed`] once the lookup is disposed; a wait
    /// that disposal interrupts ends as [`LookupOutcome::Canceled`].
    pub async fn resolve(&self, address: &MqAddress) -> Result<LookupOutcome> {
        self.resolve_with_timeout(address, self.config.timeout()).await
    }

    pub async fn resolve_with_timeout(
        &self,
        address: &MqAddress,
        timeout: Duration,
    ) -> Result<LookupOutcome> {
        let id = lookup_id(address);
        let correlation_id = Uuid::new_v4().simple().to_string();
        let (completion, outcome) = oneshot::channel();
        {
            let mut state = self.state.lock();
            if state.disposed {
                return Err(Error::disposed("lookup"));
            }
            if let Some(entry) = state.cache.get(&id) {
                debug!(address = %address, id, "lookup cache hit");
                return Ok(entry.outcome());
            }
            state.pending.push(PendingLookup {
                id: id.clone(),
                correlation_id: correlation_id.clone(),
                completion: Some(completion),
            });
        }
        let _registration = PendingRegistration {
            lookup: self,
            correlation_id: &correlation_id,
        };

        let body = self
            .serializers
            .serialize(&LookupQuery { id: id.clone() }, DEFAULT_CONTENT_TYPE)?;
        let properties = MessageProperties::new()
            .with_content_type(DEFAULT_CONTENT_TYPE)
            .with_correlation_id(correlation_id.clone())
            .with_reply_to(self.address("reply", &id));
        let published = match self.channel.create_publisher(&self.address("query", &id)) {
            Ok(publisher) => {
                let published = publisher.publish_mandatory(body, &properties).await;
                publisher.dispose().await;
                published
            }
            Err(err) => Err(err),
        };
        if let Err(err) = published {
            if self.state.lock().disposed {
                return Ok(LookupOutcome::Canceled);
            }
            return Err(err);
        }
        debug!(address = %address, id, "lookup query published");

        let outcome = match tokio::time::timeout(timeout, outcome).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => LookupOutcome::Canceled,
            Err(_) => LookupOutcome::TimedOut,
        };
        debug!(address = %address, ?outcome, "lookup finished");
        Ok(outcome)
    }

    /// Cached answer for `address`, if any.
    pub fn cached(&self, address: &MqAddress) -> Option<LookupOutcome> {
        self.state
            .lock()
            .cache
            .get(&lookup_id(address))
            .map(LookupEntry::outcome)
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Answer queries for `unresolved` with `resolved` and announce it.
    pub async fn advertise(self: &Arc<Self>, unresolved: &MqAddress, resolved: &MqAddress) -> Result<()> {
        self.ensure_not_disposed()?;
        let id = lookup_id(unresolved);

        let replaced = match self.adverts.lock().get_mut(&id) {
            Some(advert) => {
                advert.resolved = resolved.clone();
                true
            }
            None => false,
        };
        if !replaced {
            let address = MqAddress::new(format!(
                "{}query.{id}/{}-{id}",
                self.config.prefix, self.queue
            ));
            let consumer = self.channel.create_consumer(&address, false, true).await?;
            let lookup = Arc::downgrade(self);
            let advertised = id.clone();
            let registered = consumer.on_received(move |context| {
                let Some(lookup) = lookup.upgrade() else {
                    return;
                };
                let id = advertised.clone();
                tokio::spawn(async move {
                    if let Err(err) = lookup.answer_query(&context, &id).await {
                        warn!(id, error = %err, "lookup query not answered");
                    }
                });
            });
            if let Err(err) = registered {
                consumer.dispose().await;
                return Err(err);
            }
            let previous = self.adverts.lock().insert(
                id.clone(),
                Advert {
                    resolved: resolved.clone(),
                    consumer,
                },
            );
            if let Some(previous) = previous {
                previous.consumer.dispose().await;
            }
        }

        info!(unresolved = %unresolved, resolved = %resolved, "address advertised");
        self.announce(LookupEntry {
            id,
            address: Some(resolved.clone()),
            kind: LookupResultKind::Update,
        })
        .await
    }

    /// Stop answering for `unresolved` and announce that it is gone.
    pub async fn withdraw(&self, unresolved: &MqAddress) -> Result<()> {
        self.ensure_not_disposed()?;
        let id = lookup_id(unresolved);
        let advert = self.adverts.lock().remove(&id);
        let Some(advert) = advert else {
            return Ok(());
        };
        advert.consumer.dispose().await;

        info!(unresolved = %unresolved, "address withdrawn");
        self.announce(LookupEntry {
            id,
            address: None,
            kind: LookupResultKind::Update,
        })
        .await
    }

    fn ensure_not_disposed(&self) -> Result<()> {
        if self.state.lock().disposed {
            Err(Error::disposed("lookup"))
        } else {
            Ok(())
        }
    }

    /// Cache `entry` locally and publish it as an update.
    async fn announce(&self, entry: LookupEntry) -> Result<()> {
        self.state.lock().cache.insert(entry.id.clone(), entry.clone());
        let body = self.serializers.serialize(&entry, DEFAULT_CONTENT_TYPE)?;
        let properties = MessageProperties::new().with_content_type(DEFAULT_CONTENT_TYPE);
        let publisher = self.channel.create_publisher(&self.address("update", &entry.id))?;
        let published = publisher.publish(body, &properties).await;
        publisher.dispose().await;
        published
    }

    async fn answer_query(&self, context: &MessageContext, id: &str) -> Result<()> {
        let resolved = self.adverts.lock().get(id).map(|a| a.resolved.clone());
        let (Some(resolved), Some(reply_to)) = (resolved, context.reply_to()) else {
            return Ok(());
        };
        let entry = LookupEntry {
            id: id.to_string(),
            address: Some(resolved),
            kind: LookupResultKind::Reply,
        };
        let body = self.serializers.serialize(&entry, DEFAULT_CONTENT_TYPE)?;
        let mut properties = MessageProperties::new().with_content_type(DEFAULT_CONTENT_TYPE);
        properties.correlation_id = context.correlation_id().map(str::to_string);

        let publisher = self.channel.create_publisher(reply_to)?;
        let published = publisher.publish(body, &properties).await;
        publisher.dispose().await;
        debug!(id, reply_to = %reply_to, "lookup query answered");
        published
    }

    fn on_reply(&self, context: &MessageContext, entry: LookupEntry) {
        let outcome = entry.outcome();
        let mut state = self.state.lock();
        state.cache.insert(entry.id.clone(), entry);
        if let Some(correlation_id) = context.correlation_id() {
            state.complete(&outcome, |p| p.correlation_id == correlation_id);
        }
    }

    fn on_update(&self, entry: LookupEntry) {
        let outcome = entry.outcome();
        let mut state = self.state.lock();
        let id = entry.id.clone();
        state.cache.insert(entry.id.clone(), entry);
        let completed = state.complete(&outcome, |p| p.id == id);
        debug!(id, completed, "lookup update applied");
    }

    fn on_returned(&self, message: &ReturnedMessage) {
        let Some(correlation_id) = message.properties.correlation_id.as_deref() else {
            return;
        };
        let mut state = self.state.lock();
        let Some(id) = state
            .pending
            .iter()
            .find(|p| p.correlation_id == correlation_id)
            .map(|p| p.id.clone())
        else {
            return;
        };
        debug!(id, reply_code = message.reply_code, "lookup query returned");
        state.cache.insert(
            id.clone(),
            LookupEntry {
                id,
                address: None,
                kind: LookupResultKind::Returned,
            },
        );
        state.complete(&LookupOutcome::Unresolved, |p| p.correlation_id == correlation_id);
    }
}

async fn listen_returned(
    mut returned: broadcast::Receiver<ReturnedMessage>,
    lookup: Weak<MicroServiceLookup>,
) {
    loop {
        match returned.recv().await {
            Ok(message) => {
                let Some(lookup) = lookup.upgrade() else {
                    break;
                };
                lookup.on_returned(&message);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "lookup missed returned messages");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[async_trait]
impl Disposable for MicroServiceLookup {
    async fn dispose(&self) {
        {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            let canceled = state.complete(&LookupOutcome::Canceled, |_| true);
            if canceled > 0 {
                debug!(canceled, "pending lookups canceled");
            }
        }

        if let Some(listener) = self.returned_listener.lock().take() {
            listener.abort();
        }
        let adverts: Vec<Advert> = self.adverts.lock().drain().map(|(_, a)| a).collect();
        for advert in adverts {
            advert.consumer.dispose().await;
        }
        self.channel.dispose().await;
        debug!(queue = %self.queue, "lookup disposed");
    }

    fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }
}

/// Micro-service face of a lookup, invoked by its dispatcher.
struct LookupEndpoint {
    lookup: Weak<MicroServiceLookup>,
}

#[async_trait]
impl MicroService for LookupEndpoint {
    fn contract(&self) -> &'static str {
        LOOKUP_CONTRACT
    }

    async fn invoke(&self, method: &str, invocation: Invocation) -> Result<Reply> {
        let lookup = self.lookup.upgrade().ok_or_else(|| Error::disposed("lookup"))?;
        let entry: LookupEntry = invocation.parameter()?;
        match method {
            "reply" => lookup.on_reply(invocation.context(), entry),
            "update" => lookup.on_update(entry),
            other => return Err(Error::method_not_found(LOOKUP_CONTRACT, other)),
        }
        Ok(Reply::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;

    async fn lookup(broker: &str) -> (MqConnection, Arc<MicroServiceLookup>) {
        let connection = MqConnection::open_url(&format!("memory://{broker}"))
            .await
            .unwrap();
        let lookup = MicroServiceLookup::new(&connection, LookupConfig::default())
            .await
            .unwrap();
        (connection, lookup)
    }

    #[test]
    fn test_lookup_id_is_stable() {
        let a = lookup_id(&"topic://orders/order.created".into());
        assert_eq!(a, lookup_id(&"topic://orders/order.created".into()));
        assert_ne!(a, lookup_id(&"topic://orders/order.deleted".into()));
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_entry_wire_form() {
        let entry = LookupEntry {
            id: "abc".into(),
            address: Some("topic://ex/key".into()),
            kind: LookupResultKind::Reply,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"id": "abc", "address": "topic://ex/key", "kind": "reply"})
        );
        let decoded: LookupEntry = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, entry);
        assert_eq!(entry.outcome(), LookupOutcome::Resolved("topic://ex/key".into()));
    }

    #[tokio::test]
    async fn test_returned_query_is_unresolved_and_cached() {
        let (connection, lookup) = lookup("lookup-unit-returned").await;
        let address = MqAddress::from("topic://nowhere/key");

        let outcome = lookup.resolve(&address).await.unwrap();
        assert_eq!(outcome, LookupOutcome::Unresolved);
        assert_eq!(lookup.cached(&address), Some(LookupOutcome::Unresolved));
        assert_eq!(lookup.pending_count(), 0);

        connection.dispose().await;
    }

    #[tokio::test]
    async fn test_unanswered_query_times_out() {
        let (connection, lookup) = lookup("lookup-unit-timeout").await;
        let channel = connection.create_channel().await.unwrap();
        let probe = MqAddress::new(format!("{}query.#/probe", lookup.config().prefix));
        let _consumer = channel.create_consumer(&probe, false, true).await.unwrap();

        let address = MqAddress::from("topic://silent/key");
        let outcome = lookup
            .resolve_with_timeout(&address, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(outcome, LookupOutcome::TimedOut);
        assert_eq!(lookup.cached(&address), None);
        assert_eq!(lookup.pending_count(), 0);
        assert_eq!(
            MemoryBroker::named("lookup-unit-timeout").queue_depth("probe"),
            Some(1)
        );

        connection.dispose().await;
    }

    #[tokio::test]
    async fn test_dispose_cancels_pending_resolve() {
        let (connection, lookup) = lookup("lookup-unit-cancel").await;
        let channel = connection.create_channel().await.unwrap();
        let probe = MqAddress::new(format!("{}query.#/probe", lookup.config().prefix));
        let _consumer = channel.create_consumer(&probe, false, true).await.unwrap();

        let resolving = {
            let lookup = lookup.clone();
            tokio::spawn(async move {
                lookup
                    .resolve_with_timeout(&"topic://slow/key".into(), Duration::from_secs(30))
                    .await
            })
        };
        let broker = MemoryBroker::named("lookup-unit-cancel");
        while broker.queue_depth("probe") != Some(1) {
            tokio::task::yield_now().await;
        }
        lookup.dispose().await;

        assert_eq!(resolving.await.unwrap().unwrap(), LookupOutcome::Canceled);
        let err = lookup
            .resolve(&"topic://slow/key".into())
            .await
            .err()
            .expect("the lookup is disposed");
        assert!(matches!(err, Error::Disposed { .. }));
        assert!(lookup.advertise(&"a".into(), &"b".into()).await.is_err());

        connection.dispose().await;
    }

    #[tokio::test]
    async fn test_advertise_caches_locally() {
        let (connection, lookup) = lookup("lookup-unit-advertise").await;
        let logical = MqAddress::from("topic://svc/orders");
        let physical = MqAddress::from("topic://svc/orders.eu-1");

        lookup.advertise(&logical, &physical).await.unwrap();
        assert_eq!(
            lookup.resolve(&logical).await.unwrap(),
            LookupOutcome::Resolved(physical)
        );

        lookup.withdraw(&logical).await.unwrap();
        assert_eq!(lookup.cached(&logical), Some(LookupOutcome::Unresolved));

        connection.dispose().await;
    }
}
