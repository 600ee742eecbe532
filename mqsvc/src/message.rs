//! Message properties, per-message context and returned-message records

use crate::address::MqAddress;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Transport-neutral message properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// MIME type used to pick a serializer
    pub content_type: Option<String>,

    /// Correlates replies (and returned messages) with their request
    pub correlation_id: Option<String>,

    reply_to: Option<MqAddress>,

    /// Transport-specific headers
    pub extended: HashMap<String, String>,
}

impl MessageProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: MqAddress) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    pub fn reply_to(&self) -> Option<&MqAddress> {
        self.reply_to.as_ref()
    }

    pub fn set_reply_to(&mut self, reply_to: Option<MqAddress>) {
        self.reply_to = reply_to;
    }

    /// String view of the reply-to field.
    pub fn reply_to_string(&self) -> Option<&str> {
        self.reply_to.as_ref().map(MqAddress::as_str)
    }

    /// Setting the string view replaces the address view; empty clears both.
    pub fn set_reply_to_string(&mut self, reply_to: Option<&str>) {
        self.reply_to = reply_to.filter(|s| !s.is_empty()).map(MqAddress::from);
    }

    pub fn extended(&self, key: &str) -> Option<&str> {
        self.extended.get(key).map(String::as_str)
    }

    pub fn set_extended(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.extended.insert(key.into(), value.into());
    }
}

type AckCallback = Box<dyn FnOnce() + Send>;

struct AckState {
    acknowledged: AtomicBool,
    callback: Mutex<Option<AckCallback>>,
}

impl AckState {
    fn new(callback: Option<AckCallback>) -> Self {
        Self {
            acknowledged: AtomicBool::new(false),
            callback: Mutex::new(callback),
        }
    }
}

struct ContextInner {
    body: Bytes,
    routing_key: String,
    properties: MessageProperties,
    ack: AckState,
}

/// A message as seen by handlers: body, routing key, properties and the
/// acknowledgement hook of the delivery it came from.
///
/// Clones share the same delivery, so acknowledging any clone acknowledges
/// all of them. Use [`MessageContext::detached`] for an independent copy.
#[derive(Clone)]
pub struct MessageContext {
    inner: Arc<ContextInner>,
}

impl MessageContext {
    /// Outbound context with no acknowledgement hook.
    pub fn new(body: impl Into<Bytes>, properties: MessageProperties) -> Self {
        Self::build(body.into(), String::new(), properties, None)
    }

    /// Inbound context; `on_ack` runs on the first [`ack`](Self::ack) only.
    pub fn delivered<F>(
        body: Bytes,
        routing_key: impl Into<String>,
        properties: MessageProperties,
        on_ack: F,
    ) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::build(body, routing_key.into(), properties, Some(Box::new(on_ack)))
    }

    fn build(
        body: Bytes,
        routing_key: String,
        properties: MessageProperties,
        callback: Option<AckCallback>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                body,
                routing_key,
                properties,
                ack: AckState::new(callback),
            }),
        }
    }

    pub fn body(&self) -> &Bytes {
        &self.inner.body
    }

    pub fn routing_key(&self) -> &str {
        &self.inner.routing_key
    }

    pub fn properties(&self) -> &MessageProperties {
        &self.inner.properties
    }

    pub fn content_type(&self) -> Option<&str> {
        self.inner.properties.content_type.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.inner.properties.correlation_id.as_deref()
    }

    pub fn reply_to(&self) -> Option<&MqAddress> {
        self.inner.properties.reply_to()
    }

    /// Acknowledge the delivery. Only the first call has an effect.
    pub fn ack(&self) {
        if self.inner.ack.acknowledged.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(callback) = self.inner.ack.callback.lock().take() {
            callback();
        }
    }

    pub fn is_acknowledged(&self) -> bool {
        self.inner.ack.acknowledged.load(Ordering::Acquire)
    }

    /// Independent copy: own properties, same body, no acknowledgement hook.
    pub fn detached(&self) -> Self {
        Self::build(
            self.inner.body.clone(),
            self.inner.routing_key.clone(),
            self.inner.properties.clone(),
            None,
        )
    }

    /// Independent copy with edited properties, for re-publishing.
    pub fn detached_with<F>(&self, edit: F) -> Self
    where
        F: FnOnce(&mut MessageProperties),
    {
        let mut properties = self.inner.properties.clone();
        edit(&mut properties);
        Self::build(
            self.inner.body.clone(),
            self.inner.routing_key.clone(),
            properties,
            None,
        )
    }
}

impl fmt::Debug for MessageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageContext")
            .field("routing_key", &self.inner.routing_key)
            .field("body_len", &self.inner.body.len())
            .field("properties", &self.inner.properties)
            .field("acknowledged", &self.is_acknowledged())
            .finish()
    }
}

/// A mandatory publish the broker could not route.
#[derive(Debug, Clone)]
pub struct ReturnedMessage {
    pub address: MqAddress,
    pub body: Bytes,
    pub properties: MessageProperties,
    pub reply_code: u16,
    pub reply_text: String,
}

/// AMQP reply code for an unroutable mandatory message.
pub const REPLY_CODE_NO_ROUTE: u16 = 312;
