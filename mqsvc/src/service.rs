//! Micro-service contracts and the invocation surface handed to them

use crate::binding::BindingDescriptor;
use crate::message::MessageContext;
use crate::serializer::{SerializerRegistry, TypeDescriptor};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// A component whose methods are bound to message addresses.
///
/// Usually implemented by `#[micro_service]`, which generates a `match` over
/// the bound method names.
#[async_trait]
pub trait MicroService: Send + Sync + 'static {
    /// Contract name the bindings were declared under.
    fn contract(&self) -> &'static str;

    /// Run `method` for one inbound message.
    async fn invoke(&self, method: &str, invocation: Invocation) -> Result<Reply>;
}

/// Static binding metadata of a micro-service type.
pub trait MicroServiceContract: MicroService + Sized {
    const CONTRACT: &'static str;

    fn bindings() -> Vec<BindingDescriptor>;
}

/// One inbound message on its way into a bound method.
pub struct Invocation {
    context: MessageContext,
    serializers: Arc<SerializerRegistry>,
    content_type: String,
}

impl Invocation {
    /// `default_content_type` applies when the message carries none.
    pub fn new(
        context: MessageContext,
        serializers: Arc<SerializerRegistry>,
        default_content_type: &str,
    ) -> Self {
        let content_type = context
            .content_type()
            .filter(|ct| !ct.is_empty())
            .unwrap_or(default_content_type)
            .to_string();
        Self {
            context,
            serializers,
            content_type,
        }
    }

    pub fn context(&self) -> &MessageContext {
        &self.context
    }

    /// Content type used for the parameter and the reply.
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Read the body as the method's parameter.
    pub fn parameter<T>(&self) -> Result<T>
    where
        T: DeserializeOwned + 'static,
    {
        self.serializers
            .deserialize(self.context.body(), &self.content_type)
    }

    /// Serialize a method result; `()` becomes an empty reply.
    pub fn reply<R>(&self, value: &R) -> Result<Reply>
    where
        R: Serialize + 'static,
    {
        if TypeDescriptor::of::<R>().is::<()>() {
            return Ok(Reply::empty());
        }
        let body = self.serializers.serialize(value, &self.content_type)?;
        Ok(Reply::new(body, self.content_type.clone()))
    }
}

/// Result of an invocation, ready to be published to the reply-to address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    body: Bytes,
    content_type: Option<String>,
}

impl Reply {
    /// The reply of a method without a result.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(body: Bytes, content_type: impl Into<String>) -> Self {
        Self {
            body,
            content_type: Some(content_type.into()),
        }
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageProperties;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
    }

    fn invocation(body: &'static [u8], content_type: Option<&str>) -> Invocation {
        let mut properties = MessageProperties::new();
        properties.content_type = content_type.map(str::to_string);
        let context =
            MessageContext::delivered(Bytes::from_static(body), "ping", properties, || {});
        Invocation::new(
            context,
            Arc::new(SerializerRegistry::with_defaults()),
            "application/json",
        )
    }

    #[test]
    fn test_default_content_type_applies() {
        let invocation = invocation(br#"{"seq":3}"#, None);
        assert_eq!(invocation.content_type(), "application/json");
        assert_eq!(invocation.parameter::<Ping>().unwrap(), Ping { seq: 3 });
    }

    #[test]
    fn test_reply_uses_request_content_type() {
        let invocation = invocation(b"hi", Some("text/plain"));
        let text: String = invocation.parameter().unwrap();
        let reply = invocation.reply(&text.to_uppercase()).unwrap();
        assert_eq!(reply.body(), &Bytes::from_static(b"HI"));
        assert_eq!(reply.content_type(), Some("text/plain"));
    }

    #[test]
    fn test_unit_result_is_empty_reply() {
        let invocation = invocation(b"", None);
        let reply = invocation.reply(&()).unwrap();
        assert!(reply.is_empty());
        assert_eq!(reply.content_type(), None);
    }
}
