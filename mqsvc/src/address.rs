//! Address model
//!
//! Addresses are opaque strings with value equality. The structured forms
//! ([`MqConsumerAddress`], [`MqPublisherAddress`]) are produced by a broker
//! plugin from the wire form
//! `{exchangeType}://{exchangeName}/{routingKey}[/{queueName}]`.
//! A string without a scheme addresses the default direct exchange, with the
//! whole string used as both routing key and queue name.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

const SCHEME_SEPARATOR: &str = "://";

/// Opaque, immutable, cheaply cloned address.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MqAddress(Arc<str>);

impl MqAddress {
    pub fn new(value: impl Into<Arc<str>>) -> Self {
        Self(value.into())
    }

    /// Build the wire form from its parts.
    pub fn compose(
        exchange_type: &ExchangeType,
        exchange: &str,
        routing_key: &str,
        queue: Option<&str>,
    ) -> Self {
        match queue {
            Some(queue) => Self::new(format!(
                "{exchange_type}{SCHEME_SEPARATOR}{exchange}/{routing_key}/{queue}"
            )),
            None => Self::new(format!(
                "{exchange_type}{SCHEME_SEPARATOR}{exchange}/{routing_key}"
            )),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for MqAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for MqAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MqAddress({})", &self.0)
    }
}

impl From<&str> for MqAddress {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for MqAddress {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl AsRef<str> for MqAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Exchange kind named by the address scheme.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExchangeType {
    Direct,
    Topic,
    Fanout,
    Headers,
    /// Scheme the runtime does not understand; kept so matching can reject it.
    Other(String),
}

impl ExchangeType {
    pub fn parse(scheme: &str) -> Self {
        match scheme {
            "direct" => Self::Direct,
            "topic" => Self::Topic,
            "fanout" => Self::Fanout,
            "headers" => Self::Headers,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Direct => "direct",
            Self::Topic => "topic",
            Self::Fanout => "fanout",
            Self::Headers => "headers",
            Self::Other(other) => other,
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed components of an address in wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressParts {
    pub exchange_type: ExchangeType,
    pub exchange: String,
    pub routing_key: String,
    pub queue: Option<String>,
}

impl AddressParts {
    pub fn parse(address: &MqAddress) -> Result<Self> {
        let value = address.as_str();
        if value.is_empty() {
            return Err(Error::invalid_address(value, "address is empty"));
        }

        let Some((scheme, rest)) = value.split_once(SCHEME_SEPARATOR) else {
            return Ok(Self {
                exchange_type: ExchangeType::Direct,
                exchange: String::new(),
                routing_key: value.to_string(),
                queue: None,
            });
        };

        if scheme.is_empty() {
            return Err(Error::invalid_address(value, "missing exchange type"));
        }

        let (exchange, remainder) = rest.split_once('/').unwrap_or((rest, ""));
        let (routing_key, queue) = match remainder.split_once('/') {
            Some((routing_key, queue)) => (routing_key, Some(queue)),
            None => (remainder, None),
        };

        if queue.is_some_and(|q| q.is_empty() || q.contains('/')) {
            return Err(Error::invalid_address(value, "malformed queue name"));
        }

        Ok(Self {
            exchange_type: ExchangeType::parse(scheme),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            queue: queue.map(str::to_string),
        })
    }

    /// Queue name, falling back to the routing key when none was given.
    pub fn queue_name(&self) -> &str {
        self.queue.as_deref().unwrap_or(&self.routing_key)
    }
}

/// Consumer-side form of an address.
///
/// `source_key` identifies the physical queue; consumers with the same key
/// share one queue with several routing bindings.
#[derive(Clone)]
pub struct MqConsumerAddress {
    address: MqAddress,
    pub exchange_type: ExchangeType,
    pub exchange: String,
    pub routing_key: String,
    pub queue: String,
}

impl MqConsumerAddress {
    pub fn from_parts(address: MqAddress, parts: AddressParts) -> Result<Self> {
        let queue = parts.queue_name().to_string();
        if queue.is_empty() {
            return Err(Error::invalid_address(
                address.as_str(),
                "consumer address needs a queue name or routing key",
            ));
        }
        Ok(Self {
            address,
            exchange_type: parts.exchange_type,
            exchange: parts.exchange,
            routing_key: parts.routing_key,
            queue,
        })
    }

    pub fn address(&self) -> &MqAddress {
        &self.address
    }

    pub fn source_key(&self) -> &str {
        &self.queue
    }
}

/// Publisher-side form of an address.
#[derive(Clone)]
pub struct MqPublisherAddress {
    address: MqAddress,
    pub exchange_type: ExchangeType,
    pub exchange: String,
    pub routing_key: String,
}

impl MqPublisherAddress {
    pub fn from_parts(address: MqAddress, parts: AddressParts) -> Self {
        Self {
            address,
            exchange_type: parts.exchange_type,
            exchange: parts.exchange,
            routing_key: parts.routing_key,
        }
    }

    pub fn address(&self) -> &MqAddress {
        &self.address
    }

    /// Same exchange, different routing key.
    pub fn with_routing_key(&self, routing_key: &str) -> Self {
        Self {
            address: MqAddress::compose(&self.exchange_type, &self.exchange, routing_key, None),
            exchange_type: self.exchange_type.clone(),
            exchange: self.exchange.clone(),
            routing_key: routing_key.to_string(),
        }
    }
}

// Equality of the structured forms is the equality of the underlying string.
macro_rules! address_equality {
    ($ty:ty) => {
        impl PartialEq for $ty {
            fn eq(&self, other: &Self) -> bool {
                self.address == other.address
            }
        }

        impl Eq for $ty {}

        impl Hash for $ty {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.address.hash(state)
            }
        }

        impl PartialEq<MqAddress> for $ty {
            fn eq(&self, other: &MqAddress) -> bool {
                &self.address == other
            }
        }

        impl PartialEq<$ty> for MqAddress {
            fn eq(&self, other: &$ty) -> bool {
                self == &other.address
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.address, f)
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($ty), "({})"), self.address)
            }
        }
    };
}

address_equality!(MqConsumerAddress);
address_equality!(MqPublisherAddress);

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of<T: Hash>(value: &T) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_equality_follows_string_value() {
        let a = MqAddress::from("topic://ex/key/queue");
        let b = MqAddress::from("topic://ex/key/queue".to_string());
        let c = MqAddress::from("topic://ex/key/other");

        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_ne!(a, c);
        assert_ne!(hash_of(&a), hash_of(&c));
    }

    #[test]
    fn test_structured_forms_compare_by_value() {
        let address = MqAddress::from("topic://ex/key/queue");
        let consumer =
            MqConsumerAddress::from_parts(address.clone(), AddressParts::parse(&address).unwrap())
                .unwrap();
        let publisher =
            MqPublisherAddress::from_parts(address.clone(), AddressParts::parse(&address).unwrap());

        assert_eq!(consumer, address);
        assert_eq!(publisher, address);
        assert_eq!(hash_of(&consumer), hash_of(&address));
        assert_eq!(consumer.source_key(), "queue");
    }

    #[test]
    fn test_parse_full_form() {
        let parts = AddressParts::parse(&"topic://ex/a.b.*/q1".into()).unwrap();
        assert_eq!(parts.exchange_type, ExchangeType::Topic);
        assert_eq!(parts.exchange, "ex");
        assert_eq!(parts.routing_key, "a.b.*");
        assert_eq!(parts.queue.as_deref(), Some("q1"));
    }

    #[test]
    fn test_routing_key_doubles_as_queue() {
        let parts = AddressParts::parse(&"direct://ex/HelperMicroService".into()).unwrap();
        assert_eq!(parts.queue, None);
        assert_eq!(parts.queue_name(), "HelperMicroService");
    }

    #[test]
    fn test_bare_string_is_default_direct() {
        let parts = AddressParts::parse(&"A.B.C.D".into()).unwrap();
        assert_eq!(parts.exchange_type, ExchangeType::Direct);
        assert_eq!(parts.exchange, "");
        assert_eq!(parts.routing_key, "A.B.C.D");
    }

    #[test]
    fn test_unknown_scheme_is_preserved() {
        let parts = AddressParts::parse(&"x-custom://ex/key".into()).unwrap();
        assert_eq!(parts.exchange_type, ExchangeType::Other("x-custom".to_string()));
    }

    #[test]
    fn test_invalid_addresses() {
        assert!(AddressParts::parse(&"".into()).is_err());
        assert!(AddressParts::parse(&"://ex/key".into()).is_err());
        assert!(AddressParts::parse(&"topic://ex/key/q/extra".into()).is_err());

        let address = MqAddress::from("fanout://ex");
        let parts = AddressParts::parse(&address).unwrap();
        assert!(MqConsumerAddress::from_parts(address, parts).is_err());
    }

    #[test]
    fn test_compose_round_trips_through_parse() {
        let address = MqAddress::compose(&ExchangeType::Topic, "ex", "k.#", Some("q"));
        assert_eq!(address.as_str(), "topic://ex/k.#/q");
        let parts = AddressParts::parse(&address).unwrap();
        assert_eq!(parts.queue_name(), "q");
    }
}
