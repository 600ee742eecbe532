//! Content-type based payload serialization
//!
//! Serializers are tried in registration order; the first one that reports
//! it can handle a (type, content type) pair wins. Selection always happens
//! before any bytes are read or written, so a missing serializer never
//! leaves a half-written body behind.
//!
//! Serializers work on the `serde_json::Value` data model so the trait stays
//! object safe; [`SerializerRegistry`] converts typed values at the edges.
//! [`Bytes`] payloads are passed through untouched by every content type.

use crate::{Error, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// How a payload type is represented on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    /// `Bytes`: the body itself, never (de)serialized
    Raw,
    /// `String`
    Text,
    /// Anything else serde can handle
    Structured,
}

/// Runtime description of a parameter or return type.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TypeDescriptor {
    name: &'static str,
    id: TypeId,
    kind: TypeKind,
}

impl TypeDescriptor {
    pub fn of<T: 'static>() -> Self {
        let id = TypeId::of::<T>();
        let kind = if id == TypeId::of::<Bytes>() {
            TypeKind::Raw
        } else if id == TypeId::of::<String>() {
            TypeKind::Text
        } else {
            TypeKind::Structured
        };
        Self {
            name: std::any::type_name::<T>(),
            id,
            kind,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    pub fn is_raw(&self) -> bool {
        self.kind == TypeKind::Raw
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeDescriptor({})", self.name)
    }
}

/// A payload format.
pub trait Serializer: Send + Sync + 'static {
    /// Content types produced by this serializer, preferred first.
    fn content_types(&self) -> &[&'static str];

    fn can_serialize(&self, ty: &TypeDescriptor, content_type: &str) -> bool;

    fn can_deserialize(&self, ty: &TypeDescriptor, body: &Bytes, content_type: &str) -> bool;

    fn serialize(&self, value: &Value) -> Result<Bytes>;

    fn deserialize(&self, body: &Bytes) -> Result<Value>;
}

/// Media type without parameters, e.g. `application/json` for
/// `application/json; charset=utf-8`.
pub fn media_type(content_type: &str) -> &str {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
}

fn accepts(serializer: &dyn Serializer, content_type: &str) -> bool {
    let media = media_type(content_type);
    serializer
        .content_types()
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(media))
}

/// `application/json` and `text/json`
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn content_types(&self) -> &[&'static str] {
        &["application/json", "text/json"]
    }

    fn can_serialize(&self, ty: &TypeDescriptor, content_type: &str) -> bool {
        !ty.is_raw() && accepts(self, content_type)
    }

    fn can_deserialize(&self, ty: &TypeDescriptor, _body: &Bytes, content_type: &str) -> bool {
        !ty.is_raw() && accepts(self, content_type)
    }

    fn serialize(&self, value: &Value) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn deserialize(&self, body: &Bytes) -> Result<Value> {
        // An empty body reads as null so `()` and `Option<T>` parameters work.
        if body.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(body)?)
    }
}

/// `text/plain`, for `String` payloads only
#[derive(Debug, Default, Clone, Copy)]
pub struct TextSerializer;

impl Serializer for TextSerializer {
    fn content_types(&self) -> &[&'static str] {
        &["text/plain"]
    }

    fn can_serialize(&self, ty: &TypeDescriptor, content_type: &str) -> bool {
        ty.kind() == TypeKind::Text && accepts(self, content_type)
    }

    fn can_deserialize(&self, ty: &TypeDescriptor, body: &Bytes, content_type: &str) -> bool {
        ty.kind() == TypeKind::Text
            && accepts(self, content_type)
            && std::str::from_utf8(body).is_ok()
    }

    fn serialize(&self, value: &Value) -> Result<Bytes> {
        match value {
            Value::String(text) => Ok(Bytes::copy_from_slice(text.as_bytes())),
            other => Err(Error::serialization_msg(format!(
                "text/plain can only carry strings, got {other}"
            ))),
        }
    }

    fn deserialize(&self, body: &Bytes) -> Result<Value> {
        let text = std::str::from_utf8(body)
            .map_err(|e| Error::serialization("body is not valid UTF-8", e))?;
        Ok(Value::String(text.to_string()))
    }
}

/// Ordered serializer list.
#[derive(Clone, Default)]
pub struct SerializerRegistry {
    serializers: Vec<Arc<dyn Serializer>>,
}

impl SerializerRegistry {
    /// An empty registry; only raw payloads can be handled.
    pub fn new() -> Self {
        Self::default()
    }

    /// JSON first, then plain text.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.push(Arc::new(JsonSerializer));
        registry.push(Arc::new(TextSerializer));
        registry
    }

    /// Append `serializer`; earlier entries keep precedence.
    pub fn push(&mut self, serializer: Arc<dyn Serializer>) {
        self.serializers.push(serializer);
    }

    pub fn len(&self) -> usize {
        self.serializers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.serializers.is_empty()
    }

    pub fn find_serializer(
        &self,
        ty: &TypeDescriptor,
        content_type: &str,
    ) -> Result<Arc<dyn Serializer>> {
        self.serializers
            .iter()
            .find(|s| s.can_serialize(ty, content_type))
            .cloned()
            .ok_or_else(|| Error::serializer_not_found(ty.name(), content_type))
    }

    pub fn find_deserializer(
        &self,
        ty: &TypeDescriptor,
        body: &Bytes,
        content_type: &str,
    ) -> Result<Arc<dyn Serializer>> {
        self.serializers
            .iter()
            .find(|s| s.can_deserialize(ty, body, content_type))
            .cloned()
            .ok_or_else(|| Error::serializer_not_found(ty.name(), content_type))
    }

    pub fn serialize<T>(&self, value: &T, content_type: &str) -> Result<Bytes>
    where
        T: Serialize + 'static,
    {
        let ty = TypeDescriptor::of::<T>();
        if ty.is_raw() {
            if let Some(raw) = (value as &dyn Any).downcast_ref::<Bytes>() {
                return Ok(raw.clone());
            }
        }
        let serializer = self.find_serializer(&ty, content_type)?;
        let value = serde_json::to_value(value)?;
        serializer.serialize(&value)
    }

    pub fn deserialize<T>(&self, body: &Bytes, content_type: &str) -> Result<T>
    where
        T: DeserializeOwned + 'static,
    {
        let ty = TypeDescriptor::of::<T>();
        if ty.is_raw() {
            let raw: Box<dyn Any> = Box::new(body.clone());
            if let Ok(raw) = raw.downcast::<T>() {
                return Ok(*raw);
            }
        }
        let serializer = self.find_deserializer(&ty, body, content_type)?;
        let value = serializer.deserialize(body)?;
        serde_json::from_value(value).map_err(|e| {
            Error::serialization(format!("cannot read {} from {content_type}", ty.name()), e)
        })
    }
}
