//! Error types for the mqsvc runtime

use thiserror::Error;

/// Main error type for mqsvc operations
#[derive(Error, Debug)]
pub enum Error {
    /// Transport layer errors reported by a broker driver
    #[error("Transport layer error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Connection management errors
    #[error("Connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Operation attempted on a resource that was already disposed
    #[error("Cannot access a disposed {resource}")]
    Disposed { resource: &'static str },

    /// A queue was redeclared with properties that conflict with the existing queue
    #[error("Queue '{queue}' properties mismatch: {message}")]
    QueuePropertiesMismatch { queue: String, message: String },

    /// A mandatory message came back from the broker instead of a reply
    #[error("Message to '{address}' returned by broker: {reply_code} {reply_text}")]
    Unroutable {
        address: String,
        reply_code: u16,
        reply_text: String,
    },

    /// Operation or configuration the runtime refuses to interpret
    #[error("Not supported: {message}")]
    NotSupported { message: String },

    /// No serializer accepted the requested type and content type
    #[error("No serializer for type '{type_name}' with content type '{content_type}'")]
    SerializerNotFound {
        type_name: String,
        content_type: String,
    },

    /// Serialization and deserialization errors
    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Address string could not be parsed
    #[error("Invalid address '{address}': {message}")]
    InvalidAddress { address: String, message: String },

    /// Lifecycle state machine violations (start twice, stop before start)
    #[error("Invalid state for {component}: {message}")]
    InvalidState {
        component: &'static str,
        message: String,
    },

    /// Timeout errors
    #[error("Operation timed out after {duration_ms}ms: {operation}")]
    Timeout { operation: String, duration_ms: u64 },

    /// Waiting operation abandoned because its owner was disposed
    #[error("Operation canceled: {operation}")]
    Canceled { operation: String },

    /// No binding matched an inbound message
    #[error("No binding matches routing key '{routing_key}'")]
    BindingNotFound { routing_key: String },

    /// No registered component implements a contract
    #[error("Service '{name}' not found")]
    ServiceNotFound { name: String },

    /// Method invocation errors
    #[error("Method '{method}' not found on service '{service}'")]
    MethodNotFound { service: String, method: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// IO errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// Runtime errors
    #[error("Runtime error: {message}")]
    Runtime {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Create a transport error with source
    pub fn transport<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a transport error without source
    pub fn transport_msg(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error without source
    pub fn connection_msg(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    pub fn disposed(resource: &'static str) -> Self {
        Self::Disposed { resource }
    }

    pub fn queue_properties_mismatch(queue: impl Into<String>, message: impl Into<String>) -> Self {
        Self::QueuePropertiesMismatch {
            queue: queue.into(),
            message: message.into(),
        }
    }

    pub fn unroutable(
        address: impl Into<String>,
        reply_code: u16,
        reply_text: impl Into<String>,
    ) -> Self {
        Self::Unroutable {
            address: address.into(),
            reply_code,
            reply_text: reply_text.into(),
        }
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::NotSupported {
            message: message.into(),
        }
    }

    pub fn serializer_not_found(type_name: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self::SerializerNotFound {
            type_name: type_name.into(),
            content_type: content_type.into(),
        }
    }

    /// Create a serialization error with source
    pub fn serialization<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Serialization {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a serialization error without source
    pub fn serialization_msg(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
            source: None,
        }
    }

    pub fn invalid_address(address: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address: address.into(),
            message: message.into(),
        }
    }

    pub fn invalid_state(component: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidState {
            component,
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms,
        }
    }

    pub fn canceled(operation: impl Into<String>) -> Self {
        Self::Canceled {
            operation: operation.into(),
        }
    }

    pub fn binding_not_found(routing_key: impl Into<String>) -> Self {
        Self::BindingNotFound {
            routing_key: routing_key.into(),
        }
    }

    /// Create a service not found error
    pub fn service_not_found(name: impl Into<String>) -> Self {
        Self::ServiceNotFound { name: name.into() }
    }

    /// Create a method not found error
    pub fn method_not_found(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self::MethodNotFound {
            service: service.into(),
            method: method.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            field,
        }
    }

    /// Create a runtime error without source
    pub fn runtime_msg(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
            source: None,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport { .. } => true,
            Error::Connection { .. } => true,
            Error::Timeout { .. } => true,
            Error::Io { .. } => true,
            Error::Runtime { .. } => true,
            Error::Disposed { .. } => false,
            Error::QueuePropertiesMismatch { .. } => false,
            Error::Unroutable { .. } => false,
            Error::NotSupported { .. } => false,
            Error::SerializerNotFound { .. } => false,
            Error::Serialization { .. } => false,
            Error::InvalidAddress { .. } => false,
            Error::InvalidState { .. } => false,
            Error::Canceled { .. } => false,
            Error::BindingNotFound { .. } => false,
            Error::ServiceNotFound { .. } => false,
            Error::MethodNotFound { .. } => false,
            Error::Configuration { .. } => false,
        }
    }

    /// Get error category for debugging
    pub fn category(&self) -> &'static str {
        match self {
            Error::Transport { .. } => "transport",
            Error::Connection { .. } => "connection",
            Error::Disposed { .. } => "disposed",
            Error::QueuePropertiesMismatch { .. } => "topology",
            Error::Unroutable { .. } => "routing",
            Error::NotSupported { .. } => "not_supported",
            Error::SerializerNotFound { .. } => "serialization",
            Error::Serialization { .. } => "serialization",
            Error::InvalidAddress { .. } => "address",
            Error::InvalidState { .. } => "lifecycle",
            Error::Timeout { .. } => "timeout",
            Error::Canceled { .. } => "canceled",
            Error::BindingNotFound { .. } => "binding_resolution",
            Error::ServiceNotFound { .. } => "service_discovery",
            Error::MethodNotFound { .. } => "method_resolution",
            Error::Configuration { .. } => "configuration",
            Error::Io { .. } => "io",
            Error::Runtime { .. } => "runtime",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::serialization("JSON serialization failed", err)
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::configuration(err.to_string(), None)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Runtime {
            message: "Task join failed".to_string(),
            source: Some(Box::new(err)),
        }
    }
}

/// Result type for mqsvc operations
pub type Result<T> = std::result::Result<T, Error>;
