//! Runtime configuration
//!
//! Loaded from TOML. Every section has defaults, so an empty document is a
//! valid configuration that connects to the in-memory broker.
//!
//! ```toml
//! [connection]
//! url = "memory://orders"
//! name = "orders-service"
//!
//! [dispatcher]
//! pause_threshold = 10
//! default_content_type = "application/json"
//!
//! [lookup]
//! enabled = true
//! timeout_ms = 2000
//!
//! [[bindings]]
//! contract = "HelperMicroService"
//! method = "invoke1"
//! address = "topic://ex/key/queue"
//! auto_delete = true
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Default number of in-flight messages above which a dispatcher pauses its channel.
pub const DEFAULT_PAUSE_THRESHOLD: usize = 10;

/// Content type assumed when a message carries none.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Address prefix reserved for the lookup protocol.
pub const DEFAULT_LOOKUP_PREFIX: &str = "topic://medseek-util/medseek-lookup.1.";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub connection: ConnectionConfig,
    pub dispatcher: DispatcherConfig,
    pub lookup: LookupConfig,
    pub bindings: Vec<BindingOverride>,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Broker URL; its scheme selects the plugin (e.g. `memory://name`)
    pub url: String,

    /// Connection name reported to the broker
    pub name: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "memory://default".to_string(),
            name: None,
        }
    }
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: None,
        }
    }

    /// Scheme part of the URL.
    pub fn scheme(&self) -> Result<&str> {
        self.url
            .split_once("://")
            .map(|(scheme, _)| scheme)
            .filter(|scheme| !scheme.is_empty())
            .ok_or_else(|| {
                Error::configuration(
                    format!("connection url '{}' has no scheme", self.url),
                    Some("connection.url".to_string()),
                )
            })
    }

    /// Everything after the scheme separator.
    pub fn host(&self) -> &str {
        self.url
            .split_once("://")
            .map(|(_, host)| host)
            .unwrap_or(&self.url)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// In-flight count above which the channel is paused
    pub pause_threshold: usize,

    /// Content type used for replies when the request carried none
    pub default_content_type: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            pause_threshold: DEFAULT_PAUSE_THRESHOLD,
            default_content_type: DEFAULT_CONTENT_TYPE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupConfig {
    /// Register the lookup component and resolve outbound sends through it
    pub enabled: bool,

    /// Upper bound on one resolve round trip
    pub timeout_ms: u64,

    /// Topic prefix of the lookup protocol; ends with a dot
    pub prefix: String,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 5_000,
            prefix: DEFAULT_LOOKUP_PREFIX.to_string(),
        }
    }
}

impl LookupConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Replaces parts of a declared binding, matched by contract and method.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BindingOverride {
    pub contract: String,
    pub method: String,
    pub address: Option<String>,
    pub one_way: Option<bool>,
    pub auto_delete: Option<bool>,
    pub auto_ack_disabled: Option<bool>,
}

impl RuntimeConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading runtime configuration");
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<()> {
        self.connection.scheme()?;
        if self.dispatcher.default_content_type.is_empty() {
            return Err(Error::configuration(
                "default content type must not be empty",
                Some("dispatcher.default_content_type".to_string()),
            ));
        }
        if self.lookup.enabled && self.lookup.timeout_ms == 0 {
            return Err(Error::configuration(
                "lookup timeout must be positive",
                Some("lookup.timeout_ms".to_string()),
            ));
        }
        if !self.lookup.prefix.contains("://") || !self.lookup.prefix.ends_with('.') {
            return Err(Error::configuration(
                "lookup prefix must be an exchange address ending with '.'",
                Some("lookup.prefix".to_string()),
            ));
        }
        for (index, binding) in self.bindings.iter().enumerate() {
            if binding.contract.is_empty() || binding.method.is_empty() {
                return Err(Error::configuration(
                    "binding override needs contract and method",
                    Some(format!("bindings[{index}]")),
                ));
            }
        }
        Ok(())
    }
}
