//! Broker connection, the root of the resource tree

use crate::channel::MqChannel;
use crate::config::ConnectionConfig;
use crate::lifecycle::{Disposable, Lifecycle};
use crate::plugin::{ConnectionDriver, MqPlugin, PluginRegistry};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A live connection to a broker.
///
/// Handles are cheap to clone and share one connection. Disposing it disposes
/// every channel (and transitively every consumer, publisher and RPC client)
/// that is still alive.
#[derive(Clone)]
pub struct MqConnection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    lifecycle: Arc<Lifecycle>,
    plugin: Arc<dyn MqPlugin>,
    driver: Arc<dyn ConnectionDriver>,
    config: ConnectionConfig,
}

impl MqConnection {
    /// Connect through `plugin`.
    pub async fn open(plugin: Arc<dyn MqPlugin>, config: ConnectionConfig) -> Result<Self> {
        let driver = plugin.connect(&config).await?;
        info!(url = %config.url, plugin = plugin.scheme(), "connection opened");
        Ok(Self {
            inner: Arc::new(ConnectionInner {
                lifecycle: Lifecycle::new("connection"),
                plugin,
                driver,
                config,
            }),
        })
    }

    /// Connect with the plugin registered for the URL scheme.
    pub async fn open_with(registry: &PluginRegistry, config: ConnectionConfig) -> Result<Self> {
        let plugin = registry.resolve(&config)?;
        Self::open(plugin, config).await
    }

    /// Connect to `url` using the built-in plugins.
    pub async fn open_url(url: &str) -> Result<Self> {
        Self::open_with(&PluginRegistry::with_defaults(), ConnectionConfig::new(url)).await
    }

    pub fn plugin(&self) -> &Arc<dyn MqPlugin> {
        &self.inner.plugin
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Open a channel owned by this connection.
    pub async fn create_channel(&self) -> Result<MqChannel> {
        self.inner.lifecycle.ensure_alive()?;
        let driver = self.inner.driver.open_channel().await?;
        let channel = MqChannel::new(
            self.inner.plugin.clone(),
            driver,
            self.inner.lifecycle.reserve(),
        );
        if let Err(err) = self.inner.lifecycle.attach(channel.token(), channel.as_disposable()) {
            // Lost a race with dispose: the channel never became reachable.
            channel.dispose().await;
            return Err(err);
        }
        debug!(url = %self.inner.config.url, "channel created");
        Ok(channel)
    }

    /// Channels not yet disposed.
    pub fn channel_count(&self) -> usize {
        self.inner.lifecycle.live_children()
    }
}

#[async_trait]
impl Disposable for MqConnection {
    async fn dispose(&self) {
        if !self.inner.lifecycle.begin_dispose().await {
            return;
        }
        self.inner.lifecycle.dispose_children().await;
        if let Err(err) = self.inner.driver.close().await {
            warn!(url = %self.inner.config.url, error = %err, "closing connection failed");
        }
        self.inner.lifecycle.finish_dispose();
        info!(url = %self.inner.config.url, "connection disposed");
    }

    fn is_disposed(&self) -> bool {
        self.inner.lifecycle.is_disposed()
    }
}
