//! Runtime assembly from configuration
//!
//! A host owns one connection, the application's locator and dispatcher
//! and, when enabled, a lookup served by a dispatcher of its own so that
//! resolving from inside a service method never waits on the dispatch loop
//! that is running it.

use crate::binding::ConfigBindingProvider;
use crate::config::RuntimeConfig;
use crate::connection::MqConnection;
use crate::dispatcher::MicroServiceDispatcher;
use crate::invoker::RemoteInvoker;
use crate::lifecycle::Disposable;
use crate::locator::MicroServiceLocator;
use crate::lookup::MicroServiceLookup;
use crate::plugin::PluginRegistry;
use crate::serializer::SerializerRegistry;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

struct LookupHost {
    lookup: Arc<MicroServiceLookup>,
    dispatcher: MicroServiceDispatcher,
}

pub struct MicroServiceHost {
    config: RuntimeConfig,
    connection: MqConnection,
    locator: Arc<MicroServiceLocator>,
    serializers: Arc<SerializerRegistry>,
    dispatcher: MicroServiceDispatcher,
    lookup: Option<LookupHost>,
}

impl MicroServiceHost {
    /// Build a host with the built-in plugins.
    pub async fn new(config: RuntimeConfig) -> Result<Self> {
        Self::with_registry(&PluginRegistry::with_defaults(), config).await
    }

    pub async fn with_registry(registry: &PluginRegistry, config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let connection = MqConnection::open_with(registry, config.connection.clone()).await?;
        match Self::assemble(connection.clone(), config).await {
            Ok(host) => Ok(host),
            Err(err) => {
                connection.dispose().await;
                Err(err)
            }
        }
    }

    async fn assemble(connection: MqConnection, config: RuntimeConfig) -> Result<Self> {
        let locator = Arc::new(
            MicroServiceLocator::new()
                .with_provider(Arc::new(ConfigBindingProvider::new(config.bindings.clone()))),
        );
        let serializers = Arc::new(SerializerRegistry::with_defaults());
        let dispatcher = MicroServiceDispatcher::with_options(
            connection.clone(),
            locator.clone(),
            serializers.clone(),
            config.dispatcher.clone(),
        );

        let lookup = if config.lookup.enabled {
            let lookup = MicroServiceLookup::new(&connection, config.lookup.clone()).await?;
            let lookup_locator = Arc::new(MicroServiceLocator::new());
            lookup.register(&lookup_locator)?;
            let lookup_dispatcher = MicroServiceDispatcher::with_options(
                connection.clone(),
                lookup_locator,
                serializers.clone(),
                config.dispatcher.clone(),
            );
            dispatcher.set_lookup(lookup.clone());
            Some(LookupHost {
                lookup,
                dispatcher: lookup_dispatcher,
            })
        } else {
            None
        };

        Ok(Self {
            config,
            connection,
            locator,
            serializers,
            dispatcher,
            lookup,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn connection(&self) -> &MqConnection {
        &self.connection
    }

    /// Register services here before [`start`](Self::start).
    pub fn locator(&self) -> &Arc<MicroServiceLocator> {
        &self.locator
    }

    pub fn dispatcher(&self) -> &MicroServiceDispatcher {
        &self.dispatcher
    }

    pub fn lookup(&self) -> Option<&Arc<MicroServiceLookup>> {
        self.lookup.as_ref().map(|host| &host.lookup)
    }

    /// An invoker on a channel of its own.
    pub async fn remote_invoker(&self) -> Result<RemoteInvoker> {
        let channel = self.connection.create_channel().await?;
        Ok(RemoteInvoker::new(
            channel,
            self.serializers.clone(),
            self.config.dispatcher.default_content_type.clone(),
        ))
    }

    /// Start the lookup first so sends made by services can resolve.
    pub async fn start(&self) -> Result<()> {
        if let Some(lookup) = &self.lookup {
            lookup.dispatcher.start().await?;
        }
        if let Err(err) = self.dispatcher.start().await {
            if let Some(lookup) = &self.lookup {
                if let Err(stop) = lookup.dispatcher.stop().await {
                    warn!(error = %stop, "lookup dispatcher did not stop");
                }
            }
            return Err(err);
        }
        info!(
            url = %self.config.connection.url,
            lookup = self.lookup.is_some(),
            "host started"
        );
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.dispatcher.stop().await?;
        if let Some(lookup) = &self.lookup {
            lookup.dispatcher.stop().await?;
        }
        info!("host stopped");
        Ok(())
    }
}

#[async_trait]
impl Disposable for MicroServiceHost {
    async fn dispose(&self) {
        self.dispatcher.dispose().await;
        if let Some(lookup) = &self.lookup {
            lookup.dispatcher.dispose().await;
            lookup.lookup.dispose().await;
        }
        self.connection.dispose().await;
        info!("host disposed");
    }

    fn is_disposed(&self) -> bool {
        self.connection.is_disposed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::dispatcher::DispatcherState;
    use crate::Error;

    fn config(url: &str, lookup: bool) -> RuntimeConfig {
        let mut config = RuntimeConfig {
            connection: ConnectionConfig::new(url),
            ..RuntimeConfig::default()
        };
        config.lookup.enabled = lookup;
        config
    }

    #[tokio::test]
    async fn test_lifecycle_with_lookup() {
        let host = MicroServiceHost::new(config("memory://host-unit-lookup", true))
            .await
            .unwrap();
        assert!(host.lookup().is_some());

        host.start().await.unwrap();
        assert_eq!(host.dispatcher().state(), DispatcherState::Started);
        host.stop().await.unwrap();
        assert_eq!(host.dispatcher().state(), DispatcherState::Stopped);

        host.dispose().await;
        assert!(host.is_disposed());
        assert!(host.lookup().is_some_and(|l| l.is_disposed()));
        assert!(matches!(host.start().await.unwrap_err(), Error::Disposed { .. }));
    }

    #[tokio::test]
    async fn test_unknown_scheme_is_a_configuration_error() {
        let err = MicroServiceHost::new(config("carrier-pigeon://loft", false))
            .await
            .err()
            .expect("no plugin for scheme");
        assert!(matches!(err, Error::Configuration { .. }));
    }
}
