//! Component registry: binding discovery and per-call service instances

use crate::binding::{BindingDescriptor, BindingProvider, DeclaredBindingProvider, MicroServiceBinding};
use crate::service::{MicroService, MicroServiceContract};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::ops::Deref;
use std::sync::Arc;
use tracing::{debug, info};

/// Produces the instance that serves one invocation.
pub type ServiceFactory = Arc<dyn Fn() -> Result<Arc<dyn MicroService>> + Send + Sync>;

/// Called with the instance once its invocation is over.
pub type ServiceRelease = Arc<dyn Fn(Arc<dyn MicroService>) + Send + Sync>;

struct Registration {
    contract: &'static str,
    descriptors: Vec<BindingDescriptor>,
    factory: ServiceFactory,
    release: Option<ServiceRelease>,
}

/// Registered components and the bindings discovered from them.
pub struct MicroServiceLocator {
    registrations: RwLock<Vec<Arc<Registration>>>,
    providers: Vec<Arc<dyn BindingProvider>>,
    bindings: RwLock<Vec<Arc<MicroServiceBinding>>>,
}

impl Default for MicroServiceLocator {
    fn default() -> Self {
        Self::new()
    }
}

impl MicroServiceLocator {
    /// A locator that discovers the declared bindings only.
    pub fn new() -> Self {
        Self {
            registrations: RwLock::new(Vec::new()),
            providers: vec![Arc::new(DeclaredBindingProvider)],
            bindings: RwLock::new(Vec::new()),
        }
    }

    /// Append a discovery step after the existing ones.
    pub fn with_provider(mut self, provider: Arc<dyn BindingProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Register a contract served by a fresh instance per invocation.
    pub fn register<S, F>(&self, factory: F) -> Result<()>
    where
        S: MicroServiceContract,
        F: Fn() -> S + Send + Sync + 'static,
    {
        let factory: ServiceFactory = Arc::new(move || {
            let service: Arc<dyn MicroService> = Arc::new(factory());
            Ok(service)
        });
        self.register_with(S::CONTRACT, S::bindings(), factory, None)
    }

    /// Register a contract served by one shared instance.
    pub fn register_instance<S>(&self, instance: Arc<S>) -> Result<()>
    where
        S: MicroServiceContract,
    {
        let factory: ServiceFactory = Arc::new(move || {
            let service: Arc<dyn MicroService> = instance.clone();
            Ok(service)
        });
        self.register_with(S::CONTRACT, S::bindings(), factory, None)
    }

    /// Register a contract from explicit descriptors.
    ///
    /// Descriptors are validated here, so unsupported shapes fail at
    /// registration rather than at the first message.
    pub fn register_with(
        &self,
        contract: &'static str,
        descriptors: Vec<BindingDescriptor>,
        factory: ServiceFactory,
        release: Option<ServiceRelease>,
    ) -> Result<()> {
        for descriptor in &descriptors {
            MicroServiceBinding::from_descriptor(contract, descriptor)?;
        }

        let mut registrations = self.registrations.write();
        if registrations.iter().any(|r| r.contract == contract) {
            return Err(Error::configuration(
                format!("contract '{contract}' is already registered"),
                None,
            ));
        }
        registrations.push(Arc::new(Registration {
            contract,
            descriptors,
            factory,
            release,
        }));
        debug!(contract, "micro-service registered");
        Ok(())
    }

    /// Run discovery again and replace the binding table.
    pub fn refresh(&self) -> Result<Vec<Arc<MicroServiceBinding>>> {
        let registrations: Vec<Arc<Registration>> = self.registrations.read().clone();

        let mut discovered = Vec::new();
        for registration in &registrations {
            let mut bindings = Vec::new();
            for provider in &self.providers {
                provider.provide(registration.contract, &registration.descriptors, &mut bindings)?;
            }
            discovered.extend(bindings.into_iter().map(Arc::new));
        }

        info!(
            contracts = registrations.len(),
            bindings = discovered.len(),
            "bindings discovered"
        );
        *self.bindings.write() = discovered.clone();
        Ok(discovered)
    }

    /// Bindings from the last [`refresh`](Self::refresh).
    pub fn bindings(&self) -> Vec<Arc<MicroServiceBinding>> {
        self.bindings.read().clone()
    }

    pub fn contracts(&self) -> Vec<&'static str> {
        self.registrations.read().iter().map(|r| r.contract).collect()
    }

    /// An instance serving `contract` for one invocation.
    pub fn resolve(&self, contract: &str) -> Result<ServiceLease> {
        let registration = self
            .registrations
            .read()
            .iter()
            .find(|r| r.contract == contract)
            .cloned()
            .ok_or_else(|| Error::service_not_found(contract))?;

        let instance = (registration.factory)()?;
        Ok(ServiceLease {
            instance,
            release: registration.release.clone(),
        })
    }
}

/// A service instance borrowed for one invocation; released on drop.
pub struct ServiceLease {
    instance: Arc<dyn MicroService>,
    release: Option<ServiceRelease>,
}

impl Deref for ServiceLease {
    type Target = dyn MicroService;

    fn deref(&self) -> &Self::Target {
        self.instance.as_ref()
    }
}

impl Drop for ServiceLease {
    fn drop(&mut self) {
        if let Some(release) = &self.release {
            release(self.instance.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::ConfigBindingProvider;
    use crate::config::BindingOverride;
    use crate::service::{Invocation, Reply};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo;

    #[async_trait]
    impl MicroService for Echo {
        fn contract(&self) -> &'static str {
            "Echo"
        }

        async fn invoke(&self, method: &str, invocation: Invocation) -> Result<Reply> {
            match method {
                "echo" => {
                    let body: Bytes = invocation.parameter()?;
                    invocation.reply(&body)
                }
                other => Err(Error::method_not_found("Echo", other)),
            }
        }
    }

    impl MicroServiceContract for Echo {
        const CONTRACT: &'static str = "Echo";

        fn bindings() -> Vec<BindingDescriptor> {
            vec![BindingDescriptor::new("echo", "topic://ex/echo/echo-queue")
                .parameter::<Bytes>()
                .returns::<Bytes>()]
        }
    }

    #[test]
    fn test_refresh_discovers_declared_bindings() {
        let locator = MicroServiceLocator::new();
        locator.register(|| Echo).unwrap();
        assert!(locator.bindings().is_empty());

        let bindings = locator.refresh().unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].contract, "Echo");
        assert_eq!(bindings[0].method, "echo");
        assert_eq!(locator.bindings(), bindings);
    }

    #[test]
    fn test_duplicate_contract_is_rejected() {
        let locator = MicroServiceLocator::new();
        locator.register(|| Echo).unwrap();
        assert!(locator.register_instance(Arc::new(Echo)).is_err());
        assert_eq!(locator.contracts(), ["Echo"]);
    }

    #[test]
    fn test_multi_parameter_descriptor_fails_at_registration() {
        let locator = MicroServiceLocator::new();
        let descriptors = vec![BindingDescriptor::new("sum", "q")
            .parameter::<u32>()
            .parameter::<u32>()];
        let factory: ServiceFactory = Arc::new(|| Ok(Arc::new(Echo) as Arc<dyn MicroService>));
        let err = locator
            .register_with("Adder", descriptors, factory, None)
            .unwrap_err();
        assert!(matches!(err, Error::NotSupported { .. }));
        assert!(locator.contracts().is_empty());
    }

    #[test]
    fn test_lease_is_released_after_use() {
        let created = Arc::new(AtomicUsize::new(0));
        let released = Arc::new(AtomicUsize::new(0));

        let counter = created.clone();
        let factory: ServiceFactory = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Echo) as Arc<dyn MicroService>)
        });
        let counter = released.clone();
        let release: ServiceRelease = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let locator = MicroServiceLocator::new();
        locator
            .register_with("Echo", Echo::bindings(), factory, Some(release))
            .unwrap();

        for _ in 0..3 {
            let lease = locator.resolve("Echo").unwrap();
            assert_eq!(lease.contract(), "Echo");
        }
        assert_eq!(created.load(Ordering::SeqCst), 3);
        assert_eq!(released.load(Ordering::SeqCst), 3);

        let err = locator.resolve("Missing").err().expect("not registered");
        assert!(matches!(err, Error::ServiceNotFound { .. }));
    }

    #[test]
    fn test_config_provider_runs_after_declared() {
        let locator = MicroServiceLocator::new().with_provider(Arc::new(ConfigBindingProvider::new(
            vec![BindingOverride {
                contract: "Echo".into(),
                method: "echo".into(),
                one_way: Some(true),
                ..BindingOverride::default()
            }],
        )));
        locator.register(|| Echo).unwrap();
        let bindings = locator.refresh().unwrap();
        assert!(bindings[0].one_way);
    }
}
