//! Binding model: which method of which contract serves which address

use crate::address::{AddressParts, MqAddress};
use crate::config::BindingOverride;
use crate::plugin::MqPlugin;
use crate::serializer::TypeDescriptor;
use crate::{Error, Result};
use std::sync::Arc;

/// Declared binding of one method, as generated by `#[micro_service]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingDescriptor {
    pub method: &'static str,
    pub address: String,
    pub one_way: bool,
    pub auto_ack_disabled: bool,
    pub auto_delete: bool,
    /// Payload parameters, excluding the message context
    pub parameters: Vec<TypeDescriptor>,
    /// `None` for methods without a result
    pub returns: Option<TypeDescriptor>,
}

impl BindingDescriptor {
    pub fn new(method: &'static str, address: impl Into<String>) -> Self {
        Self {
            method,
            address: address.into(),
            one_way: false,
            auto_ack_disabled: false,
            auto_delete: false,
            parameters: Vec::new(),
            returns: None,
        }
    }

    pub fn one_way(mut self, one_way: bool) -> Self {
        self.one_way = one_way;
        self
    }

    pub fn auto_ack_disabled(mut self, auto_ack_disabled: bool) -> Self {
        self.auto_ack_disabled = auto_ack_disabled;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn parameter<T: 'static>(mut self) -> Self {
        self.parameters.push(TypeDescriptor::of::<T>());
        self
    }

    /// Record the result type; `()` records none.
    pub fn returns<R: 'static>(mut self) -> Self {
        let ty = TypeDescriptor::of::<R>();
        self.returns = (!ty.is::<()>()).then_some(ty);
        self
    }
}

/// A resolved binding, ready for the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MicroServiceBinding {
    pub address: MqAddress,
    pub contract: String,
    pub method: String,
    pub one_way: bool,
    pub auto_ack_disabled: bool,
    pub auto_delete: bool,
    pub parameter: TypeDescriptor,
    pub returns: Option<TypeDescriptor>,
}

impl MicroServiceBinding {
    /// Validate a descriptor: one payload parameter and a parseable address.
    pub fn from_descriptor(contract: &str, descriptor: &BindingDescriptor) -> Result<Self> {
        let [parameter] = descriptor.parameters.as_slice() else {
            return Err(Error::not_supported(format!(
                "binding {contract}.{} takes {} payload parameters; exactly one is supported",
                descriptor.method,
                descriptor.parameters.len()
            )));
        };
        let address = MqAddress::from(descriptor.address.as_str());
        AddressParts::parse(&address)?;

        Ok(Self {
            address,
            contract: contract.to_string(),
            method: descriptor.method.to_string(),
            one_way: descriptor.one_way,
            auto_ack_disabled: descriptor.auto_ack_disabled,
            auto_delete: descriptor.auto_delete,
            parameter: *parameter,
            returns: descriptor.returns,
        })
    }
}

/// One step of binding discovery.
///
/// Providers run in order for every registered contract; each one may add
/// bindings or adjust the ones earlier providers produced.
pub trait BindingProvider: Send + Sync + 'static {
    fn provide(
        &self,
        contract: &str,
        descriptors: &[BindingDescriptor],
        bindings: &mut Vec<MicroServiceBinding>,
    ) -> Result<()>;
}

/// Turns declared descriptors into bindings.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeclaredBindingProvider;

impl BindingProvider for DeclaredBindingProvider {
    fn provide(
        &self,
        contract: &str,
        descriptors: &[BindingDescriptor],
        bindings: &mut Vec<MicroServiceBinding>,
    ) -> Result<()> {
        for descriptor in descriptors {
            bindings.push(MicroServiceBinding::from_descriptor(contract, descriptor)?);
        }
        Ok(())
    }
}

/// Applies `[[bindings]]` overrides from the runtime configuration.
#[derive(Debug, Default, Clone)]
pub struct ConfigBindingProvider {
    overrides: Vec<BindingOverride>,
}

impl ConfigBindingProvider {
    pub fn new(overrides: Vec<BindingOverride>) -> Self {
        Self { overrides }
    }
}

impl BindingProvider for ConfigBindingProvider {
    fn provide(
        &self,
        contract: &str,
        _descriptors: &[BindingDescriptor],
        bindings: &mut Vec<MicroServiceBinding>,
    ) -> Result<()> {
        for entry in self.overrides.iter().filter(|o| o.contract == contract) {
            let binding = bindings
                .iter_mut()
                .find(|b| b.contract == contract && b.method == entry.method)
                .ok_or_else(|| {
                    Error::configuration(
                        format!("override for unknown binding {contract}.{}", entry.method),
                        Some("bindings".to_string()),
                    )
                })?;

            if let Some(address) = &entry.address {
                let address = MqAddress::from(address.as_str());
                AddressParts::parse(&address)?;
                binding.address = address;
            }
            if let Some(one_way) = entry.one_way {
                binding.one_way = one_way;
            }
            if let Some(auto_delete) = entry.auto_delete {
                binding.auto_delete = auto_delete;
            }
            if let Some(auto_ack_disabled) = entry.auto_ack_disabled {
                binding.auto_ack_disabled = auto_ack_disabled;
            }
        }
        Ok(())
    }
}

/// Bindings served by one physical consumer.
#[derive(Debug, Clone)]
pub struct BindingGroup {
    pub queue: String,
    pub auto_ack_disabled: bool,
    pub auto_delete: bool,
    /// Distinct addresses, in first-seen order
    pub addresses: Vec<MqAddress>,
    pub bindings: Vec<Arc<MicroServiceBinding>>,
}

/// Group bindings by (queue, auto-ack-disabled, auto-delete), keeping the
/// order in which groups are first seen. Bindings that share a queue but
/// disagree on a flag land in different groups.
pub fn group_bindings(
    plugin: &dyn MqPlugin,
    bindings: &[Arc<MicroServiceBinding>],
) -> Result<Vec<BindingGroup>> {
    let mut groups: Vec<BindingGroup> = Vec::new();
    for binding in bindings {
        let consumer_address = plugin.to_consumer_address(&binding.address)?;
        let queue = consumer_address.source_key();

        let index = match groups.iter().position(|g| {
            g.queue == queue
                && g.auto_ack_disabled == binding.auto_ack_disabled
                && g.auto_delete == binding.auto_delete
        }) {
            Some(index) => index,
            None => {
                groups.push(BindingGroup {
                    queue: queue.to_string(),
                    auto_ack_disabled: binding.auto_ack_disabled,
                    auto_delete: binding.auto_delete,
                    addresses: Vec::new(),
                    bindings: Vec::new(),
                });
                groups.len() - 1
            }
        };

        let group = &mut groups[index];
        if !group.addresses.contains(&binding.address) {
            group.addresses.push(binding.address.clone());
        }
        group.bindings.push(binding.clone());
    }
    Ok(groups)
}
