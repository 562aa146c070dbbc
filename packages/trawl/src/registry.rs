//! Registration table of available modules.
//!
//! Modules are registered by name with a factory at program start. The
//! controller instantiates a fresh module per scan from its factory, so no
//! module state leaks from one scan into the next.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::ScanError;
use crate::module::{Module, ModuleDescriptor};

type Factory = Arc<dyn Fn() -> Box<dyn Module> + Send + Sync>;

/// Name → factory table.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    factories: BTreeMap<String, Factory>,
    order: Vec<String>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module factory under `name`. A second registration under
    /// the same name replaces the first but keeps its position.
    pub fn register<F, M>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> M + Send + Sync + 'static,
        M: Module,
    {
        let name = name.into();
        if !self.factories.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.factories
            .insert(name, Arc::new(move || Box::new(factory()) as Box<dyn Module>));
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_module<F, M>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> M + Send + Sync + 'static,
        M: Module,
    {
        self.register(name, factory);
        self
    }

    /// Registered names, in registration order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Create a fresh instance of a registered module.
    pub fn instantiate(&self, name: &str) -> Result<Box<dyn Module>, ScanError> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| ScanError::UnknownModule {
                name: name.to_string(),
            })
    }

    /// Descriptors of every registered module, in registration order.
    ///
    /// Each module is instantiated once to read its declarations. The
    /// descriptor is keyed by registration name, whatever `Module::name`
    /// reports.
    pub fn descriptors(&self) -> Vec<ModuleDescriptor> {
        self.order
            .iter()
            .filter_map(|name| {
                let factory = self.factories.get(name)?;
                let module = factory();
                let mut descriptor = ModuleDescriptor::of(module.as_ref());
                descriptor.name = name.clone();
                Some(descriptor)
            })
            .collect()
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.order)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use crate::testing::ScriptedModule;

    fn registry() -> ModuleRegistry {
        ModuleRegistry::new()
            .with_module("sfp_dns", || {
                ScriptedModule::new("sfp_dns").produces([EventType::IP_ADDRESS])
            })
            .with_module("sfp_whois", || {
                ScriptedModule::new("sfp_whois")
                    .consumes([EventType::IP_ADDRESS])
                    .produces([EventType::NETBLOCK_OWNER])
            })
    }

    #[test]
    fn test_names_keep_registration_order() {
        let registry = registry();
        assert_eq!(registry.names(), &["sfp_dns".to_string(), "sfp_whois".to_string()]);
        assert_eq!(registry.len(), 2);
        assert!(registry.contains("sfp_whois"));
    }

    #[test]
    fn test_reregistration_replaces_in_place() {
        let mut registry = registry();
        registry.register("sfp_dns", || ScriptedModule::new("sfp_dns_v2"));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names()[0], "sfp_dns");
        assert_eq!(registry.instantiate("sfp_dns").unwrap().name(), "sfp_dns_v2");
    }

    #[test]
    fn test_unknown_module() {
        match registry().instantiate("sfp_nope") {
            Err(ScanError::UnknownModule { name }) => assert_eq!(name, "sfp_nope"),
            Err(other) => panic!("Expected UnknownModule, got {other}"),
            Ok(_) => panic!("Expected UnknownModule"),
        }
    }

    #[test]
    fn test_descriptors() {
        let descriptors = registry().descriptors();
        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[1].name, "sfp_whois");
        assert!(descriptors[1].consumed.matches(&EventType::IP_ADDRESS));
        assert!(descriptors[1].produced.contains(&EventType::NETBLOCK_OWNER));
        assert!(descriptors[0].consumed.is_empty());
    }
}
