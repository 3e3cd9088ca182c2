use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use conductor_core::{ConductorError, Result};

use crate::provider::Provider;

/// Typed credentials handed to a provider factory on activation.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

/// Construction function bound to a provider name, invoked lazily when the
/// name is activated with credentials.
pub type ProviderFactory =
    Box<dyn Fn(&Credentials) -> Result<Arc<dyn Provider>> + Send + Sync>;

#[derive(Default)]
struct RegistryInner {
    providers: HashMap<String, Arc<dyn Provider>>,
    factories: HashMap<String, ProviderFactory>,
    default_name: Option<String>,
    failover_order: Vec<String>,
}

/// Named set of providers with a default and an ordered failover list.
#[derive(Default)]
pub struct ProviderRegistry {
    inner: RwLock<RegistryInner>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its name. Empty names and duplicates are
    /// rejected.
    pub fn register(&self, provider: Arc<dyn Provider>) -> Result<()> {
        let name = provider.name().to_string();
        if name.is_empty() {
            return Err(ConductorError::Validation(
                "provider name must not be empty".into(),
            ));
        }
        let mut inner = self.inner.write();
        if inner.providers.contains_key(&name) {
            return Err(ConductorError::Validation(format!(
                "provider already registered: {name}"
            )));
        }
        info!(provider = %name, "registered provider");
        inner.providers.insert(name, provider);
        Ok(())
    }

    /// Bind a factory to a name for lazy activation.
    pub fn register_factory(&self, name: impl Into<String>, factory: ProviderFactory) -> Result<()> {
        let name = name.into();
        if name.is_empty() {
            return Err(ConductorError::Validation(
                "provider name must not be empty".into(),
            ));
        }
        let mut inner = self.inner.write();
        if inner.factories.contains_key(&name) {
            return Err(ConductorError::Validation(format!(
                "factory already registered: {name}"
            )));
        }
        inner.factories.insert(name, factory);
        Ok(())
    }

    /// Invoke the factory bound to `name` and register the result.
    pub fn activate(&self, name: &str, credentials: &Credentials) -> Result<Arc<dyn Provider>> {
        let provider = {
            let inner = self.inner.read();
            let factory = inner.factories.get(name).ok_or_else(|| {
                ConductorError::Validation(format!("no factory registered for {name}"))
            })?;
            factory(credentials)?
        };
        self.register(Arc::clone(&provider))?;
        Ok(provider)
    }

    /// Remove a provider. Removing the current default is rejected; the name
    /// is pruned from the failover order.
    pub fn unregister(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.default_name.as_deref() == Some(name) {
            return Err(ConductorError::Validation(format!(
                "cannot unregister default provider: {name}"
            )));
        }
        if inner.providers.remove(name).is_none() {
            return Err(ConductorError::Validation(format!(
                "provider not registered: {name}"
            )));
        }
        inner.failover_order.retain(|n| n != name);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.inner.read().providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().providers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn set_default(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.providers.contains_key(name) {
            return Err(ConductorError::Validation(format!(
                "provider not registered: {name}"
            )));
        }
        inner.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn default_name(&self) -> Option<String> {
        self.inner.read().default_name.clone()
    }

    pub fn default_provider(&self) -> Option<Arc<dyn Provider>> {
        let inner = self.inner.read();
        let name = inner.default_name.as_ref()?;
        inner.providers.get(name).cloned()
    }

    /// Set the ordered failover list. Every name must be registered.
    pub fn set_failover_order(&self, order: Vec<String>) -> Result<()> {
        let mut inner = self.inner.write();
        for name in &order {
            if !inner.providers.contains_key(name) {
                return Err(ConductorError::Validation(format!(
                    "failover order references unregistered provider: {name}"
                )));
            }
        }
        inner.failover_order = order;
        Ok(())
    }

    pub fn failover_order(&self) -> Vec<String> {
        self.inner.read().failover_order.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockProvider;

    fn mock(name: &str) -> Arc<dyn Provider> {
        Arc::new(MockProvider::new(name))
    }

    #[test]
    fn register_and_get() {
        let registry = ProviderRegistry::new();
        registry.register(mock("a")).unwrap();
        assert!(registry.get("a").is_some());
        assert!(registry.get("b").is_none());
    }

    #[test]
    fn rejects_duplicate_registration() {
        let registry = ProviderRegistry::new();
        registry.register(mock("a")).unwrap();
        assert!(registry.register(mock("a")).is_err());
    }

    #[test]
    fn rejects_empty_name() {
        let registry = ProviderRegistry::new();
        assert!(registry.register(mock("")).is_err());
    }

    #[test]
    fn unregister_default_is_rejected() {
        let registry = ProviderRegistry::new();
        registry.register(mock("a")).unwrap();
        registry.set_default("a").unwrap();
        assert!(registry.unregister("a").is_err());
    }

    #[test]
    fn unregister_prunes_failover_order() {
        let registry = ProviderRegistry::new();
        registry.register(mock("a")).unwrap();
        registry.register(mock("b")).unwrap();
        registry
            .set_failover_order(vec!["a".into(), "b".into()])
            .unwrap();
        registry.unregister("b").unwrap();
        assert_eq!(registry.failover_order(), vec!["a".to_string()]);
    }

    #[test]
    fn failover_order_requires_registered_names() {
        let registry = ProviderRegistry::new();
        registry.register(mock("a")).unwrap();
        assert!(
            registry
                .set_failover_order(vec!["a".into(), "ghost".into()])
                .is_err()
        );
    }

    #[test]
    fn factory_activation() {
        let registry = ProviderRegistry::new();
        registry
            .register_factory(
                "lazy",
                Box::new(|creds: &Credentials| {
                    assert_eq!(creds.api_key.as_deref(), Some("k"));
                    Ok(Arc::new(MockProvider::new("lazy")) as Arc<dyn Provider>)
                }),
            )
            .unwrap();
        assert!(registry.get("lazy").is_none());
        let creds = Credentials {
            api_key: Some("k".into()),
            base_url: None,
        };
        registry.activate("lazy", &creds).unwrap();
        assert!(registry.get("lazy").is_some());
    }
}
