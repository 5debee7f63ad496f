//! Adapter registry.
//!
//! Constructed once at program start and injected wherever a backend is
//! needed. There is no process-wide default instance: components receive
//! either the registry or an `Arc<dyn Adapter>` picked from it.

use std::collections::HashMap;
use std::sync::Arc;

use crate::adapter::Adapter;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no adapter registered under name: {0}")]
    UnknownAdapter(String),

    #[error("registry has no default adapter")]
    NoDefault,
}

pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn Adapter>>,
    default_name: Option<String>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
            default_name: None,
        }
    }

    /// Register an adapter under its own name. The first registration
    /// becomes the default until [`set_default`](Self::set_default) says
    /// otherwise.
    pub fn register(&mut self, adapter: Arc<dyn Adapter>) {
        let name = adapter.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.adapters.insert(name, adapter);
    }

    /// Mark a registered adapter as the default.
    pub fn set_default(&mut self, name: &str) -> Result<(), RegistryError> {
        if !self.adapters.contains_key(name) {
            return Err(RegistryError::UnknownAdapter(name.to_string()));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    /// Look up an adapter by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Adapter>, RegistryError> {
        self.adapters
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownAdapter(name.to_string()))
    }

    /// The default adapter.
    pub fn default_adapter(&self) -> Result<Arc<dyn Adapter>, RegistryError> {
        let name = self.default_name.as_deref().ok_or(RegistryError::NoDefault)?;
        self.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockAdapter;

    #[test]
    fn first_registration_is_default() {
        let mut reg = AdapterRegistry::new();
        assert!(reg.default_adapter().is_err());

        reg.register(Arc::new(MockAdapter::new()));
        let def = reg.default_adapter().unwrap();
        assert_eq!(def.name(), "mock");
    }

    #[test]
    fn set_default_requires_registration() {
        let mut reg = AdapterRegistry::new();
        reg.register(Arc::new(MockAdapter::new()));
        assert!(reg.set_default("nope").is_err());
        assert!(reg.set_default("mock").is_ok());
    }

    #[test]
    fn unknown_lookup_errors() {
        let reg = AdapterRegistry::new();
        assert!(matches!(
            reg.get("ghost"),
            Err(RegistryError::UnknownAdapter(_))
        ));
    }

    #[test]
    fn names_sorted() {
        let mut reg = AdapterRegistry::new();
        reg.register(Arc::new(MockAdapter::new()));
        assert_eq!(reg.names(), vec!["mock".to_string()]);
        assert_eq!(reg.len(), 1);
        assert!(!reg.is_empty());
    }
}
