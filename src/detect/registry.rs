use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use super::backend::DetectorBackend;

pub type SharedDetector = Arc<Mutex<dyn DetectorBackend>>;

/// Named detector backends.
///
/// Backends are wrapped in `Mutex` because `DetectorBackend::detect` takes `&mut self`.
pub struct BackendRegistry {
    backends: HashMap<String, SharedDetector>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            default_name: None,
        }
    }

    /// Register a backend. The first registered backend becomes the default.
    pub fn register<B: DetectorBackend + 'static>(&mut self, backend: B) {
        let name = backend.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.backends.insert(name, Arc::new(Mutex::new(backend)));
    }

    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.backends.contains_key(name) {
            return Err(anyhow!("backend '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<SharedDetector> {
        self.backends.get(name).cloned()
    }

    pub fn default_backend(&self) -> Option<SharedDetector> {
        self.default_name.as_ref().and_then(|name| self.get(name))
    }

    /// Backend by name, or an error listing what is registered.
    pub fn select(&self, name: &str) -> Result<SharedDetector> {
        self.get(name).ok_or_else(|| {
            anyhow!(
                "detector backend '{}' not registered (available: {})",
                name,
                self.list().join(", ")
            )
        })
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::StubBackend;

    #[test]
    fn first_registered_backend_is_default() -> Result<()> {
        let mut registry = BackendRegistry::new();
        assert!(registry.default_backend().is_none());
        registry.register(StubBackend::new());
        let backend = registry.default_backend().ok_or_else(|| anyhow!("no default"))?;
        let name = backend.lock().map_err(|_| anyhow!("poisoned"))?.name();
        assert_eq!(name, "stub");
        assert_eq!(registry.list(), vec!["stub".to_string()]);
        Ok(())
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let mut registry = BackendRegistry::new();
        registry.register(StubBackend::new());
        assert!(registry.set_default("tract").is_err());
        let err = registry.select("tract").err().map(|e| e.to_string());
        assert!(err.is_some_and(|msg| msg.contains("available: stub")));
    }
}
