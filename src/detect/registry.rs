use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use super::backend::{DetectorBackend, SharedDetector};
use crate::config::DetectorSettings;

/// Named detector backends, one of which is the default.
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

    /// Set default backend by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.backends.contains_key(name) {
            return Err(anyhow!("detector backend '{}' not registered", name));
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

    /// List registered backends, sorted by name.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve a configured backend name, falling back to the default when empty.
    ///
    /// The selected backend is warmed up before it is handed out.
    pub fn select(&self, name: &str) -> Result<SharedDetector> {
        let backend = if name.trim().is_empty() {
            self.default_backend()
                .ok_or_else(|| anyhow!("no detector backend registered"))?
        } else {
            self.get(name).ok_or_else(|| {
                anyhow!(
                    "detector backend '{}' not registered (available: {})",
                    name,
                    self.list().join(", ")
                )
            })?
        };
        backend
            .lock()
            .map_err(|_| anyhow!("detector backend lock poisoned"))?
            .warm_up()?;
        Ok(backend)
    }
}

/// Resolve the daemon's detector from configuration.
///
/// Only model backends are registered here. Scripted detectors exist for
/// tests and the demo, so a build or config without a model fails instead
/// of counting zero people forever.
pub fn select_model_backend(settings: &DetectorSettings) -> Result<SharedDetector> {
    let mut backends = BackendRegistry::new();
    register_model_backends(&mut backends, settings)?;

    if backends.list().is_empty() {
        return Err(anyhow!(
            "no detector backend available for '{}': build with backend-tract and set detector.model_path",
            settings.backend
        ));
    }
    log::info!("detector backends: {}", backends.list().join(", "));
    backends.select(&settings.backend)
}

#[cfg(feature = "backend-tract")]
fn register_model_backends(backends: &mut BackendRegistry, settings: &DetectorSettings) -> Result<()> {
    if let Some(model_path) = &settings.model_path {
        backends.register(super::backends::TractBackend::new(model_path)?);
    }
    Ok(())
}

#[cfg(not(feature = "backend-tract"))]
fn register_model_backends(_backends: &mut BackendRegistry, settings: &DetectorSettings) -> Result<()> {
    if settings.model_path.is_some() {
        log::warn!("detector.model_path ignored: built without the backend-tract feature");
    }
    Ok(())
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
