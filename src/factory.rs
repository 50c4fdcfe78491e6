//! Provider factory
//!
//! Maps provider names to constructors and builds one instance per
//! capability from the runtime configuration. The local providers are
//! registered out of the box; applications register cloud constructors at
//! startup. A process-wide instance is available through [`global`], with
//! [`initialize`] and [`reset`] for explicit setup and tests.
//! Initialization order: factory → registries → runtime.

use crate::config::RuntimeConfig;
use crate::crypto::Aes256GcmEncryptor;
use crate::error::{Result, RuntimeError};
use crate::provider::local::{
    LocalContainerRuntime, LocalEventBus, LocalServerlessRuntime, LocalStorageProvider,
};
use crate::provider::{ContainerRuntime, EventBus, ServerlessRuntime, StorageProvider};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

type Constructor<T> = Box<dyn Fn(&RuntimeConfig) -> Result<Arc<T>> + Send + Sync>;

/// Registry of provider constructors per capability
pub struct ProviderFactory {
    storage: RwLock<HashMap<String, Constructor<dyn StorageProvider>>>,
    event_bus: RwLock<HashMap<String, Constructor<dyn EventBus>>>,
    container: RwLock<HashMap<String, Constructor<dyn ContainerRuntime>>>,
    serverless: RwLock<HashMap<String, Constructor<dyn ServerlessRuntime>>>,
}

impl Default for ProviderFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderFactory {
    /// Create a factory with the built-in local providers registered
    pub fn new() -> Self {
        let factory = Self {
            storage: RwLock::new(HashMap::new()),
            event_bus: RwLock::new(HashMap::new()),
            container: RwLock::new(HashMap::new()),
            serverless: RwLock::new(HashMap::new()),
        };

        factory.register_storage_provider("local", |config| {
            let mut provider = LocalStorageProvider::new(&config.storage_path)?;
            if config.encryption_enabled {
                if let Ok(key) = std::env::var("LIGHTNING_ENCRYPTION_KEY") {
                    provider = provider
                        .with_encryptor(Arc::new(Aes256GcmEncryptor::from_base64("active", &key)?));
                } else {
                    tracing::debug!(
                        "encryption_enabled set but LIGHTNING_ENCRYPTION_KEY absent, storing plaintext"
                    );
                }
            }
            Ok(Arc::new(provider))
        });
        factory.register_event_bus_provider("local", |config| {
            Ok(Arc::new(LocalEventBus::new(config)))
        });
        factory.register_container_runtime_provider("local", |_config| {
            Ok(Arc::new(LocalContainerRuntime::new()))
        });
        factory.register_serverless_provider("local", |_config| {
            Ok(Arc::new(LocalServerlessRuntime::new()))
        });

        factory
    }

    pub fn register_storage_provider<F>(&self, name: impl Into<String>, ctor: F)
    where
        F: Fn(&RuntimeConfig) -> Result<Arc<dyn StorageProvider>> + Send + Sync + 'static,
    {
        self.storage
            .write()
            .expect("factory lock")
            .insert(name.into(), Box::new(ctor));
    }

    pub fn register_event_bus_provider<F>(&self, name: impl Into<String>, ctor: F)
    where
        F: Fn(&RuntimeConfig) -> Result<Arc<dyn EventBus>> + Send + Sync + 'static,
    {
        self.event_bus
            .write()
            .expect("factory lock")
            .insert(name.into(), Box::new(ctor));
    }

    pub fn register_container_runtime_provider<F>(&self, name: impl Into<String>, ctor: F)
    where
        F: Fn(&RuntimeConfig) -> Result<Arc<dyn ContainerRuntime>> + Send + Sync + 'static,
    {
        self.container
            .write()
            .expect("factory lock")
            .insert(name.into(), Box::new(ctor));
    }

    pub fn register_serverless_provider<F>(&self, name: impl Into<String>, ctor: F)
    where
        F: Fn(&RuntimeConfig) -> Result<Arc<dyn ServerlessRuntime>> + Send + Sync + 'static,
    {
        self.serverless
            .write()
            .expect("factory lock")
            .insert(name.into(), Box::new(ctor));
    }

    pub fn create_storage_provider(&self, config: &RuntimeConfig) -> Result<Arc<dyn StorageProvider>> {
        let registry = self.storage.read().expect("factory lock");
        let ctor = registry.get(&config.storage_provider).ok_or_else(|| {
            RuntimeError::Config(format!("Unknown storage provider: {}", config.storage_provider))
        })?;
        ctor(config)
    }

    pub fn create_event_bus(&self, config: &RuntimeConfig) -> Result<Arc<dyn EventBus>> {
        let registry = self.event_bus.read().expect("factory lock");
        let ctor = registry.get(&config.event_bus_provider).ok_or_else(|| {
            RuntimeError::Config(format!(
                "Unknown event bus provider: {}",
                config.event_bus_provider
            ))
        })?;
        ctor(config)
    }

    pub fn create_container_runtime(&self, config: &RuntimeConfig) -> Result<Arc<dyn ContainerRuntime>> {
        let registry = self.container.read().expect("factory lock");
        let ctor = registry.get(&config.container_runtime).ok_or_else(|| {
            RuntimeError::Config(format!("Unknown container runtime: {}", config.container_runtime))
        })?;
        ctor(config)
    }

    pub fn create_serverless_runtime(&self, config: &RuntimeConfig) -> Result<Arc<dyn ServerlessRuntime>> {
        let registry = self.serverless.read().expect("factory lock");
        let ctor = registry.get(&config.serverless_provider).ok_or_else(|| {
            RuntimeError::Config(format!(
                "Unknown serverless provider: {}",
                config.serverless_provider
            ))
        })?;
        ctor(config)
    }

    /// Registered provider names for a capability, for diagnostics
    pub fn registered_names(&self) -> HashMap<&'static str, Vec<String>> {
        let mut names = HashMap::new();
        names.insert(
            "storage",
            self.storage.read().expect("factory lock").keys().cloned().collect(),
        );
        names.insert(
            "event_bus",
            self.event_bus.read().expect("factory lock").keys().cloned().collect(),
        );
        names.insert(
            "container_runtime",
            self.container.read().expect("factory lock").keys().cloned().collect(),
        );
        names.insert(
            "serverless",
            self.serverless.read().expect("factory lock").keys().cloned().collect(),
        );
        names
    }
}

static GLOBAL_FACTORY: RwLock<Option<Arc<ProviderFactory>>> = RwLock::new(None);

/// Get the process-wide factory, creating a default one on first use
pub fn global() -> Arc<ProviderFactory> {
    {
        let guard = GLOBAL_FACTORY.read().expect("global factory lock");
        if let Some(factory) = guard.as_ref() {
            return Arc::clone(factory);
        }
    }
    let mut guard = GLOBAL_FACTORY.write().expect("global factory lock");
    // Another thread may have won the race
    if let Some(factory) = guard.as_ref() {
        return Arc::clone(factory);
    }
    let factory = Arc::new(ProviderFactory::new());
    *guard = Some(Arc::clone(&factory));
    factory
}

/// Install a pre-configured factory as the process-wide instance
pub fn initialize(factory: Arc<ProviderFactory>) {
    *GLOBAL_FACTORY.write().expect("global factory lock") = Some(factory);
}

/// Drop the process-wide factory (for tests)
pub fn reset() {
    *GLOBAL_FACTORY.write().expect("global factory lock") = None;
}
