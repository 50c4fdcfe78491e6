//! Runtime configuration
//!
//! One immutable `RuntimeConfig` per process, built by layering defaults,
//! an optional JSON file, and `LIGHTNING_`-prefixed environment variables.
//! Environment wins over file, file wins over defaults.

use crate::error::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Execution mode selecting the default provider set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Local,
    Azure,
    Aws,
    Gcp,
    /// Local execution with some cloud services
    Hybrid,
}

impl ExecutionMode {
    /// Default provider names for this mode as
    /// `(storage, event_bus, container_runtime, serverless)`
    pub fn default_providers(&self) -> (&'static str, &'static str, &'static str, &'static str) {
        match self {
            ExecutionMode::Local | ExecutionMode::Hybrid => ("local", "local", "local", "local"),
            ExecutionMode::Azure => ("azure_cosmos", "azure_service_bus", "azure_aci", "azure_functions"),
            ExecutionMode::Aws => ("dynamodb", "sqs", "ecs", "lambda"),
            ExecutionMode::Gcp => ("firestore", "pubsub", "cloud_run", "cloud_functions"),
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(ExecutionMode::Local),
            "azure" => Ok(ExecutionMode::Azure),
            "aws" => Ok(ExecutionMode::Aws),
            "gcp" => Ok(ExecutionMode::Gcp),
            "hybrid" => Ok(ExecutionMode::Hybrid),
            other => Err(RuntimeError::Config(format!("Unknown execution mode: {}", other))),
        }
    }
}

/// Runtime configuration for provider selection and tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub mode: ExecutionMode,

    // Storage
    pub storage_provider: String,
    pub storage_connection_string: Option<String>,
    pub storage_endpoint: Option<String>,
    /// Base path for the local storage provider
    pub storage_path: String,

    // Event bus
    pub event_bus_provider: String,
    pub event_bus_connection_string: Option<String>,
    pub event_bus_endpoint: Option<String>,

    // Container runtime
    pub container_runtime: String,
    pub container_registry: Option<String>,

    // Serverless
    pub serverless_provider: String,
    pub serverless_endpoint: Option<String>,

    // General cloud settings, passed opaquely to factories
    pub region: Option<String>,
    pub project_id: Option<String>,
    pub resource_group: Option<String>,

    // Security policy toggles, consumed by providers
    pub auth_enabled: bool,
    pub encryption_enabled: bool,

    // Logging
    pub log_level: String,
    pub log_provider: String,

    // Performance
    pub max_concurrent_operations: usize,
    pub operation_timeout_seconds: u64,
    pub retry_max_attempts: u32,
    pub retry_backoff_seconds: u64,
    pub health_check_interval_seconds: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Local,
            storage_provider: "local".to_string(),
            storage_connection_string: None,
            storage_endpoint: None,
            storage_path: "./data".to_string(),
            event_bus_provider: "local".to_string(),
            event_bus_connection_string: None,
            event_bus_endpoint: None,
            container_runtime: "local".to_string(),
            container_registry: None,
            serverless_provider: "local".to_string(),
            serverless_endpoint: None,
            region: None,
            project_id: None,
            resource_group: None,
            auth_enabled: true,
            encryption_enabled: true,
            log_level: "info".to_string(),
            log_provider: "local".to_string(),
            max_concurrent_operations: 100,
            operation_timeout_seconds: 300,
            retry_max_attempts: 3,
            retry_backoff_seconds: 1,
            health_check_interval_seconds: 30,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration: defaults, then a JSON file if given and present,
    /// then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => Self::from_file(p)?,
            _ => Self::default(),
        };
        config.apply_env()?;
        config.apply_mode_defaults();
        Ok(config)
    }

    /// Parse configuration from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            RuntimeError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&text).map_err(|e| {
            RuntimeError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })
    }

    /// Build configuration from defaults plus environment overrides
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.apply_mode_defaults();
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|e| {
            RuntimeError::Config(format!("Failed to write config file {}: {}", path.display(), e))
        })
    }

    /// Apply `LIGHTNING_*` environment variable overrides
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(mode) = std::env::var("LIGHTNING_MODE") {
            self.mode = mode.parse()?;
        }

        overlay_string(&mut self.storage_provider, "LIGHTNING_STORAGE_PROVIDER");
        overlay_opt(&mut self.storage_connection_string, "LIGHTNING_STORAGE_CONNECTION");
        overlay_opt(&mut self.storage_endpoint, "LIGHTNING_STORAGE_ENDPOINT");
        overlay_string(&mut self.storage_path, "LIGHTNING_STORAGE_PATH");

        overlay_string(&mut self.event_bus_provider, "LIGHTNING_EVENT_BUS_PROVIDER");
        overlay_opt(&mut self.event_bus_connection_string, "LIGHTNING_EVENT_BUS_CONNECTION");
        overlay_opt(&mut self.event_bus_endpoint, "LIGHTNING_EVENT_BUS_ENDPOINT");

        overlay_string(&mut self.container_runtime, "LIGHTNING_CONTAINER_RUNTIME");
        overlay_opt(&mut self.container_registry, "LIGHTNING_CONTAINER_REGISTRY");

        overlay_string(&mut self.serverless_provider, "LIGHTNING_SERVERLESS_PROVIDER");
        overlay_opt(&mut self.serverless_endpoint, "LIGHTNING_SERVERLESS_ENDPOINT");

        overlay_opt(&mut self.region, "LIGHTNING_REGION");
        overlay_opt(&mut self.project_id, "LIGHTNING_PROJECT_ID");
        overlay_opt(&mut self.resource_group, "LIGHTNING_RESOURCE_GROUP");

        if let Some(v) = env_bool("LIGHTNING_AUTH_ENABLED")? {
            self.auth_enabled = v;
        }
        if let Some(v) = env_bool("LIGHTNING_ENCRYPTION_ENABLED")? {
            self.encryption_enabled = v;
        }

        overlay_string(&mut self.log_level, "LIGHTNING_LOG_LEVEL");
        overlay_string(&mut self.log_provider, "LIGHTNING_LOG_PROVIDER");

        if let Some(v) = env_parse::<usize>("LIGHTNING_MAX_CONCURRENT_OPERATIONS")? {
            self.max_concurrent_operations = v;
        }
        if let Some(v) = env_parse::<u64>("LIGHTNING_OPERATION_TIMEOUT")? {
            self.operation_timeout_seconds = v;
        }
        if let Some(v) = env_parse::<u32>("LIGHTNING_RETRY_MAX_ATTEMPTS")? {
            self.retry_max_attempts = v;
        }
        if let Some(v) = env_parse::<u64>("LIGHTNING_RETRY_BACKOFF")? {
            self.retry_backoff_seconds = v;
        }
        if let Some(v) = env_parse::<u64>("LIGHTNING_HEALTH_CHECK_INTERVAL")? {
            self.health_check_interval_seconds = v;
        }

        Ok(())
    }

    /// Swap provider names still at their local defaults for the mode's
    /// default set. Explicitly configured providers are left alone.
    fn apply_mode_defaults(&mut self) {
        let (storage, bus, container, serverless) = self.mode.default_providers();
        if self.storage_provider == "local" {
            self.storage_provider = storage.to_string();
        }
        if self.event_bus_provider == "local" {
            self.event_bus_provider = bus.to_string();
        }
        if self.container_runtime == "local" {
            self.container_runtime = container.to_string();
        }
        if self.serverless_provider == "local" {
            self.serverless_provider = serverless.to_string();
        }
    }
}

fn overlay_string(target: &mut String, key: &str) {
    if let Ok(v) = std::env::var(key) {
        *target = v;
    }
}

fn overlay_opt(target: &mut Option<String>, key: &str) {
    if let Ok(v) = std::env::var(key) {
        *target = Some(v);
    }
}

fn env_bool(key: &str) -> Result<Option<bool>> {
    match std::env::var(key) {
        Ok(v) => match v.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(Some(true)),
            "false" | "0" | "no" => Ok(Some(false)),
            other => Err(RuntimeError::Config(format!(
                "Invalid boolean for {}: {}",
                key, other
            ))),
        },
        Err(_) => Ok(None),
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(v) => v.parse::<T>().map(Some).map_err(|_| {
            RuntimeError::Config(format!("Invalid value for {}: {}", key, v))
        }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.mode, ExecutionMode::Local);
        assert_eq!(config.storage_provider, "local");
        assert_eq!(config.event_bus_provider, "local");
        assert_eq!(config.max_concurrent_operations, 100);
        assert_eq!(config.retry_max_attempts, 3);
        assert_eq!(config.retry_backoff_seconds, 1);
        assert!(config.auth_enabled);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("azure".parse::<ExecutionMode>().unwrap(), ExecutionMode::Azure);
        assert_eq!("LOCAL".parse::<ExecutionMode>().unwrap(), ExecutionMode::Local);
        assert!("orbital".parse::<ExecutionMode>().is_err());
    }

    #[test]
    fn test_mode_default_providers() {
        let (storage, bus, _, serverless) = ExecutionMode::Aws.default_providers();
        assert_eq!(storage, "dynamodb");
        assert_eq!(bus, "sqs");
        assert_eq!(serverless, "lambda");
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = RuntimeConfig::default();
        config.storage_path = "/var/lightning".to_string();
        config.retry_max_attempts = 7;
        config.save(&path).unwrap();

        let loaded = RuntimeConfig::from_file(&path).unwrap();
        assert_eq!(loaded.storage_path, "/var/lightning");
        assert_eq!(loaded.retry_max_attempts, 7);
        assert_eq!(loaded.mode, ExecutionMode::Local);
    }

    #[test]
    fn test_file_partial_fields_use_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"event_bus_provider": "local", "retry_backoff_seconds": 2}"#)
            .unwrap();

        let loaded = RuntimeConfig::from_file(&path).unwrap();
        assert_eq!(loaded.retry_backoff_seconds, 2);
        assert_eq!(loaded.operation_timeout_seconds, 300);
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = RuntimeConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, RuntimeError::Config(_)));
    }

    #[test]
    fn test_load_missing_file_falls_back_to_defaults() {
        let config = RuntimeConfig::load(Some(Path::new("/nonexistent/lightning.json"))).unwrap();
        // Env may override in CI, but tunables keep sane values
        assert!(!config.storage_provider.is_empty());
        assert!(config.max_concurrent_operations > 0);
    }

    #[test]
    fn test_env_bool_parsing() {
        std::env::set_var("LIGHTNING_TEST_BOOL_A", "true");
        assert_eq!(env_bool("LIGHTNING_TEST_BOOL_A").unwrap(), Some(true));
        std::env::set_var("LIGHTNING_TEST_BOOL_A", "0");
        assert_eq!(env_bool("LIGHTNING_TEST_BOOL_A").unwrap(), Some(false));
        std::env::set_var("LIGHTNING_TEST_BOOL_A", "maybe");
        assert!(env_bool("LIGHTNING_TEST_BOOL_A").is_err());
        std::env::remove_var("LIGHTNING_TEST_BOOL_A");
        assert_eq!(env_bool("LIGHTNING_TEST_BOOL_A").unwrap(), None);
    }

    #[test]
    fn test_env_numeric_rejects_garbage() {
        std::env::set_var("LIGHTNING_TEST_NUM", "not-a-number");
        assert!(env_parse::<u32>("LIGHTNING_TEST_NUM").is_err());
        std::env::set_var("LIGHTNING_TEST_NUM", "42");
        assert_eq!(env_parse::<u32>("LIGHTNING_TEST_NUM").unwrap(), Some(42));
        std::env::remove_var("LIGHTNING_TEST_NUM");
    }

    #[test]
    fn test_mode_defaults_respect_explicit_provider() {
        let mut config = RuntimeConfig::default();
        config.mode = ExecutionMode::Azure;
        config.event_bus_provider = "redis".to_string();
        config.apply_mode_defaults();

        assert_eq!(config.storage_provider, "azure_cosmos");
        assert_eq!(config.event_bus_provider, "redis");
        assert_eq!(config.serverless_provider, "azure_functions");
    }
}
