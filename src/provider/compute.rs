//! Container and serverless capability contracts
//!
//! Kept deliberately small: the runtime assembly instantiates one of each,
//! health checks them, and hands them to callers. Cloud SDK bindings live
//! behind these traits, outside this crate.

use crate::error::Result;
use crate::health::HealthCheckable;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle state of a managed container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Pending,
    Running,
    Stopped,
    Failed,
}

/// Request to start a container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub command: Vec<String>,
}

/// Observed status of a container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub id: String,
    pub name: String,
    pub state: ContainerState,
    pub started_at: DateTime<Utc>,
}

/// Capability contract for container backends
#[async_trait]
pub trait ContainerRuntime: HealthCheckable {
    /// Start a container, returning its id
    async fn start_container(&self, spec: ContainerSpec) -> Result<String>;

    async fn stop_container(&self, container_id: &str) -> Result<()>;

    async fn container_status(&self, container_id: &str) -> Result<ContainerStatus>;

    async fn list_containers(&self) -> Result<Vec<ContainerStatus>>;
}

/// Request to deploy a serverless function
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    /// Handler reference, opaque to the core
    pub handler: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Capability contract for serverless backends
#[async_trait]
pub trait ServerlessRuntime: HealthCheckable {
    async fn deploy_function(&self, spec: FunctionSpec) -> Result<()>;

    /// Invoke a deployed function with a JSON payload
    async fn invoke_function(
        &self,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value>;

    async fn delete_function(&self, name: &str) -> Result<()>;

    async fn list_functions(&self) -> Result<Vec<FunctionSpec>>;
}
