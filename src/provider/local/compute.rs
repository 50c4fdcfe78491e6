//! Local container and serverless runtimes
//!
//! In-process registries that satisfy the compute capability contracts for
//! single-machine deployments. Containers are tracked as records rather
//! than real OS containers; serverless functions are stored specs invoked
//! through a registered callable, when one is provided.

use crate::error::{Result, RuntimeError};
use crate::health::{HealthCheckResult, HealthCheckable};
use crate::provider::compute::{
    ContainerRuntime, ContainerSpec, ContainerState, ContainerStatus, FunctionSpec,
    ServerlessRuntime,
};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Local in-process container runtime
#[derive(Default)]
pub struct LocalContainerRuntime {
    containers: RwLock<HashMap<String, ContainerStatus>>,
}

impl LocalContainerRuntime {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContainerRuntime for LocalContainerRuntime {
    async fn start_container(&self, spec: ContainerSpec) -> Result<String> {
        let id = format!("ctr-{}", uuid::Uuid::new_v4());
        let status = ContainerStatus {
            id: id.clone(),
            name: spec.name.clone(),
            state: ContainerState::Running,
            started_at: Utc::now(),
        };
        self.containers.write().await.insert(id.clone(), status);
        tracing::info!(container = %id, image = %spec.image, "Started container");
        Ok(id)
    }

    async fn stop_container(&self, container_id: &str) -> Result<()> {
        let mut containers = self.containers.write().await;
        match containers.get_mut(container_id) {
            Some(status) => {
                status.state = ContainerState::Stopped;
                tracing::info!(container = %container_id, "Stopped container");
                Ok(())
            }
            None => Err(RuntimeError::NotFound(format!(
                "Container not found: {}",
                container_id
            ))),
        }
    }

    async fn container_status(&self, container_id: &str) -> Result<ContainerStatus> {
        self.containers
            .read()
            .await
            .get(container_id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(format!("Container not found: {}", container_id)))
    }

    async fn list_containers(&self) -> Result<Vec<ContainerStatus>> {
        Ok(self.containers.read().await.values().cloned().collect())
    }
}

#[async_trait]
impl HealthCheckable for LocalContainerRuntime {
    async fn health_check(&self) -> HealthCheckResult {
        let start = std::time::Instant::now();
        let _ = self.containers.read().await.len();
        HealthCheckResult::healthy(start.elapsed().as_secs_f64() * 1000.0)
    }

    fn provider_name(&self) -> &str {
        "container_local"
    }
}

/// Async callable backing a locally deployed function
pub type FunctionCallable =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync>;

struct DeployedFunction {
    spec: FunctionSpec,
    callable: Option<FunctionCallable>,
}

/// Local in-process serverless runtime
#[derive(Default)]
pub struct LocalServerlessRuntime {
    functions: RwLock<HashMap<String, DeployedFunction>>,
}

impl LocalServerlessRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a callable to a deployed function so `invoke_function` can
    /// execute it in-process
    pub async fn bind_callable(&self, name: &str, callable: FunctionCallable) -> Result<()> {
        let mut functions = self.functions.write().await;
        match functions.get_mut(name) {
            Some(deployed) => {
                deployed.callable = Some(callable);
                Ok(())
            }
            None => Err(RuntimeError::NotFound(format!("Function not found: {}", name))),
        }
    }
}

#[async_trait]
impl ServerlessRuntime for LocalServerlessRuntime {
    async fn deploy_function(&self, spec: FunctionSpec) -> Result<()> {
        tracing::info!(function = %spec.name, handler = %spec.handler, "Deployed function");
        self.functions.write().await.insert(
            spec.name.clone(),
            DeployedFunction {
                spec,
                callable: None,
            },
        );
        Ok(())
    }

    async fn invoke_function(
        &self,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let callable = {
            let functions = self.functions.read().await;
            let deployed = functions
                .get(name)
                .ok_or_else(|| RuntimeError::NotFound(format!("Function not found: {}", name)))?;
            deployed.callable.clone()
        };
        match callable {
            Some(f) => f(payload).await,
            None => Err(RuntimeError::Provider(format!(
                "Function '{}' has no local callable bound",
                name
            ))),
        }
    }

    async fn delete_function(&self, name: &str) -> Result<()> {
        self.functions.write().await.remove(name);
        Ok(())
    }

    async fn list_functions(&self) -> Result<Vec<FunctionSpec>> {
        Ok(self
            .functions
            .read()
            .await
            .values()
            .map(|d| d.spec.clone())
            .collect())
    }
}

#[async_trait]
impl HealthCheckable for LocalServerlessRuntime {
    async fn health_check(&self) -> HealthCheckResult {
        let start = std::time::Instant::now();
        let _ = self.functions.read().await.len();
        HealthCheckResult::healthy(start.elapsed().as_secs_f64() * 1000.0)
    }

    fn provider_name(&self) -> &str {
        "serverless_local"
    }
}
