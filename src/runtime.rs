//! Runtime assembly
//!
//! Wires the whole system: providers built through the factory, storage and
//! bus wrapped for resilience, everything registered with the health
//! monitor, the bus started, and the instruction processor subscribed.
//! Teardown reverses the order.

use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::event::EventMessage;
use crate::factory::{self, ProviderFactory};
use crate::health::{HealthCheckable, HealthMonitor};
use crate::instruction::{InstructionProcessor, MemoryPlanStore, NullPlanner, PlanStore, Planner};
use crate::plan::ValidationContext;
use crate::provider::{ContainerRuntime, EventBus, ServerlessRuntime, StorageProvider};
use crate::resilient::{ResilientEventBus, ResilientStorageProvider};
use std::sync::Arc;

/// Builder for [`LightningRuntime`]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    factory: Option<Arc<ProviderFactory>>,
    planner: Option<Arc<dyn Planner>>,
    plan_store: Option<Arc<dyn PlanStore>>,
    validation: Option<ValidationContext>,
}

impl RuntimeBuilder {
    pub fn factory(mut self, factory: Arc<ProviderFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn plan_store(mut self, plan_store: Arc<dyn PlanStore>) -> Self {
        self.plan_store = Some(plan_store);
        self
    }

    pub fn validation(mut self, validation: ValidationContext) -> Self {
        self.validation = Some(validation);
        self
    }

    /// Instantiate providers and wire the runtime; nothing starts yet
    pub fn build(self) -> Result<LightningRuntime> {
        let factory = self.factory.unwrap_or_else(factory::global);

        let storage = Arc::new(ResilientStorageProvider::wrap(
            factory.create_storage_provider(&self.config)?,
        ));
        let event_bus = Arc::new(ResilientEventBus::wrap(
            factory.create_event_bus(&self.config)?,
        ));
        let containers = factory.create_container_runtime(&self.config)?;
        let serverless = factory.create_serverless_runtime(&self.config)?;

        let monitor = Arc::new(HealthMonitor::new(self.config.health_check_interval_seconds));
        monitor.register(
            storage.provider_name().to_string(),
            Arc::clone(&storage) as Arc<dyn HealthCheckable>,
        );
        monitor.register(
            event_bus.provider_name().to_string(),
            Arc::clone(&event_bus) as Arc<dyn HealthCheckable>,
        );
        monitor.register(
            containers.provider_name().to_string(),
            Arc::clone(&containers) as Arc<dyn HealthCheckable>,
        );
        monitor.register(
            serverless.provider_name().to_string(),
            Arc::clone(&serverless) as Arc<dyn HealthCheckable>,
        );

        let planner = self.planner.unwrap_or_else(|| Arc::new(NullPlanner));
        let plan_store = self
            .plan_store
            .unwrap_or_else(|| Arc::new(MemoryPlanStore::new()));
        let validation = self.validation.unwrap_or_else(ValidationContext::global);
        let processor = Arc::new(InstructionProcessor::new(planner, plan_store, validation));

        Ok(LightningRuntime {
            config: self.config,
            storage,
            event_bus,
            containers,
            serverless,
            monitor,
            processor,
            subscriptions: tokio::sync::Mutex::new(Vec::new()),
        })
    }
}

/// The assembled runtime
pub struct LightningRuntime {
    config: RuntimeConfig,
    storage: Arc<ResilientStorageProvider>,
    event_bus: Arc<ResilientEventBus>,
    containers: Arc<dyn ContainerRuntime>,
    serverless: Arc<dyn ServerlessRuntime>,
    monitor: Arc<HealthMonitor>,
    processor: Arc<InstructionProcessor>,
    subscriptions: tokio::sync::Mutex<Vec<String>>,
}

impl LightningRuntime {
    pub fn builder(config: RuntimeConfig) -> RuntimeBuilder {
        RuntimeBuilder {
            config,
            factory: None,
            planner: None,
            plan_store: None,
            validation: None,
        }
    }

    /// Start the health monitor and event bus, and subscribe the
    /// instruction processor
    pub async fn start(&self) -> Result<()> {
        self.monitor.start().await;
        self.event_bus.start().await?;
        let subs = Arc::clone(&self.processor)
            .register(self.event_bus.as_ref())
            .await?;
        *self.subscriptions.lock().await = subs;
        tracing::info!(mode = ?self.config.mode, "Lightning runtime started");
        Ok(())
    }

    /// Tear down in reverse order: processor unsubscribed, bus stopped,
    /// monitor stopped, storage closed
    pub async fn shutdown(&self) -> Result<()> {
        let subs = std::mem::take(&mut *self.subscriptions.lock().await);
        for sub in subs {
            let _ = self.event_bus.unsubscribe(&sub).await;
        }
        self.event_bus.stop().await?;
        self.monitor.stop().await;
        self.storage.close().await?;
        tracing::info!("Lightning runtime stopped");
        Ok(())
    }

    /// Publish a `plan.execute` envelope for a validated plan
    pub async fn emit_plan_execute(&self, plan: &serde_json::Value, user_id: &str) -> Result<()> {
        self.emit_plan_event("plan.execute", plan, user_id).await
    }

    /// Publish a `plan.setup` envelope (register, configure schedules)
    pub async fn emit_plan_setup(&self, plan: &serde_json::Value, user_id: &str) -> Result<()> {
        self.emit_plan_event("plan.setup", plan, user_id).await
    }

    async fn emit_plan_event(
        &self,
        event_type: &str,
        plan: &serde_json::Value,
        user_id: &str,
    ) -> Result<()> {
        let event = EventMessage::new(
            event_type,
            serde_json::json!({
                "plan": plan,
                "user_id": user_id,
                "source": "planner",
            }),
        )
        .with_metadata("userID", user_id);
        self.event_bus.publish(event, None).await
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &Arc<ResilientEventBus> {
        &self.event_bus
    }

    pub fn storage(&self) -> &Arc<ResilientStorageProvider> {
        &self.storage
    }

    pub fn container_runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.containers
    }

    pub fn serverless_runtime(&self) -> &Arc<dyn ServerlessRuntime> {
        &self.serverless
    }

    pub fn health_monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn instruction_processor(&self) -> &Arc<InstructionProcessor> {
        &self.processor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{InstructionAction, InstructionRecord, InstructionTrigger};
    use crate::registry::events::EventRegistry;
    use crate::registry::tools::ToolRegistry;
    use crate::registry::PlannerTool;
    use async_trait::async_trait;
    use std::collections::HashMap;

    fn local_config(dir: &tempfile::TempDir) -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.storage_path = dir.path().to_string_lossy().into_owned();
        config.encryption_enabled = false;
        config.retry_backoff_seconds = 0;
        config
    }

    fn test_validation() -> ValidationContext {
        ValidationContext::new(
            Arc::new(ToolRegistry::with_builtin_tools()),
            Arc::new(EventRegistry::with_builtin_events()),
        )
    }

    struct CannedPlanner;

    #[async_trait]
    impl Planner for CannedPlanner {
        async fn generate_plan(
            &self,
            _prompt: &str,
            _registry_subset: &HashMap<String, PlannerTool>,
            _model: Option<&str>,
            _user_id: Option<&str>,
        ) -> crate::error::Result<serde_json::Value> {
            Ok(serde_json::json!({
                "plan": {
                    "plan_name": "canned",
                    "graph_type": "reactive",
                    "events": [{"name": "event.manual.trigger", "kind": "manual"}],
                    "steps": [
                        {
                            "name": "summarize",
                            "on": ["event.manual.trigger"],
                            "action": "llm.summarize",
                            "args": {"text": "t", "style": "brief"},
                            "emits": ["event.done"]
                        }
                    ]
                },
                "summary": "Canned plan."
            }))
        }
    }

    fn sample_instruction() -> InstructionRecord {
        InstructionRecord {
            id: "ins-42".to_string(),
            name: "answer email".to_string(),
            description: None,
            trigger: InstructionTrigger {
                event_type: "email.received".to_string(),
                providers: vec![],
                conditions: serde_json::json!({}),
            },
            action: InstructionAction {
                action_type: "send_email".to_string(),
                config: serde_json::json!({}),
            },
            enabled: true,
        }
    }

    #[tokio::test]
    async fn test_build_registers_all_providers_with_monitor() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = LightningRuntime::builder(local_config(&dir))
            .factory(Arc::new(ProviderFactory::new()))
            .validation(test_validation())
            .build()
            .unwrap();

        let statuses = runtime.health_monitor().all_status();
        let names: Vec<&str> = statuses.iter().map(|s| s.name.as_str()).collect();
        assert!(names.contains(&"storage_local"));
        assert!(names.contains(&"event_bus_local"));
        assert!(names.contains(&"container_local"));
        assert!(names.contains(&"serverless_local"));
    }

    #[tokio::test]
    async fn test_end_to_end_instruction_to_plan() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = LightningRuntime::builder(local_config(&dir))
            .factory(Arc::new(ProviderFactory::new()))
            .planner(Arc::new(CannedPlanner))
            .validation(test_validation())
            .build()
            .unwrap();
        runtime.start().await.unwrap();

        let event = EventMessage::new(
            "instruction.created",
            serde_json::json!({
                "instruction": sample_instruction(),
                "instruction_id": "ins-42"
            }),
        )
        .with_metadata("userID", "user-9");
        runtime.event_bus().publish(event, None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(400)).await;

        let stored = runtime
            .instruction_processor()
            .plan_store()
            .get_by_instruction("ins-42")
            .await
            .unwrap()
            .expect("plan should be generated and stored");
        assert_eq!(stored.user_id, "user-9");
        assert_eq!(stored.plan["instruction_name"], "answer email");

        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_unsubscribes_processor() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = LightningRuntime::builder(local_config(&dir))
            .factory(Arc::new(ProviderFactory::new()))
            .planner(Arc::new(CannedPlanner))
            .validation(test_validation())
            .build()
            .unwrap();

        runtime.start().await.unwrap();
        runtime.shutdown().await.unwrap();

        // After shutdown the instruction topics have no subscribers
        assert!(
            !runtime
                .event_bus()
                .has_subscribers("instruction.created", None)
                .await
        );
    }

    #[tokio::test]
    async fn test_emit_plan_events() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = LightningRuntime::builder(local_config(&dir))
            .factory(Arc::new(ProviderFactory::new()))
            .validation(test_validation())
            .build()
            .unwrap();
        runtime.start().await.unwrap();

        let plan = serde_json::json!({"plan_name": "p"});
        runtime.emit_plan_execute(&plan, "user-1").await.unwrap();
        runtime.emit_plan_setup(&plan, "user-1").await.unwrap();

        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_provider_fails_build() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = local_config(&dir);
        config.storage_provider = "s3_tape_archive".to_string();

        let result = LightningRuntime::builder(config)
            .factory(Arc::new(ProviderFactory::new()))
            .build();
        assert!(result.is_err());
    }
}
