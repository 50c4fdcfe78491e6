//! Instruction processing — automatic plan generation
//!
//! Subscribes to `instruction.created` and `instruction.updated`, renders
//! the instruction into a deterministic planner prompt, asks the external
//! planner for a plan, validates it, and persists it. Validation failures
//! are fed back to the planner for a bounded number of attempts. Handler
//! errors are recorded per instruction and never crash the subscriber.

use crate::error::{Result, RuntimeError};
use crate::event::EventMessage;
use crate::plan::{validate_plan_value, ValidationContext};
use crate::provider::event_bus::{handler_fn, EventBus};
use crate::registry::PlannerTool;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// What fires an instruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionTrigger {
    pub event_type: String,
    #[serde(default)]
    pub providers: Vec<String>,
    /// Free-form conditions; `content_filters.subject_contains` is rendered
    /// into the planner prompt
    #[serde(default)]
    pub conditions: serde_json::Value,
}

/// What an instruction does when triggered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionAction {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// A user-authored automation rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub trigger: InstructionTrigger,
    pub action: InstructionAction,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// External planner collaborator
///
/// Given a natural-language instruction and the planner's tool subset,
/// returns a JSON object whose `plan` field parses as a plan. Error
/// messages are added to the next attempt's context.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn generate_plan(
        &self,
        prompt: &str,
        registry_subset: &HashMap<String, PlannerTool>,
        model: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<serde_json::Value>;
}

/// Placeholder planner for deployments that haven't wired a real one.
/// Every call fails, and the failure lands in the per-instruction error map.
pub struct NullPlanner;

#[async_trait]
impl Planner for NullPlanner {
    async fn generate_plan(
        &self,
        _prompt: &str,
        _registry_subset: &HashMap<String, PlannerTool>,
        _model: Option<&str>,
        _user_id: Option<&str>,
    ) -> Result<serde_json::Value> {
        Err(RuntimeError::Planner("no planner configured".to_string()))
    }
}

/// A persisted plan record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredPlan {
    pub id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub plan: serde_json::Value,
    pub status: String,
}

/// Plan persistence collaborator; safe for concurrent callers
#[async_trait]
pub trait PlanStore: Send + Sync {
    /// Persist a plan, returning a fresh opaque id
    async fn save(&self, user_id: &str, plan: serde_json::Value) -> Result<String>;

    async fn get(&self, plan_id: &str) -> Result<Option<StoredPlan>>;

    /// Latest plan generated for an instruction, if any
    async fn get_by_instruction(&self, instruction_id: &str) -> Result<Option<StoredPlan>>;

    /// Persist a revision of an existing plan
    ///
    /// The new record links to its parent via `revised_from` and carries the
    /// critique in `revision_reason`; records are never mutated, so walking
    /// parent pointers yields the revision chain.
    async fn save_revision(
        &self,
        plan_id: &str,
        critique: &str,
        revised_plan: serde_json::Value,
    ) -> Result<String>;
}

/// In-memory plan store for local runs and tests
#[derive(Default)]
pub struct MemoryPlanStore {
    plans: RwLock<HashMap<String, StoredPlan>>,
}

impl MemoryPlanStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PlanStore for MemoryPlanStore {
    async fn save(&self, user_id: &str, plan: serde_json::Value) -> Result<String> {
        let plan_id = uuid::Uuid::new_v4().to_string();
        let record = StoredPlan {
            id: plan_id.clone(),
            user_id: user_id.to_string(),
            created_at: Utc::now(),
            plan,
            status: "template".to_string(),
        };
        self.plans
            .write()
            .map_err(|e| RuntimeError::Storage(format!("Plan store lock poisoned: {}", e)))?
            .insert(plan_id.clone(), record);
        Ok(plan_id)
    }

    async fn get(&self, plan_id: &str) -> Result<Option<StoredPlan>> {
        Ok(self
            .plans
            .read()
            .map_err(|e| RuntimeError::Storage(format!("Plan store lock poisoned: {}", e)))?
            .get(plan_id)
            .cloned())
    }

    async fn get_by_instruction(&self, instruction_id: &str) -> Result<Option<StoredPlan>> {
        let plans = self
            .plans
            .read()
            .map_err(|e| RuntimeError::Storage(format!("Plan store lock poisoned: {}", e)))?;
        let mut matching: Vec<&StoredPlan> = plans
            .values()
            .filter(|record| {
                record.plan.get("instruction_id").and_then(|v| v.as_str()) == Some(instruction_id)
            })
            .collect();
        matching.sort_by_key(|record| record.created_at);
        Ok(matching.last().cloned().cloned())
    }

    async fn save_revision(
        &self,
        plan_id: &str,
        critique: &str,
        mut revised_plan: serde_json::Value,
    ) -> Result<String> {
        let user_id = {
            let plans = self
                .plans
                .read()
                .map_err(|e| RuntimeError::Storage(format!("Plan store lock poisoned: {}", e)))?;
            let parent = plans
                .get(plan_id)
                .ok_or_else(|| RuntimeError::NotFound(format!("Plan not found: {}", plan_id)))?;
            parent.user_id.clone()
        };

        if let Some(object) = revised_plan.as_object_mut() {
            object.insert("revised_from".to_string(), serde_json::json!(plan_id));
            object.insert("revision_reason".to_string(), serde_json::json!(critique));
        }
        self.save(&user_id, revised_plan).await
    }
}

/// Processes instruction events into validated, persisted plans
pub struct InstructionProcessor {
    planner: Arc<dyn Planner>,
    plan_store: Arc<dyn PlanStore>,
    validation: ValidationContext,
    max_retries: u32,
    /// Latest generation error per instruction id, for operator inspection
    errors: RwLock<HashMap<String, String>>,
}

impl InstructionProcessor {
    pub fn new(
        planner: Arc<dyn Planner>,
        plan_store: Arc<dyn PlanStore>,
        validation: ValidationContext,
    ) -> Self {
        Self {
            planner,
            plan_store,
            validation,
            max_retries: 4,
            errors: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn plan_store(&self) -> &Arc<dyn PlanStore> {
        &self.plan_store
    }

    /// Latest generation error recorded for an instruction
    pub fn last_error(&self, instruction_id: &str) -> Option<String> {
        self.errors
            .read()
            .ok()
            .and_then(|errors| errors.get(instruction_id).cloned())
    }

    /// Render an instruction into a planner prompt. Deterministic: the same
    /// instruction always produces the same prompt.
    pub fn build_prompt(instruction: &InstructionRecord) -> String {
        let mut parts = vec![format!("Create a workflow plan for: {}", instruction.name)];

        if let Some(description) = &instruction.description {
            if !description.is_empty() {
                parts.push(format!("Description: {}", description));
            }
        }

        let mut trigger = format!("When a {} event occurs", instruction.trigger.event_type);
        if !instruction.trigger.providers.is_empty() {
            trigger.push_str(&format!(" from {}", instruction.trigger.providers.join(", ")));
        }
        if let Some(keywords) = instruction
            .trigger
            .conditions
            .pointer("/content_filters/subject_contains")
            .and_then(|v| v.as_array())
        {
            let words: Vec<&str> = keywords.iter().filter_map(|v| v.as_str()).collect();
            if !words.is_empty() {
                trigger.push_str(&format!(" with subject containing: {}", words.join(", ")));
            }
        }
        parts.push(format!("Trigger: {}", trigger));

        let config = &instruction.action.config;
        let mut action = format!("Execute {}", instruction.action.action_type);
        match instruction.action.action_type.as_str() {
            "update_context_summary" => {
                let context_key = config.get("context_key").and_then(|v| v.as_str()).unwrap_or("");
                action.push_str(&format!(" for context key '{}'", context_key));
                if let Some(prompt) = config.get("synthesis_prompt").and_then(|v| v.as_str()) {
                    if !prompt.is_empty() {
                        action.push_str(&format!(" using prompt: {}", prompt));
                    }
                }
            }
            "send_email" => {
                let to = config.pointer("/email/to").and_then(|v| v.as_str()).unwrap_or("");
                let subject = config
                    .pointer("/email/subject")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                action.push_str(&format!(" to {} with subject '{}'", to, subject));
            }
            "conseil_task" => {
                let complexity = config
                    .get("complexity")
                    .and_then(|v| v.as_str())
                    .unwrap_or("simple");
                action.push_str(&format!(" with {} complexity", complexity));
                if let Some(prompt) = config.get("prompt").and_then(|v| v.as_str()) {
                    if !prompt.is_empty() {
                        action.push_str(&format!(" and prompt: {}", prompt));
                    }
                }
            }
            _ => {}
        }
        parts.push(format!("Action: {}", action));

        parts.push(
            "This should be a reactive workflow that can handle multiple instances of the trigger event."
                .to_string(),
        );
        parts.join("\n")
    }

    /// Generate, validate, decorate, and persist a plan for an instruction
    ///
    /// Validator errors are appended to the prompt between attempts so the
    /// planner can correct itself.
    pub async fn generate_and_store(
        &self,
        instruction: &InstructionRecord,
        user_id: &str,
    ) -> Result<String> {
        let base_prompt = Self::build_prompt(instruction);
        let subset = self.validation.tools.planner_tools(Some(user_id));
        let mut critique: Option<String> = None;

        for attempt in 1..=self.max_retries {
            let prompt = match &critique {
                Some(c) => format!("{}\n\nCRITIC: {}\nPlease re-emit a corrected plan.", base_prompt, c),
                None => base_prompt.clone(),
            };

            let response = self
                .planner
                .generate_plan(&prompt, &subset, None, Some(user_id))
                .await;

            let response = match response {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(
                        instruction = %instruction.id,
                        attempt,
                        error = %e,
                        "Planner call failed"
                    );
                    critique = Some(e.to_string());
                    continue;
                }
            };

            // Planner responses carry the plan in a `plan` field with an
            // optional `summary`; a bare plan object is accepted too
            let (mut plan_value, summary) = match response.get("plan") {
                Some(plan) => (
                    plan.clone(),
                    response
                        .get("summary")
                        .and_then(|v| v.as_str())
                        .unwrap_or("No summary provided.")
                        .to_string(),
                ),
                None => (response, "No summary provided.".to_string()),
            };

            if let Some(object) = plan_value.as_object_mut() {
                object.insert("summary".to_string(), serde_json::json!(summary));
                object.insert("instruction_id".to_string(), serde_json::json!(instruction.id));
                object.insert(
                    "instruction_name".to_string(),
                    serde_json::json!(instruction.name),
                );
            }

            match validate_plan_value(&plan_value, &self.validation).await {
                Ok(_) => {
                    let plan_id = self.plan_store.save(user_id, plan_value).await?;
                    tracing::info!(
                        instruction = %instruction.id,
                        plan = %plan_id,
                        attempt,
                        "Generated and stored plan"
                    );
                    return Ok(plan_id);
                }
                Err(e) => {
                    tracing::warn!(
                        instruction = %instruction.id,
                        attempt,
                        error = %e,
                        "Generated plan failed validation"
                    );
                    critique = Some(e.to_string());
                }
            }
        }

        Err(RuntimeError::Planner(format!(
            "could not produce a valid plan in {} attempts",
            self.max_retries
        )))
    }

    /// Handle `instruction.created`
    pub async fn handle_instruction_created(&self, event: EventMessage) {
        let instruction_id = event
            .data
            .get("instruction_id")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();

        if let Err(e) = self.process_created(&event).await {
            tracing::error!(
                instruction = %instruction_id,
                error = %e,
                "Failed to process instruction.created event"
            );
            self.record_error(&instruction_id, &e);
        }
    }

    /// Handle `instruction.updated`
    pub async fn handle_instruction_updated(&self, event: EventMessage) {
        let instruction_id = event
            .data
            .get("instruction_id")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();

        if let Err(e) = self.process_updated(&event).await {
            tracing::error!(
                instruction = %instruction_id,
                error = %e,
                "Failed to process instruction.updated event"
            );
            self.record_error(&instruction_id, &e);
        }
    }

    async fn process_created(&self, event: &EventMessage) -> Result<()> {
        let instruction = extract_instruction(event)?;
        let user_id = event_user(event);
        self.generate_and_store(&instruction, &user_id).await?;
        self.clear_error(&instruction.id);
        Ok(())
    }

    async fn process_updated(&self, event: &EventMessage) -> Result<()> {
        let instruction = extract_instruction(event)?;
        let previous: Option<InstructionRecord> = event
            .data
            .get("previous")
            .filter(|v| !v.is_null())
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()?;

        if !should_regenerate(&instruction, previous.as_ref()) {
            tracing::info!(
                instruction = %instruction.id,
                "Instruction changes don't require plan regeneration"
            );
            return Ok(());
        }

        let user_id = event_user(event);
        self.generate_and_store(&instruction, &user_id).await?;
        self.clear_error(&instruction.id);
        Ok(())
    }

    fn record_error(&self, instruction_id: &str, error: &RuntimeError) {
        if let Ok(mut errors) = self.errors.write() {
            errors.insert(instruction_id.to_string(), error.to_string());
        }
    }

    fn clear_error(&self, instruction_id: &str) {
        if let Ok(mut errors) = self.errors.write() {
            errors.remove(instruction_id);
        }
    }

    /// Subscribe both handlers on the bus; returns the subscription ids
    pub async fn register(self: Arc<Self>, bus: &dyn EventBus) -> Result<Vec<String>> {
        let processor = Arc::clone(&self);
        let created = bus
            .subscribe(
                "instruction.created",
                handler_fn(move |event| {
                    let processor = Arc::clone(&processor);
                    async move {
                        processor.handle_instruction_created(event).await;
                        Ok(())
                    }
                }),
                None,
                None,
            )
            .await?;

        let processor = Arc::clone(&self);
        let updated = bus
            .subscribe(
                "instruction.updated",
                handler_fn(move |event| {
                    let processor = Arc::clone(&processor);
                    async move {
                        processor.handle_instruction_updated(event).await;
                        Ok(())
                    }
                }),
                None,
                None,
            )
            .await?;

        tracing::info!("Instruction event handlers registered");
        Ok(vec![created, updated])
    }
}

fn extract_instruction(event: &EventMessage) -> Result<InstructionRecord> {
    let value = event
        .data
        .get("instruction")
        .ok_or_else(|| RuntimeError::Handler("no instruction data in event".to_string()))?;
    serde_json::from_value(value.clone()).map_err(Into::into)
}

fn event_user(event: &EventMessage) -> String {
    event
        .metadata
        .get("userID")
        .and_then(|v| v.as_str())
        .unwrap_or("default")
        .to_string()
}

/// Regenerate only when the trigger or action changed, or the instruction
/// was just enabled
fn should_regenerate(current: &InstructionRecord, previous: Option<&InstructionRecord>) -> bool {
    let Some(previous) = previous else {
        return true;
    };
    if current.trigger != previous.trigger {
        return true;
    }
    if current.action != previous.action {
        return true;
    }
    current.enabled && !previous.enabled
}
