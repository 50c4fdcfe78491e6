//! Plan validation
//!
//! Independent validators (schema, types, external events, tools) run
//! concurrently; the Petri-net validator runs sequentially afterwards. The
//! merged report fails the call iff any error-severity result failed —
//! warnings (orphaned events) are surfaced but never fatal.

use crate::error::{Result, RuntimeError};
use crate::plan::petri::{self, COMPLETION_PLACE};
use crate::plan::{GraphType, Plan};
use crate::registry::events::EventRegistry;
use crate::registry::tools::ToolRegistry;
use crate::registry::ScheduleKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Severity of a validation finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// Result of a single validator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub name: String,
    pub success: bool,
    pub severity: Severity,
    pub message: String,
}

impl ValidationResult {
    fn pass(name: &str) -> Self {
        Self {
            name: name.to_string(),
            success: true,
            severity: Severity::Info,
            message: String::new(),
        }
    }

    fn fail(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            success: false,
            severity: Severity::Error,
            message: message.into(),
        }
    }

    fn warn(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            success: false,
            severity: Severity::Warning,
            message: message.into(),
        }
    }
}

/// Merged output of a validation run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub results: Vec<ValidationResult>,
}

impl ValidationReport {
    /// True iff any error-severity result failed
    pub fn has_errors(&self) -> bool {
        self.results
            .iter()
            .any(|r| !r.success && r.severity == Severity::Error)
    }

    /// Names of validators that failed with error severity
    pub fn failing_validators(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| !r.success && r.severity == Severity::Error)
            .map(|r| r.name.as_str())
            .collect()
    }

    pub fn warnings(&self) -> Vec<&ValidationResult> {
        self.results
            .iter()
            .filter(|r| !r.success && r.severity == Severity::Warning)
            .collect()
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for result in self.results.iter().filter(|r| !r.success) {
            if !first {
                writeln!(f)?;
            }
            write!(f, "{}: {}", result.name, result.message)?;
            first = false;
        }
        Ok(())
    }
}

/// Registries the validators check plans against
#[derive(Clone)]
pub struct ValidationContext {
    pub tools: Arc<ToolRegistry>,
    pub events: Arc<EventRegistry>,
}

impl ValidationContext {
    pub fn new(tools: Arc<ToolRegistry>, events: Arc<EventRegistry>) -> Self {
        Self { tools, events }
    }

    /// Context backed by the process-wide registries
    pub fn global() -> Self {
        Self {
            tools: crate::registry::tools::global(),
            events: crate::registry::events::global(),
        }
    }
}

/// Validate a plan JSON document
///
/// Returns the report when validation passes (possibly with warnings), or
/// `PlanValidationError` carrying the merged report when any validator
/// fails with error severity.
pub async fn validate_plan_value(
    value: &serde_json::Value,
    ctx: &ValidationContext,
) -> Result<ValidationReport> {
    let mut results: Vec<ValidationResult> = Vec::new();

    // Independent validators run concurrently
    let mut handles = Vec::new();
    {
        let value = value.clone();
        handles.push(tokio::task::spawn_blocking(move || schema_check(&value)));
    }
    {
        let value = value.clone();
        handles.push(tokio::task::spawn_blocking(move || vec![types_check(&value)]));
    }

    let parsed: Option<Plan> = serde_json::from_value(value.clone()).ok();
    if let Some(plan) = &parsed {
        {
            let plan = plan.clone();
            let events = Arc::clone(&ctx.events);
            handles.push(tokio::task::spawn_blocking(move || {
                vec![external_events_check(&plan, &events)]
            }));
        }
        {
            let plan = plan.clone();
            let tools = Arc::clone(&ctx.tools);
            handles.push(tokio::task::spawn_blocking(move || {
                vec![tools_check(&plan, &tools)]
            }));
        }
    }

    for handle in handles {
        match handle.await {
            Ok(mut batch) => results.append(&mut batch),
            Err(e) => results.push(ValidationResult::fail(
                "internal",
                format!("validator task failed: {}", e),
            )),
        }
    }

    // The Petri-net validator runs sequentially after the others
    if let Some(plan) = &parsed {
        results.push(petri_check(plan));
    }

    results.sort_by(|a, b| a.name.cmp(&b.name));
    let report = ValidationReport { results };

    if report.has_errors() {
        return Err(RuntimeError::PlanValidation(report));
    }
    for warning in report.warnings() {
        tracing::warn!(validator = %warning.name, message = %warning.message, "Plan validation warning");
    }
    Ok(report)
}

/// Validate a typed plan
pub async fn validate_plan(plan: &Plan, ctx: &ValidationContext) -> Result<ValidationReport> {
    let value = plan.to_value()?;
    validate_plan_value(&value, ctx).await
}

const PLAN_KEYS: &[&str] = &[
    "plan_name",
    "graph_type",
    "events",
    "steps",
    "description",
    "summary",
    "instruction_id",
    "instruction_name",
    "revised_from",
    "revision_reason",
];
const EVENT_KEYS: &[&str] = &["name", "kind", "schedule", "description"];

/// Structural checks on the raw document, independent of typed parsing
fn schema_check(value: &serde_json::Value) -> Vec<ValidationResult> {
    let mut errors: Vec<String> = Vec::new();
    let mut results = Vec::new();

    let Some(object) = value.as_object() else {
        return vec![ValidationResult::fail("schema", "plan must be a JSON object")];
    };

    for key in object.keys() {
        if !PLAN_KEYS.contains(&key.as_str()) {
            errors.push(format!("unknown top-level key: {}", key));
        }
    }

    match object.get("plan_name").and_then(|v| v.as_str()) {
        Some(name) if !name.is_empty() => {}
        Some(_) => errors.push("plan_name must be non-empty".to_string()),
        None => errors.push("plan_name is required".to_string()),
    }

    match object.get("graph_type").and_then(|v| v.as_str()) {
        Some("acyclic") | Some("reactive") => {}
        Some(other) => errors.push(format!(
            "graph_type must be 'acyclic' or 'reactive', got '{}'",
            other
        )),
        None => errors.push("graph_type is required".to_string()),
    }

    let mut declared: Vec<(String, bool)> = Vec::new(); // (name, has kind)
    match object.get("events").and_then(|v| v.as_array()) {
        Some(events) => {
            let mut seen = HashSet::new();
            for event in events {
                let Some(event_obj) = event.as_object() else {
                    errors.push("each event must be an object".to_string());
                    continue;
                };
                for key in event_obj.keys() {
                    if !EVENT_KEYS.contains(&key.as_str()) {
                        errors.push(format!("unknown event key: {}", key));
                    }
                }
                match event_obj.get("name").and_then(|v| v.as_str()) {
                    Some(name) if name.starts_with("event.") => {
                        if !seen.insert(name.to_string()) {
                            errors.push(format!("duplicate event name: {}", name));
                        }
                        declared.push((name.to_string(), event_obj.contains_key("kind")));
                    }
                    Some(name) => {
                        errors.push(format!("event name must start with 'event.': {}", name))
                    }
                    None => errors.push("event is missing a name".to_string()),
                }
            }
        }
        None => errors.push("events must be an array".to_string()),
    }

    let mut consumed: BTreeSet<String> = BTreeSet::new();
    let mut emitted: BTreeSet<String> = BTreeSet::new();
    match object.get("steps").and_then(|v| v.as_array()) {
        Some(steps) => {
            let mut seen = HashSet::new();
            for step in steps {
                let Some(step_obj) = step.as_object() else {
                    errors.push("each step must be an object".to_string());
                    continue;
                };
                match step_obj.get("name").and_then(|v| v.as_str()) {
                    Some(name) if !name.is_empty() => {
                        if !seen.insert(name.to_string()) {
                            errors.push(format!("duplicate step name: {}", name));
                        }
                    }
                    _ => errors.push("step is missing a non-empty name".to_string()),
                }
                if step_obj.get("action").and_then(|v| v.as_str()).map_or(true, str::is_empty) {
                    errors.push("step is missing a non-empty action".to_string());
                }
                if let Some(on) = step_obj.get("on").and_then(|v| v.as_array()) {
                    consumed.extend(on.iter().filter_map(|v| v.as_str()).map(str::to_string));
                } else {
                    errors.push("step 'on' must be an array".to_string());
                }
                if let Some(emits) = step_obj.get("emits").and_then(|v| v.as_array()) {
                    emitted.extend(emits.iter().filter_map(|v| v.as_str()).map(str::to_string));
                }
            }
        }
        None => errors.push("steps must be an array".to_string()),
    }

    // The synthesized completion place is reserved
    let declared_names: BTreeSet<&str> = declared.iter().map(|(n, _)| n.as_str()).collect();
    if declared_names.contains(COMPLETION_PLACE)
        || consumed.contains(COMPLETION_PLACE)
        || emitted.contains(COMPLETION_PLACE)
    {
        errors.push(format!("'{}' is reserved for internal use", COMPLETION_PLACE));
    }

    // Every consumed event must be declared or emitted by some step
    for name in &consumed {
        if !declared_names.contains(name.as_str()) && !emitted.contains(name) {
            errors.push(format!(
                "step consumes undeclared event not emitted by any step: {}",
                name
            ));
        }
    }

    // Declared-but-unused events: a warning, unless external (pending trigger)
    let orphans: Vec<&str> = declared
        .iter()
        .filter(|(name, has_kind)| {
            !has_kind && !consumed.contains(name) && !emitted.contains(name)
        })
        .map(|(name, _)| name.as_str())
        .collect();
    if !orphans.is_empty() {
        results.push(ValidationResult::warn(
            "orphaned_events",
            format!(
                "events declared but neither consumed nor emitted: {}",
                orphans.join(", ")
            ),
        ));
    }

    if errors.is_empty() {
        results.push(ValidationResult::pass("schema"));
    } else {
        results.push(ValidationResult::fail("schema", errors.join("; ")));
    }
    results
}

/// Typed parse: field shapes, enums, unknown-field rejection
fn types_check(value: &serde_json::Value) -> ValidationResult {
    let plan: Plan = match serde_json::from_value(value.clone()) {
        Ok(plan) => plan,
        Err(e) => return ValidationResult::fail("types", e.to_string()),
    };

    for event in &plan.events {
        if let Some(kind) = &event.kind {
            if ScheduleKind::parse(kind).is_none() {
                return ValidationResult::fail(
                    "types",
                    format!("event '{}' has unknown kind '{}'", event.name, kind),
                );
            }
        }
    }
    ValidationResult::pass("types")
}

/// External events must match the registry; internal events must not carry
/// trigger metadata
fn external_events_check(plan: &Plan, registry: &EventRegistry) -> ValidationResult {
    let external: HashMap<String, ScheduleKind> = registry
        .all()
        .into_iter()
        .filter_map(|(name, def)| def.kind.map(|k| (name, k)))
        .collect();

    for event in &plan.events {
        match external.get(&event.name) {
            Some(expected) => {
                let actual = event.kind.as_deref().unwrap_or("");
                if actual != expected.as_str() {
                    return ValidationResult::fail(
                        "external_events",
                        format!(
                            "kind mismatch for external event {}: expected '{}', got '{}'",
                            event.name,
                            expected.as_str(),
                            actual
                        ),
                    );
                }
            }
            None => {
                if event.kind.is_some() || event.schedule.is_some() {
                    return ValidationResult::fail(
                        "external_events",
                        format!(
                            "internal event {} should not specify 'kind' or 'schedule'",
                            event.name
                        ),
                    );
                }
            }
        }
    }
    ValidationResult::pass("external_events")
}

/// Every step action must be an enabled registered tool with all declared
/// inputs supplied; extra args are allowed
fn tools_check(plan: &Plan, registry: &ToolRegistry) -> ValidationResult {
    for step in &plan.steps {
        let Some(tool) = registry.get(&step.action) else {
            return ValidationResult::fail("tools", format!("Unknown action: {}", step.action));
        };
        if !tool.enabled {
            return ValidationResult::fail(
                "tools",
                format!("Action '{}' is disabled", step.action),
            );
        }
        if let Some(inputs) = &tool.inputs {
            let missing: Vec<&str> = {
                let mut missing: Vec<&str> = inputs
                    .keys()
                    .filter(|input| !step.args.contains_key(*input))
                    .map(String::as_str)
                    .collect();
                missing.sort_unstable();
                missing
            };
            if !missing.is_empty() {
                return ValidationResult::fail(
                    "tools",
                    format!(
                        "Step '{}' missing required arguments: {}",
                        step.name,
                        missing.join(", ")
                    ),
                );
            }
        }
    }
    ValidationResult::pass("tools")
}

/// Workflow-net shape, soundness, and (for acyclic plans) cycle freedom
fn petri_check(plan: &Plan) -> ValidationResult {
    let net = match petri::build(plan) {
        Ok(net) => net,
        Err(e) => return ValidationResult::fail("petri_net", e),
    };
    if let Err(e) = net.check_workflow_net() {
        return ValidationResult::fail(
            "petri_net",
            format!("plan does not form a valid workflow net: {}", e),
        );
    }
    if let Err(e) = net.check_soundness() {
        return ValidationResult::fail("petri_net", format!("net is not sound: {}", e));
    }
    if plan.graph_type == GraphType::Acyclic {
        if let Err(e) = net.check_acyclic() {
            return ValidationResult::fail("petri_net", e);
        }
    }
    ValidationResult::pass("petri_net")
}
