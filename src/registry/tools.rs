//! Tool registry
//!
//! In-memory table of tool metadata keyed by id. Tools carry access scopes
//! and capabilities; the planner view exposes only PLANNER-scoped entries
//! in `{inputs, produces, description}` form. On id conflicts the first
//! registration wins — later ones are logged and skipped.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

/// Types of tools in the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolType {
    Agent,
    Llm,
    Native,
    Mcp,
    Api,
}

/// Access scopes gating which surfaces can see a tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessScope {
    Planner,
    AgentAll,
    System,
    User,
}

/// Immutable tool metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub id: String,
    pub name: String,
    pub description: String,
    pub tool_type: ToolType,
    #[serde(default)]
    pub access_scopes: HashSet<AccessScope>,
    #[serde(default)]
    pub capabilities: HashSet<String>,
    /// Declared inputs (name → type), used by the planner and validator
    #[serde(default)]
    pub inputs: Option<HashMap<String, String>>,
    /// Event names this tool produces
    #[serde(default)]
    pub produces: Option<Vec<String>>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ToolMetadata {
    pub fn is_accessible_to(&self, scope: AccessScope) -> bool {
        self.access_scopes.contains(&scope)
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

/// Planner-facing view of a tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerTool {
    pub inputs: HashMap<String, String>,
    pub produces: Vec<String>,
    pub description: String,
}

/// In-memory tool registry
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, ToolMetadata>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Create a registry pre-loaded with the built-in tool set
    pub fn with_builtin_tools() -> Self {
        let registry = Self::new();
        for tool in builtin_tools() {
            registry.register(tool);
        }
        registry
    }

    /// Register a tool; returns false when the id is already taken
    /// (first registration wins)
    pub fn register(&self, tool: ToolMetadata) -> bool {
        let mut tools = self.tools.write().expect("tool registry lock");
        if tools.contains_key(&tool.id) {
            tracing::warn!(tool = %tool.id, "Tool already registered, skipping");
            return false;
        }
        tools.insert(tool.id.clone(), tool);
        true
    }

    pub fn get(&self, tool_id: &str) -> Option<ToolMetadata> {
        self.tools.read().expect("tool registry lock").get(tool_id).cloned()
    }

    /// List tools with optional filters; disabled tools are excluded
    pub fn list(
        &self,
        scope: Option<AccessScope>,
        tool_type: Option<ToolType>,
        capability: Option<&str>,
    ) -> Vec<ToolMetadata> {
        let tools = self.tools.read().expect("tool registry lock");
        let mut result: Vec<ToolMetadata> = tools
            .values()
            .filter(|t| t.enabled)
            .filter(|t| scope.map_or(true, |s| t.is_accessible_to(s)))
            .filter(|t| tool_type.map_or(true, |ty| t.tool_type == ty))
            .filter(|t| capability.map_or(true, |c| t.has_capability(c)))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.id.cmp(&b.id));
        result
    }

    /// Tools exposed to the planner: PLANNER scope with declared
    /// inputs and produces
    pub fn planner_tools(&self, _user_id: Option<&str>) -> HashMap<String, PlannerTool> {
        self.list(Some(AccessScope::Planner), None, None)
            .into_iter()
            .filter_map(|tool| {
                let inputs = tool.inputs?;
                let produces = tool.produces?;
                Some((
                    tool.id,
                    PlannerTool {
                        inputs,
                        produces,
                        description: tool.description,
                    },
                ))
            })
            .collect()
    }

    /// Flip a tool's enabled flag; returns false for unknown ids
    pub fn set_enabled(&self, tool_id: &str, enabled: bool) -> bool {
        let mut tools = self.tools.write().expect("tool registry lock");
        match tools.get_mut(tool_id) {
            Some(tool) => {
                tool.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.tools.read().expect("tool registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn scopes(list: &[AccessScope]) -> HashSet<AccessScope> {
    list.iter().copied().collect()
}

fn caps(list: &[&str]) -> HashSet<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn inputs(pairs: &[(&str, &str)]) -> Option<HashMap<String, String>> {
    Some(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
}

/// The built-in tool set
fn builtin_tools() -> Vec<ToolMetadata> {
    vec![
        ToolMetadata {
            id: "agent.conseil".to_string(),
            name: "Conseil Agent".to_string(),
            description: "Research and shell execution agent with context access".to_string(),
            tool_type: ToolType::Agent,
            access_scopes: scopes(&[AccessScope::Planner]),
            capabilities: caps(&["task_execution", "shell_access", "research"]),
            inputs: inputs(&[("objective", "string"), ("additional_context", "string")]),
            produces: Some(vec!["event.agent.conseil.start".to_string()]),
            enabled: true,
        },
        ToolMetadata {
            id: "llm.summarize".to_string(),
            name: "LLM Summarize".to_string(),
            description: "Summarize text with a language model".to_string(),
            tool_type: ToolType::Llm,
            access_scopes: scopes(&[AccessScope::Planner, AccessScope::AgentAll]),
            capabilities: caps(&["text_generation", "summarization"]),
            inputs: inputs(&[("text", "string"), ("style", "string")]),
            produces: Some(vec!["event.summary_ready".to_string()]),
            enabled: true,
        },
        ToolMetadata {
            id: "llm.general_prompt".to_string(),
            name: "LLM General".to_string(),
            description: "General language model prompt processing".to_string(),
            tool_type: ToolType::Llm,
            access_scopes: scopes(&[AccessScope::Planner, AccessScope::AgentAll]),
            capabilities: caps(&["text_generation", "reasoning"]),
            inputs: inputs(&[
                ("system_prompt", "string"),
                ("user_prompt", "string"),
                ("model", "string"),
            ]),
            produces: Some(vec!["event.llm_response".to_string()]),
            enabled: true,
        },
        ToolMetadata {
            id: "email.send".to_string(),
            name: "Email Send".to_string(),
            description: "Send email with attachments".to_string(),
            tool_type: ToolType::Native,
            access_scopes: scopes(&[AccessScope::AgentAll]),
            capabilities: caps(&["email_send", "communication"]),
            inputs: inputs(&[("to", "string"), ("subject", "string"), ("body", "string")]),
            produces: Some(vec!["event.email.sent".to_string()]),
            enabled: true,
        },
        ToolMetadata {
            id: "cron.configure".to_string(),
            name: "Cron Configure".to_string(),
            description: "Configure scheduled plan execution".to_string(),
            tool_type: ToolType::Native,
            access_scopes: scopes(&[AccessScope::Planner]),
            capabilities: caps(&["scheduling", "automation"]),
            inputs: inputs(&[("plan_id", "string"), ("cron_expression", "string")]),
            produces: Some(vec!["event.cron.configured".to_string()]),
            enabled: true,
        },
        ToolMetadata {
            id: "event.timer.start".to_string(),
            name: "Event Timer".to_string(),
            description: "Create timed events".to_string(),
            tool_type: ToolType::Native,
            access_scopes: scopes(&[AccessScope::Planner]),
            capabilities: caps(&["timing", "event_management"]),
            inputs: inputs(&[("duration", "integer")]),
            produces: Some(vec!["event.timed_event".to_string()]),
            enabled: true,
        },
    ]
}

static GLOBAL_TOOLS: RwLock<Option<Arc<ToolRegistry>>> = RwLock::new(None);

/// Get the process-wide tool registry, loading built-ins on first use
pub fn global() -> Arc<ToolRegistry> {
    {
        let guard = GLOBAL_TOOLS.read().expect("global tool registry lock");
        if let Some(registry) = guard.as_ref() {
            return Arc::clone(registry);
        }
    }
    let mut guard = GLOBAL_TOOLS.write().expect("global tool registry lock");
    if let Some(registry) = guard.as_ref() {
        return Arc::clone(registry);
    }
    let registry = Arc::new(ToolRegistry::with_builtin_tools());
    *guard = Some(Arc::clone(&registry));
    registry
}

/// Install a pre-configured registry as the process-wide instance
pub fn initialize(registry: Arc<ToolRegistry>) {
    *GLOBAL_TOOLS.write().expect("global tool registry lock") = Some(registry);
}

/// Drop the process-wide registry (for tests)
pub fn reset() {
    *GLOBAL_TOOLS.write().expect("global tool registry lock") = None;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_tools_loaded() {
        let registry = ToolRegistry::with_builtin_tools();
        assert!(registry.get("llm.summarize").is_some());
        assert!(registry.get("agent.conseil").is_some());
        assert!(registry.get("nonexistent.tool").is_none());
    }

    #[test]
    fn test_first_registration_wins() {
        let registry = ToolRegistry::with_builtin_tools();
        let original = registry.get("llm.summarize").unwrap();

        let imposter = ToolMetadata {
            description: "imposter".to_string(),
            ..original.clone()
        };
        assert!(!registry.register(imposter));
        assert_eq!(registry.get("llm.summarize").unwrap().description, original.description);
    }

    #[test]
    fn test_list_filters() {
        let registry = ToolRegistry::with_builtin_tools();

        let planner = registry.list(Some(AccessScope::Planner), None, None);
        assert!(planner.iter().all(|t| t.is_accessible_to(AccessScope::Planner)));
        assert!(planner.iter().any(|t| t.id == "llm.summarize"));
        // email.send is agent-only
        assert!(!planner.iter().any(|t| t.id == "email.send"));

        let llm = registry.list(None, Some(ToolType::Llm), None);
        assert_eq!(llm.len(), 2);

        let schedulers = registry.list(None, None, Some("scheduling"));
        assert!(schedulers.iter().any(|t| t.id == "cron.configure"));
    }

    #[test]
    fn test_disabled_tools_hidden_from_list() {
        let registry = ToolRegistry::with_builtin_tools();
        assert!(registry.set_enabled("llm.summarize", false));

        let listed = registry.list(None, None, None);
        assert!(!listed.iter().any(|t| t.id == "llm.summarize"));
        // get() still returns it so callers can see the disabled flag
        assert!(!registry.get("llm.summarize").unwrap().enabled);

        assert!(!registry.set_enabled("ghost.tool", true));
    }

    #[test]
    fn test_planner_view_shape() {
        let registry = ToolRegistry::with_builtin_tools();
        let view = registry.planner_tools(None);

        let summarize = &view["llm.summarize"];
        assert_eq!(summarize.inputs["text"], "string");
        assert_eq!(summarize.inputs["style"], "string");
        assert_eq!(summarize.produces, vec!["event.summary_ready"]);

        // Agent-only tools don't leak into the planner view
        assert!(!view.contains_key("email.send"));
    }

    #[test]
    fn test_global_registry_idempotent_and_resettable() {
        reset();
        let a = global();
        let b = global();
        assert!(Arc::ptr_eq(&a, &b));

        let custom = Arc::new(ToolRegistry::new());
        initialize(Arc::clone(&custom));
        assert!(Arc::ptr_eq(&global(), &custom));
        reset();
    }
}
