//! Plan documents
//!
//! A plan is a Petri-net-structured workflow: externally triggered events
//! flow into steps, steps emit internal events, and the validator gates
//! every plan before it is persisted or executed. Unknown fields are
//! rejected throughout.

pub mod petri;
pub mod validator;

pub use validator::{
    validate_plan, validate_plan_value, Severity, ValidationContext, ValidationReport,
    ValidationResult,
};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Workflow graph discipline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphType {
    /// No cycles permitted in the transition graph
    Acyclic,
    /// Cycles are allowed; the workflow reacts to repeated triggers
    Reactive,
}

/// An event a plan declares, external (with a trigger kind) or internal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanEvent {
    /// Event name; must start with `event.`
    pub name: String,

    /// Trigger kind for external events: `time.cron`, `time.interval`,
    /// `webhook`, or `manual`. Internal events must omit it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Schedule pattern for time-based triggers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One step: consumes events, runs a tool action, emits events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanStep {
    pub name: String,

    /// Events that must arrive before the step fires
    pub on: Vec<String>,

    /// Tool id from the tool registry
    pub action: String,

    /// Arguments passed to the action; must cover the tool's declared inputs
    #[serde(default)]
    pub args: HashMap<String, String>,

    /// Events emitted when the step completes
    #[serde(default)]
    pub emits: Vec<String>,

    /// Optional guard expression, opaque to validation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A complete workflow plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Plan {
    pub plan_name: String,
    pub graph_type: GraphType,
    pub events: Vec<PlanEvent>,
    pub steps: Vec<PlanStep>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Natural-language summary produced at generation time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,

    /// Set when the plan was generated from an instruction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction_name: Option<String>,

    /// Parent plan id when this plan revises an earlier one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revised_from: Option<String>,

    /// The critique that prompted the revision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_reason: Option<String>,
}

impl Plan {
    /// Parse a plan from JSON, rejecting unknown fields
    pub fn from_value(value: &serde_json::Value) -> crate::error::Result<Self> {
        serde_json::from_value(value.clone()).map_err(Into::into)
    }

    pub fn to_value(&self) -> crate::error::Result<serde_json::Value> {
        serde_json::to_value(self).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_roundtrip() {
        let json = serde_json::json!({
            "plan_name": "summarize-on-demand",
            "graph_type": "acyclic",
            "events": [
                {"name": "event.manual.trigger", "kind": "manual"}
            ],
            "steps": [
                {
                    "name": "s",
                    "on": ["event.manual.trigger"],
                    "action": "llm.summarize",
                    "args": {"text": "x", "style": "brief"},
                    "emits": ["event.summary_complete"]
                }
            ]
        });

        let plan = Plan::from_value(&json).unwrap();
        assert_eq!(plan.plan_name, "summarize-on-demand");
        assert_eq!(plan.graph_type, GraphType::Acyclic);
        assert_eq!(plan.events[0].kind.as_deref(), Some("manual"));
        assert_eq!(plan.steps[0].emits, vec!["event.summary_complete"]);

        let back = plan.to_value().unwrap();
        assert_eq!(back["plan_name"], "summarize-on-demand");
        // Optional fields stay absent
        assert!(back.get("summary").is_none());
    }

    #[test]
    fn test_unknown_top_level_key_rejected() {
        let json = serde_json::json!({
            "plan_name": "p",
            "graph_type": "reactive",
            "events": [],
            "steps": [],
            "bogus_key": 1
        });
        assert!(Plan::from_value(&json).is_err());
    }

    #[test]
    fn test_unknown_step_key_rejected() {
        let json = serde_json::json!({
            "plan_name": "p",
            "graph_type": "reactive",
            "events": [],
            "steps": [
                {"name": "s", "on": [], "action": "a", "retries": 5}
            ]
        });
        assert!(Plan::from_value(&json).is_err());
    }

    #[test]
    fn test_invalid_graph_type_rejected() {
        let json = serde_json::json!({
            "plan_name": "p",
            "graph_type": "circular",
            "events": [],
            "steps": []
        });
        assert!(Plan::from_value(&json).is_err());
    }

    #[test]
    fn test_revision_metadata_fields() {
        let json = serde_json::json!({
            "plan_name": "p",
            "graph_type": "reactive",
            "events": [],
            "steps": [],
            "summary": "does things",
            "revised_from": "plan-1",
            "revision_reason": "tighten the trigger"
        });
        let plan = Plan::from_value(&json).unwrap();
        assert_eq!(plan.revised_from.as_deref(), Some("plan-1"));
        assert_eq!(plan.revision_reason.as_deref(), Some("tighten the trigger"));
    }
}
