//! Event registry
//!
//! Definitions for the event names plans may reference. External events
//! (category `external`) carry a trigger kind — cron, interval, webhook, or
//! manual — and optionally a schedule pattern; they are the only events a
//! plan may use as triggers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Event categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    /// From the external world (user input, sensors, APIs)
    Input,
    /// System communication between components
    Internal,
    /// To the external world (UI updates, notifications)
    Output,
    /// Externally scheduled or triggered, usable as plan triggers
    External,
}

/// Trigger kinds for external events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleKind {
    #[serde(rename = "time.cron")]
    Cron,
    #[serde(rename = "time.interval")]
    Interval,
    #[serde(rename = "webhook")]
    Webhook,
    #[serde(rename = "manual")]
    Manual,
}

impl ScheduleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleKind::Cron => "time.cron",
            ScheduleKind::Interval => "time.interval",
            ScheduleKind::Webhook => "webhook",
            ScheduleKind::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "time.cron" => Some(ScheduleKind::Cron),
            "time.interval" => Some(ScheduleKind::Interval),
            "webhook" => Some(ScheduleKind::Webhook),
            "manual" => Some(ScheduleKind::Manual),
            _ => None,
        }
    }
}

/// Definition of an event type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDefinition {
    /// Event name; must start with `event.`
    pub name: String,
    pub category: EventCategory,
    #[serde(default)]
    pub kind: Option<ScheduleKind>,
    /// Cron pattern or ISO-8601 interval for scheduled events
    #[serde(default)]
    pub schedule_pattern: Option<String>,
    #[serde(default)]
    pub required_data: Option<Vec<String>>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Registry of all known event definitions
pub struct EventRegistry {
    events: RwLock<HashMap<String, EventDefinition>>,
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRegistry {
    pub fn new() -> Self {
        Self {
            events: RwLock::new(HashMap::new()),
        }
    }

    /// Create a registry pre-loaded with the built-in event set
    pub fn with_builtin_events() -> Self {
        let registry = Self::new();
        for event in builtin_events() {
            registry.register(event);
        }
        registry
    }

    /// Register or replace an event definition
    pub fn register(&self, definition: EventDefinition) {
        self.events
            .write()
            .expect("event registry lock")
            .insert(definition.name.clone(), definition);
    }

    pub fn get(&self, name: &str) -> Option<EventDefinition> {
        self.events.read().expect("event registry lock").get(name).cloned()
    }

    pub fn all(&self) -> HashMap<String, EventDefinition> {
        self.events.read().expect("event registry lock").clone()
    }

    pub fn by_category(&self, category: EventCategory) -> Vec<EventDefinition> {
        let mut result: Vec<EventDefinition> = self
            .events
            .read()
            .expect("event registry lock")
            .values()
            .filter(|e| e.category == category)
            .cloned()
            .collect();
        result.sort_by(|a, b| a.name.cmp(&b.name));
        result
    }

    /// External events only — those with a trigger kind, usable by plans
    pub fn external_events(&self) -> Vec<EventDefinition> {
        self.by_category(EventCategory::External)
    }

    pub fn is_external(&self, name: &str) -> bool {
        self.get(name)
            .map(|e| e.category == EventCategory::External)
            .unwrap_or(false)
    }

    /// Remove all definitions (for tests)
    pub fn clear(&self) {
        self.events.write().expect("event registry lock").clear();
    }
}

/// The built-in event set
fn builtin_events() -> Vec<EventDefinition> {
    vec![
        EventDefinition {
            name: "event.email.check".to_string(),
            category: EventCategory::External,
            kind: Some(ScheduleKind::Interval),
            schedule_pattern: Some("PT5M".to_string()),
            required_data: Some(vec!["folder".to_string()]),
            description: Some("Check for new emails".to_string()),
        },
        EventDefinition {
            name: "event.calendar.sync".to_string(),
            category: EventCategory::External,
            kind: Some(ScheduleKind::Cron),
            schedule_pattern: Some("0 */6 * * *".to_string()),
            required_data: None,
            description: Some("Sync calendar events".to_string()),
        },
        EventDefinition {
            name: "event.webhook.github".to_string(),
            category: EventCategory::External,
            kind: Some(ScheduleKind::Webhook),
            schedule_pattern: None,
            required_data: Some(vec!["repository".to_string(), "action".to_string()]),
            description: Some("GitHub webhook events".to_string()),
        },
        EventDefinition {
            name: "event.manual.trigger".to_string(),
            category: EventCategory::External,
            kind: Some(ScheduleKind::Manual),
            schedule_pattern: None,
            required_data: None,
            description: Some("Manually triggered event".to_string()),
        },
        EventDefinition {
            name: "event.time.daily".to_string(),
            category: EventCategory::External,
            kind: Some(ScheduleKind::Cron),
            schedule_pattern: Some("0 20 * * *".to_string()),
            required_data: None,
            description: Some("Daily time-based trigger".to_string()),
        },
        EventDefinition {
            name: "event.user.action".to_string(),
            category: EventCategory::Input,
            kind: None,
            schedule_pattern: None,
            required_data: None,
            description: Some("User action event".to_string()),
        },
        EventDefinition {
            name: "event.worker.task".to_string(),
            category: EventCategory::Internal,
            kind: None,
            schedule_pattern: None,
            required_data: None,
            description: Some("Worker task event".to_string()),
        },
        EventDefinition {
            name: "event.context.update".to_string(),
            category: EventCategory::Internal,
            kind: None,
            schedule_pattern: None,
            required_data: None,
            description: Some("Context update event".to_string()),
        },
        EventDefinition {
            name: "event.notification".to_string(),
            category: EventCategory::Output,
            kind: None,
            schedule_pattern: None,
            required_data: None,
            description: Some("Notification output event".to_string()),
        },
        EventDefinition {
            name: "event.system.start".to_string(),
            category: EventCategory::Internal,
            kind: None,
            schedule_pattern: None,
            required_data: None,
            description: Some("System startup event".to_string()),
        },
        EventDefinition {
            name: "event.system.stop".to_string(),
            category: EventCategory::Internal,
            kind: None,
            schedule_pattern: None,
            required_data: None,
            description: Some("System shutdown event".to_string()),
        },
    ]
}

static GLOBAL_EVENTS: RwLock<Option<Arc<EventRegistry>>> = RwLock::new(None);

/// Get the process-wide event registry, loading built-ins on first use
pub fn global() -> Arc<EventRegistry> {
    {
        let guard = GLOBAL_EVENTS.read().expect("global event registry lock");
        if let Some(registry) = guard.as_ref() {
            return Arc::clone(registry);
        }
    }
    let mut guard = GLOBAL_EVENTS.write().expect("global event registry lock");
    if let Some(registry) = guard.as_ref() {
        return Arc::clone(registry);
    }
    let registry = Arc::new(EventRegistry::with_builtin_events());
    *guard = Some(Arc::clone(&registry));
    registry
}

/// Install a pre-configured registry as the process-wide instance
pub fn initialize(registry: Arc<EventRegistry>) {
    *GLOBAL_EVENTS.write().expect("global event registry lock") = Some(registry);
}

/// Drop the process-wide registry (for tests)
pub fn reset() {
    *GLOBAL_EVENTS.write().expect("global event registry lock") = None;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_events() {
        let registry = EventRegistry::with_builtin_events();
        let manual = registry.get("event.manual.trigger").unwrap();
        assert_eq!(manual.category, EventCategory::External);
        assert_eq!(manual.kind, Some(ScheduleKind::Manual));
        assert!(registry.get("event.ghost").is_none());
    }

    #[test]
    fn test_external_events_have_kinds() {
        let registry = EventRegistry::with_builtin_events();
        let external = registry.external_events();
        assert!(!external.is_empty());
        assert!(external.iter().all(|e| e.kind.is_some()));
        assert!(external.iter().any(|e| e.name == "event.webhook.github"));
        // Internal events excluded
        assert!(!external.iter().any(|e| e.name == "event.worker.task"));
    }

    #[test]
    fn test_is_external() {
        let registry = EventRegistry::with_builtin_events();
        assert!(registry.is_external("event.manual.trigger"));
        assert!(!registry.is_external("event.worker.task"));
        assert!(!registry.is_external("event.unknown"));
    }

    #[test]
    fn test_register_and_clear() {
        let registry = EventRegistry::new();
        registry.register(EventDefinition {
            name: "event.custom".to_string(),
            category: EventCategory::External,
            kind: Some(ScheduleKind::Webhook),
            schedule_pattern: None,
            required_data: None,
            description: None,
        });
        assert!(registry.is_external("event.custom"));

        registry.clear();
        assert!(registry.all().is_empty());
    }

    #[test]
    fn test_schedule_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&ScheduleKind::Cron).unwrap(),
            "\"time.cron\""
        );
        assert_eq!(ScheduleKind::parse("manual"), Some(ScheduleKind::Manual));
        assert_eq!(ScheduleKind::parse("time.interval"), Some(ScheduleKind::Interval));
        assert_eq!(ScheduleKind::parse("yearly"), None);
        assert_eq!(ScheduleKind::Webhook.as_str(), "webhook");
    }

    #[test]
    fn test_global_registry() {
        reset();
        let a = global();
        let b = global();
        assert!(Arc::ptr_eq(&a, &b));
        reset();
    }
}
