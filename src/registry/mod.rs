//! Process-wide tool and event registries
//!
//! Explicit singletons: initialize once at startup, reset in tests.
//! Concurrent reads are permitted; writes serialize behind the table locks.

pub mod events;
pub mod tools;

pub use events::{EventCategory, EventDefinition, EventRegistry, ScheduleKind};
pub use tools::{AccessScope, PlannerTool, ToolMetadata, ToolRegistry, ToolType};
