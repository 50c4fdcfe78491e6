//! # lightning-runtime
//!
//! Event-driven orchestration runtime with pluggable providers.
//!
//! ## Overview
//!
//! `lightning-runtime` routes typed messages between producers and handlers
//! through a topic-addressed event bus, guarantees at-most-once delivery per
//! handler with bounded retry, preserves undeliverable messages in a
//! dead-letter store, and composes against swappable storage, container, and
//! serverless backends selected by configuration. Generated workflow plans
//! are gated by schema, registry, and Petri-net soundness validation before
//! they are persisted or executed.
//!
//! ## Quick Start
//!
//! ```rust
//! use lightning_runtime::provider::local::LocalEventBus;
//! use lightning_runtime::provider::{handler_fn, EventBus};
//! use lightning_runtime::EventMessage;
//!
//! # async fn example() -> lightning_runtime::Result<()> {
//! let bus = LocalEventBus::default();
//!
//! bus.subscribe(
//!     "user.*",
//!     handler_fn(|event| async move {
//!         println!("got {}", event.event_type);
//!         Ok(())
//!     }),
//!     None,
//!     None,
//! )
//! .await?;
//!
//! bus.start().await?;
//! bus.publish(
//!     EventMessage::new("user.created", serde_json::json!({"id": "u-1"})),
//!     None,
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **Provider traits** — `EventBus`, `StorageProvider`, `ContainerRuntime`,
//!   `ServerlessRuntime`, all `HealthCheckable`
//! - **ProviderFactory** — name → constructor registry, selected by config
//! - **CircuitBreaker / HealthMonitor** — resilience around any provider
//! - **Plan validator** — schema + registries + Petri-net soundness
//! - **InstructionProcessor** — instruction events → validated, stored plans
//! - **LightningRuntime** — wires all of the above

pub mod config;
pub mod crypto;
pub mod error;
pub mod event;
pub mod factory;
pub mod health;
pub mod instruction;
pub mod plan;
pub mod provider;
pub mod registry;
pub mod resilient;
pub mod runtime;

// Re-export core types
pub use config::{ExecutionMode, RuntimeConfig};
pub use error::{Result, RuntimeError};
pub use event::{EventMessage, EventPriority};
pub use factory::ProviderFactory;
pub use health::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, HealthCheckResult, HealthCheckable,
    HealthMonitor, HealthStatus,
};
pub use instruction::{
    InstructionAction, InstructionProcessor, InstructionRecord, InstructionTrigger,
    MemoryPlanStore, PlanStore, Planner, StoredPlan,
};
pub use plan::{
    validate_plan, validate_plan_value, GraphType, Plan, PlanEvent, PlanStep, Severity,
    ValidationContext, ValidationReport, ValidationResult,
};
pub use provider::{
    handler_fn, ContainerRuntime, DeadLetterRecord, Document, DocumentStore, EventBus,
    EventHandler, FilterExpression, ServerlessRuntime, StorageProvider,
};
pub use resilient::{ResilientEventBus, ResilientStorageProvider};
pub use runtime::LightningRuntime;

// Re-export the local providers for convenience
pub use provider::local::{LocalBusOptions, LocalEventBus, LocalStorageProvider};
