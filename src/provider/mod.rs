//! Provider abstraction layer
//!
//! Capability contracts for the swappable backends: event bus, document
//! storage, container runtime, and serverless runtime. Concrete
//! implementations are selected at runtime through the provider factory;
//! the `local` module holds the in-process reference implementations.

pub mod compute;
pub mod event_bus;
pub mod local;
pub mod storage;

pub use compute::{
    ContainerRuntime, ContainerSpec, ContainerState, ContainerStatus, FunctionSpec,
    ServerlessRuntime,
};
pub use event_bus::{handler_fn, DeadLetterRecord, EventBus, EventHandler, FilterExpression};
pub use storage::{Document, DocumentStore, StorageProvider};
