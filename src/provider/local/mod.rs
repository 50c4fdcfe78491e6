//! In-process reference implementations of the provider contracts

pub mod compute;
pub mod event_bus;
pub mod storage;

pub use compute::{FunctionCallable, LocalContainerRuntime, LocalServerlessRuntime};
pub use event_bus::{LocalBusOptions, LocalEventBus};
pub use storage::{LocalDocumentStore, LocalStorageProvider};
