//! Per-source lifecycle: edge gate, optimization, live bandit selection and
//! demotion, serialized per key and persisted with optimistic versioning.

pub mod config;
pub mod lifecycle;
pub mod phase;
pub mod state;
pub mod store;
mod worker;

pub use config::{EngineConfig, LifecycleConfig};
pub use lifecycle::{Engine, EngineHandle, Ingest, Selection, Stores};
pub use phase::{PhaseMachine, Transition};
pub use state::{RunSummary, SelectionState};
pub use store::{MemoryStore, SelectionStore, SqliteStore};
