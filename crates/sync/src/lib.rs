//! Constellation Sync - the incremental diagram synchronization engine
//!
//! This crate ties the pieces together:
//! - Project configuration
//! - Scope rules and change-to-scope mapping
//! - The generation backend port with Gemini and mock adapters
//! - Retry with backoff and the per-scope state machine
//! - The update orchestrator
//! - Export of Clean diagrams to a mirrored tree

pub mod backend;
pub mod config;
pub mod export;
pub mod orchestrator;
pub mod retry;
pub mod scope;
pub mod state;

pub use backend::{create_backend, DiagramBackend, FileInput, GeneratedDiagram, GenerationRequest, ScopeFile, ScopeLink};
pub use config::{example_config, BackendConfig, BackendKind, Config, ExportConfig, ScopeConfig, SyncConfig};
pub use export::{export_diagrams, ExportReport};
pub use orchestrator::{scopes_for, CycleOptions, CycleReport, Engine, ScopeOutcome, UpdateResult};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use scope::{DiagramScope, ScopeRule, ScopeSet};
pub use state::{MarkOutcome, ScopeStates, TransitionError};

/// Result type for sync operations
pub type Result<T> = anyhow::Result<T>;
