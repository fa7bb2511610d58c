//! Arca Common - Shared types and traits
//!
//! This crate provides the data model, collaborator traits, error taxonomy
//! and configuration used across the arca plugin orchestrator.
//!
//! Key pieces:
//! - Repository objects and index query types
//! - Jobs, selectors and the job status lifecycle
//! - Reports and per-object report items
//! - The plugin lifecycle contract

pub mod config;
pub mod error;
pub mod job;
pub mod report;
pub mod traits;
pub mod types;

// Re-export commonly used types
pub use config::OrchestratorConfig;
pub use error::{ArcaError, ArcaResult, ErrorKind, HookStage};
pub use job::{
    Job, JobFilter, JobId, JobRequest, JobSort, JobStatus, ObjectSelector, OrchestratorMethod,
    PluginParameters,
};
pub use report::{ErrorRecord, PluginState, Report, ReportCounts, ReportItem};
pub use traits::{
    Collaborators, ExecutionContext, IndexService, InstanceId, JobStore, ModelService,
    ObjectStream, Plugin, PluginInfo, PluginRegistry, ProgressSink, VecStream,
};
pub use types::{
    Aip, AipState, File, Filter, FilterTerm, IndexResult, ObjectKind, ObjectRef, Representation,
    RepositoryObject, Sorter, Sublist, TransferredResource,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
