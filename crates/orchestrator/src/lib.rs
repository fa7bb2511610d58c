//! Orchestrator - batch dispatch, progress and job control
//!
//! A job's object set is partitioned into batches; each batch gets its own
//! plugin instance and runs on the item-processing pool. Job start/stop
//! messages use a separate control pool.

mod control;
mod coordinator;
mod instance;
mod orchestrator;
mod partitioner;
mod pool;
mod progress;
mod sources;

pub use control::{JobControlChannel, JobRegistry, JobRunner};
pub use coordinator::Coordinator;
pub use instance::{PluginInstance, PluginInstanceFactory, PreparedPlugin};
pub use orchestrator::Orchestrator;
pub use partitioner::{Batch, BatchIter, BatchPartitioner};
pub use pool::{BatchHandle, BatchTask, WorkerPool};
pub use progress::{ProgressEntry, ProgressSnapshot, ProgressTracker};
pub use sources::{open_source, FileStream, IdStream, IndexStream, RepresentationStream};
