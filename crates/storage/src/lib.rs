//! Arca Storage - Collaborator backends
//!
//! In-memory model and index services over a repository fixture, plus
//! in-memory and SQLite job stores.

pub mod jobs;
pub mod repository;
pub mod sqlite;

pub use jobs::MemoryJobStore;
pub use repository::{MemoryRepository, RepositoryFixture, StreamStats};
pub use sqlite::SqliteJobStore;
