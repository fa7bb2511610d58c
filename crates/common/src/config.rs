//! Orchestrator configuration.
//!
//! Pool sizes are read once at startup; the orchestrator never resizes them.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{ArcaError, ArcaResult};

pub const DEFAULT_BLOCK_SIZE: usize = 100;
pub const DEFAULT_PER_BLOCK_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_JOB_WORKER_COUNT: usize = 2;
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

pub const ENV_WORKERS: &str = "ARCA_WORKERS";
pub const ENV_BLOCK_SIZE: &str = "ARCA_BLOCK_SIZE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Item-processing pool size.
    pub worker_count: usize,
    /// Job-control pool size.
    pub job_worker_count: usize,
    pub block_size: usize,
    pub per_block_timeout_secs: u64,
    pub worker_queue_capacity: usize,
    pub control_queue_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            job_worker_count: DEFAULT_JOB_WORKER_COUNT,
            block_size: DEFAULT_BLOCK_SIZE,
            per_block_timeout_secs: DEFAULT_PER_BLOCK_TIMEOUT_SECS,
            worker_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            control_queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl OrchestratorConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> ArcaResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ArcaError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| ArcaError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `ARCA_WORKERS` / `ARCA_BLOCK_SIZE` when set.
    pub fn with_env_overrides(mut self) -> ArcaResult<Self> {
        if let Some(v) = read_env_usize(ENV_WORKERS)? {
            self.worker_count = v;
        }
        if let Some(v) = read_env_usize(ENV_BLOCK_SIZE)? {
            self.block_size = v;
        }
        self.validate()?;
        Ok(self)
    }

    #[must_use]
    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    #[must_use]
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    #[must_use]
    pub fn with_per_block_timeout(mut self, timeout: Duration) -> Self {
        self.per_block_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn validate(&self) -> ArcaResult<()> {
        let checks = [
            ("worker_count", self.worker_count),
            ("job_worker_count", self.job_worker_count),
            ("block_size", self.block_size),
            ("worker_queue_capacity", self.worker_queue_capacity),
            ("control_queue_capacity", self.control_queue_capacity),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(ArcaError::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.per_block_timeout_secs == 0 {
            return Err(ArcaError::Config(
                "per_block_timeout_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn per_block_timeout(&self) -> Duration {
        Duration::from_secs(self.per_block_timeout_secs)
    }

    /// Number of blocks needed for `object_count` objects, at least one.
    #[must_use]
    pub fn blocks_for(&self, object_count: usize) -> usize {
        object_count.div_ceil(self.block_size).max(1)
    }

    /// Aggregate timeout scaled by the number of blocks.
    #[must_use]
    pub fn timeout_for_blocks(&self, blocks: usize) -> Duration {
        self.per_block_timeout()
            .saturating_mul(u32::try_from(blocks.max(1)).unwrap_or(u32::MAX))
    }
}

fn read_env_usize(name: &str) -> ArcaResult<Option<usize>> {
    match std::env::var(name) {
        Ok(v) => v
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|e| ArcaError::Config(format!("{name}={v}: {e}"))),
        Err(_) => Ok(None),
    }
}
