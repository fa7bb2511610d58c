//! Metric helpers over the `metrics` facade.
//!
//! Without an installed recorder every call is a no-op.

use ::metrics::{counter, describe_counter, describe_gauge, gauge};

pub const BATCHES_TOTAL: &str = "arca_batches_total";
pub const JOBS_TOTAL: &str = "arca_jobs_total";
pub const REPORT_ITEMS_TOTAL: &str = "arca_report_items_total";
pub const JOB_PROGRESS_PERCENT: &str = "arca_job_progress_percent";
pub const LOST_BATCHES_TOTAL: &str = "arca_lost_batches_total";

/// How a single batch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Completed,
    Failed,
    HookFailed,
    TimedOut,
    Cancelled,
    Malformed,
}

impl BatchOutcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::HookFailed => "hook_failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
            Self::Malformed => "malformed",
        }
    }
}

/// Register metric descriptions with the installed recorder.
pub fn describe() {
    describe_counter!(BATCHES_TOTAL, "Batches finished, by plugin and outcome");
    describe_counter!(JOBS_TOTAL, "Jobs reaching a terminal status");
    describe_counter!(REPORT_ITEMS_TOTAL, "Report items merged, by state");
    describe_gauge!(JOB_PROGRESS_PERCENT, "Aggregate completion of a running job");
    describe_counter!(LOST_BATCHES_TOTAL, "Batch results dropped as malformed");
}

pub fn record_batch(plugin: &str, outcome: BatchOutcome) {
    counter!(BATCHES_TOTAL, "plugin" => plugin.to_string(), "outcome" => outcome.as_str())
        .increment(1);
    if outcome == BatchOutcome::Malformed {
        counter!(LOST_BATCHES_TOTAL).increment(1);
    }
}

pub fn record_job(status: &'static str) {
    counter!(JOBS_TOTAL, "status" => status).increment(1);
}

pub fn record_items(state: &'static str, count: usize) {
    counter!(REPORT_ITEMS_TOTAL, "state" => state).increment(count as u64);
}

pub fn set_job_progress(job_id: &str, percentage: f64) {
    gauge!(JOB_PROGRESS_PERCENT, "job" => job_id.to_string()).set(percentage);
}

/// Zero a finished job's progress gauge.
pub fn clear_job_progress(job_id: &str) {
    set_job_progress(job_id, 0.0);
}
