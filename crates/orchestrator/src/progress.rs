//! Progress tracking
//!
//! One entry per plugin instance, grouped per job. Each job has its own
//! lock so updates for different jobs never contend.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use arca_common::{ArcaError, ArcaResult, InstanceId, JobId, ProgressSink};
use arca_telemetry::metrics;

/// Counters for one plugin instance. `total_steps` is fixed when the entry
/// is registered; reports in other units are scaled onto it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEntry {
    pub object_count: usize,
    pub steps_completed: usize,
    pub total_steps: usize,
}

impl ProgressEntry {
    fn new(object_count: usize) -> Self {
        Self {
            object_count,
            steps_completed: 0,
            total_steps: object_count.max(1),
        }
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.steps_completed >= self.total_steps
    }

    /// Objects of this instance counted as done.
    fn weighted_steps(&self) -> f64 {
        self.steps_completed as f64 * self.object_count as f64 / self.total_steps as f64
    }
}

#[derive(Debug, Default)]
struct JobProgress {
    entries: BTreeMap<InstanceId, ProgressEntry>,
    registered_objects: usize,
    /// Objects that ended without an instance, e.g. ids that did not resolve.
    settled_objects: usize,
    expected_objects: usize,
    percentage: f64,
}

impl JobProgress {
    fn total_objects(&self) -> usize {
        self.registered_objects.max(self.expected_objects)
    }

    fn recompute(&mut self) -> f64 {
        let total = self.total_objects();
        let all_complete = self.entries.values().all(ProgressEntry::is_complete);
        let computed = if total == 0 {
            // a run without objects is done once its instances are
            if !self.entries.is_empty() && all_complete {
                100.0
            } else {
                0.0
            }
        } else if self.registered_objects == total && all_complete {
            100.0
        } else {
            let done: f64 = self.entries.values().map(ProgressEntry::weighted_steps).sum();
            let done = done + self.settled_objects as f64;
            (done * 100.0 / total as f64).min(100.0)
        };
        self.percentage = computed;
        computed
    }
}

/// Point-in-time view of one job's progress.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub percentage: f64,
    pub total_objects: usize,
    pub instances: Vec<(InstanceId, ProgressEntry)>,
}

pub struct ProgressTracker {
    jobs: DashMap<JobId, Arc<Mutex<JobProgress>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
        }
    }

    /// The job's lock, created on first use. The map shard is released
    /// before the caller locks the job.
    fn job(&self, job_id: &str) -> Arc<Mutex<JobProgress>> {
        if let Some(existing) = self.jobs.get(job_id) {
            return Arc::clone(existing.value());
        }
        Arc::clone(self.jobs.entry(job_id.to_string()).or_default().value())
    }

    fn existing(&self, job_id: &str) -> Option<Arc<Mutex<JobProgress>>> {
        self.jobs.get(job_id).map(|e| Arc::clone(e.value()))
    }

    /// Declare the job's object count up front, when the selector knows it.
    pub fn expect_objects(&self, job_id: &str, total: usize) {
        let job = self.job(job_id);
        let mut job = job.lock();
        job.expected_objects = total;
        job.recompute();
    }

    /// Register a fresh entry for `instance`, sized to its batch.
    pub fn register(&self, job_id: &str, instance: InstanceId, object_count: usize) {
        let job = self.job(job_id);
        let mut job = job.lock();
        if job.entries.insert(instance, ProgressEntry::new(object_count)).is_none() {
            job.registered_objects += object_count;
        }
        job.recompute();
        debug!(job = job_id, %instance, object_count, "Registered progress entry");
    }

    /// Count `count` objects as finished without an instance entry, so a job
    /// whose ids partly failed to resolve still ends at 100%.
    pub fn settle(&self, job_id: &str, count: usize) {
        if count == 0 {
            return;
        }
        let job = self.job(job_id);
        let mut job = job.lock();
        job.registered_objects += count;
        job.settled_objects += count;
        let percentage = job.recompute();
        metrics::set_job_progress(job_id, percentage);
        debug!(job = job_id, count, "Settled objects without an instance");
    }

    /// Record completed steps out of `total_steps`. The ratio is scaled onto
    /// the entry's registered total, clamped, and never moves backwards.
    /// Returns the job's aggregate percentage.
    pub fn update(
        &self,
        job_id: &str,
        instance: InstanceId,
        steps_completed: usize,
        total_steps: usize,
    ) -> ArcaResult<f64> {
        let job = self
            .existing(job_id)
            .ok_or_else(|| ArcaError::JobNotFound(job_id.to_string()))?;
        let mut job = job.lock();
        let entry = job.entries.get_mut(&instance).ok_or_else(|| {
            ArcaError::JobNotFound(format!("{job_id}: no progress entry for instance {instance}"))
        })?;
        let steps = if total_steps > 0 {
            steps_completed.min(total_steps).saturating_mul(entry.total_steps) / total_steps
        } else {
            steps_completed.min(entry.total_steps)
        };
        entry.steps_completed = entry.steps_completed.max(steps);
        let percentage = job.recompute();
        metrics::set_job_progress(job_id, percentage);
        Ok(percentage)
    }

    /// Mark an instance finished regardless of what it reported.
    pub fn complete(&self, job_id: &str, instance: InstanceId) {
        if let Some(job) = self.existing(job_id) {
            let mut job = job.lock();
            if let Some(entry) = job.entries.get_mut(&instance) {
                entry.steps_completed = entry.total_steps;
            }
            let percentage = job.recompute();
            metrics::set_job_progress(job_id, percentage);
        }
    }

    pub fn percentage(&self, job_id: &str) -> Option<f64> {
        self.existing(job_id).map(|job| job.lock().percentage)
    }

    pub fn snapshot(&self, job_id: &str) -> Option<ProgressSnapshot> {
        self.existing(job_id).map(|job| {
            let job = job.lock();
            ProgressSnapshot {
                percentage: job.percentage,
                total_objects: job.total_objects(),
                instances: job.entries.iter().map(|(id, e)| (*id, *e)).collect(),
            }
        })
    }

    /// Drop a terminated job's entries.
    pub fn purge(&self, job_id: &str) -> Option<f64> {
        self.jobs.remove(job_id).map(|(_, job)| {
            let percentage = job.lock().percentage;
            metrics::clear_job_progress(job_id);
            debug!(job = job_id, percentage, "Purged progress");
            percentage
        })
    }

    pub fn active_jobs(&self) -> usize {
        self.jobs.len()
    }

    pub fn print_summary(&self, job_id: &str) {
        if let Some(s) = self.snapshot(job_id) {
            let complete = s.instances.iter().filter(|(_, e)| e.is_complete()).count();
            info!("Progress for job {}:", job_id);
            info!("  Objects: {}", s.total_objects);
            info!("  Instances: {} ({} complete)", s.instances.len(), complete);
            info!("  Completion: {:.1}%", s.percentage);
        }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for ProgressTracker {
    fn update_progress(
        &self,
        job_id: &str,
        instance: InstanceId,
        steps_completed: usize,
        total_steps: usize,
    ) -> ArcaResult<f64> {
        self.update(job_id, instance, steps_completed, total_steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn close_to(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn weighted_percentage_for_uneven_batches() {
        let tracker = ProgressTracker::new();
        let ids = [InstanceId::new(), InstanceId::new(), InstanceId::new()];
        tracker.register("job", ids[0], 100);
        tracker.register("job", ids[1], 100);
        tracker.register("job", ids[2], 50);

        tracker.update("job", ids[0], 100, 100).unwrap();
        tracker.update("job", ids[1], 100, 100).unwrap();
        let pct = tracker.update("job", ids[2], 25, 50).unwrap();
        assert!(close_to(pct, 90.0), "got {pct}");

        let pct = tracker.update("job", ids[2], 50, 50).unwrap();
        assert_eq!(pct, 100.0);
    }

    #[test]
    fn steps_are_clamped_and_never_regress() {
        let tracker = ProgressTracker::new();
        let id = InstanceId::new();
        tracker.register("job", id, 10);
        tracker.update("job", id, 50, 10).unwrap();
        tracker.update("job", id, 3, 10).unwrap();
        let s = tracker.snapshot("job").unwrap();
        assert_eq!(s.instances[0].1.steps_completed, 10);
    }

    #[test]
    fn expected_total_keeps_early_percentage_low() {
        let tracker = ProgressTracker::new();
        tracker.expect_objects("job", 200);
        let id = InstanceId::new();
        tracker.register("job", id, 100);
        let pct = tracker.update("job", id, 100, 100).unwrap();
        assert!(close_to(pct, 50.0));
    }

    #[test]
    fn larger_reported_total_does_not_lower_progress() {
        let tracker = ProgressTracker::new();
        let id = InstanceId::new();
        tracker.register("job", id, 10);
        let first = tracker.update("job", id, 5, 10).unwrap();
        assert!(close_to(first, 50.0));
        let second = tracker.update("job", id, 6, 100).unwrap();
        assert!(close_to(second, 50.0), "got {second}");
        let third = tracker.update("job", id, 80, 100).unwrap();
        assert!(close_to(third, 80.0), "got {third}");
        assert_eq!(tracker.snapshot("job").unwrap().instances[0].1.total_steps, 10);
    }

    #[test]
    fn settled_objects_complete_the_job() {
        let tracker = ProgressTracker::new();
        tracker.expect_objects("job", 2);
        let id = InstanceId::new();
        tracker.register("job", id, 1);
        tracker.complete("job", id);
        assert_eq!(tracker.percentage("job"), Some(50.0));
        tracker.settle("job", 1);
        assert_eq!(tracker.percentage("job"), Some(100.0));
    }

    #[test]
    fn settled_objects_count_towards_partial_progress() {
        let tracker = ProgressTracker::new();
        tracker.expect_objects("job", 4);
        tracker.settle("job", 1);
        let id = InstanceId::new();
        tracker.register("job", id, 3);
        let pct = tracker.update("job", id, 1, 3).unwrap();
        assert!(close_to(pct, 50.0), "got {pct}");
    }

    #[test]
    fn instance_without_objects_reaches_100_when_complete() {
        let tracker = ProgressTracker::new();
        let id = InstanceId::new();
        tracker.register("job", id, 0);
        assert_eq!(tracker.percentage("job"), Some(0.0));
        tracker.complete("job", id);
        assert_eq!(tracker.percentage("job"), Some(100.0));
    }

    #[test]
    fn unknown_job_or_instance_is_an_error() {
        let tracker = ProgressTracker::new();
        assert!(tracker.update("nope", InstanceId::new(), 1, 1).is_err());
        tracker.register("job", InstanceId::new(), 1);
        assert!(tracker.update("job", InstanceId::new(), 1, 1).is_err());
    }

    #[test]
    fn purge_removes_job() {
        let tracker = ProgressTracker::new();
        let id = InstanceId::new();
        tracker.register("job", id, 4);
        tracker.complete("job", id);
        assert_eq!(tracker.purge("job"), Some(100.0));
        assert_eq!(tracker.active_jobs(), 0);
        assert!(tracker.percentage("job").is_none());
    }

    proptest! {
        #[test]
        fn percentage_is_monotonic_and_bounded(
            sizes in prop::collection::vec(1usize..200, 1..8),
            steps in prop::collection::vec((0usize..8, 0usize..250), 0..60),
        ) {
            let tracker = ProgressTracker::new();
            let ids: Vec<InstanceId> = sizes.iter().map(|_| InstanceId::new()).collect();
            for (id, size) in ids.iter().zip(&sizes) {
                tracker.register("job", *id, *size);
            }
            let snapshot = tracker.snapshot("job").unwrap();
            let registered: usize = snapshot.instances.iter().map(|(_, e)| e.object_count).sum();
            prop_assert_eq!(registered, sizes.iter().sum::<usize>());

            let mut last = 0.0;
            for (which, step) in steps {
                let i = which % ids.len();
                let pct = tracker.update("job", ids[i], step, sizes[i]).unwrap();
                prop_assert!(pct + 1e-9 >= last);
                prop_assert!(pct <= 100.0);
                last = pct;
            }
            for (_, e) in tracker.snapshot("job").unwrap().instances {
                prop_assert!(e.steps_completed <= e.total_steps);
            }

            for (id, size) in ids.iter().zip(&sizes) {
                tracker.update("job", *id, *size, *size).unwrap();
            }
            prop_assert_eq!(tracker.percentage("job"), Some(100.0));
        }
    }
}
