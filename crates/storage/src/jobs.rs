//! In-memory job store.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;

use arca_common::{
    ArcaError, ArcaResult, IndexResult, Job, JobFilter, JobSort, JobStatus, JobStore, Sublist,
};

/// Sort and page a set of jobs.
pub(crate) fn page_jobs(mut jobs: Vec<Job>, sort: JobSort, sublist: Sublist) -> IndexResult<Job> {
    jobs.sort_by(|a, b| match sort {
        JobSort::CreatedAsc => a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)),
        JobSort::CreatedDesc => b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)),
    });
    let total_count = jobs.len();
    let results = jobs
        .into_iter()
        .skip(sublist.offset)
        .take(sublist.limit)
        .collect();
    IndexResult {
        offset: sublist.offset,
        limit: sublist.limit,
        total_count,
        results,
    }
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: Job) -> ArcaResult<Job> {
        let mut jobs = self.jobs.write();
        if jobs.contains_key(&job.id) {
            return Err(ArcaError::Storage(format!("job '{}' already exists", job.id)));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn retrieve(&self, job_id: &str) -> ArcaResult<Job> {
        self.jobs
            .read()
            .get(job_id)
            .cloned()
            .ok_or_else(|| ArcaError::JobNotFound(job_id.to_string()))
    }

    async fn find(
        &self,
        filter: &JobFilter,
        sort: JobSort,
        sublist: Sublist,
    ) -> ArcaResult<IndexResult<Job>> {
        let matching: Vec<Job> = self
            .jobs
            .read()
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        Ok(page_jobs(matching, sort, sublist))
    }

    async fn update_status(
        &self,
        job_id: &str,
        status: JobStatus,
        completion_percentage: u8,
    ) -> ArcaResult<Job> {
        let mut jobs = self.jobs.write();
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| ArcaError::JobNotFound(job_id.to_string()))?;
        if job.status != status {
            job.transition_to(status)?;
        }
        job.completion_percentage = completion_percentage.min(100);
        job.updated_at = Utc::now();
        Ok(job.clone())
    }
}
