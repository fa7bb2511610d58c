//! Orchestrator - job validation, dispatch and control

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use arca_common::{
    ArcaError, ArcaResult, Collaborators, Filter, IndexResult, Job, JobFilter, JobId, JobRequest,
    JobSort, JobStatus, JobStore, ObjectKind, ObjectSelector, ObjectStream, OrchestratorConfig,
    OrchestratorMethod, PluginInfo, PluginParameters, PluginRegistry, PluginState, Report,
    RepositoryObject, Sublist, TransferredResource, VecStream,
};
use arca_telemetry::metrics;

use crate::control::{JobControlChannel, JobRegistry, JobRunner};
use crate::coordinator::Coordinator;
use crate::instance::PreparedPlugin;
use crate::partitioner::BatchPartitioner;
use crate::pool::WorkerPool;
use crate::progress::ProgressTracker;
use crate::sources::open_source;

/// How long an overrun job may take to cancel its batches, run its post
/// hooks and return a partial report.
const JOB_EXPIRY_GRACE: Duration = Duration::from_secs(30);

/// Shared state behind the facade; also the control pool's job runner.
struct Engine {
    config: OrchestratorConfig,
    registry: Arc<dyn PluginRegistry>,
    collaborators: Collaborators,
    store: Arc<dyn JobStore>,
    pool: Arc<WorkerPool>,
    progress: Arc<ProgressTracker>,
    jobs: JobRegistry,
    partitioner: BatchPartitioner,
    coordinator: Coordinator,
}

/// Boundary API of the plugin orchestrator.
pub struct Orchestrator {
    engine: Arc<Engine>,
    control: JobControlChannel,
}

impl Orchestrator {
    /// Build the orchestrator and spawn both worker pools. Must be called
    /// inside a tokio runtime.
    pub fn new(
        config: OrchestratorConfig,
        registry: Arc<dyn PluginRegistry>,
        collaborators: Collaborators,
        store: Arc<dyn JobStore>,
    ) -> ArcaResult<Self> {
        config.validate()?;
        let pool = Arc::new(WorkerPool::new(
            config.worker_count,
            config.worker_queue_capacity,
        )?);
        let progress = Arc::new(ProgressTracker::new());
        let coordinator = Coordinator::new(
            Arc::clone(&pool),
            Arc::clone(&progress),
            collaborators.clone(),
            &config,
        );
        let engine = Arc::new(Engine {
            partitioner: BatchPartitioner::new(config.block_size)?,
            config,
            registry,
            collaborators,
            store,
            pool,
            progress,
            jobs: JobRegistry::new(),
            coordinator,
        });
        let control = JobControlChannel::new(
            engine.config.job_worker_count,
            engine.config.control_queue_capacity,
            JOB_EXPIRY_GRACE,
            Arc::clone(&engine) as Arc<dyn JobRunner>,
        );
        metrics::describe();
        info!(
            "Orchestrator ready: {} worker(s), {} job worker(s), block size {}",
            engine.pool.worker_count(),
            engine.config.job_worker_count,
            engine.config.block_size
        );
        Ok(Self { engine, control })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.engine.config
    }

    pub fn progress_tracker(&self) -> Arc<ProgressTracker> {
        Arc::clone(&self.engine.progress)
    }

    pub fn worker_pool(&self) -> Arc<WorkerPool> {
        Arc::clone(&self.engine.pool)
    }

    /// Validate, store and start a job. Returns its id once queued.
    #[instrument(skip(self, request), fields(plugin = %request.plugin))]
    pub async fn submit(&self, request: JobRequest) -> ArcaResult<JobId> {
        let job = self.engine.validate(request)?;
        let job = self.engine.store.create(job).await?;
        info!(job = %job.id, "Job {} submitted", job.name);
        let id = job.id.clone();
        self.execute_job(job).await?;
        Ok(id)
    }

    /// Start an already-stored job on the job control pool. Completion is
    /// logged; callers observe status through the job store.
    pub async fn execute_job(&self, job: Job) -> ArcaResult<()> {
        let job_id = job.id.clone();
        self.engine.jobs.register(&job_id);
        let timeout = self.engine.control_timeout(&job);
        let rx = match self.control.start(job, timeout).await {
            Ok(rx) => rx,
            Err(e) => {
                self.engine.jobs.remove(&job_id);
                return Err(e);
            }
        };
        tokio::spawn(async move {
            match rx.await {
                Ok(Ok(report)) => info!(
                    job = %job_id,
                    "Job finished: {} item(s), partial={}",
                    report.items.len(),
                    report.partial
                ),
                Ok(Err(e)) => error!(job = %job_id, "Job failed: {}", e),
                Err(_) => error!(job = %job_id, "Job control channel dropped the job"),
            }
        });
        Ok(())
    }

    /// Validate and run a job inline, without storing it.
    pub async fn run(&self, request: JobRequest) -> ArcaResult<Report> {
        let job = request.into_job()?;
        let prepared = self.engine.prepare(&job)?;
        let token = self.engine.jobs.register(&job.id);
        if let Some(n) = job.known_object_count() {
            self.engine.progress.expect_objects(&job.id, n);
        }
        let report = self
            .engine
            .execute_selector(&job.id, prepared, &job.selector, &token)
            .await;
        self.engine.progress.purge(&job.id);
        self.engine.jobs.remove(&job.id);
        Ok(report)
    }

    /// Run a plugin once with no objects: pre hook, one execution over an
    /// empty list, then the post hook whatever the execution did.
    pub async fn run_plugin(
        &self,
        plugin_id: &str,
        parameters: PluginParameters,
    ) -> ArcaResult<Report> {
        self.run(request(
            plugin_id,
            parameters,
            OrchestratorMethod::RunPlugin,
            ObjectSelector::None,
        ))
        .await
    }

    pub async fn run_plugin_from_index(
        &self,
        plugin_id: &str,
        parameters: PluginParameters,
        kind: ObjectKind,
        filter: Filter,
    ) -> ArcaResult<Report> {
        self.run(request(
            plugin_id,
            parameters,
            OrchestratorMethod::RunPluginFromIndex,
            ObjectSelector::query(kind, filter),
        ))
        .await
    }

    pub async fn run_plugin_on_aips(
        &self,
        plugin_id: &str,
        parameters: PluginParameters,
        aip_ids: Vec<String>,
    ) -> ArcaResult<Report> {
        self.run(request(
            plugin_id,
            parameters,
            OrchestratorMethod::RunPluginOnAips,
            ObjectSelector::ids(ObjectKind::Aip, aip_ids),
        ))
        .await
    }

    pub async fn run_plugin_on_all_aips(
        &self,
        plugin_id: &str,
        parameters: PluginParameters,
    ) -> ArcaResult<Report> {
        self.run(request(
            plugin_id,
            parameters,
            OrchestratorMethod::RunPluginOnAllAips,
            ObjectSelector::all(ObjectKind::Aip),
        ))
        .await
    }

    pub async fn run_plugin_on_all_representations(
        &self,
        plugin_id: &str,
        parameters: PluginParameters,
    ) -> ArcaResult<Report> {
        self.run(request(
            plugin_id,
            parameters,
            OrchestratorMethod::RunPluginOnAllRepresentations,
            ObjectSelector::all(ObjectKind::Representation),
        ))
        .await
    }

    pub async fn run_plugin_on_all_files(
        &self,
        plugin_id: &str,
        parameters: PluginParameters,
    ) -> ArcaResult<Report> {
        self.run(request(
            plugin_id,
            parameters,
            OrchestratorMethod::RunPluginOnAllFiles,
            ObjectSelector::all(ObjectKind::File),
        ))
        .await
    }

    /// Run over resources supplied by the caller rather than looked up.
    pub async fn run_plugin_on_transferred_resources(
        &self,
        plugin_id: &str,
        parameters: PluginParameters,
        resources: Vec<TransferredResource>,
    ) -> ArcaResult<Report> {
        let ids = resources.iter().map(|r| r.id.clone()).collect();
        let job = request(
            plugin_id,
            parameters,
            OrchestratorMethod::RunPluginOnTransferredResources,
            ObjectSelector::ids(ObjectKind::TransferredResource, ids),
        )
        .into_job()?;
        let prepared = self.engine.prepare(&job)?;
        let token = self.engine.jobs.register(&job.id);
        self.engine.progress.expect_objects(&job.id, resources.len());
        let objects: Vec<RepositoryObject> = resources.into_iter().map(Into::into).collect();
        let report = self
            .engine
            .execute_source(
                &job.id,
                prepared,
                ObjectKind::TransferredResource,
                Box::new(VecStream::new(objects)),
                &token,
            )
            .await;
        self.engine.progress.purge(&job.id);
        self.engine.jobs.remove(&job.id);
        Ok(report)
    }

    /// Stop one job. Only that job's queued and in-flight batches are
    /// affected.
    #[instrument(skip(self))]
    pub async fn stop(&self, job_id: &str) -> ArcaResult<()> {
        if self.engine.jobs.cancel(job_id) {
            info!("Stop requested for job {}", job_id);
            return Ok(());
        }
        let job = self.engine.store.retrieve(job_id).await?;
        if job.status.is_terminal() {
            debug!("Job {} already {}", job_id, job.status);
            return Ok(());
        }
        self.engine
            .store
            .update_status(job_id, JobStatus::Stopped, job.completion_percentage)
            .await?;
        metrics::record_job(JobStatus::Stopped.as_str());
        Ok(())
    }

    /// Aggregate completion percentage of a job.
    pub async fn progress(&self, job_id: &str) -> ArcaResult<f64> {
        if let Some(pct) = self.engine.progress.percentage(job_id) {
            return Ok(pct);
        }
        let job = self.engine.store.retrieve(job_id).await?;
        Ok(f64::from(job.completion_percentage))
    }

    pub async fn retrieve_job(&self, job_id: &str) -> ArcaResult<Job> {
        self.engine.store.retrieve(job_id).await
    }

    pub async fn find_jobs(
        &self,
        filter: &JobFilter,
        sort: JobSort,
        sublist: Sublist,
    ) -> ArcaResult<IndexResult<Job>> {
        self.engine.store.find(filter, sort, sublist).await
    }

    pub fn list_plugins(&self) -> Vec<PluginInfo> {
        self.engine.registry.list()
    }

    /// Cancel every job and stop both pools.
    pub async fn shutdown(&self) {
        let active = self.engine.jobs.active();
        if active.is_empty() {
            info!("Shutting down orchestrator");
        } else {
            info!(
                "Shutting down orchestrator, cancelling {} active job(s): {}",
                active.len(),
                active.join(", ")
            );
        }
        self.engine.jobs.cancel_all();
        self.control.shutdown().await;
        self.engine.pool.shutdown().await;
    }
}

fn request(
    plugin_id: &str,
    parameters: PluginParameters,
    method: OrchestratorMethod,
    selector: ObjectSelector,
) -> JobRequest {
    let mut request = JobRequest::new(plugin_id, method, selector);
    request.plugin_parameters = parameters;
    request
}

impl Engine {
    /// Turn a request into a job, rejecting anything that cannot run.
    fn validate(&self, request: JobRequest) -> ArcaResult<Job> {
        let job = request.into_job()?;
        self.prepare(&job)?;
        Ok(job)
    }

    fn prepare(&self, job: &Job) -> ArcaResult<Arc<PreparedPlugin>> {
        PreparedPlugin::prepare(
            self.registry.as_ref(),
            &job.plugin,
            &job.plugin_parameters,
            job.selector.kind(),
        )
        .map(Arc::new)
    }

    /// Budget for a whole job on the control pool, scaled by its block count.
    fn control_timeout(&self, job: &Job) -> Duration {
        let objects = match &job.selector {
            ObjectSelector::Ids { ids, .. } => ids.len(),
            ObjectSelector::Query { kind, filter } => {
                self.collaborators.index.count(*kind, filter).unwrap_or(0)
            }
            ObjectSelector::All { kind } => self
                .collaborators
                .index
                .count(*kind, &Filter::all())
                .unwrap_or(0),
            ObjectSelector::None => 0,
        };
        // one extra block covers hooks and merging
        self.config
            .timeout_for_blocks(self.config.blocks_for(objects) + 1)
    }

    async fn execute_selector(
        &self,
        job_id: &str,
        prepared: Arc<PreparedPlugin>,
        selector: &ObjectSelector,
        token: &CancellationToken,
    ) -> Report {
        let Some(kind) = selector.kind() else {
            let batches = self.partitioner.standalone();
            return self.coordinator.run(job_id, prepared, batches, token).await;
        };
        match open_source(&self.collaborators, selector, self.config.block_size) {
            Ok(source) => {
                self.execute_source(job_id, prepared, kind, source, token)
                    .await
            }
            Err(e) => {
                warn!(job = job_id, "Could not open object source: {}", e);
                let mut report = Report::new(job_id, prepared.id());
                report.record_error(&e);
                report.partial = true;
                report.finish();
                report
            }
        }
    }

    async fn execute_source(
        &self,
        job_id: &str,
        prepared: Arc<PreparedPlugin>,
        kind: ObjectKind,
        source: Box<dyn ObjectStream>,
        token: &CancellationToken,
    ) -> Report {
        let batches = self.partitioner.partition(kind, source);
        self.coordinator.run(job_id, prepared, batches, token).await
    }

    fn final_status(&self, job_id: &str, report: &Report, token: &CancellationToken) -> JobStatus {
        if self.jobs.is_expired(job_id) {
            JobStatus::Failed
        } else if token.is_cancelled() {
            JobStatus::Stopped
        } else if report.partial || report.overall_state() == PluginState::Failure {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        }
    }

    async fn finish_job(&self, job_id: &str, status: JobStatus) {
        let percentage = match status {
            JobStatus::Completed => 100,
            _ => self
                .progress
                .percentage(job_id)
                .map(|p| p.floor().clamp(0.0, 100.0) as u8)
                .unwrap_or(0),
        };
        if let Err(e) = self.store.update_status(job_id, status, percentage).await {
            warn!(job = job_id, "Could not record final status {}: {}", status, e);
        }
        metrics::record_job(status.as_str());
        self.progress.purge(job_id);
        self.jobs.remove(job_id);
    }
}

#[async_trait]
impl JobRunner for Engine {
    #[instrument(skip(self, job), fields(job = %job.id, plugin = %job.plugin))]
    async fn run_job(&self, job: Job) -> ArcaResult<Report> {
        let token = self.jobs.register(&job.id);
        if token.is_cancelled() {
            info!("Job stopped before it started");
            self.finish_job(&job.id, JobStatus::Stopped).await;
            return Err(ArcaError::Cancelled);
        }
        if let Err(e) = self.store.update_status(&job.id, JobStatus::Running, 0).await {
            self.jobs.remove(&job.id);
            return Err(e);
        }

        let prepared = match self.prepare(&job) {
            Ok(prepared) => prepared,
            Err(e) => {
                self.finish_job(&job.id, JobStatus::Failed).await;
                return Err(e);
            }
        };
        if let Some(n) = job.known_object_count() {
            self.progress.expect_objects(&job.id, n);
        }
        let report = self
            .execute_selector(&job.id, prepared, &job.selector, &token)
            .await;
        let status = self.final_status(&job.id, &report, &token);
        self.progress.print_summary(&job.id);
        self.finish_job(&job.id, status).await;
        Ok(report)
    }

    async fn expire(&self, job_id: &str) {
        if self.jobs.expire(job_id) {
            warn!(job = job_id, "Job overran its budget, cancelling outstanding batches");
        }
    }

    async fn abandon(&self, job_id: &str) {
        if let Some(token) = self.jobs.token(job_id) {
            token.cancel();
        }
        self.finish_job(job_id, JobStatus::Failed).await;
    }
}
