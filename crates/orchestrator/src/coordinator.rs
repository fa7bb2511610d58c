//! Fan-out/fan-in over one run's batches

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use arca_common::{
    ArcaError, ArcaResult, Collaborators, ExecutionContext, ObjectRef, OrchestratorConfig,
    ProgressSink, Report,
};
use arca_telemetry::metrics::{self, BatchOutcome};

use crate::instance::{PluginInstance, PluginInstanceFactory, PreparedPlugin};
use crate::partitioner::BatchIter;
use crate::pool::{BatchTask, WorkerPool};
use crate::progress::ProgressTracker;

/// Longest wait for a worker to release an instance before its post hook.
const AFTER_HOOK_GRACE: Duration = Duration::from_secs(5);

/// A batch that reached the pool and has not answered yet.
struct InFlight {
    instance: PluginInstance,
    objects: Vec<ObjectRef>,
}

#[derive(Clone)]
pub struct Coordinator {
    pool: Arc<WorkerPool>,
    progress: Arc<ProgressTracker>,
    collaborators: Collaborators,
    per_block_timeout: Duration,
}

impl Coordinator {
    pub fn new(
        pool: Arc<WorkerPool>,
        progress: Arc<ProgressTracker>,
        collaborators: Collaborators,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            pool,
            progress,
            collaborators,
            per_block_timeout: config.per_block_timeout(),
        }
    }

    /// Dispatch every batch from `batches`, wait for all of them (bounded by
    /// the per-block timeout times the number of dispatched batches, counted
    /// from the start of the run), run the post hooks and merge the batch
    /// reports.
    ///
    /// Always returns a report. Batches that did not complete contribute
    /// failure or skipped items and mark the report partial.
    #[instrument(skip_all, fields(job = %job_id, plugin = %prepared.id()))]
    pub async fn run(
        &self,
        job_id: &str,
        prepared: Arc<PreparedPlugin>,
        mut batches: BatchIter,
        job_token: &CancellationToken,
    ) -> Report {
        let started = Instant::now();
        let plugin_id = prepared.id().to_string();
        let mut report = Report::new(job_id, plugin_id.as_str());
        let run_token = job_token.child_token();
        let factory = PluginInstanceFactory::new(
            prepared,
            self.collaborators.clone(),
            Arc::clone(&self.progress),
        );
        let sink: Arc<dyn ProgressSink> = self.progress.clone();

        let mut pending: FuturesUnordered<BoxFuture<'static, (usize, ArcaResult<Report>)>> =
            FuturesUnordered::new();
        let mut in_flight: HashMap<usize, InFlight> = HashMap::new();
        let mut finished: Vec<PluginInstance> = Vec::new();

        while let Some(next) = batches.next() {
            let batch = match next {
                Ok(batch) => batch,
                Err(e) => match e.object_ref() {
                    Some(object) => {
                        warn!("Object {} could not be read: {}", object, e);
                        report.record_failure([&object], &e);
                        self.progress.settle(job_id, 1);
                        continue;
                    }
                    None => {
                        warn!("Object source failed, no further batches: {}", e);
                        report.record_error(&e);
                        report.partial = true;
                        break;
                    }
                },
            };
            report.batches += 1;
            let objects = batch.object_refs();

            if run_token.is_cancelled() {
                info!(batch = batch.index, "Job stopped, skipping remaining batches");
                report.record_failure(&objects, &ArcaError::Cancelled);
                report.partial = true;
                metrics::record_batch(&plugin_id, BatchOutcome::Cancelled);
                break;
            }

            let instance = match factory.create(job_id, &batch).await {
                Ok(instance) => instance,
                Err(e) => {
                    warn!(batch = batch.index, "Instance setup failed: {}", e);
                    report.record_failure(&objects, &e);
                    if objects.is_empty() {
                        report.record_error(&e);
                        report.partial = true;
                    }
                    self.progress.settle(job_id, objects.len());
                    metrics::record_batch(&plugin_id, BatchOutcome::HookFailed);
                    continue;
                }
            };

            let ctx = ExecutionContext::new(
                job_id.to_string(),
                instance.id(),
                self.collaborators.clone(),
                Arc::clone(&sink),
                run_token.clone(),
            );
            let task = BatchTask {
                batch_index: batch.index,
                objects: batch.objects,
                plugin: instance.handle(),
                ctx,
            };
            match self.pool.submit(task) {
                Ok(handle) => {
                    let index = handle.batch_index;
                    pending.push(async move { (index, handle.wait().await) }.boxed());
                    in_flight.insert(index, InFlight { instance, objects });
                }
                Err(e) => {
                    warn!(
                        batch = batch.index,
                        "Dispatch of {} instance {} failed: {}",
                        instance.plugin_id(),
                        instance.id(),
                        e
                    );
                    report.record_failure(&objects, &e);
                    self.progress.complete(job_id, instance.id());
                    metrics::record_batch(&plugin_id, BatchOutcome::Failed);
                    finished.push(instance);
                }
            }
        }
        if let Err(e) = batches.close() {
            warn!("Object source close failed: {}", e);
            report.record_error(&ArcaError::Source(e.to_string()));
        }
        drop(batches);

        let dispatched = in_flight.len();
        if dispatched == 0 {
            debug!("No batches dispatched");
        } else {
            let budget = self
                .per_block_timeout
                .saturating_mul(u32::try_from(dispatched).unwrap_or(u32::MAX));
            let deadline = started + budget;
            info!("Dispatched {} batch(es), waiting up to {:?}", dispatched, budget);

            loop {
                match tokio::time::timeout_at(deadline, pending.next()).await {
                    Ok(Some((index, result))) => {
                        let Some(done) = in_flight.remove(&index) else {
                            continue;
                        };
                        self.absorb(&mut report, &plugin_id, index, &done, result);
                        self.progress.complete(job_id, done.instance.id());
                        finished.push(done.instance);
                    }
                    Ok(None) => break,
                    Err(_) => {
                        warn!(
                            "Timed out after {:?} with {} batch(es) outstanding",
                            budget,
                            in_flight.len()
                        );
                        run_token.cancel();
                        let timeout = ArcaError::Timeout(format!(
                            "batch not finished within {budget:?}"
                        ));
                        for (_, done) in in_flight.drain() {
                            report.record_failure(&done.objects, &timeout);
                            metrics::record_batch(&plugin_id, BatchOutcome::TimedOut);
                            finished.push(done.instance);
                        }
                        report.partial = true;
                        break;
                    }
                }
            }
        }
        drop(pending);

        for instance in &finished {
            if let Err(e) = instance
                .after_execute(&self.collaborators, AFTER_HOOK_GRACE)
                .await
            {
                warn!(
                    batch = instance.batch_index(),
                    "Post-execution hook of {} failed: {}",
                    instance.plugin_id(),
                    e
                );
                report.record_error(&e);
            }
        }

        if job_token.is_cancelled() {
            report.partial = true;
        }
        report.finish();

        let counts = report.counts();
        for (state, n) in [
            ("success", counts.success),
            ("partial_success", counts.partial_success),
            ("failure", counts.failure),
            ("skipped", counts.skipped),
        ] {
            if n > 0 {
                metrics::record_items(state, n);
            }
        }
        info!(
            "Run finished: {} batch(es), {} item(s), {} failure(s), partial={}",
            report.batches,
            counts.total(),
            counts.failure,
            report.partial
        );
        report
    }

    fn absorb(
        &self,
        report: &mut Report,
        plugin_id: &str,
        index: usize,
        done: &InFlight,
        result: ArcaResult<Report>,
    ) {
        match result {
            Ok(batch_report) if batch_report.is_well_formed_for(&done.objects) => {
                debug!(batch = index, items = batch_report.items.len(), "Batch completed");
                metrics::record_batch(plugin_id, BatchOutcome::Completed);
                report.merge(batch_report);
            }
            Ok(_) => {
                warn!(batch = index, "Dropping malformed batch result");
                report.lost_batches += 1;
                report.record_failure(
                    &done.objects,
                    &ArcaError::MalformedResult(format!(
                        "batch {index} returned items for objects outside the batch"
                    )),
                );
                metrics::record_batch(plugin_id, BatchOutcome::Malformed);
            }
            Err(ArcaError::Cancelled) => {
                report.record_failure(&done.objects, &ArcaError::Cancelled);
                report.partial = true;
                metrics::record_batch(plugin_id, BatchOutcome::Cancelled);
            }
            Err(e) => {
                warn!(batch = index, "Batch failed: {}", e);
                report.record_failure(&done.objects, &e);
                if done.objects.is_empty() {
                    // nothing to attach the failure to
                    report.record_error(&e);
                    report.partial = true;
                }
                metrics::record_batch(plugin_id, BatchOutcome::Failed);
            }
        }
    }
}
