//! Collaborator traits consumed by the orchestrator
//!
//! - `Plugin`: the lifecycle contract every processing plugin honours
//! - `PluginRegistry`: resolves a plugin id to a fresh, unconfigured instance
//! - `ModelService` / `IndexService`: read access to the repository
//! - `ObjectStream`: closable sequential object source
//! - `JobStore`: job persistence
//! - `ProgressSink`: where plugin instances report completed steps

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::{ArcaError, ArcaResult};
use crate::job::{Job, JobFilter, JobId, JobSort, JobStatus, PluginParameters};
use crate::report::{Report, ReportItem};
use crate::types::{
    Aip, Filter, IndexResult, ObjectKind, RepositoryObject, Sorter, Sublist,
};

/// Identity of one configured plugin instance (one per batch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Repository services handed to plugin hooks.
#[derive(Clone)]
pub struct Collaborators {
    pub model: Arc<dyn ModelService>,
    pub index: Arc<dyn IndexService>,
}

impl Collaborators {
    pub fn new(model: Arc<dyn ModelService>, index: Arc<dyn IndexService>) -> Self {
        Self { model, index }
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Receives step updates from running plugin instances.
pub trait ProgressSink: Send + Sync {
    /// Record `steps_completed` of `total_steps` for `instance`; returns the
    /// job's aggregate percentage.
    fn update_progress(
        &self,
        job_id: &str,
        instance: InstanceId,
        steps_completed: usize,
        total_steps: usize,
    ) -> ArcaResult<f64>;
}

/// Everything a plugin instance sees while executing one batch.
#[derive(Clone)]
pub struct ExecutionContext {
    pub job_id: JobId,
    pub instance_id: InstanceId,
    pub collaborators: Collaborators,
    progress: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(
        job_id: JobId,
        instance_id: InstanceId,
        collaborators: Collaborators,
        progress: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_id,
            instance_id,
            collaborators,
            progress,
            cancel,
        }
    }

    /// Set once the owning job is stopped or its run timed out.
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn report_progress(&self, steps_completed: usize, total_steps: usize) {
        if let Err(e) = self.progress.update_progress(
            &self.job_id,
            self.instance_id,
            steps_completed,
            total_steps,
        ) {
            debug!(job = %self.job_id, instance = %self.instance_id, "progress update ignored: {}", e);
        }
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("job_id", &self.job_id)
            .field("instance_id", &self.instance_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Descriptive data about a registered plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub object_kinds: Vec<ObjectKind>,
}

/// Processing plugin lifecycle contract.
///
/// An instance is configured once, runs `before_execute` once, executes
/// exactly one batch and then runs `after_execute` once.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "1.0"
    }

    fn description(&self) -> &str {
        ""
    }

    /// Object kinds this plugin can act on.
    fn object_kinds(&self) -> &[ObjectKind];

    fn supports(&self, kind: ObjectKind) -> bool {
        self.object_kinds().contains(&kind)
    }

    fn set_parameters(&mut self, parameters: &PluginParameters) -> ArcaResult<()>;

    fn parameters(&self) -> &PluginParameters;

    /// Check the currently applied parameter values.
    fn validate_parameters(&self) -> ArcaResult<()> {
        Ok(())
    }

    /// Fresh, unconfigured instance of the same plugin.
    fn clone_plugin(&self) -> Box<dyn Plugin>;

    fn info(&self) -> PluginInfo {
        PluginInfo {
            id: self.id().to_string(),
            name: self.name().to_string(),
            version: self.version().to_string(),
            description: self.description().to_string(),
            object_kinds: self.object_kinds().to_vec(),
        }
    }

    async fn before_execute(&mut self, _collaborators: &Collaborators) -> ArcaResult<()> {
        Ok(())
    }

    /// Process one object. Used by the provided [`Plugin::execute`].
    async fn process_object(
        &mut self,
        _ctx: &ExecutionContext,
        object: &RepositoryObject,
    ) -> ArcaResult<ReportItem> {
        Err(ArcaError::execution_for(
            object.object_ref(),
            format!("plugin '{}' does not process single objects", self.id()),
        ))
    }

    /// Process a batch. The default walks the batch in order, stops between
    /// objects once the job is cancelled, and reports one step per object.
    async fn execute(
        &mut self,
        ctx: &ExecutionContext,
        batch: &[RepositoryObject],
    ) -> ArcaResult<Report> {
        let mut report = Report::new(ctx.job_id.clone(), self.id());
        let total = batch.len();
        for (i, object) in batch.iter().enumerate() {
            if ctx.is_cancelled() {
                for rest in &batch[i..] {
                    report.add_item(ReportItem::from_error(rest.object_ref(), &ArcaError::Cancelled));
                }
                report.partial = true;
                break;
            }
            let item = match self.process_object(ctx, object).await {
                Ok(item) => item,
                Err(e) => ReportItem::from_error(object.object_ref(), &e),
            };
            report.add_item(item);
            ctx.report_progress(i + 1, total);
        }
        Ok(report)
    }

    async fn after_execute(&mut self, _collaborators: &Collaborators) -> ArcaResult<()> {
        Ok(())
    }
}

/// Resolves plugin identifiers.
pub trait PluginRegistry: Send + Sync {
    /// Fresh unconfigured instance of `plugin_id`.
    fn resolve(&self, plugin_id: &str) -> ArcaResult<Box<dyn Plugin>>;

    fn list(&self) -> Vec<PluginInfo>;
}

/// Sequential, closable object source.
///
/// `close` must be idempotent; sources are closed exactly once by their
/// consumer on every exit path, and closing again is a no-op.
pub trait ObjectStream: Iterator<Item = ArcaResult<RepositoryObject>> + Send {
    fn close(&mut self) -> ArcaResult<()>;

    /// Objects yielded so far.
    fn yielded(&self) -> usize;
}

/// Finite in-memory object source.
#[derive(Debug)]
pub struct VecStream {
    items: std::vec::IntoIter<ArcaResult<RepositoryObject>>,
    yielded: usize,
    closed: bool,
}

impl VecStream {
    pub fn new(objects: Vec<RepositoryObject>) -> Self {
        Self::from_results(objects.into_iter().map(Ok).collect())
    }

    pub fn from_results(items: Vec<ArcaResult<RepositoryObject>>) -> Self {
        Self {
            items: items.into_iter(),
            yielded: 0,
            closed: false,
        }
    }
}

impl Iterator for VecStream {
    type Item = ArcaResult<RepositoryObject>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.closed {
            return None;
        }
        let next = self.items.next();
        if next.is_some() {
            self.yielded += 1;
        }
        next
    }
}

impl ObjectStream for VecStream {
    fn close(&mut self) -> ArcaResult<()> {
        self.closed = true;
        Ok(())
    }

    fn yielded(&self) -> usize {
        self.yielded
    }
}

/// Repository model access.
pub trait ModelService: Send + Sync {
    fn retrieve_aip(&self, aip_id: &str) -> ArcaResult<Aip>;

    fn retrieve_object(&self, kind: ObjectKind, id: &str) -> ArcaResult<RepositoryObject>;

    fn list_aips(&self) -> ArcaResult<Box<dyn ObjectStream>>;

    fn list_files_under(
        &self,
        aip_id: &str,
        representation_id: &str,
        recursive: bool,
    ) -> ArcaResult<Box<dyn ObjectStream>>;
}

/// Index search access.
pub trait IndexService: Send + Sync {
    fn find(
        &self,
        kind: ObjectKind,
        filter: &Filter,
        sorter: Option<&Sorter>,
        sublist: Sublist,
    ) -> ArcaResult<IndexResult<RepositoryObject>>;

    fn count(&self, kind: ObjectKind, filter: &Filter) -> ArcaResult<usize>;
}

/// Job persistence.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: Job) -> ArcaResult<Job>;

    async fn retrieve(&self, job_id: &str) -> ArcaResult<Job>;

    async fn find(
        &self,
        filter: &JobFilter,
        sort: JobSort,
        sublist: Sublist,
    ) -> ArcaResult<IndexResult<Job>>;

    /// Move a job to `status`; transitions out of terminal states are rejected.
    async fn update_status(
        &self,
        job_id: &str,
        status: JobStatus,
        completion_percentage: u8,
    ) -> ArcaResult<Job>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::PluginState;
    use crate::types::File;
    use support::Recorder;

    mod support {
        use super::*;
        use std::sync::Mutex;

        #[derive(Default)]
        pub struct Recorder {
            pub updates: Mutex<Vec<(usize, usize)>>,
        }

        impl ProgressSink for Recorder {
            fn update_progress(
                &self,
                _job_id: &str,
                _instance: InstanceId,
                steps_completed: usize,
                total_steps: usize,
            ) -> ArcaResult<f64> {
                self.updates.lock().unwrap().push((steps_completed, total_steps));
                Ok(steps_completed as f64 / total_steps as f64 * 100.0)
            }
        }
    }

    struct EchoPlugin {
        params: PluginParameters,
    }

    #[async_trait]
    impl Plugin for EchoPlugin {
        fn id(&self) -> &str {
            "echo"
        }

        fn name(&self) -> &str {
            "Echo"
        }

        fn object_kinds(&self) -> &[ObjectKind] {
            &[ObjectKind::File]
        }

        fn set_parameters(&mut self, parameters: &PluginParameters) -> ArcaResult<()> {
            self.params = parameters.clone();
            Ok(())
        }

        fn parameters(&self) -> &PluginParameters {
            &self.params
        }

        fn clone_plugin(&self) -> Box<dyn Plugin> {
            Box::new(EchoPlugin {
                params: PluginParameters::new(),
            })
        }

        async fn process_object(
            &mut self,
            _ctx: &ExecutionContext,
            object: &RepositoryObject,
        ) -> ArcaResult<ReportItem> {
            Ok(ReportItem::success(object.object_ref()))
        }
    }

    struct NullModel;

    impl ModelService for NullModel {
        fn retrieve_aip(&self, aip_id: &str) -> ArcaResult<Aip> {
            Err(ArcaError::NotFound {
                kind: ObjectKind::Aip,
                id: aip_id.into(),
            })
        }

        fn retrieve_object(&self, kind: ObjectKind, id: &str) -> ArcaResult<RepositoryObject> {
            Err(ArcaError::NotFound {
                kind,
                id: id.into(),
            })
        }

        fn list_aips(&self) -> ArcaResult<Box<dyn ObjectStream>> {
            Ok(Box::new(VecStream::new(Vec::new())))
        }

        fn list_files_under(&self, _: &str, _: &str, _: bool) -> ArcaResult<Box<dyn ObjectStream>> {
            Ok(Box::new(VecStream::new(Vec::new())))
        }
    }

    impl IndexService for NullModel {
        fn find(
            &self,
            _kind: ObjectKind,
            _filter: &Filter,
            _sorter: Option<&Sorter>,
            sublist: Sublist,
        ) -> ArcaResult<IndexResult<RepositoryObject>> {
            Ok(IndexResult {
                offset: sublist.offset,
                limit: sublist.limit,
                total_count: 0,
                results: Vec::new(),
            })
        }

        fn count(&self, _kind: ObjectKind, _filter: &Filter) -> ArcaResult<usize> {
            Ok(0)
        }
    }

    fn context(cancel: CancellationToken, sink: Arc<Recorder>) -> ExecutionContext {
        let model = Arc::new(NullModel);
        ExecutionContext::new(
            "job-1".into(),
            InstanceId::new(),
            Collaborators::new(model.clone(), model),
            sink,
            cancel,
        )
    }

    fn files(n: usize) -> Vec<RepositoryObject> {
        (0..n).map(|i| File::new(format!("f{i}"), 1).into()).collect()
    }

    #[tokio::test]
    async fn default_execute_reports_each_step() {
        let sink = Arc::new(Recorder::default());
        let ctx = context(CancellationToken::new(), sink.clone());
        let mut plugin = EchoPlugin {
            params: PluginParameters::new(),
        };
        let report = plugin.execute(&ctx, &files(3)).await.unwrap();
        assert_eq!(report.counts().success, 3);
        assert_eq!(*sink.updates.lock().unwrap(), vec![(1, 3), (2, 3), (3, 3)]);
    }

    #[tokio::test]
    async fn default_execute_stops_between_items_when_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let ctx = context(token, Arc::new(Recorder::default()));
        let mut plugin = EchoPlugin {
            params: PluginParameters::new(),
        };
        let report = plugin.execute(&ctx, &files(2)).await.unwrap();
        assert!(report.partial);
        assert!(report.items.iter().all(|i| i.state == PluginState::Skipped));
    }

    #[test]
    fn vec_stream_counts_and_closes() {
        let mut s = VecStream::new(files(2));
        assert!(s.next().is_some());
        assert_eq!(s.yielded(), 1);
        s.close().unwrap();
        s.close().unwrap();
        assert!(s.next().is_none());
    }
}
