//! Per-batch plugin instances

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use arca_common::{
    ArcaError, ArcaResult, Collaborators, HookStage, InstanceId, ObjectKind, Plugin, PluginInfo,
    PluginParameters, PluginRegistry,
};

use crate::partitioner::Batch;
use crate::progress::ProgressTracker;

/// A plugin resolved and configured once per job.
///
/// Parameters are applied and validated here; every batch instance is a
/// fresh clone configured from the same immutable parameter set.
pub struct PreparedPlugin {
    prototype: Box<dyn Plugin>,
    parameters: Arc<PluginParameters>,
}

impl PreparedPlugin {
    pub fn prepare(
        registry: &dyn PluginRegistry,
        plugin_id: &str,
        parameters: &PluginParameters,
        kind: Option<ObjectKind>,
    ) -> ArcaResult<Self> {
        let mut prototype = registry.resolve(plugin_id)?;
        if let Some(kind) = kind.filter(|k| !prototype.supports(*k)) {
            return Err(ArcaError::InvalidSelector(format!(
                "plugin '{plugin_id}' does not act on {kind} objects"
            )));
        }
        prototype
            .set_parameters(parameters)
            .and_then(|()| prototype.validate_parameters())
            .map_err(|e| match e {
                ArcaError::InvalidParameter(_) => e,
                other => ArcaError::InvalidParameter(format!("{plugin_id}: {other}")),
            })?;
        debug!("Prepared plugin {} with {} parameter(s)", plugin_id, parameters.len());
        Ok(Self {
            prototype,
            parameters: Arc::new(parameters.clone()),
        })
    }

    pub fn id(&self) -> &str {
        self.prototype.id()
    }

    pub fn info(&self) -> PluginInfo {
        self.prototype.info()
    }

    pub fn parameters(&self) -> &Arc<PluginParameters> {
        &self.parameters
    }

    /// Fresh instance carrying the prepared parameter values.
    pub fn instantiate(&self) -> ArcaResult<Box<dyn Plugin>> {
        let mut plugin = self.prototype.clone_plugin();
        plugin.set_parameters(&self.parameters)?;
        Ok(plugin)
    }
}

/// One configured plugin instance, owned by exactly one batch.
pub struct PluginInstance {
    id: InstanceId,
    batch_index: usize,
    plugin_id: String,
    plugin: Arc<Mutex<Box<dyn Plugin>>>,
}

impl PluginInstance {
    #[inline]
    pub fn id(&self) -> InstanceId {
        self.id
    }

    #[inline]
    pub fn batch_index(&self) -> usize {
        self.batch_index
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Shared handle for the worker that executes this instance's batch.
    pub(crate) fn handle(&self) -> Arc<Mutex<Box<dyn Plugin>>> {
        Arc::clone(&self.plugin)
    }

    /// Run the post-execution hook. Waits at most `grace` for the worker to
    /// release the instance.
    pub async fn after_execute(
        &self,
        collaborators: &Collaborators,
        grace: Duration,
    ) -> ArcaResult<()> {
        let mut plugin = tokio::time::timeout(grace, self.plugin.lock())
            .await
            .map_err(|_| {
                ArcaError::hook(
                    HookStage::AfterExecute,
                    format!("instance {} still busy after {:?}", self.id, grace),
                )
            })?;
        plugin
            .after_execute(collaborators)
            .await
            .map_err(|e| as_hook_error(HookStage::AfterExecute, e))
    }
}

fn as_hook_error(stage: HookStage, err: ArcaError) -> ArcaError {
    match err {
        ArcaError::Hook { .. } => err,
        other => ArcaError::hook(stage, other.to_string()),
    }
}

/// Produces one configured, hooked and progress-registered instance per batch.
#[derive(Clone)]
pub struct PluginInstanceFactory {
    prepared: Arc<PreparedPlugin>,
    collaborators: Collaborators,
    progress: Arc<ProgressTracker>,
}

impl PluginInstanceFactory {
    pub fn new(
        prepared: Arc<PreparedPlugin>,
        collaborators: Collaborators,
        progress: Arc<ProgressTracker>,
    ) -> Self {
        Self {
            prepared,
            collaborators,
            progress,
        }
    }

    /// Clone, configure and hook an instance for `batch`. A failing
    /// pre-execution hook leaves no progress entry behind.
    #[instrument(skip(self, batch), fields(plugin = %self.prepared.id(), batch = batch.index))]
    pub async fn create(&self, job_id: &str, batch: &Batch) -> ArcaResult<PluginInstance> {
        let mut plugin = self.prepared.instantiate()?;
        plugin
            .before_execute(&self.collaborators)
            .await
            .map_err(|e| as_hook_error(HookStage::BeforeExecute, e))?;

        let id = InstanceId::new();
        self.progress.register(job_id, id, batch.len());
        Ok(PluginInstance {
            id,
            batch_index: batch.index,
            plugin_id: self.prepared.id().to_string(),
            plugin: Arc::new(Mutex::new(plugin)),
        })
    }
}
