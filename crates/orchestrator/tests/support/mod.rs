//! Shared fixtures for orchestrator integration tests.

#![allow(dead_code)]

use arca_common::{
    ArcaError, ArcaResult, Collaborators, ExecutionContext, JobStore, ObjectKind, ObjectRef,
    OrchestratorConfig, Plugin, PluginParameters, Report, ReportItem, RepositoryObject,
    TransferredResource,
};
use arca_orchestrator::Orchestrator;
use arca_plugin_host::PluginManager;
use arca_storage::{MemoryJobStore, MemoryRepository};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const SCRIPTED: &str = "scripted";

/// What the scripted does when it meets a given object.
#[derive(Debug, Clone)]
pub enum Action {
    Fail,
    Panic,
    Sleep(Duration),
    Malformed,
}

/// Behaviour and call counters shared by every clone of one scripted.
#[derive(Debug, Default)]
pub struct Behavior {
    pub actions: HashMap<String, Action>,
    pub fail_before_on_call: Option<usize>,
    pub fail_execute: bool,
    pub before_calls: AtomicUsize,
    pub after_calls: AtomicUsize,
}

impl Behavior {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, object_id: &str, action: Action) -> Self {
        self.actions.insert(object_id.to_string(), action);
        self
    }

    pub fn fail_before_on_call(mut self, call: usize) -> Self {
        self.fail_before_on_call = Some(call);
        self
    }

    /// Every execution fails, whatever the batch holds.
    pub fn failing_execute(mut self) -> Self {
        self.fail_execute = true;
        self
    }

    pub fn before_calls(&self) -> usize {
        self.before_calls.load(Ordering::SeqCst)
    }

    pub fn after_calls(&self) -> usize {
        self.after_calls.load(Ordering::SeqCst)
    }
}

pub struct ScriptedPlugin {
    behavior: Arc<Behavior>,
    parameters: PluginParameters,
}

impl ScriptedPlugin {
    pub fn new(behavior: Arc<Behavior>) -> Self {
        Self {
            behavior,
            parameters: PluginParameters::new(),
        }
    }
}

#[async_trait]
impl Plugin for ScriptedPlugin {
    fn id(&self) -> &str {
        SCRIPTED
    }

    fn name(&self) -> &str {
        "Scripted"
    }

    fn object_kinds(&self) -> &[ObjectKind] {
        &ObjectKind::ALL
    }

    fn set_parameters(&mut self, parameters: &PluginParameters) -> ArcaResult<()> {
        self.parameters = parameters.clone();
        Ok(())
    }

    fn parameters(&self) -> &PluginParameters {
        &self.parameters
    }

    fn clone_plugin(&self) -> Box<dyn Plugin> {
        Box::new(ScriptedPlugin::new(Arc::clone(&self.behavior)))
    }

    async fn before_execute(&mut self, _collaborators: &Collaborators) -> ArcaResult<()> {
        let call = self.behavior.before_calls.fetch_add(1, Ordering::SeqCst);
        if self.behavior.fail_before_on_call == Some(call) {
            return Err(ArcaError::Source("scripted could not reach its backend".into()));
        }
        Ok(())
    }

    async fn execute(
        &mut self,
        ctx: &ExecutionContext,
        batch: &[RepositoryObject],
    ) -> ArcaResult<Report> {
        if self.behavior.fail_execute {
            return Err(ArcaError::Execution {
                message: "scripted execution failure".into(),
                object: None,
            });
        }
        let actions: Vec<&Action> = batch
            .iter()
            .filter_map(|o| self.behavior.actions.get(o.id()))
            .collect();
        for action in &actions {
            match action {
                Action::Fail => {
                    return Err(ArcaError::Execution {
                        message: "scripted failure".into(),
                        object: None,
                    })
                }
                Action::Panic => panic!("scripted panic"),
                Action::Malformed => {
                    let mut report = Report::new(ctx.job_id.clone(), SCRIPTED);
                    report.add_item(ReportItem::success(ObjectRef::new(
                        ObjectKind::File,
                        "not-in-this-batch",
                    )));
                    return Ok(report);
                }
                Action::Sleep(_) => {}
            }
        }

        let mut report = Report::new(ctx.job_id.clone(), SCRIPTED);
        for (i, object) in batch.iter().enumerate() {
            if ctx.is_cancelled() {
                report.add_item(ReportItem::from_error(object.object_ref(), &ArcaError::Cancelled));
                continue;
            }
            if let Some(Action::Sleep(d)) = self.behavior.actions.get(object.id()) {
                tokio::time::sleep(*d).await;
            }
            report.add_item(ReportItem::success(object.object_ref()));
            ctx.report_progress(i + 1, batch.len());
        }
        Ok(report)
    }

    async fn after_execute(&mut self, _collaborators: &Collaborators) -> ArcaResult<()> {
        self.behavior.after_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn resources(n: usize) -> Vec<TransferredResource> {
    (0..n)
        .map(|i| TransferredResource::new(format!("t{i}"), format!("t{i}.zip")).with_size(i as u64))
        .collect()
}

pub fn config(workers: usize, block_size: usize) -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_workers(workers)
        .with_block_size(block_size)
}

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub repository: Arc<MemoryRepository>,
    pub behavior: Arc<Behavior>,
}

impl Harness {
    pub fn new(config: OrchestratorConfig, behavior: Behavior) -> Self {
        Self::with_store(
            config,
            behavior,
            Arc::new(MemoryRepository::new()),
            Arc::new(MemoryJobStore::new()),
        )
    }

    pub fn with_store(
        config: OrchestratorConfig,
        behavior: Behavior,
        repository: Arc<MemoryRepository>,
        store: Arc<dyn JobStore>,
    ) -> Self {
        let behavior = Arc::new(behavior);
        let plugins = PluginManager::with_builtins();
        plugins.register(Box::new(ScriptedPlugin::new(Arc::clone(&behavior))));
        let orchestrator = Orchestrator::new(
            config,
            Arc::new(plugins),
            Collaborators::new(repository.clone(), repository.clone()),
            store,
        )
        .unwrap();
        Self {
            orchestrator: Arc::new(orchestrator),
            repository,
            behavior,
        }
    }
}
