//! Jobs: what to run, over which objects, and where the run stands.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{ArcaError, ArcaResult};
use crate::types::{Filter, ObjectKind};

pub type JobId = String;

/// Plugin parameter values, keyed by parameter name.
pub type PluginParameters = BTreeMap<String, String>;

/// Which objects a job acts on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObjectSelector {
    /// Explicit identifiers of one kind.
    Ids { kind: ObjectKind, ids: Vec<String> },
    /// Index query over one kind.
    Query {
        kind: ObjectKind,
        #[serde(default)]
        filter: Filter,
    },
    /// Every object of one kind in the repository.
    All { kind: ObjectKind },
    /// No objects; the plugin works from its parameters alone.
    None,
}

impl ObjectSelector {
    /// Kind of the selected objects; `None` for a parameter-only run.
    #[must_use]
    pub fn kind(&self) -> Option<ObjectKind> {
        match self {
            ObjectSelector::Ids { kind, .. }
            | ObjectSelector::Query { kind, .. }
            | ObjectSelector::All { kind } => Some(*kind),
            ObjectSelector::None => None,
        }
    }

    #[must_use]
    pub fn ids(kind: ObjectKind, ids: Vec<String>) -> Self {
        ObjectSelector::Ids { kind, ids }
    }

    #[must_use]
    pub fn query(kind: ObjectKind, filter: Filter) -> Self {
        ObjectSelector::Query { kind, filter }
    }

    #[must_use]
    pub fn all(kind: ObjectKind) -> Self {
        ObjectSelector::All { kind }
    }
}

/// The orchestrator entry points a job may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorMethod {
    RunPlugin,
    RunPluginFromIndex,
    RunPluginOnAips,
    RunPluginOnAllAips,
    RunPluginOnAllRepresentations,
    RunPluginOnAllFiles,
    RunPluginOnTransferredResources,
}

impl OrchestratorMethod {
    pub const ALL: [OrchestratorMethod; 7] = [
        OrchestratorMethod::RunPlugin,
        OrchestratorMethod::RunPluginFromIndex,
        OrchestratorMethod::RunPluginOnAips,
        OrchestratorMethod::RunPluginOnAllAips,
        OrchestratorMethod::RunPluginOnAllRepresentations,
        OrchestratorMethod::RunPluginOnAllFiles,
        OrchestratorMethod::RunPluginOnTransferredResources,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            OrchestratorMethod::RunPlugin => "run_plugin",
            OrchestratorMethod::RunPluginFromIndex => "run_plugin_from_index",
            OrchestratorMethod::RunPluginOnAips => "run_plugin_on_aips",
            OrchestratorMethod::RunPluginOnAllAips => "run_plugin_on_all_aips",
            OrchestratorMethod::RunPluginOnAllRepresentations => {
                "run_plugin_on_all_representations"
            }
            OrchestratorMethod::RunPluginOnAllFiles => "run_plugin_on_all_files",
            OrchestratorMethod::RunPluginOnTransferredResources => {
                "run_plugin_on_transferred_resources"
            }
        }
    }

    /// Whether `selector` is a valid object set for this method.
    #[must_use]
    pub fn accepts(&self, selector: &ObjectSelector) -> bool {
        match (self, selector) {
            (OrchestratorMethod::RunPlugin, ObjectSelector::None) => true,
            (OrchestratorMethod::RunPluginFromIndex, ObjectSelector::Query { .. }) => true,
            (OrchestratorMethod::RunPluginOnAips, ObjectSelector::Ids { kind, .. }) => {
                *kind == ObjectKind::Aip
            }
            (OrchestratorMethod::RunPluginOnAllAips, ObjectSelector::All { kind }) => {
                *kind == ObjectKind::Aip
            }
            (OrchestratorMethod::RunPluginOnAllRepresentations, ObjectSelector::All { kind }) => {
                *kind == ObjectKind::Representation
            }
            (OrchestratorMethod::RunPluginOnAllFiles, ObjectSelector::All { kind }) => {
                *kind == ObjectKind::File
            }
            (
                OrchestratorMethod::RunPluginOnTransferredResources,
                ObjectSelector::Ids { kind, .. },
            ) => *kind == ObjectKind::TransferredResource,
            _ => false,
        }
    }
}

impl fmt::Display for OrchestratorMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrchestratorMethod {
    type Err = ArcaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim();
        OrchestratorMethod::ALL
            .iter()
            .copied()
            .find(|m| {
                m.as_str() == normalized || m.as_str().replace('_', "") == normalized.to_lowercase()
            })
            .ok_or_else(|| ArcaError::InvalidOrchestratorMethod(s.to_string()))
    }
}

/// Job lifecycle: `submitted -> running -> {completed, failed, stopped}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Submitted,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl JobStatus {
    /// No further transitions are allowed from a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    #[must_use]
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Submitted, Self::Running)
                | (Self::Submitted, Self::Stopped)
                | (Self::Submitted, Self::Failed)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Stopped)
        )
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ArcaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submitted" => Ok(Self::Submitted),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            _ => Err(ArcaError::Storage(format!("Invalid job status: {s}"))),
        }
    }
}

/// Job creation request as received from a caller, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub plugin: String,
    #[serde(default)]
    pub plugin_parameters: PluginParameters,
    pub orchestrator_method: String,
    pub selector: ObjectSelector,
    #[serde(default)]
    pub username: String,
}

impl JobRequest {
    #[must_use]
    pub fn new(
        plugin: impl Into<String>,
        method: OrchestratorMethod,
        selector: ObjectSelector,
    ) -> Self {
        Self {
            id: None,
            name: None,
            plugin: plugin.into(),
            plugin_parameters: PluginParameters::new(),
            orchestrator_method: method.as_str().to_string(),
            selector,
            username: String::new(),
        }
    }

    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.plugin_parameters.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    /// Parse and check the request shape. Plugin resolution happens in the
    /// orchestrator, which owns the registry.
    pub fn into_job(self) -> ArcaResult<Job> {
        let method: OrchestratorMethod = self.orchestrator_method.parse()?;
        if !method.accepts(&self.selector) {
            let kind = self
                .selector
                .kind()
                .map(|k| format!(" of kind {k}"))
                .unwrap_or_default();
            return Err(ArcaError::InvalidSelector(format!(
                "{method} cannot act on a {:?} selector{kind}",
                selector_name(&self.selector),
            )));
        }
        let id = self
            .id
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let name = self
            .name
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| id.clone());
        let now = Utc::now();
        Ok(Job {
            id,
            name,
            plugin: self.plugin,
            plugin_parameters: self.plugin_parameters,
            orchestrator_method: method,
            selector: self.selector,
            username: self.username,
            status: JobStatus::Submitted,
            completion_percentage: 0,
            created_at: now,
            updated_at: now,
        })
    }
}

fn selector_name(selector: &ObjectSelector) -> &'static str {
    match selector {
        ObjectSelector::Ids { .. } => "ids",
        ObjectSelector::Query { .. } => "query",
        ObjectSelector::All { .. } => "all",
        ObjectSelector::None => "none",
    }
}

/// A validated job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub plugin: String,
    pub plugin_parameters: PluginParameters,
    pub orchestrator_method: OrchestratorMethod,
    pub selector: ObjectSelector,
    pub username: String,
    pub status: JobStatus,
    pub completion_percentage: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Object count known up front, if the selector names the objects.
    #[must_use]
    pub fn known_object_count(&self) -> Option<usize> {
        match &self.selector {
            ObjectSelector::Ids { ids, .. } => Some(ids.len()),
            ObjectSelector::None => Some(0),
            _ => None,
        }
    }

    /// Move to `next`, refusing transitions out of terminal states.
    pub fn transition_to(&mut self, next: JobStatus) -> ArcaResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(ArcaError::InvalidTransition(format!(
                "job {}: {} -> {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Criteria for listing stored jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub plugin: Option<String>,
    pub username: Option<String>,
}

impl JobFilter {
    #[must_use]
    pub fn matches(&self, job: &Job) -> bool {
        self.status.map_or(true, |s| s == job.status)
            && self.plugin.as_ref().map_or(true, |p| p == &job.plugin)
            && self.username.as_ref().map_or(true, |u| u == &job.username)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSort {
    #[default]
    CreatedAsc,
    CreatedDesc,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str, selector: ObjectSelector) -> JobRequest {
        JobRequest {
            id: None,
            name: None,
            plugin: "inventory".into(),
            plugin_parameters: PluginParameters::new(),
            orchestrator_method: method.into(),
            selector,
            username: "admin".into(),
        }
    }

    #[test]
    fn method_parsing_accepts_snake_and_camel_forms() {
        assert_eq!(
            "run_plugin_on_all_files".parse::<OrchestratorMethod>().unwrap(),
            OrchestratorMethod::RunPluginOnAllFiles
        );
        assert_eq!(
            "runPluginOnTransferredResources"
                .parse::<OrchestratorMethod>()
                .unwrap(),
            OrchestratorMethod::RunPluginOnTransferredResources
        );
        assert!(matches!(
            "runEverything".parse::<OrchestratorMethod>(),
            Err(ArcaError::InvalidOrchestratorMethod(_))
        ));
    }

    #[test]
    fn into_job_defaults_id_and_name() {
        let job = request(
            "run_plugin_on_all_aips",
            ObjectSelector::all(ObjectKind::Aip),
        )
        .into_job()
        .unwrap();
        assert!(!job.id.is_empty());
        assert_eq!(job.name, job.id);
        assert_eq!(job.status, JobStatus::Submitted);
    }

    #[test]
    fn into_job_rejects_mismatched_selector() {
        let err = request(
            "run_plugin_on_all_files",
            ObjectSelector::all(ObjectKind::Aip),
        )
        .into_job()
        .unwrap_err();
        assert!(matches!(err, ArcaError::InvalidSelector(_)));
    }

    #[test]
    fn run_plugin_takes_no_objects() {
        assert_eq!(
            "runPlugin".parse::<OrchestratorMethod>().unwrap(),
            OrchestratorMethod::RunPlugin
        );
        let job = request("run_plugin", ObjectSelector::None).into_job().unwrap();
        assert_eq!(job.selector.kind(), None);
        assert_eq!(job.known_object_count(), Some(0));
        assert!(request("run_plugin", ObjectSelector::all(ObjectKind::Aip))
            .into_job()
            .is_err());
        assert!(request("run_plugin_on_all_aips", ObjectSelector::None)
            .into_job()
            .is_err());
    }

    #[test]
    fn into_job_rejects_unknown_method() {
        let err = request("nope", ObjectSelector::all(ObjectKind::Aip))
            .into_job()
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn status_transitions() {
        assert!(JobStatus::Submitted.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Submitted.can_transition_to(JobStatus::Stopped));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Stopped.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn transition_updates_timestamp() {
        let mut job = request(
            "run_plugin_on_all_aips",
            ObjectSelector::all(ObjectKind::Aip),
        )
        .into_job()
        .unwrap();
        let before = job.updated_at;
        job.transition_to(JobStatus::Running).unwrap();
        assert!(job.updated_at >= before);
        assert!(job.transition_to(JobStatus::Submitted).is_err());
    }
}
