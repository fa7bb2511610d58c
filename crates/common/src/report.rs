//! Per-object outcomes and their job-level aggregate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::error::{ArcaError, ErrorKind};
use crate::types::ObjectRef;

/// Outcome of processing a single object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    Success,
    PartialSuccess,
    Failure,
    Skipped,
}

impl PluginState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            PluginState::Success => "success",
            PluginState::PartialSuccess => "partial_success",
            PluginState::Failure => "failure",
            PluginState::Skipped => "skipped",
        }
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error attached to a report item or to the report itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub object: Option<ObjectRef>,
}

impl ErrorRecord {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            object: None,
        }
    }

    #[must_use]
    pub fn with_object(mut self, object: ObjectRef) -> Self {
        self.object = Some(object);
        self
    }
}

impl From<&ArcaError> for ErrorRecord {
    fn from(err: &ArcaError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            object: err.object_ref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportItem {
    pub object: ObjectRef,
    pub state: PluginState,
    #[serde(default)]
    pub details: String,
    /// Rich rendering of `details`, when the plugin produced one.
    #[serde(default)]
    pub html_details: Option<String>,
    #[serde(default)]
    pub outcome_object_id: Option<String>,
    #[serde(default)]
    pub error: Option<ErrorRecord>,
    pub date: DateTime<Utc>,
}

impl ReportItem {
    #[must_use]
    pub fn new(object: ObjectRef, state: PluginState) -> Self {
        Self {
            object,
            state,
            details: String::new(),
            html_details: None,
            outcome_object_id: None,
            error: None,
            date: Utc::now(),
        }
    }

    #[must_use]
    pub fn success(object: ObjectRef) -> Self {
        Self::new(object, PluginState::Success)
    }

    #[must_use]
    pub fn failure(object: ObjectRef, details: impl Into<String>) -> Self {
        Self::new(object, PluginState::Failure).with_details(details)
    }

    #[must_use]
    pub fn skipped(object: ObjectRef, details: impl Into<String>) -> Self {
        Self::new(object, PluginState::Skipped).with_details(details)
    }

    /// Failure (or skip, for cancellation) caused by `err` for `object`.
    #[must_use]
    pub fn from_error(object: ObjectRef, err: &ArcaError) -> Self {
        let state = if matches!(err, ArcaError::Cancelled) {
            PluginState::Skipped
        } else {
            PluginState::Failure
        };
        let record = ErrorRecord::new(err.kind(), err.to_string()).with_object(object.clone());
        Self::new(object, state)
            .with_details(err.to_string())
            .with_error(record)
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    #[must_use]
    pub fn with_html_details(mut self, html: impl Into<String>) -> Self {
        self.html_details = Some(html.into());
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: ErrorRecord) -> Self {
        self.error = Some(error);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportCounts {
    pub success: usize,
    pub partial_success: usize,
    pub failure: usize,
    pub skipped: usize,
}

impl ReportCounts {
    #[must_use]
    pub fn total(&self) -> usize {
        self.success + self.partial_success + self.failure + self.skipped
    }
}

/// Job-level aggregate of report items.
///
/// Item order follows batch completion order, not submission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub job_id: String,
    pub plugin_id: String,
    pub items: Vec<ReportItem>,
    /// Set when some batches did not complete (timeout, stop, source failure).
    #[serde(default)]
    pub partial: bool,
    /// Batches whose worker response was dropped as malformed.
    #[serde(default)]
    pub lost_batches: usize,
    #[serde(default)]
    pub batches: usize,
    /// Errors not tied to a single object (post-hook failures, source aborts).
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Report {
    #[must_use]
    pub fn new(job_id: impl Into<String>, plugin_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            plugin_id: plugin_id.into(),
            items: Vec::new(),
            partial: false,
            lost_batches: 0,
            batches: 0,
            errors: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn add_item(&mut self, item: ReportItem) {
        self.items.push(item);
    }

    /// Fold a batch report into this one, keeping every item.
    pub fn merge(&mut self, other: Report) {
        self.items.extend(other.items);
        self.errors.extend(other.errors);
        self.partial |= other.partial;
        self.lost_batches += other.lost_batches;
    }

    /// Record `err` against every object in `objects`.
    pub fn record_failure<'a>(
        &mut self,
        objects: impl IntoIterator<Item = &'a ObjectRef>,
        err: &ArcaError,
    ) {
        for object in objects {
            self.items.push(ReportItem::from_error(object.clone(), err));
        }
    }

    pub fn record_error(&mut self, err: &ArcaError) {
        self.errors.push(ErrorRecord::from(err));
    }

    /// A batch report is well formed when every item names an object of that batch.
    #[must_use]
    pub fn is_well_formed_for(&self, batch: &[ObjectRef]) -> bool {
        let expected: HashSet<&ObjectRef> = batch.iter().collect();
        self.items.iter().all(|item| expected.contains(&item.object))
    }

    #[must_use]
    pub fn counts(&self) -> ReportCounts {
        let mut counts = ReportCounts::default();
        for item in &self.items {
            match item.state {
                PluginState::Success => counts.success += 1,
                PluginState::PartialSuccess => counts.partial_success += 1,
                PluginState::Failure => counts.failure += 1,
                PluginState::Skipped => counts.skipped += 1,
            }
        }
        counts
    }

    /// Collapse item states into one job outcome.
    #[must_use]
    pub fn overall_state(&self) -> PluginState {
        let c = self.counts();
        if c.failure == 0 && c.partial_success == 0 && !self.partial && self.errors.is_empty() {
            PluginState::Success
        } else if c.success == 0 && c.partial_success == 0 && c.total() > 0 && c.failure > 0 {
            PluginState::Failure
        } else {
            PluginState::PartialSuccess
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }
}
