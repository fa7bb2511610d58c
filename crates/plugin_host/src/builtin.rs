//! Built-in plugins

use async_trait::async_trait;
use tracing::debug;

use arca_common::{
    ArcaError, ArcaResult, Collaborators, ExecutionContext, ObjectKind, Plugin, PluginParameters,
    ReportItem, RepositoryObject,
};

const SKIP_DIRECTORIES: &str = "skip_directories";
const MAX_BYTES: &str = "max_bytes";

fn parse_bool(key: &str, raw: &str) -> ArcaResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        other => Err(ArcaError::InvalidParameter(format!(
            "{key}: expected a boolean, got '{other}'"
        ))),
    }
}

/// Records what it sees: one success item per object.
#[derive(Debug, Clone)]
pub struct InventoryPlugin {
    parameters: PluginParameters,
    skip_directories: bool,
    processed: usize,
}

impl InventoryPlugin {
    pub fn new() -> Self {
        Self {
            parameters: PluginParameters::new(),
            skip_directories: true,
            processed: 0,
        }
    }
}

impl Default for InventoryPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for InventoryPlugin {
    fn id(&self) -> &str {
        "inventory"
    }

    fn name(&self) -> &str {
        "Inventory"
    }

    fn description(&self) -> &str {
        "Lists every object it is run over"
    }

    fn object_kinds(&self) -> &[ObjectKind] {
        &ObjectKind::ALL
    }

    fn set_parameters(&mut self, parameters: &PluginParameters) -> ArcaResult<()> {
        if let Some(raw) = parameters.get(SKIP_DIRECTORIES) {
            self.skip_directories = parse_bool(SKIP_DIRECTORIES, raw)?;
        }
        self.parameters = parameters.clone();
        Ok(())
    }

    fn parameters(&self) -> &PluginParameters {
        &self.parameters
    }

    fn clone_plugin(&self) -> Box<dyn Plugin> {
        Box::new(Self::new())
    }

    async fn process_object(
        &mut self,
        _ctx: &ExecutionContext,
        object: &RepositoryObject,
    ) -> ArcaResult<ReportItem> {
        self.processed += 1;
        let item = match object {
            RepositoryObject::File(f) if f.is_directory && self.skip_directories => {
                return Ok(ReportItem::skipped(object.object_ref(), "directory"));
            }
            RepositoryObject::Aip(a) => ReportItem::success(object.object_ref()).with_details(
                format!("{} representation(s), state {}", a.representations.len(), a.state.as_str()),
            ),
            RepositoryObject::Representation(r) => ReportItem::success(object.object_ref())
                .with_details(format!("{} file(s) in AIP {}", r.files.len(), r.aip_id)),
            RepositoryObject::File(f) => {
                let mut path = f.path.clone();
                path.push(f.id.clone());
                ReportItem::success(object.object_ref())
                    .with_details(format!("{} ({} bytes)", path.join("/"), f.size))
            }
            RepositoryObject::TransferredResource(t) => ReportItem::success(object.object_ref())
                .with_details(format!("{} ({} bytes)", t.path, t.size)),
        };
        Ok(item)
    }

    async fn after_execute(&mut self, _collaborators: &Collaborators) -> ArcaResult<()> {
        debug!("inventory instance processed {} object(s)", self.processed);
        Ok(())
    }
}

/// Fails files and transferred resources larger than `max_bytes`.
#[derive(Debug, Clone, Default)]
pub struct SizeLimitPlugin {
    parameters: PluginParameters,
    max_bytes: Option<u64>,
}

impl SizeLimitPlugin {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Plugin for SizeLimitPlugin {
    fn id(&self) -> &str {
        "size-limit"
    }

    fn name(&self) -> &str {
        "Size limit"
    }

    fn description(&self) -> &str {
        "Fails objects whose size exceeds max_bytes"
    }

    fn object_kinds(&self) -> &[ObjectKind] {
        &[ObjectKind::File, ObjectKind::TransferredResource]
    }

    fn set_parameters(&mut self, parameters: &PluginParameters) -> ArcaResult<()> {
        self.max_bytes = match parameters.get(MAX_BYTES) {
            Some(raw) => Some(raw.trim().parse::<u64>().map_err(|e| {
                ArcaError::InvalidParameter(format!("{MAX_BYTES}: '{raw}' is not a byte count: {e}"))
            })?),
            None => None,
        };
        self.parameters = parameters.clone();
        Ok(())
    }

    fn parameters(&self) -> &PluginParameters {
        &self.parameters
    }

    fn validate_parameters(&self) -> ArcaResult<()> {
        match self.max_bytes {
            Some(_) => Ok(()),
            None => Err(ArcaError::InvalidParameter(format!(
                "{MAX_BYTES} is required"
            ))),
        }
    }

    fn clone_plugin(&self) -> Box<dyn Plugin> {
        Box::new(Self::new())
    }

    async fn process_object(
        &mut self,
        _ctx: &ExecutionContext,
        object: &RepositoryObject,
    ) -> ArcaResult<ReportItem> {
        let limit = self
            .max_bytes
            .ok_or_else(|| ArcaError::InvalidParameter(format!("{MAX_BYTES} is required")))?;
        let size = match object {
            RepositoryObject::File(f) if f.is_directory => {
                return Ok(ReportItem::skipped(object.object_ref(), "directory"));
            }
            RepositoryObject::File(f) => f.size,
            RepositoryObject::TransferredResource(t) => t.size,
            other => {
                return Err(ArcaError::execution_for(
                    other.object_ref(),
                    format!("size-limit cannot act on {}", other.kind()),
                ));
            }
        };
        if size > limit {
            Ok(ReportItem::failure(
                object.object_ref(),
                format!("size {size} exceeds limit {limit}"),
            )
            .with_html_details(format!(
                "<p>Size <b>{size}</b> exceeds the limit of <b>{limit}</b> bytes</p>"
            )))
        } else {
            Ok(ReportItem::success(object.object_ref()).with_details(format!("{size} bytes")))
        }
    }
}
