//! Repository object model and index query types
//!
//! Objects are plain data: the orchestrator only needs identity, kind and a
//! handful of indexed fields. Builders consume `self` so fixtures and tests
//! can be assembled without intermediate clones.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ArcaError;

/// Kind of repository entity a plugin can act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Aip,
    Representation,
    File,
    TransferredResource,
}

impl ObjectKind {
    #[inline]
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Aip => "aip",
            ObjectKind::Representation => "representation",
            ObjectKind::File => "file",
            ObjectKind::TransferredResource => "transferred_resource",
        }
    }

    pub const ALL: [ObjectKind; 4] = [
        ObjectKind::Aip,
        ObjectKind::Representation,
        ObjectKind::File,
        ObjectKind::TransferredResource,
    ];
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = ArcaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "aip" => Ok(ObjectKind::Aip),
            "representation" => Ok(ObjectKind::Representation),
            "file" => Ok(ObjectKind::File),
            "transferred_resource" => Ok(ObjectKind::TransferredResource),
            other => Err(ArcaError::InvalidSelector(format!(
                "unknown object kind '{other}'"
            ))),
        }
    }
}

/// Reference to a single repository object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub id: String,
}

impl ObjectRef {
    #[inline]
    #[must_use]
    pub fn new(kind: ObjectKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AipState {
    #[default]
    Active,
    IngestProcessing,
    UnderAppraisal,
    Deleted,
}

impl AipState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            AipState::Active => "active",
            AipState::IngestProcessing => "ingest_processing",
            AipState::UnderAppraisal => "under_appraisal",
            AipState::Deleted => "deleted",
        }
    }
}

/// Archival information package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aip {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub state: AipState,
    #[serde(default)]
    pub representations: Vec<Representation>,
}

impl Aip {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            state: AipState::Active,
            representations: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    #[must_use]
    pub fn with_state(mut self, state: AipState) -> Self {
        self.state = state;
        self
    }

    /// Attach a representation, rewriting its `aip_id` to this package.
    #[must_use]
    pub fn with_representation(mut self, mut representation: Representation) -> Self {
        representation.aip_id = self.id.clone();
        for file in &mut representation.files {
            file.aip_id = self.id.clone();
            file.representation_id = representation.id.clone();
        }
        self.representations.push(representation);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Representation {
    pub id: String,
    #[serde(default)]
    pub aip_id: String,
    #[serde(default = "default_true")]
    pub original: bool,
    #[serde(default)]
    pub files: Vec<File>,
}

fn default_true() -> bool {
    true
}

impl Representation {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            aip_id: String::new(),
            original: true,
            files: Vec::new(),
        }
    }

    #[must_use]
    pub fn derived(mut self) -> Self {
        self.original = false;
        self
    }

    #[must_use]
    pub fn with_file(mut self, mut file: File) -> Self {
        file.aip_id = self.aip_id.clone();
        file.representation_id = self.id.clone();
        self.files.push(file);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct File {
    pub id: String,
    #[serde(default)]
    pub aip_id: String,
    #[serde(default)]
    pub representation_id: String,
    /// Directory components leading to this file inside the representation.
    #[serde(default)]
    pub path: Vec<String>,
    #[serde(default)]
    pub is_directory: bool,
    #[serde(default)]
    pub size: u64,
}

impl File {
    #[must_use]
    pub fn new(id: impl Into<String>, size: u64) -> Self {
        Self {
            id: id.into(),
            aip_id: String::new(),
            representation_id: String::new(),
            path: Vec::new(),
            is_directory: false,
            size,
        }
    }

    #[must_use]
    pub fn directory(id: impl Into<String>) -> Self {
        Self {
            is_directory: true,
            ..Self::new(id, 0)
        }
    }

    #[must_use]
    pub fn with_path(mut self, path: Vec<String>) -> Self {
        self.path = path;
        self
    }
}

/// Resource dropped in the transfer area, awaiting ingest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferredResource {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default = "default_true")]
    pub is_file: bool,
    #[serde(default)]
    pub size: u64,
}

impl TransferredResource {
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: id.into(),
            path: name.clone(),
            name,
            is_file: true,
            size: 0,
        }
    }

    #[must_use]
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }
}

/// Any object a plugin may be run over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "object", rename_all = "snake_case")]
pub enum RepositoryObject {
    Aip(Aip),
    Representation(Representation),
    File(File),
    TransferredResource(TransferredResource),
}

impl RepositoryObject {
    #[inline]
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            RepositoryObject::Aip(a) => &a.id,
            RepositoryObject::Representation(r) => &r.id,
            RepositoryObject::File(f) => &f.id,
            RepositoryObject::TransferredResource(t) => &t.id,
        }
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> ObjectKind {
        match self {
            RepositoryObject::Aip(_) => ObjectKind::Aip,
            RepositoryObject::Representation(_) => ObjectKind::Representation,
            RepositoryObject::File(_) => ObjectKind::File,
            RepositoryObject::TransferredResource(_) => ObjectKind::TransferredResource,
        }
    }

    #[must_use]
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(self.kind(), self.id())
    }

    /// Indexed field lookup used by [`Filter`] and [`Sorter`].
    #[must_use]
    pub fn field(&self, name: &str) -> Option<String> {
        if name == "id" {
            return Some(self.id().to_string());
        }
        match self {
            RepositoryObject::Aip(a) => match name {
                "parent_id" => a.parent_id.clone(),
                "state" => Some(a.state.as_str().to_string()),
                "representations" => Some(a.representations.len().to_string()),
                _ => None,
            },
            RepositoryObject::Representation(r) => match name {
                "aip_id" => Some(r.aip_id.clone()),
                "original" => Some(r.original.to_string()),
                _ => None,
            },
            RepositoryObject::File(f) => match name {
                "aip_id" => Some(f.aip_id.clone()),
                "representation_id" => Some(f.representation_id.clone()),
                "is_directory" => Some(f.is_directory.to_string()),
                "path" => Some(f.path.join("/")),
                "size" => Some(f.size.to_string()),
                _ => None,
            },
            RepositoryObject::TransferredResource(t) => match name {
                "name" => Some(t.name.clone()),
                "path" => Some(t.path.clone()),
                "is_file" => Some(t.is_file.to_string()),
                "size" => Some(t.size.to_string()),
                _ => None,
            },
        }
    }
}

impl From<Aip> for RepositoryObject {
    fn from(v: Aip) -> Self {
        RepositoryObject::Aip(v)
    }
}

impl From<Representation> for RepositoryObject {
    fn from(v: Representation) -> Self {
        RepositoryObject::Representation(v)
    }
}

impl From<File> for RepositoryObject {
    fn from(v: File) -> Self {
        RepositoryObject::File(v)
    }
}

impl From<TransferredResource> for RepositoryObject {
    fn from(v: TransferredResource) -> Self {
        RepositoryObject::TransferredResource(v)
    }
}

/// Single equality term of an index filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterTerm {
    pub field: String,
    pub value: String,
}

/// Conjunction of equality terms. An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default)]
    pub terms: Vec<FilterTerm>,
}

impl Filter {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_term(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.terms.push(FilterTerm {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    #[must_use]
    pub fn matches(&self, object: &RepositoryObject) -> bool {
        self.terms
            .iter()
            .all(|t| object.field(&t.field).as_deref() == Some(t.value.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sorter {
    pub field: String,
    #[serde(default)]
    pub descending: bool,
}

/// Paging window over an index result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sublist {
    pub offset: usize,
    pub limit: usize,
}

impl Sublist {
    #[inline]
    #[must_use]
    pub const fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }
}

impl Default for Sublist {
    fn default() -> Self {
        Self::new(0, 100)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexResult<T> {
    pub offset: usize,
    pub limit: usize,
    pub total_count: usize,
    pub results: Vec<T>,
}

impl<T> IndexResult<T> {
    /// Whether further pages exist after this one.
    #[must_use]
    pub fn has_more(&self) -> bool {
        self.total_count > self.offset + self.results.len() && !self.results.is_empty()
    }
}
