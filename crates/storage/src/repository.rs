//! In-memory repository: model and index collaborators over a fixture.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use arca_common::{
    Aip, ArcaError, ArcaResult, Filter, IndexResult, IndexService, ModelService, ObjectKind,
    ObjectStream, RepositoryObject, Sorter, Sublist, TransferredResource, VecStream,
};

/// Serialized repository contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepositoryFixture {
    #[serde(default)]
    pub aips: Vec<Aip>,
    #[serde(default)]
    pub transferred_resources: Vec<TransferredResource>,
}

/// Counters over every stream handed out, for exactly-once close checks.
#[derive(Debug, Default)]
pub struct StreamStats {
    opened: AtomicUsize,
    close_calls: AtomicUsize,
}

impl StreamStats {
    #[must_use]
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

/// Stream that reports its `close` calls to the owning repository.
struct TrackedStream {
    inner: VecStream,
    stats: Arc<StreamStats>,
}

impl TrackedStream {
    fn new(objects: Vec<RepositoryObject>, stats: Arc<StreamStats>) -> Self {
        stats.opened.fetch_add(1, Ordering::SeqCst);
        Self {
            inner: VecStream::new(objects),
            stats,
        }
    }
}

impl Iterator for TrackedStream {
    type Item = ArcaResult<RepositoryObject>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

impl ObjectStream for TrackedStream {
    fn close(&mut self) -> ArcaResult<()> {
        self.stats.close_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.close()
    }

    fn yielded(&self) -> usize {
        self.inner.yielded()
    }
}

#[derive(Debug, Default)]
pub struct MemoryRepository {
    aips: RwLock<Vec<Aip>>,
    transferred: RwLock<Vec<TransferredResource>>,
    stats: Arc<StreamStats>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixture(fixture: RepositoryFixture) -> Self {
        let repo = Self::new();
        for aip in fixture.aips {
            repo.insert_aip(aip);
        }
        for resource in fixture.transferred_resources {
            repo.insert_transferred_resource(resource);
        }
        repo
    }

    pub fn from_json_str(raw: &str) -> ArcaResult<Self> {
        let fixture: RepositoryFixture = serde_json::from_str(raw)?;
        Ok(Self::from_fixture(fixture))
    }

    /// Load a JSON fixture from disk.
    pub fn load(path: impl AsRef<Path>) -> ArcaResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let repo = Self::from_json_str(&raw)?;
        debug!(
            "Loaded repository fixture {} ({} AIPs)",
            path.as_ref().display(),
            repo.aips.read().len()
        );
        Ok(repo)
    }

    /// Insert an AIP, linking representations and files back to it.
    pub fn insert_aip(&self, mut aip: Aip) {
        for representation in &mut aip.representations {
            representation.aip_id = aip.id.clone();
            for file in &mut representation.files {
                file.aip_id = aip.id.clone();
                file.representation_id = representation.id.clone();
            }
        }
        let mut aips = self.aips.write();
        match aips.iter_mut().find(|a| a.id == aip.id) {
            Some(existing) => *existing = aip,
            None => aips.push(aip),
        }
    }

    pub fn insert_transferred_resource(&self, resource: TransferredResource) {
        let mut resources = self.transferred.write();
        match resources.iter_mut().find(|r| r.id == resource.id) {
            Some(existing) => *existing = resource,
            None => resources.push(resource),
        }
    }

    #[must_use]
    pub fn stream_stats(&self) -> Arc<StreamStats> {
        Arc::clone(&self.stats)
    }

    /// Every object of `kind`, in repository order.
    fn objects_of(&self, kind: ObjectKind) -> Vec<RepositoryObject> {
        match kind {
            ObjectKind::Aip => self.aips.read().iter().cloned().map(Into::into).collect(),
            ObjectKind::Representation => self
                .aips
                .read()
                .iter()
                .flat_map(|a| a.representations.iter().cloned().map(Into::into))
                .collect(),
            ObjectKind::File => self
                .aips
                .read()
                .iter()
                .flat_map(|a| a.representations.iter())
                .flat_map(|r| r.files.iter().cloned().map(Into::into))
                .collect(),
            ObjectKind::TransferredResource => self
                .transferred
                .read()
                .iter()
                .cloned()
                .map(Into::into)
                .collect(),
        }
    }
}

impl ModelService for MemoryRepository {
    fn retrieve_aip(&self, aip_id: &str) -> ArcaResult<Aip> {
        self.aips
            .read()
            .iter()
            .find(|a| a.id == aip_id)
            .cloned()
            .ok_or_else(|| ArcaError::NotFound {
                kind: ObjectKind::Aip,
                id: aip_id.to_string(),
            })
    }

    fn retrieve_object(&self, kind: ObjectKind, id: &str) -> ArcaResult<RepositoryObject> {
        if kind == ObjectKind::Aip {
            return self.retrieve_aip(id).map(Into::into);
        }
        self.objects_of(kind)
            .into_iter()
            .find(|o| o.id() == id)
            .ok_or_else(|| ArcaError::NotFound {
                kind,
                id: id.to_string(),
            })
    }

    fn list_aips(&self) -> ArcaResult<Box<dyn ObjectStream>> {
        let objects = self.objects_of(ObjectKind::Aip);
        Ok(Box::new(TrackedStream::new(objects, self.stream_stats())))
    }

    fn list_files_under(
        &self,
        aip_id: &str,
        representation_id: &str,
        recursive: bool,
    ) -> ArcaResult<Box<dyn ObjectStream>> {
        let aip = self.retrieve_aip(aip_id)?;
        let representation = aip
            .representations
            .into_iter()
            .find(|r| r.id == representation_id)
            .ok_or_else(|| ArcaError::NotFound {
                kind: ObjectKind::Representation,
                id: representation_id.to_string(),
            })?;
        let files = representation
            .files
            .into_iter()
            .filter(|f| recursive || f.path.is_empty())
            .map(Into::into)
            .collect();
        Ok(Box::new(TrackedStream::new(files, self.stream_stats())))
    }
}

impl IndexService for MemoryRepository {
    fn find(
        &self,
        kind: ObjectKind,
        filter: &Filter,
        sorter: Option<&Sorter>,
        sublist: Sublist,
    ) -> ArcaResult<IndexResult<RepositoryObject>> {
        let mut matching: Vec<RepositoryObject> = self
            .objects_of(kind)
            .into_iter()
            .filter(|o| filter.matches(o))
            .collect();
        if let Some(sorter) = sorter {
            matching.sort_by(|a, b| {
                let ord = a.field(&sorter.field).cmp(&b.field(&sorter.field));
                if sorter.descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }
        let total_count = matching.len();
        let results = matching
            .into_iter()
            .skip(sublist.offset)
            .take(sublist.limit)
            .collect();
        Ok(IndexResult {
            offset: sublist.offset,
            limit: sublist.limit,
            total_count,
            results,
        })
    }

    fn count(&self, kind: ObjectKind, filter: &Filter) -> ArcaResult<usize> {
        Ok(self
            .objects_of(kind)
            .iter()
            .filter(|o| filter.matches(o))
            .count())
    }
}
