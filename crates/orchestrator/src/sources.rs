//! Object sources for each selector shape

use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

use arca_common::{
    ArcaResult, Collaborators, Filter, IndexService, ModelService, ObjectKind, ObjectSelector,
    ObjectStream, RepositoryObject, Sublist, VecStream,
};

/// Open the object source described by `selector`. Index-backed sources
/// fetch `page_size` objects per round trip.
pub fn open_source(
    collaborators: &Collaborators,
    selector: &ObjectSelector,
    page_size: usize,
) -> ArcaResult<Box<dyn ObjectStream>> {
    let model = Arc::clone(&collaborators.model);
    let index = Arc::clone(&collaborators.index);
    let source: Box<dyn ObjectStream> = match selector {
        ObjectSelector::Ids { kind, ids } => Box::new(IdStream::new(model, *kind, ids.clone())),
        ObjectSelector::Query { kind, filter } => {
            Box::new(IndexStream::new(index, *kind, filter.clone(), page_size))
        }
        ObjectSelector::All { kind } => match kind {
            ObjectKind::Aip => model.list_aips()?,
            ObjectKind::Representation => Box::new(RepresentationStream::new(model.list_aips()?)),
            ObjectKind::File => Box::new(FileStream::new(model.list_aips()?, model)),
            ObjectKind::TransferredResource => Box::new(IndexStream::new(
                index,
                ObjectKind::TransferredResource,
                Filter::all(),
                page_size,
            )),
        },
        ObjectSelector::None => Box::new(VecStream::new(Vec::new())),
    };
    Ok(source)
}

/// Resolves explicit ids one at a time through the model.
pub struct IdStream {
    model: Arc<dyn ModelService>,
    kind: ObjectKind,
    ids: std::vec::IntoIter<String>,
    yielded: usize,
    closed: bool,
}

impl IdStream {
    pub fn new(model: Arc<dyn ModelService>, kind: ObjectKind, ids: Vec<String>) -> Self {
        Self {
            model,
            kind,
            ids: ids.into_iter(),
            yielded: 0,
            closed: false,
        }
    }
}

impl Iterator for IdStream {
    type Item = ArcaResult<RepositoryObject>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.closed {
            return None;
        }
        let id = self.ids.next()?;
        self.yielded += 1;
        Some(self.model.retrieve_object(self.kind, &id))
    }
}

impl ObjectStream for IdStream {
    fn close(&mut self) -> ArcaResult<()> {
        self.closed = true;
        Ok(())
    }

    fn yielded(&self) -> usize {
        self.yielded
    }
}

/// Pages through an index query.
pub struct IndexStream {
    index: Arc<dyn IndexService>,
    kind: ObjectKind,
    filter: Filter,
    page_size: usize,
    offset: usize,
    buffer: VecDeque<RepositoryObject>,
    exhausted: bool,
    yielded: usize,
}

impl IndexStream {
    pub fn new(
        index: Arc<dyn IndexService>,
        kind: ObjectKind,
        filter: Filter,
        page_size: usize,
    ) -> Self {
        Self {
            index,
            kind,
            filter,
            page_size: page_size.max(1),
            offset: 0,
            buffer: VecDeque::new(),
            exhausted: false,
            yielded: 0,
        }
    }

    fn fetch_page(&mut self) -> ArcaResult<()> {
        let page = self.index.find(
            self.kind,
            &self.filter,
            None,
            Sublist::new(self.offset, self.page_size),
        )?;
        debug!(
            kind = %self.kind,
            offset = self.offset,
            total = page.total_count,
            "Fetched {} object(s) from index",
            page.results.len()
        );
        self.offset += page.results.len();
        if page.results.is_empty() || self.offset >= page.total_count {
            self.exhausted = true;
        }
        self.buffer.extend(page.results);
        Ok(())
    }
}

impl Iterator for IndexStream {
    type Item = ArcaResult<RepositoryObject>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        let object = self.buffer.pop_front()?;
        self.yielded += 1;
        Some(Ok(object))
    }
}

impl ObjectStream for IndexStream {
    fn close(&mut self) -> ArcaResult<()> {
        self.exhausted = true;
        self.buffer.clear();
        Ok(())
    }

    fn yielded(&self) -> usize {
        self.yielded
    }
}

/// Every representation of every AIP.
pub struct RepresentationStream {
    aips: Box<dyn ObjectStream>,
    buffer: VecDeque<RepositoryObject>,
    yielded: usize,
    closed: bool,
}

impl RepresentationStream {
    pub fn new(aips: Box<dyn ObjectStream>) -> Self {
        Self {
            aips,
            buffer: VecDeque::new(),
            yielded: 0,
            closed: false,
        }
    }
}

impl Iterator for RepresentationStream {
    type Item = ArcaResult<RepositoryObject>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.buffer.is_empty() {
            if self.closed {
                return None;
            }
            match self.aips.next()? {
                Ok(RepositoryObject::Aip(aip)) => {
                    self.buffer
                        .extend(aip.representations.into_iter().map(RepositoryObject::from));
                }
                Ok(_) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        let object = self.buffer.pop_front()?;
        self.yielded += 1;
        Some(Ok(object))
    }
}

impl ObjectStream for RepresentationStream {
    fn close(&mut self) -> ArcaResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.buffer.clear();
        self.aips.close()
    }

    fn yielded(&self) -> usize {
        self.yielded
    }
}

/// Every non-directory file under every representation of every AIP.
///
/// Each per-representation listing is closed as soon as it is drained.
pub struct FileStream {
    aips: Box<dyn ObjectStream>,
    model: Arc<dyn ModelService>,
    pending: VecDeque<(String, String)>,
    current: Option<Box<dyn ObjectStream>>,
    yielded: usize,
    closed: bool,
}

impl FileStream {
    pub fn new(aips: Box<dyn ObjectStream>, model: Arc<dyn ModelService>) -> Self {
        Self {
            aips,
            model,
            pending: VecDeque::new(),
            current: None,
            yielded: 0,
            closed: false,
        }
    }

    fn close_current(&mut self) -> ArcaResult<()> {
        match self.current.take() {
            Some(mut listing) => listing.close(),
            None => Ok(()),
        }
    }
}

impl Iterator for FileStream {
    type Item = ArcaResult<RepositoryObject>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.closed {
                return None;
            }
            if let Some(listing) = self.current.as_mut() {
                match listing.next() {
                    Some(Ok(RepositoryObject::File(f))) if f.is_directory => continue,
                    Some(Ok(object)) => {
                        self.yielded += 1;
                        return Some(Ok(object));
                    }
                    Some(Err(e)) => return Some(Err(e)),
                    None => {
                        if let Err(e) = self.close_current() {
                            warn!("File listing close failed: {}", e);
                        }
                        continue;
                    }
                }
            }
            if let Some((aip_id, representation_id)) = self.pending.pop_front() {
                match self.model.list_files_under(&aip_id, &representation_id, true) {
                    Ok(listing) => self.current = Some(listing),
                    Err(e) => return Some(Err(e)),
                }
                continue;
            }
            match self.aips.next()? {
                Ok(RepositoryObject::Aip(aip)) => {
                    self.pending.extend(
                        aip.representations
                            .into_iter()
                            .map(|r| (aip.id.clone(), r.id)),
                    );
                }
                Ok(_) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

impl ObjectStream for FileStream {
    fn close(&mut self) -> ArcaResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.pending.clear();
        let current = self.close_current();
        let outer = self.aips.close();
        current.and(outer)
    }

    fn yielded(&self) -> usize {
        self.yielded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arca_common::{Aip, ArcaError, File, Representation, TransferredResource};
    use arca_storage::MemoryRepository;

    fn collaborators() -> (Arc<MemoryRepository>, Collaborators) {
        let repo = Arc::new(MemoryRepository::new());
        repo.insert_aip(
            Aip::new("a1")
                .with_representation(
                    Representation::new("r1")
                        .with_file(File::new("f1", 1))
                        .with_file(File::directory("d"))
                        .with_file(File::new("f2", 2).with_path(vec!["d".into()])),
                )
                .with_representation(Representation::new("r2").with_file(File::new("f3", 3))),
        );
        repo.insert_aip(Aip::new("a2").with_representation(Representation::new("r3")));
        for i in 0..5 {
            repo.insert_transferred_resource(TransferredResource::new(format!("t{i}"), "x"));
        }
        let c = Collaborators::new(repo.clone(), repo.clone());
        (repo, c)
    }

    fn ids(stream: Box<dyn ObjectStream>) -> Vec<String> {
        stream.map(|o| o.unwrap().id().to_string()).collect()
    }

    #[test]
    fn all_representations_flattens_aips() {
        let (_, c) = collaborators();
        let s = open_source(&c, &ObjectSelector::all(ObjectKind::Representation), 10).unwrap();
        assert_eq!(ids(s), vec!["r1", "r2", "r3"]);
    }

    #[test]
    fn all_files_skips_directories_and_closes_listings() {
        let (repo, c) = collaborators();
        let mut s = open_source(&c, &ObjectSelector::all(ObjectKind::File), 10).unwrap();
        let got: Vec<String> = s.by_ref().map(|o| o.unwrap().id().to_string()).collect();
        assert_eq!(got, vec!["f1", "f2", "f3"]);
        assert_eq!(s.yielded(), 3);
        s.close().unwrap();
        s.close().unwrap();
        let stats = repo.stream_stats();
        // one AIP listing plus three representation listings
        assert_eq!(stats.opened(), 4);
        assert_eq!(stats.close_calls(), 4);
    }

    #[test]
    fn index_source_pages_through_results() {
        let (_, c) = collaborators();
        let s = open_source(
            &c,
            &ObjectSelector::all(ObjectKind::TransferredResource),
            2,
        )
        .unwrap();
        assert_eq!(ids(s), vec!["t0", "t1", "t2", "t3", "t4"]);
    }

    #[test]
    fn query_source_applies_filter() {
        let (_, c) = collaborators();
        let selector = ObjectSelector::query(
            ObjectKind::File,
            Filter::all().with_term("representation_id", "r1"),
        );
        let s = open_source(&c, &selector, 1).unwrap();
        assert_eq!(ids(s), vec!["f1", "d", "f2"]);
    }

    #[test]
    fn id_source_reports_missing_objects() {
        let (_, c) = collaborators();
        let selector = ObjectSelector::ids(ObjectKind::Aip, vec!["a2".into(), "nope".into()]);
        let mut s = open_source(&c, &selector, 10).unwrap();
        assert_eq!(s.next().unwrap().unwrap().id(), "a2");
        let err = s.next().unwrap().unwrap_err();
        assert!(matches!(err, ArcaError::NotFound { .. }));
        assert!(err.object_ref().is_some());
        assert!(s.next().is_none());
        assert_eq!(s.yielded(), 2);
    }
}
