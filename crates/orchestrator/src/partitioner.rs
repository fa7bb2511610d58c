//! Batch partitioning over closable object sources

use tracing::{debug, warn};

use arca_common::{
    ArcaError, ArcaResult, ObjectKind, ObjectRef, ObjectStream, RepositoryObject, VecStream,
};

/// An ordered group of objects handled by one plugin instance. Only a
/// parameter-only run uses an empty batch.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Position in source order, starting at zero.
    pub index: usize,
    pub kind: Option<ObjectKind>,
    pub objects: Vec<RepositoryObject>,
}

impl Batch {
    /// The single empty batch of a run that selects no objects.
    pub fn standalone() -> Self {
        Self {
            index: 0,
            kind: None,
            objects: Vec::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn object_refs(&self) -> Vec<ObjectRef> {
        self.objects.iter().map(RepositoryObject::object_ref).collect()
    }
}

/// Splits object sources into batches of at most `block_size` objects.
#[derive(Debug, Clone, Copy)]
pub struct BatchPartitioner {
    block_size: usize,
}

impl BatchPartitioner {
    pub fn new(block_size: usize) -> ArcaResult<Self> {
        if block_size == 0 {
            return Err(ArcaError::Config("block size must be greater than zero".into()));
        }
        Ok(Self { block_size })
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Lazily batch `source`. The source is closed exactly once: on
    /// exhaustion, on an explicit [`BatchIter::close`], or when the iterator
    /// is dropped.
    pub fn partition(&self, kind: ObjectKind, source: Box<dyn ObjectStream>) -> BatchIter {
        BatchIter {
            source: Some(source),
            kind: Some(kind),
            block_size: self.block_size,
            next_index: 0,
            pending_error: None,
            standalone: None,
        }
    }

    /// A single empty batch for a plugin run that selects no objects.
    pub fn standalone(&self) -> BatchIter {
        BatchIter {
            source: None,
            kind: None,
            block_size: self.block_size,
            next_index: 1,
            pending_error: None,
            standalone: Some(Batch::standalone()),
        }
    }

    /// Batch an in-memory list.
    pub fn partition_list(&self, kind: ObjectKind, objects: Vec<RepositoryObject>) -> BatchIter {
        self.partition(kind, Box::new(VecStream::new(objects)))
    }
}

/// Iterator of batches over one object source.
///
/// A source error that names an object is surfaced on its own and iteration
/// continues; any other source error is surfaced and ends iteration.
pub struct BatchIter {
    source: Option<Box<dyn ObjectStream>>,
    kind: Option<ObjectKind>,
    block_size: usize,
    next_index: usize,
    pending_error: Option<ArcaError>,
    standalone: Option<Batch>,
}

impl BatchIter {
    /// Close the underlying source now. Later calls are no-ops.
    pub fn close(&mut self) -> ArcaResult<()> {
        match self.source.take() {
            Some(mut source) => {
                debug!("Closing object source after {} object(s)", source.yielded());
                source.close()
            }
            None => Ok(()),
        }
    }

    /// Objects pulled from the source so far.
    pub fn yielded(&self) -> Option<usize> {
        self.source.as_ref().map(|s| s.yielded())
    }

    pub fn is_closed(&self) -> bool {
        self.source.is_none()
    }

    fn emit(&mut self, objects: Vec<RepositoryObject>) -> Batch {
        let batch = Batch {
            index: self.next_index,
            kind: self.kind,
            objects,
        };
        self.next_index += 1;
        batch
    }

    fn close_on_exhaustion(&mut self) -> Option<ArcaError> {
        self.close()
            .err()
            .map(|e| ArcaError::Source(format!("failed to close object source: {e}")))
    }
}

impl Iterator for BatchIter {
    type Item = ArcaResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.pending_error.take() {
            return Some(Err(err));
        }
        if let Some(batch) = self.standalone.take() {
            return Some(Ok(batch));
        }
        let mut objects = Vec::with_capacity(self.block_size);
        while objects.len() < self.block_size {
            let Some(source) = self.source.as_mut() else {
                break;
            };
            match source.next() {
                Some(Ok(object)) => objects.push(object),
                Some(Err(err)) => {
                    let fatal = err.object_ref().is_none();
                    if fatal {
                        if let Err(close_err) = self.close() {
                            warn!("Object source close failed after error: {}", close_err);
                        }
                    }
                    if objects.is_empty() {
                        return Some(Err(err));
                    }
                    self.pending_error = Some(err);
                    break;
                }
                None => {
                    if let Some(close_err) = self.close_on_exhaustion() {
                        if objects.is_empty() {
                            return Some(Err(close_err));
                        }
                        self.pending_error = Some(close_err);
                    }
                    break;
                }
            }
        }
        if objects.is_empty() {
            None
        } else {
            Some(Ok(self.emit(objects)))
        }
    }
}

impl Drop for BatchIter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Object source close failed on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arca_common::File;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn files(n: usize) -> Vec<RepositoryObject> {
        (0..n).map(|i| File::new(format!("f{i}"), 1).into()).collect()
    }

    struct CountingStream {
        inner: VecStream,
        closes: Arc<AtomicUsize>,
    }

    impl Iterator for CountingStream {
        type Item = ArcaResult<RepositoryObject>;

        fn next(&mut self) -> Option<Self::Item> {
            self.inner.next()
        }
    }

    impl ObjectStream for CountingStream {
        fn close(&mut self) -> ArcaResult<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.inner.close()
        }

        fn yielded(&self) -> usize {
            self.inner.yielded()
        }
    }

    fn counting(items: Vec<ArcaResult<RepositoryObject>>) -> (Box<dyn ObjectStream>, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        let stream = CountingStream {
            inner: VecStream::from_results(items),
            closes: Arc::clone(&closes),
        };
        (Box::new(stream), closes)
    }

    #[test]
    fn rejects_zero_block_size() {
        assert!(BatchPartitioner::new(0).is_err());
    }

    #[test]
    fn splits_250_into_three_batches() {
        let p = BatchPartitioner::new(100).unwrap();
        let sizes: Vec<usize> = p
            .partition_list(ObjectKind::File, files(250))
            .map(|b| b.unwrap().len())
            .collect();
        assert_eq!(sizes, vec![100, 100, 50]);
    }

    #[test]
    fn empty_source_yields_nothing_and_closes() {
        let p = BatchPartitioner::new(10).unwrap();
        let (source, closes) = counting(Vec::new());
        let mut iter = p.partition(ObjectKind::File, source);
        assert!(iter.next().is_none());
        assert!(iter.is_closed());
        drop(iter);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn early_drop_closes_once() {
        let p = BatchPartitioner::new(2).unwrap();
        let (source, closes) = counting(files(10).into_iter().map(Ok).collect());
        let mut iter = p.partition(ObjectKind::File, source);
        assert!(iter.next().is_some());
        iter.close().unwrap();
        iter.close().unwrap();
        drop(iter);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn object_errors_do_not_end_iteration() {
        let p = BatchPartitioner::new(2).unwrap();
        let missing = ArcaError::NotFound {
            kind: ObjectKind::File,
            id: "gone".into(),
        };
        let mut items: Vec<ArcaResult<RepositoryObject>> = files(1).into_iter().map(Ok).collect();
        items.push(Err(missing));
        items.extend(files(2).into_iter().map(Ok));
        let (source, closes) = counting(items);
        let out: Vec<_> = p.partition(ObjectKind::File, source).collect();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].as_ref().unwrap().len(), 1);
        assert!(out[1].is_err());
        assert_eq!(out[2].as_ref().unwrap().len(), 2);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn source_failure_ends_iteration_and_closes() {
        let p = BatchPartitioner::new(5).unwrap();
        let mut items: Vec<ArcaResult<RepositoryObject>> = files(3).into_iter().map(Ok).collect();
        items.push(Err(ArcaError::Source("index went away".into())));
        items.extend(files(3).into_iter().map(Ok));
        let (source, closes) = counting(items);
        let out: Vec<_> = p.partition(ObjectKind::File, source).collect();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_ref().unwrap().len(), 3);
        assert!(matches!(out[1], Err(ArcaError::Source(_))));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn standalone_yields_one_empty_batch() {
        let p = BatchPartitioner::new(3).unwrap();
        let mut iter = p.standalone();
        let batch = iter.next().unwrap().unwrap();
        assert_eq!(batch.index, 0);
        assert!(batch.kind.is_none());
        assert!(batch.is_empty());
        assert!(iter.next().is_none());
        assert!(iter.is_closed());
    }

    proptest! {
        #[test]
        fn batches_cover_input_in_order(n in 0usize..600, block in 1usize..150) {
            let p = BatchPartitioner::new(block).unwrap();
            let input = files(n);
            let batches: Vec<Batch> = p
                .partition_list(ObjectKind::File, input.clone())
                .map(|b| b.unwrap())
                .collect();

            prop_assert_eq!(batches.len(), n.div_ceil(block));
            for (i, b) in batches.iter().enumerate() {
                prop_assert_eq!(b.index, i);
                prop_assert!(!b.is_empty());
                if i + 1 < batches.len() {
                    prop_assert_eq!(b.len(), block);
                }
            }
            if let Some(last) = batches.last() {
                let expected = if n % block == 0 { block } else { n % block };
                prop_assert_eq!(last.len(), expected);
            }
            let rejoined: Vec<RepositoryObject> =
                batches.into_iter().flat_map(|b| b.objects).collect();
            prop_assert_eq!(rejoined, input);
        }
    }
}
