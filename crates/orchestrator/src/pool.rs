//! Item-processing worker pool
//!
//! N long-lived tokio tasks, each draining its own bounded queue. Tasks are
//! handed out round-robin regardless of queue depth. Submission never waits:
//! a task that finds its queue full is parked until the queue has room or
//! the task's job is cancelled.

use parking_lot::Mutex as SyncMutex;
use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use arca_common::{ArcaError, ArcaResult, ExecutionContext, Plugin, Report, RepositoryObject};

/// One "execute this batch with this instance" request.
pub struct BatchTask {
    pub batch_index: usize,
    pub objects: Vec<RepositoryObject>,
    pub plugin: Arc<Mutex<Box<dyn Plugin>>>,
    pub ctx: ExecutionContext,
}

struct Envelope {
    task: BatchTask,
    reply: oneshot::Sender<ArcaResult<Report>>,
}

/// Resolves once the worker has finished (or abandoned) the batch.
pub struct BatchHandle {
    pub batch_index: usize,
    pub worker: usize,
    rx: oneshot::Receiver<ArcaResult<Report>>,
}

impl BatchHandle {
    pub async fn wait(self) -> ArcaResult<Report> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(ArcaError::WorkerUnavailable(format!(
                "worker {} dropped batch {}",
                self.worker, self.batch_index
            ))),
        }
    }
}

pub struct WorkerPool {
    senders: SyncMutex<Vec<mpsc::Sender<Envelope>>>,
    dispatched: Vec<AtomicUsize>,
    next: AtomicUsize,
    workers: SyncMutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl WorkerPool {
    /// Spawn `worker_count` workers. Must be called inside a tokio runtime.
    pub fn new(worker_count: usize, queue_capacity: usize) -> ArcaResult<Self> {
        if worker_count == 0 || queue_capacity == 0 {
            return Err(ArcaError::Config(
                "worker pool needs at least one worker and a non-zero queue".into(),
            ));
        }
        let mut senders = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let (tx, rx) = mpsc::channel(queue_capacity);
            senders.push(tx);
            workers.push(tokio::spawn(worker_loop(worker_id, rx)));
        }
        info!("Started worker pool with {} worker(s)", worker_count);
        Ok(Self {
            senders: SyncMutex::new(senders),
            dispatched: (0..worker_count).map(|_| AtomicUsize::new(0)).collect(),
            next: AtomicUsize::new(0),
            workers: SyncMutex::new(workers),
            worker_count,
        })
    }

    #[inline]
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Tasks handed to each worker so far.
    pub fn dispatched(&self) -> Vec<usize> {
        self.dispatched
            .iter()
            .map(|d| d.load(Ordering::Relaxed))
            .collect()
    }

    pub fn total_dispatched(&self) -> usize {
        self.dispatched().iter().sum()
    }

    /// Queue `task` on the next worker in cyclic order.
    pub fn submit(&self, task: BatchTask) -> ArcaResult<BatchHandle> {
        let worker = self.next.fetch_add(1, Ordering::Relaxed) % self.worker_count;
        let sender = self
            .senders
            .lock()
            .get(worker)
            .cloned()
            .ok_or_else(|| ArcaError::WorkerUnavailable("worker pool is shut down".into()))?;

        let batch_index = task.batch_index;
        let (reply, rx) = oneshot::channel();
        match sender.try_send(Envelope { task, reply }) {
            Ok(()) => debug!(worker, batch = batch_index, "Dispatched batch"),
            Err(TrySendError::Full(envelope)) => {
                debug!(worker, batch = batch_index, "Worker queue full, parking batch");
                tokio::spawn(park(worker, sender, envelope));
            }
            Err(TrySendError::Closed(_)) => {
                return Err(ArcaError::WorkerUnavailable(format!("worker {worker} has stopped")));
            }
        }
        self.dispatched[worker].fetch_add(1, Ordering::Relaxed);
        Ok(BatchHandle {
            batch_index,
            worker,
            rx,
        })
    }

    /// Close every queue and wait for the workers to drain.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.senders.lock().clear();
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for w in workers {
            if let Err(e) = w.await {
                warn!("Worker exited abnormally: {}", e);
            }
        }
        info!("Worker pool stopped");
    }
}

/// Hold a batch until its worker's queue has room. A cancelled job's batch
/// is answered without ever reaching the worker.
async fn park(worker: usize, sender: mpsc::Sender<Envelope>, envelope: Envelope) {
    let token = envelope.task.ctx.cancellation_token().clone();
    tokio::select! {
        permit = sender.reserve() => match permit {
            Ok(permit) => permit.send(envelope),
            Err(_) => {
                let _ = envelope.reply.send(Err(ArcaError::WorkerUnavailable(format!(
                    "worker {worker} has stopped"
                ))));
            }
        },
        _ = token.cancelled() => {
            let _ = envelope.reply.send(Err(ArcaError::Cancelled));
        }
    }
}

async fn worker_loop(worker_id: usize, mut rx: mpsc::Receiver<Envelope>) {
    while let Some(Envelope { task, reply }) = rx.recv().await {
        let batch = task.batch_index;
        let result = run_task(task).await;
        if reply.send(result).is_err() {
            debug!(worker = worker_id, batch, "Batch result had no receiver");
        }
    }
    debug!(worker = worker_id, "Worker queue closed");
}

/// Execute one batch in its own task so a panicking plugin only fails its
/// batch. Cancellation abandons the batch at the next await point.
async fn run_task(task: BatchTask) -> ArcaResult<Report> {
    let BatchTask {
        batch_index,
        objects,
        plugin,
        ctx,
    } = task;
    let token = ctx.cancellation_token().clone();
    if token.is_cancelled() {
        return Err(ArcaError::Cancelled);
    }

    let mut exec = tokio::spawn(async move {
        let mut plugin = plugin.lock().await;
        plugin.execute(&ctx, &objects).await
    });

    tokio::select! {
        joined = &mut exec => match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(ArcaError::Execution {
                message: format!("batch {batch_index} panicked: {}", panic_message(e.into_panic())),
                object: None,
            }),
            Err(_) => Err(ArcaError::Cancelled),
        },
        _ = token.cancelled() => {
            exec.abort();
            let _ = exec.await;
            debug!(batch = batch_index, "Batch abandoned after cancellation");
            Err(ArcaError::Cancelled)
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arca_common::{
        Collaborators, File, InstanceId, ObjectKind, PluginParameters, ProgressSink,
        ReportItem,
    };
    use arca_storage::MemoryRepository;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct NoProgress;

    impl ProgressSink for NoProgress {
        fn update_progress(&self, _: &str, _: InstanceId, _: usize, _: usize) -> ArcaResult<f64> {
            Ok(0.0)
        }
    }

    #[derive(Clone)]
    enum Mode {
        Ok,
        Panic,
        Sleep(Duration),
    }

    struct TestPlugin {
        mode: Mode,
        params: PluginParameters,
    }

    #[async_trait]
    impl Plugin for TestPlugin {
        fn id(&self) -> &str {
            "test"
        }

        fn name(&self) -> &str {
            "test"
        }

        fn object_kinds(&self) -> &[ObjectKind] {
            &ObjectKind::ALL
        }

        fn set_parameters(&mut self, parameters: &PluginParameters) -> ArcaResult<()> {
            self.params = parameters.clone();
            Ok(())
        }

        fn parameters(&self) -> &PluginParameters {
            &self.params
        }

        fn clone_plugin(&self) -> Box<dyn Plugin> {
            Box::new(TestPlugin {
                mode: self.mode.clone(),
                params: PluginParameters::new(),
            })
        }

        async fn process_object(
            &mut self,
            _ctx: &ExecutionContext,
            object: &RepositoryObject,
        ) -> ArcaResult<ReportItem> {
            match &self.mode {
                Mode::Ok => {}
                Mode::Panic => panic!("plugin blew up"),
                Mode::Sleep(d) => tokio::time::sleep(*d).await,
            }
            Ok(ReportItem::success(object.object_ref()))
        }
    }

    fn task(mode: Mode, token: CancellationToken) -> BatchTask {
        let repo = Arc::new(MemoryRepository::new());
        BatchTask {
            batch_index: 0,
            objects: vec![File::new("f", 1).into()],
            plugin: Arc::new(Mutex::new(Box::new(TestPlugin {
                mode,
                params: PluginParameters::new(),
            }))),
            ctx: ExecutionContext::new(
                "job".into(),
                InstanceId::new(),
                Collaborators::new(repo.clone(), repo),
                Arc::new(NoProgress),
                token,
            ),
        }
    }

    #[tokio::test]
    async fn round_robin_dispatch() {
        let pool = WorkerPool::new(3, 4).unwrap();
        let mut handles = Vec::new();
        for _ in 0..7 {
            handles.push(pool.submit(task(Mode::Ok, CancellationToken::new())).unwrap());
        }
        for h in handles {
            assert_eq!(h.wait().await.unwrap().items.len(), 1);
        }
        assert_eq!(pool.dispatched(), vec![3, 2, 2]);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn panic_fails_only_its_batch() {
        let pool = WorkerPool::new(1, 4).unwrap();
        let bad = pool.submit(task(Mode::Panic, CancellationToken::new())).unwrap();
        let good = pool.submit(task(Mode::Ok, CancellationToken::new())).unwrap();
        let err = bad.wait().await.unwrap_err();
        assert!(err.to_string().contains("plugin blew up"));
        assert!(good.wait().await.is_ok());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn cancellation_abandons_in_flight_batch() {
        let pool = WorkerPool::new(1, 4).unwrap();
        let token = CancellationToken::new();
        let handle = pool
            .submit(task(Mode::Sleep(Duration::from_secs(30)), token.clone()))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap();
        assert!(matches!(result, Err(ArcaError::Cancelled)));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn submit_after_shutdown_fails() {
        let pool = WorkerPool::new(2, 1).unwrap();
        pool.shutdown().await;
        assert!(matches!(
            pool.submit(task(Mode::Ok, CancellationToken::new())),
            Err(ArcaError::WorkerUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn full_queue_does_not_block_submit() {
        let pool = WorkerPool::new(1, 1).unwrap();
        assert_eq!(pool.worker_count(), 1);
        let token = CancellationToken::new();
        let handles: Vec<BatchHandle> = (0..4)
            .map(|_| {
                pool.submit(task(Mode::Sleep(Duration::from_secs(60)), token.clone()))
                    .unwrap()
            })
            .collect();
        assert_eq!(pool.total_dispatched(), 4);

        token.cancel();
        for h in handles {
            let result = tokio::time::timeout(Duration::from_secs(5), h.wait())
                .await
                .unwrap();
            assert!(matches!(result, Err(ArcaError::Cancelled)));
        }
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn parked_batches_run_once_the_queue_drains() {
        let pool = WorkerPool::new(1, 1).unwrap();
        let handles: Vec<BatchHandle> = (0..5)
            .map(|_| pool.submit(task(Mode::Ok, CancellationToken::new())).unwrap())
            .collect();
        for h in handles {
            assert_eq!(h.wait().await.unwrap().items.len(), 1);
        }
        pool.shutdown().await;
    }
}
