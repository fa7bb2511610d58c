//! Job control: cancellation registry and the job-control worker pool
//!
//! Start messages run on their own small pool so job control never waits
//! behind batch work.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use arca_common::{ArcaError, ArcaResult, Job, JobId, Report};

/// Per-job cancellation tokens, all children of one root token.
///
/// A job cancelled because it overran its budget is also marked expired, so
/// it ends failed rather than stopped.
pub struct JobRegistry {
    root: CancellationToken,
    tokens: DashMap<JobId, CancellationToken>,
    expired: DashMap<JobId, ()>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            tokens: DashMap::new(),
            expired: DashMap::new(),
        }
    }

    /// Token for `job_id`, created on first use.
    pub fn register(&self, job_id: &str) -> CancellationToken {
        self.tokens
            .entry(job_id.to_string())
            .or_insert_with(|| self.root.child_token())
            .clone()
    }

    pub fn token(&self, job_id: &str) -> Option<CancellationToken> {
        self.tokens.get(job_id).map(|t| t.clone())
    }

    /// Cancel one job. Returns false when the job is not active.
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.tokens.get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Mark `job_id` as out of time and cancel it. Returns false when the
    /// job is not active.
    pub fn expire(&self, job_id: &str) -> bool {
        let Some(token) = self.token(job_id) else {
            return false;
        };
        self.expired.insert(job_id.to_string(), ());
        token.cancel();
        true
    }

    pub fn is_expired(&self, job_id: &str) -> bool {
        self.expired.contains_key(job_id)
    }

    pub fn remove(&self, job_id: &str) {
        self.tokens.remove(job_id);
        self.expired.remove(job_id);
    }

    pub fn active(&self) -> Vec<JobId> {
        self.tokens.iter().map(|e| e.key().clone()).collect()
    }

    pub fn cancel_all(&self) {
        self.root.cancel();
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Executes stored jobs on behalf of the control pool.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run_job(&self, job: Job) -> ArcaResult<Report>;

    /// Called when a job overran its control timeout. The run keeps going
    /// for a grace period so it can wind down and report.
    async fn expire(&self, job_id: &str);

    /// Called when a job did not wind down within the grace period and was
    /// dropped.
    async fn abandon(&self, job_id: &str);
}

enum ControlMessage {
    Start {
        job: Job,
        timeout: Duration,
        reply: oneshot::Sender<ArcaResult<Report>>,
    },
}

pub struct JobControlChannel {
    sender: SyncMutex<Option<mpsc::Sender<ControlMessage>>>,
    workers: SyncMutex<Vec<JoinHandle<()>>>,
}

impl JobControlChannel {
    /// Spawn `worker_count` control workers sharing one bounded queue. A job
    /// that overruns its timeout gets `grace` more to return its report.
    pub fn new(
        worker_count: usize,
        capacity: usize,
        grace: Duration,
        runner: Arc<dyn JobRunner>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..worker_count.max(1))
            .map(|worker_id| {
                let rx = Arc::clone(&rx);
                let runner = Arc::clone(&runner);
                tokio::spawn(async move {
                    loop {
                        let message = {
                            let mut rx = rx.lock().await;
                            rx.recv().await
                        };
                        let Some(message) = message else {
                            break;
                        };
                        handle(worker_id, runner.as_ref(), grace, message).await;
                    }
                    debug!(worker = worker_id, "Control worker stopped");
                })
            })
            .collect();
        Self {
            sender: SyncMutex::new(Some(tx)),
            workers: SyncMutex::new(workers),
        }
    }

    /// Queue a job start. The receiver resolves with the job's report.
    pub async fn start(
        &self,
        job: Job,
        timeout: Duration,
    ) -> ArcaResult<oneshot::Receiver<ArcaResult<Report>>> {
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or_else(|| ArcaError::WorkerUnavailable("job control channel is closed".into()))?;
        let (reply, rx) = oneshot::channel();
        sender
            .send(ControlMessage::Start {
                job,
                timeout,
                reply,
            })
            .await
            .map_err(|_| ArcaError::WorkerUnavailable("job control channel is closed".into()))?;
        Ok(rx)
    }

    pub async fn shutdown(&self) {
        self.sender.lock().take();
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for w in workers {
            if let Err(e) = w.await {
                warn!("Control worker exited abnormally: {}", e);
            }
        }
        info!("Job control channel stopped");
    }
}

async fn handle(
    worker_id: usize,
    runner: &dyn JobRunner,
    grace: Duration,
    message: ControlMessage,
) {
    match message {
        ControlMessage::Start {
            job,
            timeout,
            reply,
        } => {
            let job_id = job.id.clone();
            debug!(worker = worker_id, job = %job_id, "Starting job");
            let mut run = runner.run_job(job);
            let result = match tokio::time::timeout(timeout, &mut run).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(job = %job_id, "Job exceeded its {:?} budget, cancelling", timeout);
                    runner.expire(&job_id).await;
                    match tokio::time::timeout(grace, &mut run).await {
                        Ok(result) => result,
                        Err(_) => {
                            error!(job = %job_id, "Job still running {:?} after cancellation", grace);
                            drop(run);
                            runner.abandon(&job_id).await;
                            Err(ArcaError::Timeout(format!(
                                "job {job_id} did not finish within {timeout:?}"
                            )))
                        }
                    }
                }
            };
            if reply.send(result).is_err() {
                debug!(job = %job_id, "Nobody waiting for job result");
            }
        }
    }
}
