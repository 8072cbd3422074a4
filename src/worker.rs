//! # Worker Pool
//!
//! Every measurement phase runs as a job on a fixed-size pool. Jobs wait in
//! a bounded queue; when the queue is full, submission fails immediately
//! with a capacity error instead of piling up work the server cannot serve
//! in time.
//!
//! Each job runs in its own task, so a panicking job is caught at the task
//! boundary: the worker logs it, the submitter sees an internal error, and
//! the worker carries on with the next job.

use crate::error::{CapacityLimit, Result, SpeedTestError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Point-in-time pool usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub workers: usize,
    pub busy: usize,
    pub queued: usize,
    pub queue_depth: usize,
}

pub struct WorkerPool {
    sender: mpsc::Sender<Job>,
    workers: usize,
    queue_depth: usize,
    busy: Arc<AtomicUsize>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start `workers` workers sharing a queue of `queue_depth` jobs.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(workers: usize, queue_depth: usize) -> Self {
        let workers = workers.max(1);
        let queue_depth = queue_depth.max(1);
        let (sender, receiver) = mpsc::channel::<Job>(queue_depth);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let busy = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        let handles = (0..workers)
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    Arc::clone(&receiver),
                    Arc::clone(&busy),
                    shutdown.clone(),
                ))
            })
            .collect();

        debug!(
            "Started worker pool: {} workers, queue depth {}",
            workers, queue_depth
        );

        Self {
            sender,
            workers,
            queue_depth,
            busy,
            shutdown,
            handles: Mutex::new(handles),
        }
    }

    /// Queue `job` and return a receiver for its output.
    ///
    /// The receiver errors if the job panicked or was dropped at shutdown.
    pub fn submit<F, T>(&self, job: F) -> Result<oneshot::Receiver<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            return Err(SpeedTestError::Internal(
                "worker pool is shutting down".to_string(),
            ));
        }

        let (tx, rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let _ = tx.send(job.await);
        });

        match self.sender.try_send(job) {
            Ok(()) => Ok(rx),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Worker queue full ({} pending jobs)", self.queue_depth);
                Err(SpeedTestError::Capacity(CapacityLimit::WorkerQueue(
                    self.queue_depth,
                )))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SpeedTestError::Internal(
                "worker pool is closed".to_string(),
            )),
        }
    }

    /// Queue `job` and wait for its output
    pub async fn run<F, T>(&self, job: F) -> Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let rx = self.submit(job)?;
        rx.await
            .map_err(|_| SpeedTestError::Internal("worker job did not complete".to_string()))
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.workers,
            busy: self.busy.load(Ordering::Relaxed),
            queued: self.queue_depth - self.sender.capacity(),
            queue_depth: self.queue_depth,
        }
    }

    /// Stop taking jobs and wait for running ones to finish.
    ///
    /// Jobs still waiting in the queue are dropped.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Worker exited abnormally: {}", e);
            }
        }
        debug!("Worker pool stopped");
    }
}

async fn worker_loop(
    id: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    busy: Arc<AtomicUsize>,
    shutdown: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            job = async { receiver.lock().await.recv().await } => match job {
                Some(job) => job,
                None => break,
            },
        };

        busy.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = tokio::spawn(job).await {
            report_job_failure(id, e);
        }
        busy.fetch_sub(1, Ordering::Relaxed);
    }
    debug!("Worker {} stopped", id);
}

fn report_job_failure(worker: usize, err: JoinError) {
    if err.is_panic() {
        let payload = err.into_panic();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!("Job on worker {} panicked: {}", worker, message);
    } else {
        warn!("Job on worker {} was cancelled", worker);
    }
}
