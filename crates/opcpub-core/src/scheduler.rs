//! Bounded task scheduler for long-running request work (discovery).
//!
//! A fixed set of workers pulls jobs from a bounded queue. Scheduling never
//! blocks: when the queue is full the job is rejected and the caller's
//! rejection callback runs instead.

use crate::error::{CoreError, CoreResult};
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Task scheduler configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TaskSchedulerConfig {
    /// Jobs that may wait for a worker
    pub max_queue_size: usize,
    /// Jobs that may run concurrently
    pub max_instances: usize,
}

impl Default for TaskSchedulerConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10,
            max_instances: 4,
        }
    }
}

struct Gauges {
    queued: AtomicUsize,
    active: AtomicUsize,
}

/// Runs queued jobs on a bounded worker set.
pub struct TaskScheduler {
    config: TaskSchedulerConfig,
    sender: parking_lot::Mutex<Option<mpsc::Sender<Job>>>,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    gauges: Arc<Gauges>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl TaskScheduler {
    /// Create an inert scheduler; jobs queue up until [`TaskScheduler::start`].
    pub fn new(config: TaskSchedulerConfig) -> CoreResult<Self> {
        if config.max_queue_size == 0 || config.max_instances == 0 {
            return Err(CoreError::Invalid(
                "task scheduler needs a queue and at least one worker".into(),
            ));
        }
        let (sender, receiver) = mpsc::channel(config.max_queue_size);
        Ok(Self {
            config,
            sender: parking_lot::Mutex::new(Some(sender)),
            receiver: Arc::new(Mutex::new(receiver)),
            gauges: Arc::new(Gauges {
                queued: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
            }),
            workers: parking_lot::Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Spawn the workers.
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }
        for worker in 0..self.config.max_instances {
            let receiver = Arc::clone(&self.receiver);
            let gauges = Arc::clone(&self.gauges);
            let shutdown = self.shutdown.clone();
            workers.push(tokio::spawn(run_worker(worker, receiver, gauges, shutdown)));
        }
        tracing::info!(
            workers = self.config.max_instances,
            queue = self.config.max_queue_size,
            "Task scheduler started"
        );
    }

    /// Queue `work`; returns `false` and calls `on_rejected` once if the
    /// queue is full or the scheduler has stopped.
    pub fn try_schedule<F, R>(&self, work: F, on_rejected: R) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
        R: FnOnce(),
    {
        let sender = self.sender.lock().clone();
        let Some(sender) = sender else {
            tracing::debug!("Task rejected, scheduler stopped");
            on_rejected();
            return false;
        };

        self.gauges.queued.fetch_add(1, Ordering::AcqRel);
        match sender.try_send(Box::pin(work)) {
            Ok(()) => true,
            Err(err) => {
                self.gauges.queued.fetch_sub(1, Ordering::AcqRel);
                match err {
                    mpsc::error::TrySendError::Full(_) => {
                        tracing::warn!(
                            queue = self.config.max_queue_size,
                            "Task rejected, queue full"
                        );
                    }
                    mpsc::error::TrySendError::Closed(_) => {
                        tracing::debug!("Task rejected, queue closed");
                    }
                }
                on_rejected();
                false
            }
        }
    }

    /// Jobs waiting for a worker.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.gauges.queued.load(Ordering::Acquire)
    }

    /// Jobs currently running.
    #[must_use]
    pub fn active(&self) -> usize {
        self.gauges.active.load(Ordering::Acquire)
    }

    /// Stop accepting jobs, let the workers drain the queue and wait for them.
    pub async fn shutdown(&self) {
        self.sender.lock().take();
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(err) = worker.await {
                tracing::warn!(error = %err, "Scheduler worker terminated abnormally");
            }
        }
        self.shutdown.cancel();
        tracing::info!("Task scheduler stopped");
    }

    /// Stop immediately, abandoning queued jobs.
    pub fn abort(&self) {
        self.sender.lock().take();
        self.shutdown.cancel();
    }
}

async fn run_worker(
    worker: usize,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    gauges: Arc<Gauges>,
    shutdown: CancellationToken,
) {
    loop {
        let job = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                () = shutdown.cancelled() => None,
                job = receiver.recv() => job,
            }
        };
        let Some(job) = job else {
            break;
        };

        gauges.queued.fetch_sub(1, Ordering::AcqRel);
        gauges.active.fetch_add(1, Ordering::AcqRel);
        if let Err(err) = tokio::spawn(job).await {
            if err.is_panic() {
                tracing::error!(worker, "Scheduled task panicked");
            } else {
                tracing::warn!(worker, error = %err, "Scheduled task cancelled");
            }
        }
        gauges.active.fetch_sub(1, Ordering::AcqRel);
    }
    tracing::debug!(worker, "Scheduler worker stopped");
}
