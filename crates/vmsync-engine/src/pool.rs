//! Bounded worker pool with caller-runs backpressure.
//!
//! Jobs go into a bounded queue drained by a fixed set of workers. When the
//! queue is full the submitting task runs the job itself instead of waiting,
//! so a slow remote API throttles the producer without unbounded buffering.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub struct WorkerPool {
    tx: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(workers: usize, queue_bound: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(queue_bound.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..workers.max(1))
            .map(|_| {
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    loop {
                        // Hold the lock only while receiving; jobs run
                        // unlocked so workers stay concurrent.
                        let job = rx.lock().await.recv().await;
                        match job {
                            Some(job) => job.await,
                            None => break,
                        }
                    }
                })
            })
            .collect();
        Self { tx, workers }
    }

    /// Submit a job. Runs it inline when the queue is full.
    pub async fn run<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.tx.try_send(Box::pin(fut)) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) | Err(TrySendError::Closed(job)) => job.await,
        }
    }

    /// Close the queue and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        drop(self.tx);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}
