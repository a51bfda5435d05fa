//! Background task workers
//!
//! A fixed number of workers share one bounded queue. A worker runs the
//! tasks a finished task unlocks before taking the next one off the queue,
//! so one submission moves through its stages without re-queueing.

use std::collections::VecDeque;
use std::sync::Arc;

use kbpo_core::{KbpoError, Result, WorkerConfig};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::tasks::{Pipeline, Task};

/// Pool of pipeline workers fed through a bounded channel
pub struct WorkerPool {
    sender: mpsc::Sender<Task>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(pipeline: Arc<Pipeline>, config: &WorkerConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..config.concurrency.max(1))
            .map(|worker| {
                let pipeline = Arc::clone(&pipeline);
                let receiver = Arc::clone(&receiver);
                tokio::spawn(async move {
                    loop {
                        let next = receiver.lock().await.recv().await;
                        let Some(task) = next else { break };
                        run_chain(&pipeline, worker, task).await;
                    }
                    debug!(worker, "worker stopped");
                })
            })
            .collect();

        Self { sender, workers }
    }

    /// Queue a task; waits while the queue is full
    pub async fn submit(&self, task: Task) -> Result<()> {
        self.sender
            .send(task)
            .await
            .map_err(|e| KbpoError::Other(anyhow::anyhow!("worker pool closed: {}", e.0.name())))
    }

    /// Handle for queueing tasks from elsewhere, e.g. request handlers
    pub fn sender(&self) -> mpsc::Sender<Task> {
        self.sender.clone()
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Stop accepting tasks and wait for queued ones to finish.
    /// Senders handed out by [`WorkerPool::sender`] must be dropped first.
    pub async fn shutdown(self) {
        drop(self.sender);
        for result in futures::future::join_all(self.workers).await {
            if let Err(e) = result {
                error!(error = %e, "worker panicked");
            }
        }
    }
}

async fn run_chain(pipeline: &Pipeline, worker: usize, task: Task) {
    let mut queue = VecDeque::from([task]);
    while let Some(task) = queue.pop_front() {
        let name = task.name();
        match pipeline.run(task).await {
            Ok(next) => {
                debug!(worker, task = name, followups = next.len(), "task done");
                queue.extend(next);
            }
            Err(e @ KbpoError::InvalidState { .. }) => {
                warn!(worker, task = name, error = %e, "task skipped");
            }
            Err(e) => {
                error!(worker, task = name, error = %e, "task failed");
            }
        }
    }
}
