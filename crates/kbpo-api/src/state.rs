//! Application state management
//!
//! Author: hephaex@gmail.com

use kbpo_core::{AppConfig, KbStore};
use kbpo_pipeline::{Pipeline, Task};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Application state shared across handlers
pub struct AppState {
    /// Application configuration
    pub config: AppConfig,
    /// Lifecycle stages over the store and crowd
    pub pipeline: Arc<Pipeline>,
    /// Worker queue; `None` runs follow-up stages inline
    pub tasks: Option<mpsc::Sender<Task>>,
    /// Server start time
    pub start_time: Instant,
    /// Request counter
    pub request_count: AtomicU64,
}

impl AppState {
    pub fn new(config: AppConfig, pipeline: Arc<Pipeline>) -> Self {
        Self {
            config,
            pipeline,
            tasks: None,
            start_time: Instant::now(),
            request_count: AtomicU64::new(0),
        }
    }

    pub fn with_tasks(mut self, tasks: mpsc::Sender<Task>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    pub fn store(&self) -> &dyn KbStore {
        self.pipeline.store().as_ref()
    }

    /// Increment request counter
    pub fn increment_requests(&self) -> u64 {
        self.request_count.fetch_add(1, Ordering::SeqCst)
    }

    /// Get total request count
    pub fn get_request_count(&self) -> u64 {
        self.request_count.load(Ordering::SeqCst)
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Hand a task to the workers, or run it and its follow-ups here
    pub async fn dispatch(&self, task: Task) -> kbpo_core::Result<()> {
        if let Some(tasks) = &self.tasks {
            if let Err(e) = tasks.send(task).await {
                tracing::warn!(task = e.0.name(), "worker queue closed, running inline");
                return self.run_inline(e.0).await;
            }
            return Ok(());
        }
        self.run_inline(task).await
    }

    async fn run_inline(&self, task: Task) -> kbpo_core::Result<()> {
        let mut queue = vec![task];
        while let Some(task) = queue.pop() {
            queue.extend(self.pipeline.run(task).await?);
        }
        Ok(())
    }
}
