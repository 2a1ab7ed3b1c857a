use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, instrument};

use super::TaskRegistry;

#[derive(Debug, Clone)]
pub struct TaskCleanupWorkerConfig {
    pub interval: Duration,
}

impl Default for TaskCleanupWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

/// Periodically drops finished tasks past their TTL.
pub struct TaskCleanupWorker {
    registry: Arc<TaskRegistry>,
    config: TaskCleanupWorkerConfig,
}

impl TaskCleanupWorker {
    pub fn new(registry: Arc<TaskRegistry>, config: TaskCleanupWorkerConfig) -> Self {
        Self { registry, config }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            ttl_secs = self.registry.config().ttl.as_secs(),
            "Starting task cleanup worker"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let purged = self.registry.purge_expired().await;
                    if purged > 0 {
                        info!(purged, "Purged expired tasks");
                    } else {
                        debug!("No expired tasks");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Task cleanup worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{TaskLookupError, TaskRegistryConfig, TaskStatus};

    #[tokio::test(start_paused = true)]
    async fn test_worker_purges_and_stops() {
        let registry = Arc::new(TaskRegistry::new(TaskRegistryConfig {
            capacity: 8,
            ttl: Duration::from_secs(5),
            ..Default::default()
        }));
        let id = registry.create(TaskStatus::Success, "t", "done").await.unwrap();

        let worker = TaskCleanupWorker::new(
            registry.clone(),
            TaskCleanupWorkerConfig {
                interval: Duration::from_secs(10),
            },
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run(rx).await });

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(registry.len().await, 0);
        assert_eq!(registry.get(&id).await.unwrap_err(), TaskLookupError::Expired(id));

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
