//! Starts the compaction and retention loops for a set of storage directories.

use crate::cleaner::manager::LogCleanerManager;
use crate::cleaner::worker::{CleanerWorker, Compactor, RetentionSweeper, RetentionWorker};
use crate::storage::CleanerConfig;
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Running cleaner: `num_threads` compaction workers plus one retention loop,
/// all sharing one manager.
pub struct LogCleaner {
    manager: Arc<LogCleanerManager>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl LogCleaner {
    /// Validates `config`, loads checkpoints and spawns the loops on the
    /// current tokio runtime.
    pub fn start(
        config: &CleanerConfig,
        compactor: Arc<dyn Compactor>,
        sweeper: Arc<dyn RetentionSweeper>,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Internal(format!("log cleaner needs a tokio runtime: {}", e)))?;
        let manager = Arc::new(LogCleanerManager::new(&config.log_dirs)?);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let mut tasks = Vec::with_capacity(config.num_threads + 1);
        for id in 0..config.num_threads {
            let worker = Arc::new(CleanerWorker::new(
                id,
                Arc::clone(&manager),
                Arc::clone(&compactor),
                Arc::clone(&sweeper),
                config.backoff,
            ));
            tasks.push(runtime.spawn(worker.run(shutdown_rx.clone())));
        }
        let retention = Arc::new(RetentionWorker::new(
            Arc::clone(&manager),
            sweeper,
            config.retention_check_interval,
        ));
        tasks.push(runtime.spawn(retention.run(shutdown_rx)));

        log::info!(
            "Log cleaner started with {} worker(s) over {} log dir(s)",
            config.num_threads,
            config.log_dirs.len()
        );
        Ok(LogCleaner {
            manager,
            shutdown,
            tasks,
        })
    }

    pub fn manager(&self) -> &Arc<LogCleanerManager> {
        &self.manager
    }

    /// Signals every loop to stop and waits for them.
    pub async fn shutdown(self) -> Result<()> {
        // Fails only when every loop is already gone.
        let _ = self.shutdown.send(true);
        let mut first_error = None;
        for task in self.tasks {
            if let Err(e) = task.await {
                log::error!("Log cleaner task failed: {}", e);
                first_error.get_or_insert(Error::Internal(format!("cleaner task failed: {}", e)));
            }
        }
        log::info!("Log cleaner stopped");
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleaner::ranker::LogToClean;
    use crate::storage::{Log, LogConfig, LogRegistry};
    use crate::TopicPartition;
    use assert_matches::assert_matches;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tempfile::tempdir;

    #[derive(Default)]
    struct CountingCompactor {
        cleaned: Mutex<Vec<TopicPartition>>,
    }

    impl Compactor for CountingCompactor {
        fn clean(&self, log: &LogToClean, check_aborted: &dyn Fn() -> Result<()>) -> Result<u64> {
            check_aborted()?;
            self.cleaned.lock().push(log.topic_partition.clone());
            Ok(log.first_uncleanable_offset)
        }
    }

    fn config(dirs: Vec<std::path::PathBuf>, num_threads: usize) -> CleanerConfig {
        CleanerConfig {
            log_dirs: dirs,
            num_threads,
            backoff: Duration::from_millis(5),
            retention_check_interval: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_start_cleans_every_partition_and_stops() {
        let dir = tempdir().unwrap();
        let compactor = Arc::new(CountingCompactor::default());
        let registry = Arc::new(LogRegistry::new());
        let cleaner = LogCleaner::start(
            &config(vec![dir.path().to_path_buf()], 2),
            compactor.clone(),
            registry.clone(),
        )
        .unwrap();

        for partition in 0..3 {
            let tp = TopicPartition::new("service", partition);
            let log = registry.insert(Log::new(tp, dir.path(), LogConfig::compacted()).unwrap());
            {
                let mut log = log.write();
                for i in 0..3u8 {
                    log.append_entry(&[i], b"v").unwrap();
                    log.roll();
                }
                log.update_high_watermark(3);
            }
            cleaner.manager().add_log(log);
        }

        for _ in 0..400 {
            if compactor.cleaned.lock().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let manager = Arc::clone(cleaner.manager());
        cleaner.shutdown().await.unwrap();

        let mut cleaned = compactor.cleaned.lock().clone();
        cleaned.sort();
        let expected: Vec<TopicPartition> =
            (0..3).map(|p| TopicPartition::new("service", p)).collect();
        assert_eq!(cleaned, expected);
        assert!(manager
            .all_cleaner_checkpoints()
            .values()
            .all(|&offset| offset == 3));
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let dir = tempdir().unwrap();
        let result = LogCleaner::start(
            &config(vec![dir.path().to_path_buf()], 0),
            Arc::new(CountingCompactor::default()),
            Arc::new(LogRegistry::new()),
        );
        assert_matches!(result.err(), Some(Error::InvalidConfig(_)));
    }

    #[test]
    fn test_start_outside_runtime_fails() {
        let dir = tempdir().unwrap();
        let result = LogCleaner::start(
            &config(vec![dir.path().to_path_buf()], 1),
            Arc::new(CountingCompactor::default()),
            Arc::new(LogRegistry::new()),
        );
        assert_matches!(result.err(), Some(Error::Internal(_)));
    }
}
