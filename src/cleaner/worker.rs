//! Background loops driving the cleaner manager.
//!
//! Cancellation is cooperative: a compactor polls the abort probe between
//! segments and stops when the manager reports the pass as aborted.

use crate::cleaner::manager::LogCleanerManager;
use crate::cleaner::ranker::LogToClean;
use crate::partition::TopicPartition;
use crate::storage::log::now_ms;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Rewrites the dirty range of a log, keeping the latest record per key.
pub trait Compactor: Send + Sync {
    /// Cleans `[first_dirty_offset, first_uncleanable_offset)` of `log` and
    /// returns the offset cleaning reached. Must call `check_aborted` between
    /// segments and stop with its error when it fails.
    fn clean(&self, log: &LogToClean, check_aborted: &dyn Fn() -> Result<()>) -> Result<u64>;
}

/// Deletes segments that retention no longer needs.
pub trait RetentionSweeper: Send + Sync {
    /// Drops segments below `log_start_offset` and anything past retention.
    /// Returns the number of segments removed.
    fn delete_expired(&self, tp: &TopicPartition, log_start_offset: u64, now: u64) -> Result<usize>;
}

pub struct CleanerWorker {
    id: usize,
    manager: Arc<LogCleanerManager>,
    compactor: Arc<dyn Compactor>,
    sweeper: Arc<dyn RetentionSweeper>,
    backoff: Duration,
}

impl CleanerWorker {
    pub fn new(
        id: usize,
        manager: Arc<LogCleanerManager>,
        compactor: Arc<dyn Compactor>,
        sweeper: Arc<dyn RetentionSweeper>,
        backoff: Duration,
    ) -> Self {
        CleanerWorker {
            id,
            manager,
            compactor,
            sweeper,
            backoff,
        }
    }

    /// Cleans the filthiest log, if any. Returns whether a log was claimed.
    pub fn clean_filthiest_log(&self, now: u64) -> Result<bool> {
        let cleanable = match self.manager.grab_filthiest_compacted_log(now) {
            Some(cleanable) => cleanable,
            None => return Ok(false),
        };
        let tp = cleanable.topic_partition.clone();
        let manager = Arc::clone(&self.manager);
        let probe_tp = tp.clone();
        let check_aborted = move || manager.check_cleaning_aborted(&probe_tp);

        let end_offset = match self.compactor.clean(&cleanable, &check_aborted) {
            Ok(end_offset) => end_offset,
            Err(Error::CleaningAborted(_)) => {
                log::info!("Cleaner {}: cleaning of {} was aborted", self.id, tp);
                cleanable.first_dirty_offset
            }
            Err(e) => {
                log::error!("Cleaner {}: failed to clean {}: {}", self.id, tp, e);
                self.manager
                    .mark_partition_uncleanable(&cleanable.dir, &tp);
                cleanable.first_dirty_offset
            }
        };
        self.manager.done_cleaning(&tp, &cleanable.dir, end_offset)?;
        Ok(true)
    }

    /// Deletes stale segments of every idle compacted log.
    pub fn delete_compacted_segments(&self, now: u64) -> Result<usize> {
        let deletable = self.manager.deletable_logs();
        if deletable.is_empty() {
            return Ok(0);
        }
        let mut deleted = 0;
        for (tp, log) in &deletable {
            let log_start_offset = log.snapshot().log_start_offset;
            match self.sweeper.delete_expired(tp, log_start_offset, now) {
                Ok(n) => deleted += n,
                Err(e) => log::warn!(
                    "Cleaner {}: failed to delete segments of {}: {}",
                    self.id,
                    tp,
                    e
                ),
            }
        }
        let partitions: Vec<TopicPartition> = deletable.into_iter().map(|(tp, _)| tp).collect();
        self.manager.done_deleting(&partitions)?;
        Ok(deleted)
    }

    /// One iteration of the loop. Returns whether any cleaning happened.
    pub fn do_work(&self, now: u64) -> bool {
        let cleaned = match self.clean_filthiest_log(now) {
            Ok(cleaned) => cleaned,
            Err(e) => {
                log::error!("Cleaner {}: {}", self.id, e);
                false
            }
        };
        if let Err(e) = self.delete_compacted_segments(now) {
            log::error!("Cleaner {}: {}", self.id, e);
        }
        cleaned
    }

    /// Runs until `shutdown` flips to true, backing off when idle.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        log::info!("Cleaner {} starting", self.id);
        while !*shutdown.borrow() {
            let worker = Arc::clone(&self);
            let iteration = tokio::task::spawn_blocking(move || worker.do_work(now_ms()));
            let cleaned = match iteration.await {
                Ok(cleaned) => cleaned,
                Err(e) => {
                    log::error!("Cleaner {} iteration panicked: {}", self.id, e);
                    false
                }
            };
            if !cleaned {
                tokio::select! {
                    _ = tokio::time::sleep(self.backoff) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        log::info!("Cleaner {} stopped", self.id);
    }
}

pub struct RetentionWorker {
    manager: Arc<LogCleanerManager>,
    sweeper: Arc<dyn RetentionSweeper>,
    interval: Duration,
}

impl RetentionWorker {
    pub fn new(
        manager: Arc<LogCleanerManager>,
        sweeper: Arc<dyn RetentionSweeper>,
        interval: Duration,
    ) -> Self {
        RetentionWorker {
            manager,
            sweeper,
            interval,
        }
    }

    /// Pauses non-compacted partitions, deletes their expired segments and
    /// resumes them. Every paused partition is resumed even if a delete fails;
    /// the first failure is returned afterwards.
    pub fn sweep(&self, now: u64) -> Result<usize> {
        let paused = self.manager.pause_cleaning_for_non_compacted_partitions();
        let mut deleted = 0;
        let mut first_error = None;
        for (tp, log_start_offset) in &paused {
            match self.sweeper.delete_expired(tp, *log_start_offset, now) {
                Ok(n) => deleted += n,
                Err(e) => {
                    log::warn!("Retention sweep of {} failed: {}", tp, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        let partitions: Vec<TopicPartition> = paused.into_iter().map(|(tp, _)| tp).collect();
        self.manager.resume_cleaning(&partitions);
        if deleted > 0 {
            log::info!("Retention sweep deleted {} segment(s)", deleted);
        }
        first_error.map_or(Ok(deleted), Err)
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    let worker = Arc::clone(&self);
                    let sweep = tokio::task::spawn_blocking(move || worker.sweep(now_ms()));
                    if let Ok(Err(e)) = sweep.await {
                        log::error!("Retention sweep failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        log::info!("Retention worker stopped");
    }
}
