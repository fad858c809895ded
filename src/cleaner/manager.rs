//! Coordinates compaction and retention over every partition of a broker.
//!
//! Compaction workers take the dirtiest partition with
//! [`LogCleanerManager::grab_filthiest_compacted_log`] and hand it back with
//! [`LogCleanerManager::done_cleaning`]. The retention sweep pauses all
//! non-compacted partitions, deletes what has expired and resumes them.
//! Range and ratio calculations run on log snapshots outside any lock; only
//! state transitions are serialized.

use crate::cleaner::checkpoint::CheckpointStore;
use crate::cleaner::offsets::{cleanable_offsets, max_compaction_delay};
use crate::cleaner::ranker::{rank, LogToClean};
use crate::cleaner::state::{CleaningStateStore, LogCleaningState};
use crate::partition::TopicPartition;
use crate::storage::{CleanableLog, LogSnapshot};
use crate::{Error, Result};
use dashmap::DashMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct CleanerManagerStats {
    max_dirty_ratio_bits: AtomicU64,
    last_run_ms: AtomicU64,
}

struct LogView {
    tp: TopicPartition,
    log: Arc<dyn CleanableLog>,
    dir: PathBuf,
    snapshot: LogSnapshot,
}

pub struct LogCleanerManager {
    logs: DashMap<TopicPartition, Arc<dyn CleanableLog>>,
    states: CleaningStateStore,
    checkpoints: CheckpointStore,
    stats: CleanerManagerStats,
}

impl LogCleanerManager {
    /// Creates a manager for the given storage directories, loading their
    /// cleaner checkpoints.
    pub fn new<P: AsRef<Path>>(log_dirs: &[P]) -> Result<Self> {
        Ok(LogCleanerManager {
            logs: DashMap::new(),
            states: CleaningStateStore::new(),
            checkpoints: CheckpointStore::open(log_dirs)?,
            stats: CleanerManagerStats::default(),
        })
    }

    pub fn add_log(&self, log: Arc<dyn CleanableLog>) {
        let tp = log.topic_partition();
        log::debug!("{}: registered with the cleaner", tp);
        self.logs.insert(tp, log);
    }

    /// Stops cleaning of a partition, waiting for any pass in flight, and
    /// forgets it together with its checkpoint.
    pub fn remove_log(&self, tp: &TopicPartition) -> Result<()> {
        let log = match self.logs.get(tp) {
            Some(entry) => Arc::clone(entry.value()),
            None => return Err(Error::UnknownPartition(tp.clone())),
        };
        self.states.abort(tp)?;
        self.logs.remove(tp);
        self.states.remove_partition(tp);
        self.checkpoints.remove(&log.dir(), tp)
    }

    fn log_views(&self) -> Vec<LogView> {
        let logs: Vec<(TopicPartition, Arc<dyn CleanableLog>)> = self
            .logs
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        logs.into_iter()
            .map(|(tp, log)| LogView {
                dir: log.dir(),
                snapshot: log.snapshot(),
                tp,
                log,
            })
            .collect()
    }

    /// Picks the idle compacted partition most in need of cleaning, claims it
    /// and describes the range to clean. `None` means nothing to do.
    pub fn grab_filthiest_compacted_log(&self, now: u64) -> Option<LogToClean> {
        self.stats.last_run_ms.store(now, Ordering::Relaxed);

        let views: Vec<LogView> = self
            .log_views()
            .into_iter()
            .filter(|v| v.snapshot.cleanup_policy().compact())
            .collect();
        let idle = self
            .states
            .idle_among(views.iter().map(|v| (&v.tp, v.dir.as_path())));

        let mut dirty_logs = Vec::with_capacity(idle.len());
        let mut checkpoint_resets = HashMap::new();
        for view in views.into_iter().filter(|v| idle.contains(&v.tp)) {
            let last_clean = self.checkpoints.last_cleaned(&view.dir, &view.tp);
            let offsets = cleanable_offsets(&view.snapshot, &view.tp, last_clean, now);
            if offsets.force_update_checkpoint {
                checkpoint_resets.insert(view.tp.clone(), offsets.first_dirty_offset);
            }
            let delay = max_compaction_delay(&view.snapshot, offsets.first_dirty_offset, now);
            let ltc =
                LogToClean::new(view.tp, view.log, view.dir, &view.snapshot, offsets, delay);
            if ltc.total_bytes() > 0 {
                dirty_logs.push(ltc);
            }
        }

        let dirtiest = dirty_logs
            .iter()
            .map(LogToClean::cleanable_ratio)
            .fold(0.0f64, f64::max);
        self.stats
            .max_dirty_ratio_bits
            .store(dirtiest.to_bits(), Ordering::Relaxed);

        let mut ranked = rank(dirty_logs);
        let order: Vec<TopicPartition> = ranked
            .iter()
            .map(|c| c.topic_partition.clone())
            .collect();
        let chosen = self.states.claim_for_compaction(&order)?;
        let index = ranked.iter().position(|c| c.topic_partition == chosen)?;
        let filthiest = ranked.swap_remove(index);

        // Only the claimant rewrites the checkpoint.
        if let Some(&reset_to) = checkpoint_resets.get(&chosen) {
            if let Err(e) = self.checkpoints.record_cleaned(&filthiest.dir, &chosen, reset_to) {
                log::warn!("{}: failed to reset cleaner checkpoint: {}", chosen, e);
            }
        }
        log::info!(
            "{}: selected for cleaning, range [{}, {}), dirty ratio {:.3}",
            filthiest.topic_partition,
            filthiest.first_dirty_offset,
            filthiest.first_uncleanable_offset,
            filthiest.cleanable_ratio()
        );
        Some(filthiest)
    }

    /// Claims every idle compacted partition so that segments below its log
    /// start offset can be deleted. Each must be released via `done_deleting`.
    pub fn deletable_logs(&self) -> Vec<(TopicPartition, Arc<dyn CleanableLog>)> {
        let views: Vec<LogView> = self
            .log_views()
            .into_iter()
            .filter(|v| v.snapshot.cleanup_policy().compact())
            .collect();
        let claimed = self
            .states
            .claim_all(views.iter().map(|v| (&v.tp, v.dir.as_path())));
        views
            .into_iter()
            .filter(|v| claimed.contains(&v.tp))
            .map(|v| (v.tp, v.log))
            .collect()
    }

    /// Pauses every partition that is not compacted so the retention sweep can
    /// delete its expired segments. Returns each paused partition with its log
    /// start offset.
    pub fn pause_cleaning_for_non_compacted_partitions(&self) -> Vec<(TopicPartition, u64)> {
        let candidates: Vec<(TopicPartition, u64)> = self
            .log_views()
            .into_iter()
            .filter(|v| !v.snapshot.cleanup_policy().compact())
            .map(|v| (v.tp, v.snapshot.log_start_offset))
            .collect();
        let paused = self.states.pause_non_compacted(candidates);
        log::debug!("Paused {} non-compacted partition(s) for retention", paused.len());
        paused
    }

    pub fn resume_cleaning(&self, partitions: &[TopicPartition]) {
        self.states.resume(partitions);
    }

    pub fn abort_and_pause_cleaning(&self, tp: &TopicPartition) -> Result<()> {
        self.states.abort_and_pause(tp)
    }

    pub fn abort_cleaning(&self, tp: &TopicPartition) -> Result<()> {
        self.states.abort(tp)
    }

    /// Polled by a cleaner between segments.
    pub fn check_cleaning_aborted(&self, tp: &TopicPartition) -> Result<()> {
        self.states.check_aborted(tp)
    }

    /// Completes a compaction pass that reached `last_offset`. The partition
    /// stays claimed until the checkpoint write has finished, so it cannot be
    /// selected again against a stale checkpoint.
    pub fn done_cleaning(&self, tp: &TopicPartition, dir: &Path, last_offset: u64) -> Result<()> {
        self.states.check_done(tp)?;
        let persisted = self.checkpoints.record_cleaned(dir, tp, last_offset);
        if let Err(e) = &persisted {
            log::error!("{}: failed to write cleaner checkpoint {}: {}", tp, last_offset, e);
        }
        let next = self.states.done(tp)?;
        log::info!(
            "{}: cleaning done up to offset {}, now {}",
            tp,
            last_offset,
            next.map_or_else(|| "Idle".to_string(), |s| s.to_string())
        );
        persisted
    }

    pub fn done_deleting(&self, partitions: &[TopicPartition]) -> Result<()> {
        self.states.done_many(partitions)
    }

    pub fn set_cleaning_state(&self, tp: &TopicPartition, state: Option<LogCleaningState>) {
        self.states.set_state(tp, state);
    }

    pub fn cleaning_state(&self, tp: &TopicPartition) -> Option<LogCleaningState> {
        self.states.state(tp)
    }

    pub fn all_cleaner_checkpoints(&self) -> HashMap<TopicPartition, u64> {
        self.checkpoints.all_checkpoints()
    }

    pub fn mark_partition_uncleanable(&self, dir: &Path, tp: &TopicPartition) {
        log::warn!("{}: marked uncleanable in {:?}", tp, dir);
        self.states.mark_uncleanable(dir, tp);
    }

    pub fn is_uncleanable_partition(&self, dir: &Path, tp: &TopicPartition) -> bool {
        self.states.is_uncleanable(dir, tp)
    }

    /// Lowers the checkpoint after the log was truncated to `offset`.
    pub fn maybe_truncate_checkpoint(
        &self,
        dir: &Path,
        tp: &TopicPartition,
        offset: u64,
    ) -> Result<()> {
        if !self.logs.contains_key(tp) {
            return Ok(());
        }
        self.checkpoints.truncate(dir, tp, offset)
    }

    pub fn update_checkpoints_for_deleted_log(
        &self,
        dir: &Path,
        tp: &TopicPartition,
    ) -> Result<()> {
        self.checkpoints.remove(dir, tp)
    }

    pub fn alter_checkpoint_dir(
        &self,
        tp: &TopicPartition,
        source: &Path,
        destination: &Path,
    ) -> Result<()> {
        self.checkpoints.alter_dir(tp, source, destination)
    }

    pub fn handle_log_dir_failure(&self, dir: &Path) {
        log::warn!("Stopping cleaner bookkeeping for failed directory {:?}", dir);
        self.checkpoints.handle_dir_failure(dir);
        self.states.handle_dir_failure(dir);
    }

    /// Dirty ratio of the dirtiest partition seen by the last selection, in percent.
    pub fn max_dirty_percent(&self) -> u32 {
        let ratio = f64::from_bits(self.stats.max_dirty_ratio_bits.load(Ordering::Relaxed));
        (ratio * 100.0).round() as u32
    }

    pub fn time_since_last_run_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.stats.last_run_ms.load(Ordering::Relaxed))
    }

    pub fn uncleanable_partitions_count(&self) -> usize {
        self.states.uncleanable_count()
    }
}
