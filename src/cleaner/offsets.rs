use crate::partition::TopicPartition;
use crate::storage::LogSnapshot;

/// Offset range `[first_dirty_offset, first_uncleanable_offset)` a compaction
/// pass may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetsToClean {
    pub first_dirty_offset: u64,
    pub first_uncleanable_offset: u64,
    /// The stored checkpoint was out of range and should be rewritten.
    pub force_update_checkpoint: bool,
}

impl OffsetsToClean {
    pub fn range(&self) -> (u64, u64) {
        (self.first_dirty_offset, self.first_uncleanable_offset)
    }
}

/// Computes the cleanable range of one partition at time `now` (epoch millis).
pub fn cleanable_offsets(
    log: &LogSnapshot,
    tp: &TopicPartition,
    last_clean_offset: Option<u64>,
    now: u64,
) -> OffsetsToClean {
    let log_start_offset = log.log_start_offset;
    let (first_dirty_offset, force_update_checkpoint) = match last_clean_offset {
        None => (log_start_offset, false),
        Some(checkpoint) if checkpoint < log_start_offset => {
            log::debug!(
                "{}: checkpoint {} is below log start offset {}, resetting to log start",
                tp,
                checkpoint,
                log_start_offset
            );
            (log_start_offset, true)
        }
        Some(checkpoint) if checkpoint > log.log_end_offset => {
            log::warn!(
                "{}: checkpoint {} is beyond log end offset {}, resetting to log start offset {}",
                tp,
                checkpoint,
                log.log_end_offset,
                log_start_offset
            );
            (log_start_offset, true)
        }
        Some(checkpoint) => (checkpoint, false),
    };

    // The active segment is still being appended to.
    let active_bound = log.active_segment_base_offset;

    // Nothing above the high watermark is committed yet.
    let watermark_bound = log
        .segments
        .iter()
        .find(|s| s.next_offset > log.high_watermark)
        .map_or(u64::MAX, |s| s.base_offset);

    let min_lag_ms = log.config.min_compaction_lag_ms();
    let age_bound = if min_lag_ms > 0 {
        let young_after = now.saturating_sub(min_lag_ms);
        log.non_active_segments_from(first_dirty_offset)
            .find(|s| s.largest_timestamp > young_after)
            .map_or(active_bound, |s| s.base_offset)
    } else {
        u64::MAX
    };

    let undecided_bound = log.first_undecided_offset.unwrap_or(u64::MAX);

    let first_uncleanable_offset = active_bound
        .min(watermark_bound)
        .min(age_bound)
        .min(undecided_bound)
        .max(first_dirty_offset);

    log::debug!(
        "{}: cleanable range [{}, {}) (active {}, watermark {}, age {}, undecided {})",
        tp,
        first_dirty_offset,
        first_uncleanable_offset,
        active_bound,
        watermark_bound,
        age_bound,
        undecided_bound
    );

    OffsetsToClean {
        first_dirty_offset,
        first_uncleanable_offset,
        force_update_checkpoint,
    }
}

/// How long (millis) the oldest dirty rolled segment has overstayed the
/// configured maximum compaction lag. Zero when it has not, or when no
/// maximum is configured.
pub fn max_compaction_delay(log: &LogSnapshot, first_dirty_offset: u64, now: u64) -> u64 {
    let max_lag_ms = match log.config.max_compaction_lag {
        Some(lag) => lag.as_millis() as u64,
        None => return 0,
    };
    let earliest_dirty_timestamp = log
        .non_active_segments_from(first_dirty_offset)
        .filter_map(|s| s.first_timestamp)
        .filter(|&ts| ts > 0)
        .min();
    let clean_until = now.saturating_sub(max_lag_ms);
    match earliest_dirty_timestamp {
        Some(ts) if ts < clean_until => clean_until - ts,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ControlType, Log, LogConfig};
    use std::time::Duration;

    const T0: u64 = 1_700_000_000_000;
    const LAG_MS: u64 = 60 * 60 * 1000;

    fn tp() -> TopicPartition {
        TopicPartition::new("offsets", 0)
    }

    fn new_log(config: LogConfig) -> Log {
        Log::new(tp(), "/tmp/offsets", config).unwrap()
    }

    fn write_segments(log: &mut Log, count: u8, timestamp: u64) {
        for _ in 0..count {
            let key = [(log.log_end_offset() % 4) as u8];
            log.append_entry_at(&key, b"value", timestamp).unwrap();
            log.roll();
        }
        let end = log.log_end_offset();
        log.update_high_watermark(end);
    }

    fn lagged_config() -> LogConfig {
        LogConfig::compacted().with_min_compaction_lag(Duration::from_millis(LAG_MS))
    }

    #[test]
    fn test_cleanable_offsets_without_lag() {
        let mut log = new_log(LogConfig::compacted());
        write_segments(&mut log, 8, T0);
        let offsets = cleanable_offsets(&log.snapshot(), &tp(), None, T0);
        assert_eq!(offsets.range(), (0, log.active_segment_base_offset()));
        assert_eq!(offsets.first_uncleanable_offset, 8);
        assert!(!offsets.force_update_checkpoint);
    }

    #[test]
    fn test_cleanable_offsets_stop_at_young_segments() {
        let mut log = new_log(lagged_config());
        write_segments(&mut log, 4, T0);
        let first_young = log.log_end_offset();
        let t1 = T0 + LAG_MS + 1;
        write_segments(&mut log, 4, t1);

        let offsets = cleanable_offsets(&log.snapshot(), &tp(), None, t1);
        assert_eq!(offsets.range(), (0, first_young));
        assert_ne!(offsets.first_uncleanable_offset, log.active_segment_base_offset());
    }

    #[test]
    fn test_cleanable_offsets_after_lag_elapsed() {
        let mut log = new_log(lagged_config());
        write_segments(&mut log, 8, T0);
        let offsets = cleanable_offsets(&log.snapshot(), &tp(), None, T0 + LAG_MS + 1);
        assert_eq!(offsets.range(), (0, log.active_segment_base_offset()));
    }

    #[test]
    fn test_undecided_transaction_is_not_cleanable() {
        let mut log = new_log(lagged_config());
        let producer_id = 15;
        log.append_transactional_at(producer_id, b"1", b"a", T0).unwrap();
        log.append_transactional_at(producer_id, b"2", b"b", T0).unwrap();
        log.append_transactional_at(producer_id, b"3", b"c", T0).unwrap();
        log.roll();
        log.update_high_watermark(3);

        // The lag has passed, but the transaction is still open.
        let now = T0 + LAG_MS + 1;
        let offsets = cleanable_offsets(&log.snapshot(), &tp(), None, now);
        assert_eq!(offsets.range(), (0, 0));

        log.append_end_txn_at(producer_id, ControlType::Abort, now).unwrap();
        log.roll();
        log.update_high_watermark(4);

        // The decided segment is cleanable at once; the marker waits for the lag.
        let offsets = cleanable_offsets(&log.snapshot(), &tp(), None, now);
        assert_eq!(offsets.range(), (0, 3));

        let later = now + LAG_MS + 1;
        let offsets = cleanable_offsets(&log.snapshot(), &tp(), None, later);
        assert_eq!(offsets.range(), (0, 4));
    }

    #[test]
    fn test_high_watermark_bounds_range() {
        let mut log = new_log(LogConfig::compacted());
        write_segments(&mut log, 6, T0);
        log.update_high_watermark(3);
        let offsets = cleanable_offsets(&log.snapshot(), &tp(), None, T0);
        assert_eq!(offsets.range(), (0, 3));
    }

    #[test]
    fn test_checkpoint_seeds_first_dirty_offset() {
        let mut log = new_log(LogConfig::compacted());
        write_segments(&mut log, 8, T0);

        let offsets = cleanable_offsets(&log.snapshot(), &tp(), Some(5), T0);
        assert_eq!(offsets.range(), (5, 8));
        assert!(!offsets.force_update_checkpoint);

        // Range never inverts, even when the checkpoint is past every bound.
        log.update_high_watermark(2);
        let offsets = cleanable_offsets(&log.snapshot(), &tp(), Some(5), T0);
        assert_eq!(offsets.range(), (5, 5));
    }

    #[test]
    fn test_out_of_range_checkpoint_resets_to_log_start() {
        let mut log = new_log(LogConfig::compacted());
        write_segments(&mut log, 8, T0);
        log.advance_log_start_offset(4);

        let offsets = cleanable_offsets(&log.snapshot(), &tp(), Some(2), T0);
        assert_eq!(offsets.range(), (4, 8));
        assert!(offsets.force_update_checkpoint);

        let offsets = cleanable_offsets(&log.snapshot(), &tp(), Some(100), T0);
        assert_eq!(offsets.range(), (4, 8));
        assert!(offsets.force_update_checkpoint);
    }

    #[test]
    fn test_max_compaction_delay() {
        let config = LogConfig::compacted().with_max_compaction_lag(Duration::from_millis(LAG_MS));
        let mut log = new_log(config);
        write_segments(&mut log, 2, T0);

        let snapshot = log.snapshot();
        assert_eq!(max_compaction_delay(&snapshot, 0, T0 + LAG_MS), 0);
        assert_eq!(max_compaction_delay(&snapshot, 0, T0 + LAG_MS + 250), 250);
        // Nothing dirty left once the checkpoint passes every rolled segment.
        assert_eq!(max_compaction_delay(&snapshot, 2, T0 + LAG_MS + 250), 0);

        let unbounded = new_log(LogConfig::compacted());
        assert_eq!(max_compaction_delay(&unbounded.snapshot(), 0, u64::MAX), 0);
    }
}
