use crate::cleaner::offsets::OffsetsToClean;
use crate::partition::TopicPartition;
use crate::storage::{CleanableLog, LogSnapshot};
use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// A partition chosen (or considered) for compaction, with the byte counts
/// used to rank it.
#[derive(Clone)]
pub struct LogToClean {
    pub topic_partition: TopicPartition,
    pub log: Arc<dyn CleanableLog>,
    pub dir: PathBuf,
    pub first_dirty_offset: u64,
    pub first_uncleanable_offset: u64,
    /// Bytes of segments based below `first_dirty_offset`.
    pub clean_bytes: u64,
    /// Bytes of segments based within the cleanable range.
    pub cleanable_bytes: u64,
    pub min_cleanable_ratio: f64,
    /// Dirty data has overstayed the maximum compaction lag.
    pub needs_compaction_now: bool,
}

impl LogToClean {
    pub fn new(
        topic_partition: TopicPartition,
        log: Arc<dyn CleanableLog>,
        dir: PathBuf,
        snapshot: &LogSnapshot,
        offsets: OffsetsToClean,
        max_compaction_delay_ms: u64,
    ) -> Self {
        let (clean_bytes, cleanable_bytes) = attribute_bytes(snapshot, &offsets);
        LogToClean {
            topic_partition,
            log,
            dir,
            first_dirty_offset: offsets.first_dirty_offset,
            first_uncleanable_offset: offsets.first_uncleanable_offset,
            clean_bytes,
            cleanable_bytes,
            min_cleanable_ratio: snapshot.config.min_cleanable_ratio,
            needs_compaction_now: max_compaction_delay_ms > 0,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.clean_bytes + self.cleanable_bytes
    }

    pub fn cleanable_ratio(&self) -> f64 {
        dirty_ratio(self.cleanable_bytes, self.clean_bytes)
    }

    /// Worth a compaction pass: something to clean, and either dirty enough
    /// or overdue.
    pub fn is_admissible(&self) -> bool {
        self.cleanable_bytes > 0
            && (self.needs_compaction_now || self.cleanable_ratio() >= self.min_cleanable_ratio)
    }

    /// Ordering used for selection: overdue logs first, then dirtiest, then
    /// partition order.
    fn priority_cmp(&self, other: &Self) -> Ordering {
        other
            .needs_compaction_now
            .cmp(&self.needs_compaction_now)
            .then_with(|| other.cleanable_ratio().total_cmp(&self.cleanable_ratio()))
            .then_with(|| self.topic_partition.cmp(&other.topic_partition))
    }
}

impl fmt::Debug for LogToClean {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogToClean")
            .field("topic_partition", &self.topic_partition)
            .field("dir", &self.dir)
            .field("first_dirty_offset", &self.first_dirty_offset)
            .field("first_uncleanable_offset", &self.first_uncleanable_offset)
            .field("clean_bytes", &self.clean_bytes)
            .field("cleanable_bytes", &self.cleanable_bytes)
            .field("needs_compaction_now", &self.needs_compaction_now)
            .finish()
    }
}

/// `cleanable / (cleanable + clean)`, with 0/0 taken as 0.
pub fn dirty_ratio(cleanable_bytes: u64, clean_bytes: u64) -> f64 {
    let total = cleanable_bytes + clean_bytes;
    if total == 0 {
        0.0
    } else {
        cleanable_bytes as f64 / total as f64
    }
}

// A segment is attributed wholly to the region its base offset falls in.
fn attribute_bytes(snapshot: &LogSnapshot, offsets: &OffsetsToClean) -> (u64, u64) {
    let mut clean_bytes = 0;
    let mut cleanable_bytes = 0;
    for segment in &snapshot.segments {
        if segment.base_offset < offsets.first_dirty_offset {
            clean_bytes += segment.size_in_bytes;
        } else if segment.base_offset < offsets.first_uncleanable_offset {
            cleanable_bytes += segment.size_in_bytes;
        }
    }
    (clean_bytes, cleanable_bytes)
}

/// Drops candidates not worth cleaning and orders the rest best-first.
pub fn rank(candidates: Vec<LogToClean>) -> Vec<LogToClean> {
    let mut admitted: Vec<LogToClean> = candidates
        .into_iter()
        .filter(LogToClean::is_admissible)
        .collect();
    admitted.sort_by(LogToClean::priority_cmp);
    admitted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleaner::offsets::cleanable_offsets;
    use crate::storage::{Log, LogConfig};
    use parking_lot::RwLock;

    fn candidate(
        partition: u32,
        clean_bytes: u64,
        cleanable_bytes: u64,
        min_ratio: f64,
        overdue: bool,
    ) -> LogToClean {
        let tp = TopicPartition::new("rank", partition);
        let log = Log::new(tp.clone(), "/tmp/rank", LogConfig::compacted()).unwrap();
        LogToClean {
            topic_partition: tp,
            log: Arc::new(RwLock::new(log)),
            dir: PathBuf::from("/tmp/rank"),
            first_dirty_offset: 0,
            first_uncleanable_offset: 0,
            clean_bytes,
            cleanable_bytes,
            min_cleanable_ratio: min_ratio,
            needs_compaction_now: overdue,
        }
    }

    #[test]
    fn test_dirty_ratio() {
        assert_eq!(dirty_ratio(0, 0), 0.0);
        assert_eq!(dirty_ratio(0, 100), 0.0);
        assert_eq!(dirty_ratio(25, 75), 0.25);
        assert_eq!(dirty_ratio(10, 0), 1.0);
    }

    #[test]
    fn test_threshold_filters_candidates() {
        let ranked = rank(vec![
            candidate(0, 90, 10, 0.5, false),
            candidate(1, 40, 60, 0.5, false),
            candidate(2, 0, 0, 0.0, false),
        ]);
        let chosen: Vec<u32> = ranked.iter().map(|c| c.topic_partition.partition).collect();
        assert_eq!(chosen, vec![1]);
    }

    #[test]
    fn test_zero_threshold_admits_any_cleanable_bytes() {
        let ranked = rank(vec![candidate(0, 1_000_000, 1, 0.0, false)]);
        assert_eq!(ranked.len(), 1);
    }

    #[test]
    fn test_ranking_order() {
        let ranked = rank(vec![
            candidate(0, 50, 50, 0.0, false),
            candidate(1, 10, 90, 0.0, false),
            candidate(2, 90, 10, 0.9, true),
            candidate(3, 10, 90, 0.0, false),
        ]);
        let order: Vec<u32> = ranked.iter().map(|c| c.topic_partition.partition).collect();
        // Overdue first regardless of ratio, ties broken by partition.
        assert_eq!(order, vec![2, 1, 3, 0]);
    }

    #[test]
    fn test_overdue_log_still_needs_cleanable_bytes() {
        assert!(rank(vec![candidate(0, 100, 0, 0.0, true)]).is_empty());
    }

    #[test]
    fn test_bytes_are_attributed_by_segment_base() {
        let tp = TopicPartition::new("rank", 0);
        let mut log = Log::new(tp.clone(), "/tmp/rank", LogConfig::compacted()).unwrap();
        for i in 0..6u8 {
            log.append_entry_at(&[i], b"v", 1).unwrap();
            log.roll();
        }
        log.update_high_watermark(6);
        let snapshot = log.snapshot();
        let segment_size = snapshot.segments[0].size_in_bytes;
        let offsets = cleanable_offsets(&snapshot, &tp, Some(2), 1);

        let ltc = LogToClean::new(
            tp,
            Arc::new(RwLock::new(log)),
            PathBuf::from("/tmp/rank"),
            &snapshot,
            offsets,
            0,
        );
        assert_eq!(ltc.clean_bytes, 2 * segment_size);
        assert_eq!(ltc.cleanable_bytes, 4 * segment_size);
        assert!((ltc.cleanable_ratio() - 4.0 / 6.0).abs() < 1e-9);
        assert!(!ltc.needs_compaction_now);
    }
}
