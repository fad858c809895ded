// src/storage/log.rs
use crate::partition::TopicPartition;
use crate::storage::config::{CleanupPolicy, LogConfig};
use crate::storage::entry::{ControlType, LogEntry};
use crate::storage::segment::{Segment, SegmentInfo};
use crate::Result;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Read-only view of a partition log used by the cleaner. Every decision is
/// made against a `LogSnapshot`, never against the live log.
pub trait CleanableLog: Send + Sync {
    fn topic_partition(&self) -> TopicPartition;
    /// Storage directory holding this partition's segments.
    fn dir(&self) -> PathBuf;
    fn config(&self) -> LogConfig;
    fn snapshot(&self) -> LogSnapshot;
}

#[derive(Debug, Clone)]
pub struct LogSnapshot {
    pub log_start_offset: u64,
    pub log_end_offset: u64,
    pub high_watermark: u64,
    pub active_segment_base_offset: u64,
    /// All segments in offset order; the active segment is last.
    pub segments: Vec<SegmentInfo>,
    pub config: LogConfig,
    /// First offset of the earliest transaction that is neither committed nor aborted.
    pub first_undecided_offset: Option<u64>,
}

impl LogSnapshot {
    pub fn cleanup_policy(&self) -> CleanupPolicy {
        self.config.cleanup_policy
    }

    /// Rolled segments whose offsets reach `from` or beyond.
    pub fn non_active_segments_from(&self, from: u64) -> impl Iterator<Item = &SegmentInfo> {
        let active = self.active_segment_base_offset;
        self.segments
            .iter()
            .filter(move |s| s.base_offset < active && s.next_offset > from)
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.size_in_bytes).sum()
    }
}

pub struct Log {
    topic_partition: TopicPartition,
    log_dir: PathBuf,
    config: LogConfig,
    active_segment: Segment,
    segments: BTreeMap<u64, Segment>, // Stores rolled (non-active) segments
    log_start_offset: u64,
    high_watermark: u64,
    ongoing_txns: BTreeMap<u64, u64>, // producer id -> first offset of its open transaction
}

impl Log {
    pub fn new<P: AsRef<Path>>(
        topic_partition: TopicPartition,
        log_dir: P,
        config: LogConfig,
    ) -> Result<Self> {
        config.validate()?;
        let active_segment = Segment::new(0, config.segment_bytes);
        Ok(Log {
            topic_partition,
            log_dir: log_dir.as_ref().to_path_buf(),
            config,
            active_segment,
            segments: BTreeMap::new(),
            log_start_offset: 0,
            high_watermark: 0,
            ongoing_txns: BTreeMap::new(),
        })
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    pub fn dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: LogConfig) -> Result<()> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    pub fn append_entry(&mut self, key: &[u8], value: &[u8]) -> Result<u64> {
        self.append_entry_at(key, value, now_ms())
    }

    pub fn append_entry_at(&mut self, key: &[u8], value: &[u8], timestamp: u64) -> Result<u64> {
        self.append_internal(timestamp, None, None, key, value)
    }

    /// Appends a record belonging to the open transaction of `producer_id`,
    /// opening one if the producer has none.
    pub fn append_transactional_at(
        &mut self,
        producer_id: u64,
        key: &[u8],
        value: &[u8],
        timestamp: u64,
    ) -> Result<u64> {
        let offset = self.append_internal(timestamp, Some(producer_id), None, key, value)?;
        self.ongoing_txns.entry(producer_id).or_insert(offset);
        Ok(offset)
    }

    /// Writes a commit or abort marker, resolving the producer's open transaction.
    pub fn append_end_txn_at(
        &mut self,
        producer_id: u64,
        control: ControlType,
        timestamp: u64,
    ) -> Result<u64> {
        let offset = self.append_internal(timestamp, Some(producer_id), Some(control), &[], &[])?;
        if self.ongoing_txns.remove(&producer_id).is_none() {
            log::warn!(
                "{}: end marker {:?} for producer {} without an open transaction",
                self.topic_partition,
                control,
                producer_id
            );
        }
        Ok(offset)
    }

    fn append_internal(
        &mut self,
        timestamp: u64,
        producer_id: Option<u64>,
        control: Option<ControlType>,
        key: &[u8],
        value: &[u8],
    ) -> Result<u64> {
        if self.active_segment.is_full() {
            self.roll_segment();
        }
        match self
            .active_segment
            .append(timestamp, producer_id, control, key, value)?
        {
            Some(offset) => Ok(offset),
            None => {
                // Not enough room left in the active segment; a fresh one always accepts.
                self.roll_segment();
                self.active_segment
                    .append(timestamp, producer_id, control, key, value)?
                    .ok_or_else(|| {
                        crate::Error::Internal("empty segment rejected an append".to_string())
                    })
            }
        }
    }

    /// Rolls the active segment. Rolling an empty active segment is a no-op.
    pub fn roll(&mut self) {
        if !self.active_segment.is_empty() {
            self.roll_segment();
        }
    }

    fn roll_segment(&mut self) {
        let next_base_for_new_segment = self.active_segment.next_offset();
        let new_active_segment = Segment::new(next_base_for_new_segment, self.config.segment_bytes);
        let old_active_segment = std::mem::replace(&mut self.active_segment, new_active_segment);
        log::debug!(
            "{}: rolled segment {} at offset {}",
            self.topic_partition,
            old_active_segment.base_offset,
            next_base_for_new_segment
        );
        self.segments
            .insert(old_active_segment.base_offset, old_active_segment);
    }

    pub fn read_at_global_offset(&self, global_offset: u64) -> Result<Option<&LogEntry>> {
        if global_offset < self.log_start_offset {
            return Ok(None);
        }
        let active_base = self.active_segment.base_offset;
        if global_offset >= active_base {
            return self
                .active_segment
                .read_entry_by_relative_offset(global_offset - active_base);
        }
        match self.segments.range(..=global_offset).next_back() {
            Some((&segment_base, segment)) => {
                segment.read_entry_by_relative_offset(global_offset - segment_base)
            }
            None => Ok(None),
        }
    }

    pub fn log_start_offset(&self) -> u64 {
        self.log_start_offset
    }

    // Returns the next global offset that will be assigned to a new entry.
    pub fn log_end_offset(&self) -> u64 {
        self.active_segment.next_offset()
    }

    pub fn high_watermark(&self) -> u64 {
        self.high_watermark
    }

    pub fn active_segment_base_offset(&self) -> u64 {
        self.active_segment.base_offset
    }

    /// Moves the high watermark, clamped to the offsets the log holds.
    pub fn update_high_watermark(&mut self, offset: u64) -> u64 {
        self.high_watermark = offset.clamp(self.log_start_offset, self.log_end_offset());
        self.high_watermark
    }

    pub fn first_undecided_offset(&self) -> Option<u64> {
        self.ongoing_txns.values().copied().min()
    }

    /// Raises the log start offset and drops rolled segments that lie entirely
    /// below it. Returns the number of segments removed.
    pub fn advance_log_start_offset(&mut self, offset: u64) -> usize {
        let offset = offset.min(self.high_watermark);
        if offset <= self.log_start_offset {
            return 0;
        }
        self.log_start_offset = offset;
        let doomed: Vec<u64> = self
            .segments
            .iter()
            .filter(|(_, s)| s.next_offset() <= offset)
            .map(|(&base, _)| base)
            .collect();
        for base in &doomed {
            self.segments.remove(base);
        }
        if !doomed.is_empty() {
            log::info!(
                "{}: deleted {} segment(s) below log start offset {}",
                self.topic_partition,
                doomed.len(),
                offset
            );
        }
        doomed.len()
    }

    /// Deletes leading rolled segments whose newest record is older than the
    /// retention window and which are fully below the high watermark.
    pub fn delete_retention_expired(&mut self, now: u64) -> usize {
        let retention_ms = match self.config.retention {
            Some(retention) if self.config.cleanup_policy.delete() => retention.as_millis() as u64,
            _ => return 0,
        };
        let cutoff = now.saturating_sub(retention_ms);
        let mut new_start = self.log_start_offset;
        for segment in self.segments.values() {
            let expired = segment.largest_timestamp() < cutoff;
            if !expired || segment.next_offset() > self.high_watermark {
                break;
            }
            new_start = segment.next_offset();
        }
        self.advance_log_start_offset(new_start)
    }

    pub fn snapshot(&self) -> LogSnapshot {
        let mut segments: Vec<SegmentInfo> = self.segments.values().map(Segment::info).collect();
        segments.push(self.active_segment.info());
        LogSnapshot {
            log_start_offset: self.log_start_offset,
            log_end_offset: self.log_end_offset(),
            high_watermark: self.high_watermark,
            active_segment_base_offset: self.active_segment.base_offset,
            segments,
            config: self.config.clone(),
            first_undecided_offset: self.first_undecided_offset(),
        }
    }
}

impl CleanableLog for RwLock<Log> {
    fn topic_partition(&self) -> TopicPartition {
        self.read().topic_partition.clone()
    }

    fn dir(&self) -> PathBuf {
        self.read().log_dir.clone()
    }

    fn config(&self) -> LogConfig {
        self.read().config.clone()
    }

    fn snapshot(&self) -> LogSnapshot {
        self.read().snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn new_log(config: LogConfig) -> Log {
        Log::new(TopicPartition::new("journal", 0), "/tmp/journal", config).unwrap()
    }

    #[test]
    fn test_roll_on_full_segment() {
        let mut log = new_log(LogConfig::compacted().with_segment_bytes(1));
        for i in 0..4u8 {
            assert_eq!(log.append_entry_at(&[i], b"v", 10).unwrap(), i as u64);
        }
        let snapshot = log.snapshot();
        assert_eq!(snapshot.segments.len(), 4);
        assert_eq!(snapshot.active_segment_base_offset, 3);
        assert_eq!(snapshot.log_end_offset, 4);
        assert_eq!(log.read_at_global_offset(1).unwrap().unwrap().key, vec![1u8]);
    }

    #[test]
    fn test_roll_of_empty_active_segment_is_noop() {
        let mut log = new_log(LogConfig::compacted());
        log.roll();
        assert_eq!(log.snapshot().segments.len(), 1);
        log.append_entry_at(b"k", b"v", 1).unwrap();
        log.roll();
        log.roll();
        assert_eq!(log.snapshot().segments.len(), 2);
        assert_eq!(log.active_segment_base_offset(), 1);
    }

    #[test]
    fn test_high_watermark_is_clamped() {
        let mut log = new_log(LogConfig::compacted());
        log.append_entry_at(b"k", b"v", 1).unwrap();
        assert_eq!(log.update_high_watermark(100), 1);
    }

    #[test]
    fn test_transaction_tracking() {
        let mut log = new_log(LogConfig::compacted());
        log.append_entry_at(b"a", b"1", 1).unwrap();
        log.append_transactional_at(15, b"b", b"2", 1).unwrap();
        log.append_transactional_at(15, b"c", b"3", 1).unwrap();
        assert_eq!(log.first_undecided_offset(), Some(1));
        let marker = log.append_end_txn_at(15, ControlType::Abort, 1).unwrap();
        assert_eq!(marker, 3);
        assert!(log.read_at_global_offset(3).unwrap().unwrap().is_control());
        assert_eq!(log.first_undecided_offset(), None);
    }

    #[test]
    fn test_advance_log_start_offset_drops_segments() {
        let mut log = new_log(LogConfig::compacted());
        for i in 0..6u8 {
            log.append_entry_at(&[i], b"v", 1).unwrap();
            log.roll();
        }
        log.update_high_watermark(6);
        assert_eq!(log.advance_log_start_offset(3), 3);
        assert_eq!(log.log_start_offset(), 3);
        assert!(log.read_at_global_offset(2).unwrap().is_none());
        assert_eq!(log.snapshot().segments[0].base_offset, 3);
        // Never moves backwards.
        assert_eq!(log.advance_log_start_offset(1), 0);
        assert_eq!(log.log_start_offset(), 3);
    }

    #[test]
    fn test_retention_deletes_only_expired_segments() {
        let config = LogConfig::default().with_retention(Duration::from_millis(100));
        let mut log = new_log(config);
        log.append_entry_at(b"a", b"1", 1_000).unwrap();
        log.roll();
        log.append_entry_at(b"b", b"1", 1_000).unwrap();
        log.roll();
        log.append_entry_at(b"c", b"1", 5_000).unwrap();
        log.roll();
        log.update_high_watermark(3);

        assert_eq!(log.delete_retention_expired(5_050), 2);
        assert_eq!(log.log_start_offset(), 2);
        assert_eq!(log.delete_retention_expired(5_050), 0);
    }

    #[test]
    fn test_shared_log_snapshot() {
        let shared = RwLock::new(new_log(LogConfig::compacted()));
        shared.write().append_entry_at(b"k", b"v", 1).unwrap();
        let snapshot = CleanableLog::snapshot(&shared);
        assert_eq!(snapshot.log_end_offset, 1);
        assert_eq!(snapshot.cleanup_policy(), CleanupPolicy::Compact);
        assert_eq!(shared.topic_partition(), TopicPartition::new("journal", 0));

        shared.write().set_config(LogConfig::default()).unwrap();
        assert_eq!(shared.config().cleanup_policy, CleanupPolicy::Delete);
    }
}
