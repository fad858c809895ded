// src/storage/segment.rs
use crate::storage::entry::{ControlType, LogEntry};
use crate::{Error, Result};

/// Point-in-time description of a segment, as consumed by the cleaner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInfo {
    pub base_offset: u64,
    /// Offset one past the last entry; equals `base_offset` when empty.
    pub next_offset: u64,
    pub size_in_bytes: u64,
    /// Timestamp of the first entry, if any.
    pub first_timestamp: Option<u64>,
    /// Largest entry timestamp, 0 for an empty segment.
    pub largest_timestamp: u64,
}

// A contiguous run of entries starting at `base_offset`. Only the active
// segment of a log accepts appends.
pub struct Segment {
    pub base_offset: u64,
    current_relative_offset: u64,
    entries: Vec<LogEntry>,
    max_segment_bytes: u64,
    current_data_bytes: u64,
    first_timestamp: Option<u64>,
    largest_timestamp: u64,
}

impl Segment {
    pub fn new(base_offset: u64, max_segment_bytes: u64) -> Self {
        Segment {
            base_offset,
            current_relative_offset: 0,
            entries: Vec::new(),
            max_segment_bytes,
            current_data_bytes: 0,
            first_timestamp: None,
            largest_timestamp: 0,
        }
    }

    // Appends an entry at the next offset. Returns Ok(None) when the segment has
    // no room for it; an empty segment always takes the entry so that oversized
    // entries cannot make the log roll forever.
    pub fn append(
        &mut self,
        timestamp: u64,
        producer_id: Option<u64>,
        control: Option<ControlType>,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<u64>> {
        let absolute_offset = self.next_offset();
        let entry = LogEntry::new(
            absolute_offset,
            timestamp,
            producer_id,
            control,
            key.to_vec(),
            value.to_vec(),
        );
        let entry_len_on_disk = entry.size_in_bytes()?;

        if !self.entries.is_empty()
            && self.current_data_bytes + entry_len_on_disk > self.max_segment_bytes
        {
            return Ok(None);
        }

        self.entries.push(entry);
        self.current_data_bytes += entry_len_on_disk;
        self.current_relative_offset += 1;
        self.first_timestamp.get_or_insert(timestamp);
        self.largest_timestamp = self.largest_timestamp.max(timestamp);

        Ok(Some(absolute_offset))
    }

    // Reads an entry by its relative offset *within this segment*.
    pub fn read_entry_by_relative_offset(
        &self,
        target_relative_offset: u64,
    ) -> Result<Option<&LogEntry>> {
        match self.entries.get(target_relative_offset as usize) {
            Some(entry) => {
                if entry.offset != self.base_offset + target_relative_offset {
                    return Err(Error::Internal(format!(
                        "Segment {}: expected offset {} but found {}",
                        self.base_offset,
                        self.base_offset + target_relative_offset,
                        entry.offset
                    )));
                }
                if !entry.is_valid() {
                    return Err(Error::ChecksumMismatch);
                }
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn is_full(&self) -> bool {
        self.current_data_bytes >= self.max_segment_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get_current_relative_offset(&self) -> u64 {
        self.current_relative_offset
    }

    pub fn get_current_data_bytes(&self) -> u64 {
        self.current_data_bytes
    }

    pub fn next_offset(&self) -> u64 {
        self.base_offset + self.current_relative_offset
    }

    pub fn largest_timestamp(&self) -> u64 {
        self.largest_timestamp
    }

    pub fn info(&self) -> SegmentInfo {
        SegmentInfo {
            base_offset: self.base_offset,
            next_offset: self.next_offset(),
            size_in_bytes: self.current_data_bytes,
            first_timestamp: self.first_timestamp,
            largest_timestamp: self.largest_timestamp,
        }
    }
}
