use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

/// Outcome recorded by a transaction end marker.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    Commit,
    Abort,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub offset: u64,
    pub timestamp: u64, // milliseconds since the epoch
    pub producer_id: Option<u64>,
    pub control: Option<ControlType>,
    pub checksum: u32, // CRC32 of everything above plus key and value
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl LogEntry {
    pub fn new(
        offset: u64,
        timestamp: u64,
        producer_id: Option<u64>,
        control: Option<ControlType>,
        key: Vec<u8>,
        value: Vec<u8>,
    ) -> Self {
        let mut entry = LogEntry {
            offset,
            timestamp,
            producer_id,
            control,
            checksum: 0,
            key,
            value,
        };
        entry.checksum = entry.compute_checksum();
        entry
    }

    pub fn compute_checksum(&self) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(&self.offset.to_be_bytes());
        hasher.update(&self.timestamp.to_be_bytes());
        hasher.update(&self.producer_id.unwrap_or(u64::MAX).to_be_bytes());
        hasher.update(&[match self.control {
            None => 0u8,
            Some(ControlType::Commit) => 1,
            Some(ControlType::Abort) => 2,
        }]);
        hasher.update(&(self.key.len() as u32).to_be_bytes());
        hasher.update(&(self.value.len() as u32).to_be_bytes());
        hasher.update(&self.key);
        hasher.update(&self.value);
        hasher.finalize()
    }

    pub fn is_valid(&self) -> bool {
        self.compute_checksum() == self.checksum
    }

    pub fn is_control(&self) -> bool {
        self.control.is_some()
    }

    /// Bytes this entry occupies on disk: the length prefix plus the encoded entry.
    pub fn size_in_bytes(&self) -> crate::Result<u64> {
        Ok(4 + bincode::serialized_size(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[test]
    fn test_log_entry_serialization_deserialization() {
        let original_entry = LogEntry::new(
            123,
            SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64,
            Some(15),
            None,
            b"key".to_vec(),
            b"value".to_vec(),
        );

        let serialized = bincode::serialize(&original_entry).expect("Failed to serialize LogEntry");
        let deserialized: LogEntry =
            bincode::deserialize(&serialized).expect("Failed to deserialize LogEntry");

        assert_eq!(original_entry, deserialized);
        assert!(deserialized.is_valid());
    }

    #[test]
    fn test_checksum_detects_tampering() {
        let mut entry = LogEntry::new(7, 1_000, None, None, b"k".to_vec(), b"v".to_vec());
        assert!(entry.is_valid());
        entry.value = b"changed".to_vec();
        assert!(!entry.is_valid());
    }

    #[test]
    fn test_size_includes_length_prefix() {
        let entry = LogEntry::new(0, 0, None, Some(ControlType::Abort), Vec::new(), Vec::new());
        let encoded = bincode::serialize(&entry).unwrap();
        assert_eq!(entry.size_in_bytes().unwrap(), encoded.len() as u64 + 4);
    }
}
