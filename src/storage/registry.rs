use crate::cleaner::worker::RetentionSweeper;
use crate::partition::TopicPartition;
use crate::storage::Log;
use crate::{Error, Result};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// Logs hosted by this process, keyed by partition.
#[derive(Default)]
pub struct LogRegistry {
    logs: DashMap<TopicPartition, Arc<RwLock<Log>>>,
}

impl LogRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, log: Log) -> Arc<RwLock<Log>> {
        let tp = log.topic_partition().clone();
        let shared = Arc::new(RwLock::new(log));
        self.logs.insert(tp, Arc::clone(&shared));
        shared
    }

    pub fn get(&self, tp: &TopicPartition) -> Option<Arc<RwLock<Log>>> {
        self.logs.get(tp).map(|e| Arc::clone(e.value()))
    }

    pub fn remove(&self, tp: &TopicPartition) -> Option<Arc<RwLock<Log>>> {
        self.logs.remove(tp).map(|(_, log)| log)
    }

    pub fn len(&self) -> usize {
        self.logs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }
}

impl RetentionSweeper for LogRegistry {
    fn delete_expired(
        &self,
        tp: &TopicPartition,
        log_start_offset: u64,
        now: u64,
    ) -> Result<usize> {
        let log = self
            .get(tp)
            .ok_or_else(|| Error::UnknownPartition(tp.clone()))?;
        let mut log = log.write();
        let mut deleted = log.advance_log_start_offset(log_start_offset);
        deleted += log.delete_retention_expired(now);
        Ok(deleted)
    }
}
