use crate::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SEGMENT_BYTES: u64 = 1024 * 1024 * 16; // 16MB
const DEFAULT_MIN_CLEANABLE_RATIO: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CleanupPolicy {
    #[default]
    Delete,
    Compact,
    CompactAndDelete,
}

impl CleanupPolicy {
    pub fn compact(&self) -> bool {
        matches!(self, CleanupPolicy::Compact | CleanupPolicy::CompactAndDelete)
    }

    pub fn delete(&self) -> bool {
        matches!(self, CleanupPolicy::Delete | CleanupPolicy::CompactAndDelete)
    }
}

/// Per-partition settings that drive retention and compaction decisions.
#[derive(Debug, Clone, PartialEq)]
pub struct LogConfig {
    pub cleanup_policy: CleanupPolicy,
    /// Dirty fraction a partition must reach before it is worth compacting.
    pub min_cleanable_ratio: f64,
    /// Records younger than this are never compacted.
    pub min_compaction_lag: Option<Duration>,
    /// Dirty records older than this force compaction regardless of ratio.
    pub max_compaction_lag: Option<Duration>,
    pub segment_bytes: u64,
    pub retention: Option<Duration>,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            cleanup_policy: CleanupPolicy::default(),
            min_cleanable_ratio: DEFAULT_MIN_CLEANABLE_RATIO,
            min_compaction_lag: None,
            max_compaction_lag: None,
            segment_bytes: DEFAULT_SEGMENT_BYTES,
            retention: None,
        }
    }
}

impl LogConfig {
    pub fn compacted() -> Self {
        Self::default().with_cleanup_policy(CleanupPolicy::Compact)
    }

    pub fn with_cleanup_policy(mut self, policy: CleanupPolicy) -> Self {
        self.cleanup_policy = policy;
        self
    }

    pub fn with_min_cleanable_ratio(mut self, ratio: f64) -> Self {
        self.min_cleanable_ratio = ratio;
        self
    }

    pub fn with_min_compaction_lag(mut self, lag: Duration) -> Self {
        self.min_compaction_lag = Some(lag);
        self
    }

    pub fn with_max_compaction_lag(mut self, lag: Duration) -> Self {
        self.max_compaction_lag = Some(lag);
        self
    }

    pub fn with_segment_bytes(mut self, bytes: u64) -> Self {
        self.segment_bytes = bytes;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    /// Minimum compaction lag in milliseconds, 0 when unset.
    pub fn min_compaction_lag_ms(&self) -> u64 {
        self.min_compaction_lag
            .map(|lag| lag.as_millis() as u64)
            .unwrap_or(0)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.min_cleanable_ratio) {
            return Err(Error::InvalidConfig(format!(
                "min_cleanable_ratio must be within [0, 1], got {}",
                self.min_cleanable_ratio
            )));
        }
        if self.segment_bytes == 0 {
            return Err(Error::InvalidConfig(
                "segment_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Process-wide settings for the background cleaner and retention loops.
#[derive(Debug, Clone)]
pub struct CleanerConfig {
    pub log_dirs: Vec<PathBuf>,
    pub num_threads: usize,
    /// Sleep between polls when there is nothing to clean.
    pub backoff: Duration,
    pub retention_check_interval: Duration,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        CleanerConfig {
            log_dirs: Vec::new(),
            num_threads: 1,
            backoff: Duration::from_secs(15),
            retention_check_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl CleanerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_threads == 0 {
            return Err(Error::InvalidConfig(
                "num_threads must be at least 1".to_string(),
            ));
        }
        if self.log_dirs.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one log directory is required".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_policy_flags() {
        assert!(!CleanupPolicy::Delete.compact());
        assert!(CleanupPolicy::Delete.delete());
        assert!(CleanupPolicy::Compact.compact());
        assert!(!CleanupPolicy::Compact.delete());
        assert!(CleanupPolicy::CompactAndDelete.compact());
        assert!(CleanupPolicy::CompactAndDelete.delete());
    }

    #[test]
    fn test_log_config_validation() {
        assert!(LogConfig::compacted().validate().is_ok());
        assert_matches!(
            LogConfig::default().with_min_cleanable_ratio(1.5).validate(),
            Err(Error::InvalidConfig(_))
        );
        assert_matches!(
            LogConfig::default().with_segment_bytes(0).validate(),
            Err(Error::InvalidConfig(_))
        );
    }

    #[test]
    fn test_min_compaction_lag_defaults_to_zero() {
        assert_eq!(LogConfig::default().min_compaction_lag_ms(), 0);
        let config = LogConfig::default().with_min_compaction_lag(Duration::from_secs(2));
        assert_eq!(config.min_compaction_lag_ms(), 2000);
    }

    #[test]
    fn test_cleaner_config_requires_dirs() {
        assert_matches!(
            CleanerConfig::default().validate(),
            Err(Error::InvalidConfig(_))
        );
        let config = CleanerConfig {
            log_dirs: vec![PathBuf::from("/tmp/logs")],
            ..CleanerConfig::default()
        };
        assert!(config.validate().is_ok());
    }
}
