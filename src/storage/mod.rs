pub mod config;
pub mod entry;
pub mod log;
pub mod registry;
pub mod segment;

pub use config::{CleanerConfig, CleanupPolicy, LogConfig};
pub use entry::{ControlType, LogEntry};
pub use log::{CleanableLog, Log, LogSnapshot};
pub use registry::LogRegistry;
pub use segment::SegmentInfo;
