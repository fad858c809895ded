pub mod checkpoint;
pub mod manager;
pub mod offsets;
pub mod ranker;
pub mod service;
pub mod state;
pub mod worker;

pub use checkpoint::{CheckpointStore, OffsetCheckpointFile};
pub use manager::LogCleanerManager;
pub use offsets::{cleanable_offsets, max_compaction_delay, OffsetsToClean};
pub use ranker::LogToClean;
pub use service::LogCleaner;
pub use state::{CleaningEvent, CleaningStateStore, LogCleaningState};
pub use worker::{CleanerWorker, Compactor, RetentionSweeper, RetentionWorker};
