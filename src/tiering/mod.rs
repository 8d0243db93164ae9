//! Tiering engine
//!
//! Keeps recent billing records inline in a low-latency index and moves aged
//! payloads to a cheap bulk store:
//! - **Index store**: authoritative entry per record, inline payload or blob pointer
//! - **Bulk store**: archived payloads, reachable only through an index entry
//! - **Migration engine**: periodic sweeps running archive-one per candidate
//! - **Retrieval router**: tier-transparent `get_record`

pub mod archiver;
pub mod checkpoint;
pub mod coordinator;
pub mod dead_letter;
pub mod error;
pub mod fs_bulk;
pub mod memory_bulk;
pub mod memory_index;
pub mod metrics;
pub mod migration;
pub mod router;
pub mod sqlite_index;
pub mod traits;

pub use archiver::{ArchiveOutcome, Archiver};
pub use checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, SweepCheckpoint};
pub use coordinator::{TieringConfig, TieringService, TieringServiceBuilder};
pub use dead_letter::{
    ChannelDeadLetterSink, DeadLetter, DeadLetterSink, MemoryDeadLetterSink, TracingDeadLetterSink,
};
pub use error::{StoreError, TierError};
pub use fs_bulk::FsBulkStore;
pub use memory_bulk::MemoryBulkStore;
pub use memory_index::MemoryIndexStore;
pub use metrics::{AlertSeverity, SweepAlert, SweepMonitor, SweepThresholds, TieringMetrics};
pub use migration::{MigrationEngine, SweepReport};
pub use router::RetrievalRouter;
pub use sqlite_index::SqliteIndexStore;
pub use traits::{
    BlobInfo, BulkStore, IndexStore, PageToken, ScanPage, StorageClass, TierCounts, UpdateOutcome,
};
