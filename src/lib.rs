//! billing-tiering - age-based tiering engine for immutable billing records
//!
//! Recent records live inline in a low-latency index. A periodic migration
//! sweep moves aged payloads to a cheap bulk store and leaves a pointer
//! behind, and a single `get_record` call serves a record from whichever
//! tier currently holds it.

pub mod observability;
pub mod orchestrator;
pub mod tiering;
pub mod types;
pub mod utils;

// Re-export main types for convenience
pub use orchestrator::{OrchestratorConfig, ShutdownCoordinator, SystemInitializer};
pub use tiering::{
    BulkStore, IndexStore, RetrievalRouter, MigrationEngine, SweepReport, TierError,
    TieringConfig, TieringService,
};
pub use types::{IndexEntry, Location, NewRecord, RecordId, RecordView};
