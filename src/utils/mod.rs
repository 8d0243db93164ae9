//! Utility modules for the tiering engine
//!
//! Reusable helpers shared by the migration and retrieval paths: bounded
//! retries for store calls and the injectable clock.

pub mod clock;
pub mod retry;

// Re-export commonly used items
pub use clock::{ceil_to_millis, Clock, ManualClock, SystemClock};
pub use retry::{call_with_retry, call_with_retry_if, RetryPolicy};
