//! Injectable time source.
//!
//! Tiering decisions depend only on record timestamps and "now". Reading now
//! through [`Clock`] lets sweeps be replayed deterministically in tests.

use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock with millisecond resolution
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        self.millis.store(now.timestamp_millis(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let millis = self.millis.load(Ordering::SeqCst);
        DateTime::from_timestamp_millis(millis).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Smallest whole-millisecond instant at or after `ts`.
///
/// Index stores compare timestamps in whole milliseconds; a cutoff aligned
/// this way keeps `timestamp < cutoff` exact for sub-millisecond clocks.
pub fn ceil_to_millis(ts: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let floor_ms = ts.timestamp_millis();
    let floor = DateTime::from_timestamp_millis(floor_ms)?;
    if floor == ts {
        return Some(ts);
    }
    DateTime::from_timestamp_millis(floor_ms.checked_add(1)?)
}
