//! In-memory index store
//!
//! Entries live in a hash map keyed by id, with a `(timestamp, id)` ordered
//! set alongside so archival scans and listings walk time order without
//! sorting. Used for development, single-process deployments and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::error::StoreError;
use super::traits::{next_token, IndexStore, PageToken, ScanPage, TierCounts, UpdateOutcome};
use crate::types::{IndexEntry, RecordId, RecordSummary, TierKind};

#[derive(Debug, Default)]
struct IndexState {
    entries: HashMap<RecordId, IndexEntry>,
    by_time: BTreeSet<(i64, RecordId)>,
}

/// Index store backed by process memory
#[derive(Debug, Default)]
pub struct MemoryIndexStore {
    state: RwLock<IndexState>,
}

impl MemoryIndexStore {
    pub fn new() -> Self {
        info!("Initializing MemoryIndexStore");
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Snapshot of every entry, in `(timestamp, id)` order
    pub async fn entries(&self) -> Vec<IndexEntry> {
        let state = self.state.read().await;
        state
            .by_time
            .iter()
            .filter_map(|(_, id)| state.entries.get(id).cloned())
            .collect()
    }
}

#[async_trait]
impl IndexStore for MemoryIndexStore {
    async fn get(&self, id: &RecordId) -> Result<Option<IndexEntry>, StoreError> {
        Ok(self.state.read().await.entries.get(id).cloned())
    }

    async fn put(&self, entry: &IndexEntry) -> Result<(), StoreError> {
        let mut state = self.state.write().await;

        if state.entries.contains_key(&entry.id) {
            return Err(StoreError::AlreadyExists(entry.id.to_string()));
        }

        state
            .by_time
            .insert((entry.timestamp.timestamp_millis(), entry.id.clone()));
        state.entries.insert(entry.id.clone(), entry.clone());

        debug!("Indexed record {} ({})", entry.id, entry.tier());
        Ok(())
    }

    async fn conditional_update(
        &self,
        id: &RecordId,
        expected: TierKind,
        new_entry: &IndexEntry,
    ) -> Result<UpdateOutcome, StoreError> {
        let mut state = self.state.write().await;

        let current = state
            .entries
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if current.tier() != expected {
            return Ok(UpdateOutcome::ConditionFailed);
        }
        if new_entry.id != *id || new_entry.timestamp != current.timestamp {
            return Err(StoreError::InvalidInput(format!(
                "conditional update for {} may not change id or timestamp",
                id
            )));
        }

        *current = new_entry.clone();
        Ok(UpdateOutcome::Applied)
    }

    async fn scan_archivable(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<&PageToken>,
        limit: usize,
    ) -> Result<ScanPage, StoreError> {
        let state = self.state.read().await;
        let cutoff_ms = cutoff.timestamp_millis();

        let entries: Vec<IndexEntry> = state
            .by_time
            .iter()
            .skip_while(|(ts, id)| after.is_some_and(|token| !token.precedes(*ts, id)))
            .take_while(|(ts, _)| *ts < cutoff_ms)
            .filter_map(|(_, id)| state.entries.get(id))
            .filter(|entry| entry.tier() == TierKind::Inline)
            .take(limit)
            .cloned()
            .collect();

        let next = next_token(&entries, limit);
        Ok(ScanPage { entries, next })
    }

    async fn list_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RecordSummary>, StoreError> {
        let state = self.state.read().await;
        let from_ms = from.timestamp_millis();
        let to_ms = to.timestamp_millis();

        Ok(state
            .by_time
            .iter()
            .skip_while(|(ts, _)| *ts < from_ms)
            .take_while(|(ts, _)| *ts < to_ms)
            .filter_map(|(_, id)| state.entries.get(id))
            .take(limit)
            .map(IndexEntry::summary)
            .collect())
    }

    async fn tier_counts(&self) -> Result<TierCounts, StoreError> {
        let state = self.state.read().await;
        let archived = state
            .entries
            .values()
            .filter(|entry| entry.tier() == TierKind::Archived)
            .count() as u64;

        Ok(TierCounts {
            inline: state.entries.len() as u64 - archived,
            archived,
        })
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
