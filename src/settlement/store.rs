//! Settlement persistence seam
//!
//! The coordinator and monitor only see [`SettlementStore`]. PostgreSQL is
//! the durable backend (`database::settlements`); the in-memory store is
//! the fallback when PostgreSQL is disabled, and backs the tests.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use super::record::{SettlementRecord, SettlementState};
use crate::chain::RequestId;

#[async_trait]
pub trait SettlementStore: Send + Sync {
    /// Insert a record unless one exists for the request id.
    ///
    /// Returns `false` for a duplicate; the existing record is untouched.
    async fn insert_new(&self, record: &SettlementRecord) -> Result<bool>;

    async fn save(&self, record: &SettlementRecord) -> Result<()>;

    async fn load(&self, request_id: &RequestId) -> Result<Option<SettlementRecord>>;

    /// Every record, oldest first
    async fn list(&self) -> Result<Vec<SettlementRecord>>;

    /// Non-terminal records, oldest first
    async fn list_open(&self) -> Result<Vec<SettlementRecord>>;

    async fn list_failed(&self) -> Result<Vec<SettlementRecord>>;

    /// Last fully scanned block
    async fn load_cursor(&self) -> Result<Option<u64>>;

    async fn save_cursor(&self, block: u64) -> Result<()>;
}

#[derive(Default)]
struct MemoryState {
    sequence: u64,
    records: HashMap<RequestId, (u64, SettlementRecord)>,
    cursor: Option<u64>,
}

impl MemoryState {
    fn ordered(&self) -> Vec<SettlementRecord> {
        let mut entries: Vec<&(u64, SettlementRecord)> = self.records.values().collect();
        entries.sort_by_key(|(sequence, _)| *sequence);
        entries.into_iter().map(|(_, record)| record.clone()).collect()
    }
}

/// Process-local store; contents are lost on restart
#[derive(Default)]
pub struct InMemorySettlementStore {
    state: RwLock<MemoryState>,
}

impl InMemorySettlementStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettlementStore for InMemorySettlementStore {
    async fn insert_new(&self, record: &SettlementRecord) -> Result<bool> {
        let mut state = self.state.write().await;
        if state.records.contains_key(&record.request_id) {
            return Ok(false);
        }
        state.sequence += 1;
        let sequence = state.sequence;
        state
            .records
            .insert(record.request_id.clone(), (sequence, record.clone()));
        debug!(request_id = %record.request_id, "Settlement record created");
        Ok(true)
    }

    async fn save(&self, record: &SettlementRecord) -> Result<()> {
        let mut state = self.state.write().await;
        match state.records.get_mut(&record.request_id) {
            Some((_, existing)) => *existing = record.clone(),
            None => {
                state.sequence += 1;
                let sequence = state.sequence;
                state
                    .records
                    .insert(record.request_id.clone(), (sequence, record.clone()));
            }
        }
        Ok(())
    }

    async fn load(&self, request_id: &RequestId) -> Result<Option<SettlementRecord>> {
        Ok(self
            .state
            .read()
            .await
            .records
            .get(request_id)
            .map(|(_, record)| record.clone()))
    }

    async fn list(&self) -> Result<Vec<SettlementRecord>> {
        Ok(self.state.read().await.ordered())
    }

    async fn list_open(&self) -> Result<Vec<SettlementRecord>> {
        Ok(self
            .state
            .read()
            .await
            .ordered()
            .into_iter()
            .filter(|record| !record.state.is_terminal())
            .collect())
    }

    async fn list_failed(&self) -> Result<Vec<SettlementRecord>> {
        Ok(self
            .state
            .read()
            .await
            .ordered()
            .into_iter()
            .filter(|record| matches!(record.state, SettlementState::Failed { .. }))
            .collect())
    }

    async fn load_cursor(&self) -> Result<Option<u64>> {
        Ok(self.state.read().await.cursor)
    }

    async fn save_cursor(&self, block: u64) -> Result<()> {
        self.state.write().await.cursor = Some(block);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Address, ThresholdEvent};
    use crate::settlement::record::SettlementStage;

    fn record(id: u128) -> SettlementRecord {
        SettlementRecord::detected(&ThresholdEvent {
            request_id: RequestId::from_u128(id),
            verifiers: vec![Address::from_bytes([1; 20])],
            block_number: 1,
        })
    }

    #[tokio::test]
    async fn test_insert_new_rejects_duplicates() {
        let store = InMemorySettlementStore::new();
        let mut first = record(1);
        assert!(store.insert_new(&first).await.unwrap());

        first.transition(SettlementState::ResultsFetched);
        store.save(&first).await.unwrap();

        assert!(!store.insert_new(&record(1)).await.unwrap());
        let loaded = store.load(&RequestId::from_u128(1)).await.unwrap().unwrap();
        assert_eq!(loaded.state, SettlementState::ResultsFetched);
    }

    #[tokio::test]
    async fn test_listing_filters_and_orders() {
        let store = InMemorySettlementStore::new();
        for id in [3, 1, 2] {
            store.insert_new(&record(id)).await.unwrap();
        }

        let mut done = record(1);
        done.transition(SettlementState::Complete);
        store.save(&done).await.unwrap();

        let mut failed = record(2);
        failed.transition(SettlementState::Failed {
            stage: SettlementStage::Submitting,
            reason: "reverted".to_string(),
        });
        store.save(&failed).await.unwrap();

        let all: Vec<String> = store
            .list()
            .await
            .unwrap()
            .iter()
            .map(|r| r.request_id.to_string())
            .collect();
        assert_eq!(all, vec!["3", "1", "2"]);

        let open = store.list_open().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].request_id, RequestId::from_u128(3));

        let failed = store.list_failed().await.unwrap();
        assert_eq!(failed[0].request_id, RequestId::from_u128(2));
    }

    #[tokio::test]
    async fn test_cursor() {
        let store = InMemorySettlementStore::new();
        assert_eq!(store.load_cursor().await.unwrap(), None);
        store.save_cursor(42).await.unwrap();
        assert_eq!(store.load_cursor().await.unwrap(), Some(42));
    }
}
