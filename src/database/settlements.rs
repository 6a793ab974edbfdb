//! Settlement Repository - PostgreSQL operations for settlement records using sqlx

use anyhow::anyhow;
use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::chain::RequestId;
use crate::settlement::{SettlementRecord, SettlementStore};

#[derive(Clone)]
pub struct SettlementRepository {
    pool: PgPool,
}

impl SettlementRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert_if_absent(&self, record: &SettlementRecord) -> Result<bool, String> {
        let result = sqlx::query(
            r#"
            INSERT INTO settlements.records
            (request_id, state, record, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (request_id) DO NOTHING
            "#,
        )
        .bind(record.request_id.as_str())
        .bind(record.state.name())
        .bind(Json(record))
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to insert settlement record: {}", e))?;

        let inserted = result.rows_affected() == 1;
        if inserted {
            debug!(request_id = %record.request_id, "Settlement record created");
        }
        Ok(inserted)
    }

    pub async fn upsert(&self, record: &SettlementRecord) -> Result<(), String> {
        sqlx::query(
            r#"
            INSERT INTO settlements.records
            (request_id, state, record, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (request_id)
            DO UPDATE SET state = EXCLUDED.state,
                          record = EXCLUDED.record,
                          updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(record.request_id.as_str())
        .bind(record.state.name())
        .bind(Json(record))
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to save settlement record: {}", e))?;

        debug!(request_id = %record.request_id, state = %record.state, "Settlement record saved");
        Ok(())
    }

    pub async fn get(&self, request_id: &RequestId) -> Result<Option<SettlementRecord>, String> {
        let row = sqlx::query("SELECT record FROM settlements.records WHERE request_id = $1")
            .bind(request_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| format!("Failed to get settlement record: {}", e))?;

        Ok(row.map(|row| {
            let Json(record): Json<SettlementRecord> = row.get("record");
            record
        }))
    }

    /// Records whose state name matches the filter, oldest first
    async fn fetch_where(&self, filter: &str) -> Result<Vec<SettlementRecord>, String> {
        let query = format!(
            "SELECT record FROM settlements.records {} ORDER BY seq ASC",
            filter
        );
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| format!("Failed to list settlement records: {}", e))?;

        rows.into_iter()
            .map(|row| {
                row.try_get::<Json<SettlementRecord>, _>("record")
                    .map(|Json(record)| record)
                    .map_err(|e| format!("Failed to decode settlement record: {}", e))
            })
            .collect()
    }

    pub async fn get_all(&self) -> Result<Vec<SettlementRecord>, String> {
        self.fetch_where("").await
    }

    pub async fn get_open(&self) -> Result<Vec<SettlementRecord>, String> {
        self.fetch_where("WHERE state NOT IN ('complete', 'failed')").await
    }

    pub async fn get_failed(&self) -> Result<Vec<SettlementRecord>, String> {
        self.fetch_where("WHERE state = 'failed'").await
    }

    pub async fn get_cursor(&self) -> Result<Option<u64>, String> {
        let row = sqlx::query("SELECT block_number FROM settlements.cursor WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| format!("Failed to get cursor: {}", e))?;

        Ok(row.map(|row| row.get::<i64, _>("block_number") as u64))
    }

    pub async fn set_cursor(&self, block: u64) -> Result<(), String> {
        let block = i64::try_from(block).map_err(|_| format!("Block {} out of range", block))?;
        sqlx::query(
            r#"
            INSERT INTO settlements.cursor (id, block_number, updated_at)
            VALUES (1, $1, NOW())
            ON CONFLICT (id)
            DO UPDATE SET block_number = EXCLUDED.block_number, updated_at = NOW()
            "#,
        )
        .bind(block)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to save cursor: {}", e))?;

        Ok(())
    }
}

#[async_trait]
impl SettlementStore for SettlementRepository {
    async fn insert_new(&self, record: &SettlementRecord) -> anyhow::Result<bool> {
        self.insert_if_absent(record).await.map_err(|e| anyhow!(e))
    }

    async fn save(&self, record: &SettlementRecord) -> anyhow::Result<()> {
        self.upsert(record).await.map_err(|e| anyhow!(e))
    }

    async fn load(&self, request_id: &RequestId) -> anyhow::Result<Option<SettlementRecord>> {
        self.get(request_id).await.map_err(|e| anyhow!(e))
    }

    async fn list(&self) -> anyhow::Result<Vec<SettlementRecord>> {
        self.get_all().await.map_err(|e| anyhow!(e))
    }

    async fn list_open(&self) -> anyhow::Result<Vec<SettlementRecord>> {
        self.get_open().await.map_err(|e| anyhow!(e))
    }

    async fn list_failed(&self) -> anyhow::Result<Vec<SettlementRecord>> {
        self.get_failed().await.map_err(|e| anyhow!(e))
    }

    async fn load_cursor(&self) -> anyhow::Result<Option<u64>> {
        self.get_cursor().await.map_err(|e| anyhow!(e))
    }

    async fn save_cursor(&self, block: u64) -> anyhow::Result<()> {
        self.set_cursor(block).await.map_err(|e| anyhow!(e))
    }
}
