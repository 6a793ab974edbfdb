//! Database Connection Pool using sqlx

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::config::DatabaseConfig;
use crate::database::settlements::SettlementRepository;

pub struct DatabasePool {
    pool: PgPool,
    settlements: SettlementRepository,
}

impl DatabasePool {
    pub async fn new(config: &DatabaseConfig) -> Result<Self, String> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.postgres_url)
            .await
            .map_err(|e| format!("Failed to connect to PostgreSQL: {}", e))?;

        info!("Connected to PostgreSQL");

        let settlements = SettlementRepository::new(pool.clone());

        Ok(Self { pool, settlements })
    }

    pub async fn init_schema(&self) -> Result<(), String> {
        info!("Initializing database schema...");

        sqlx::query("CREATE SCHEMA IF NOT EXISTS settlements")
            .execute(&self.pool)
            .await
            .map_err(|e| format!("Failed to create settlements schema: {}", e))?;

        // One row per request; the record itself is stored as JSONB
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settlements.records (
                seq BIGSERIAL UNIQUE,
                request_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                record JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to create settlements.records: {}", e))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS records_state_idx ON settlements.records (state, seq)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to create records_state_idx: {}", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settlements.cursor (
                id SMALLINT PRIMARY KEY CHECK (id = 1),
                block_number BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to create settlements.cursor: {}", e))?;

        info!("Database schema initialized");
        Ok(())
    }

    pub fn settlements(&self) -> &SettlementRepository {
        &self.settlements
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
