use chrono::Utc;
use log::{debug, info};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::config::DatabaseOutputConfig;
use crate::storage::models::{ReadingRow, ReadingStats};
use crate::utils::error::ModbusError;

const INSERT_CHUNK: usize = 500;

#[derive(Clone)]
pub struct SqliteManager {
    pool: SqlitePool,
}

impl SqliteManager {
    pub async fn new(config: &DatabaseOutputConfig) -> Result<Self, ModbusError> {
        // Create database directory if it doesn't exist
        if let Some(parent) = Path::new(&config.database_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ModbusError::StorageError(format!("Failed to create database directory: {}", e))
                })?;
            }
        }

        info!("🗄️  Initializing SQLite database: {}", config.database_path);

        let options = SqliteConnectOptions::new()
            .filename(&config.database_path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .journal_mode(if config.enable_wal {
                SqliteJournalMode::Wal
            } else {
                SqliteJournalMode::Delete
            })
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| ModbusError::StorageError(format!("Failed to connect to SQLite: {}", e)))?;

        Self::with_pool(pool).await
    }

    /// Private in-memory database, used by one-shot runs and tests.
    pub async fn in_memory() -> Result<Self, ModbusError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // Every connection would get its own empty database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, ModbusError> {
        let manager = Self { pool };
        manager.initialize_schema().await?;
        info!("✅ SQLite database initialized successfully");
        Ok(manager)
    }

    async fn initialize_schema(&self) -> Result<(), ModbusError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS readings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recording_id TEXT NOT NULL,
                gateway_host TEXT NOT NULL,
                gateway_port INTEGER NOT NULL,
                unit INTEGER NOT NULL,
                table_id INTEGER NOT NULL,
                register_addr INTEGER NOT NULL,
                value INTEGER NOT NULL,
                unix_timestamp INTEGER NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_readings_recording ON readings(recording_id, unix_timestamp)",
            "CREATE INDEX IF NOT EXISTS idx_readings_timestamp ON readings(unix_timestamp)",
        ];

        for index_sql in indexes {
            sqlx::query(index_sql).execute(&self.pool).await?;
        }

        debug!("Database schema ready");
        Ok(())
    }

    pub async fn batch_insert_readings(&self, rows: Vec<ReadingRow>) -> Result<usize, ModbusError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut total_inserted = 0;
        for chunk in rows.chunks(INSERT_CHUNK) {
            total_inserted += self.insert_chunk(chunk).await?;
        }

        debug!("💾 Inserted {} register values", total_inserted);
        Ok(total_inserted)
    }

    async fn insert_chunk(&self, rows: &[ReadingRow]) -> Result<usize, ModbusError> {
        let mut tx = self.pool.begin().await?;

        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO readings (
                    recording_id, gateway_host, gateway_port, unit,
                    table_id, register_addr, value, unix_timestamp
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            )
            .bind(&row.recording_id)
            .bind(&row.gateway_host)
            .bind(row.gateway_port)
            .bind(row.unit)
            .bind(row.table_id)
            .bind(row.register_addr)
            .bind(row.value)
            .bind(row.unix_timestamp)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(rows.len())
    }

    pub async fn get_recent_readings(&self, limit: i64, offset: i64) -> Result<Vec<ReadingRow>, ModbusError> {
        let rows = sqlx::query_as::<_, ReadingRow>(
            r#"
            SELECT * FROM readings
            ORDER BY unix_timestamp DESC, id DESC
            LIMIT ? OFFSET ?
        "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn get_recording_readings(
        &self,
        recording_id: &str,
        limit: Option<i64>,
    ) -> Result<Vec<ReadingRow>, ModbusError> {
        let rows = sqlx::query_as::<_, ReadingRow>(
            r#"
            SELECT * FROM readings
            WHERE recording_id = ?
            ORDER BY unix_timestamp ASC, id ASC
            LIMIT ?
        "#,
        )
        .bind(recording_id)
        // SQLite treats a negative limit as no limit
        .bind(limit.unwrap_or(-1))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn get_stats(&self, recording_id: Option<&str>) -> Result<ReadingStats, ModbusError> {
        let stats = sqlx::query_as::<_, ReadingStats>(
            r#"
            SELECT
                COUNT(*) as total_readings,
                COUNT(DISTINCT recording_id) as recordings,
                COUNT(DISTINCT gateway_host || ':' || gateway_port || '/' || unit || '/' || table_id) as tables,
                MAX(unix_timestamp) as latest_timestamp,
                MIN(unix_timestamp) as earliest_timestamp
            FROM readings
            WHERE ?1 IS NULL OR recording_id = ?1
        "#,
        )
        .bind(recording_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(stats)
    }

    /// Deletes readings older than `hours_to_keep`. Returns how many rows went.
    pub async fn cleanup_old_data(&self, hours_to_keep: u64) -> Result<u64, ModbusError> {
        let keep_secs = i64::try_from(hours_to_keep.saturating_mul(3600)).unwrap_or(i64::MAX);
        let cutoff_timestamp = Utc::now().timestamp().saturating_sub(keep_secs);

        let result = sqlx::query("DELETE FROM readings WHERE unix_timestamp < ?")
            .bind(cutoff_timestamp)
            .execute(&self.pool)
            .await?;

        info!("🧹 Cleaned up {} old readings", result.rows_affected());
        Ok(result.rows_affected())
    }

    pub async fn close(&self) {
        info!("🔒 Closing SQLite database connections");
        self.pool.close().await;
    }
}
