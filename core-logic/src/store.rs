//! # Transaction Store
//!
//! SQLite persistence for spam runs. One database file holds:
//!
//! - `transactions` - global cache of transaction bodies (hash => trytes), shared by all runs
//! - `runs` - one row per run, keyed by the run start timestamp
//! - `sent` / `unconfirmed` - per-run record of broadcast transactions
//! - `logs` - per-run free-form log lines
//!
//! [`RunLedger`] binds a store to one run and degrades every operation to a
//! no-op when no store is configured, so the engine never has to branch on it.

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{ConfigError, DatabaseError};

/// A transaction body as the store sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTransaction {
    pub hash: String,
    pub trytes: String,
}

#[derive(Debug)]
pub struct TxStore {
    pool: SqlitePool,
    total_queries: AtomicU64,
    total_errors: AtomicU64,
}

/// Timestamp format used for run keys and row timestamps.
pub fn timestamp_key() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

impl TxStore {
    pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;
    pub const DEFAULT_TIMEOUT_MS: u64 = 30000;

    pub async fn new(db_path: &str) -> Result<Self> {
        if !Path::new(db_path).exists() {
            std::fs::File::create(db_path).map_err(|e| ConfigError::IoError {
                path: db_path.to_string(),
                msg: e.to_string(),
            })?;
            info!("Created new database file: {}", db_path);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(Self::DEFAULT_MAX_CONNECTIONS)
            .acquire_timeout(Duration::from_millis(Self::DEFAULT_TIMEOUT_MS))
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("PRAGMA journal_mode=WAL;")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA synchronous=NORMAL;")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(&format!("sqlite://{}", db_path))
            .await
            .map_err(|e| DatabaseError::TransactionFailed { msg: e.to_string() })?;

        let store = Self {
            pool,
            total_queries: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS transactions (
                hash TEXT PRIMARY KEY,
                trytes TEXT NOT NULL
            );",
            "CREATE TABLE IF NOT EXISTS runs (
                run_key TEXT PRIMARY KEY,
                started_at INTEGER NOT NULL
            );",
            "CREATE TABLE IF NOT EXISTS sent (
                run_key TEXT NOT NULL,
                hash TEXT NOT NULL,
                sent_at TEXT NOT NULL,
                PRIMARY KEY (run_key, hash)
            );",
            "CREATE TABLE IF NOT EXISTS unconfirmed (
                run_key TEXT NOT NULL,
                hash TEXT NOT NULL,
                sent_at TEXT NOT NULL,
                PRIMARY KEY (run_key, hash)
            );",
            "CREATE TABLE IF NOT EXISTS logs (
                id INTEGER PRIMARY KEY,
                run_key TEXT NOT NULL,
                logged_at TEXT NOT NULL,
                message TEXT NOT NULL
            );",
            "CREATE INDEX IF NOT EXISTS idx_logs_run ON logs(run_key);",
        ];

        for sql in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| DatabaseError::MigrationFailed { msg: e.to_string() })?;
        }

        debug!("Transaction store schema initialized");
        Ok(())
    }

    /// Registers a run. Re-opening an existing run key is harmless.
    pub async fn new_run(&self, run_key: &str) -> Result<()> {
        let result = sqlx::query("INSERT OR IGNORE INTO runs (run_key, started_at) VALUES (?, ?)")
            .bind(run_key)
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await;
        self.track(result.is_ok());
        result.context("Failed to create run")?;
        Ok(())
    }

    pub async fn log(&self, run_key: &str, message: &str) -> Result<()> {
        let result =
            sqlx::query("INSERT INTO logs (run_key, logged_at, message) VALUES (?, ?, ?)")
                .bind(run_key)
                .bind(timestamp_key())
                .bind(message)
                .execute(&self.pool)
                .await;
        self.track(result.is_ok());
        result.context("Failed to write run log")?;
        Ok(())
    }

    /// Looks up cached bodies. The result is aligned with `hashes`; misses are `None`.
    pub async fn get_transactions(&self, hashes: &[String]) -> Result<Vec<Option<String>>> {
        let mut output = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let row = sqlx::query_as::<_, (String,)>(
                "SELECT trytes FROM transactions WHERE hash = ?",
            )
            .bind(hash)
            .fetch_optional(&self.pool)
            .await;
            self.track(row.is_ok());
            output.push(row.context("Failed to load cached transaction")?.map(|r| r.0));
        }
        Ok(output)
    }

    /// Caches transaction bodies. Storing the same hash again overwrites it with
    /// the identical body.
    pub async fn store_transactions(&self, txs: &[StoredTransaction]) -> Result<()> {
        if txs.is_empty() {
            return Ok(());
        }
        let result = self.insert_transactions(txs).await;
        self.track(result.is_ok());
        result
    }

    async fn insert_transactions(&self, txs: &[StoredTransaction]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for stored in txs {
            sqlx::query("INSERT OR REPLACE INTO transactions (hash, trytes) VALUES (?, ?)")
                .bind(&stored.hash)
                .bind(&stored.trytes)
                .execute(&mut *tx)
                .await
                .context("Failed to cache transaction")?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Records a broadcast bundle: caches the bodies and adds every hash to the
    /// run's `sent` and `unconfirmed` sets in one database transaction.
    pub async fn log_sent_transactions(
        &self,
        run_key: &str,
        txs: &[StoredTransaction],
    ) -> Result<()> {
        if txs.is_empty() {
            return Ok(());
        }
        let result = self.insert_sent(run_key, txs).await;
        self.track(result.is_ok());
        result
    }

    async fn insert_sent(&self, run_key: &str, txs: &[StoredTransaction]) -> Result<()> {
        let sent_at = timestamp_key();
        let mut tx = self.pool.begin().await?;

        for stored in txs {
            sqlx::query("INSERT OR REPLACE INTO transactions (hash, trytes) VALUES (?, ?)")
                .bind(&stored.hash)
                .bind(&stored.trytes)
                .execute(&mut *tx)
                .await?;
            sqlx::query("INSERT OR REPLACE INTO sent (run_key, hash, sent_at) VALUES (?, ?, ?)")
                .bind(run_key)
                .bind(&stored.hash)
                .bind(&sent_at)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "INSERT OR REPLACE INTO unconfirmed (run_key, hash, sent_at) VALUES (?, ?, ?)",
            )
            .bind(run_key)
            .bind(&stored.hash)
            .bind(&sent_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await.context("Failed to record sent transactions")?;
        Ok(())
    }

    pub async fn unconfirmed_hashes(&self, run_key: &str) -> Result<Vec<String>> {
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT hash FROM unconfirmed WHERE run_key = ? ORDER BY sent_at, hash",
        )
        .bind(run_key)
        .fetch_all(&self.pool)
        .await;
        self.track(rows.is_ok());
        Ok(rows
            .context("Failed to query unconfirmed transactions")?
            .into_iter()
            .map(|r| r.0)
            .collect())
    }

    pub async fn sent_hashes(&self, run_key: &str) -> Result<Vec<String>> {
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT hash FROM sent WHERE run_key = ? ORDER BY sent_at, hash",
        )
        .bind(run_key)
        .fetch_all(&self.pool)
        .await;
        self.track(rows.is_ok());
        Ok(rows
            .context("Failed to query sent transactions")?
            .into_iter()
            .map(|r| r.0)
            .collect())
    }

    pub async fn sent_count(&self, run_key: &str) -> Result<u64> {
        let row = sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM sent WHERE run_key = ?")
            .bind(run_key)
            .fetch_one(&self.pool)
            .await;
        self.track(row.is_ok());
        let (count,) = row.context("Failed to count sent transactions")?;
        Ok(count.max(0) as u64)
    }

    /// Drops hashes from the run's unconfirmed set. Unknown hashes are ignored.
    pub async fn remove_confirmed_transactions(
        &self,
        run_key: &str,
        hashes: &[String],
    ) -> Result<()> {
        if hashes.is_empty() {
            return Ok(());
        }
        let result = self.delete_unconfirmed(run_key, hashes).await;
        self.track(result.is_ok());
        result
    }

    async fn delete_unconfirmed(&self, run_key: &str, hashes: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for hash in hashes {
            sqlx::query("DELETE FROM unconfirmed WHERE run_key = ? AND hash = ?")
                .bind(run_key)
                .bind(hash)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit()
            .await
            .context("Failed to remove confirmed transactions")?;
        Ok(())
    }

    pub async fn run_logs(&self, run_key: &str) -> Result<Vec<String>> {
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT message FROM logs WHERE run_key = ? ORDER BY id",
        )
        .bind(run_key)
        .fetch_all(&self.pool)
        .await;
        self.track(rows.is_ok());
        Ok(rows
            .context("Failed to query run logs")?
            .into_iter()
            .map(|r| r.0)
            .collect())
    }

    /// (queries, errors) since the store was opened.
    pub fn query_stats(&self) -> (u64, u64) {
        (
            self.total_queries.load(Ordering::SeqCst),
            self.total_errors.load(Ordering::SeqCst),
        )
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn track(&self, success: bool) {
        self.total_queries.fetch_add(1, Ordering::SeqCst);
        if !success {
            self.total_errors.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// A store bound to one run. Without a store every read is empty and every
/// write is a no-op.
#[derive(Debug, Clone)]
pub struct RunLedger {
    store: Option<Arc<TxStore>>,
    run_key: String,
}

impl RunLedger {
    pub fn new(store: Option<Arc<TxStore>>, run_key: impl Into<String>) -> Self {
        Self {
            store,
            run_key: run_key.into(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, timestamp_key())
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub fn run_key(&self) -> &str {
        &self.run_key
    }

    pub async fn open(&self) -> Result<()> {
        match &self.store {
            Some(store) => store.new_run(&self.run_key).await,
            None => Ok(()),
        }
    }

    pub async fn log(&self, message: &str) -> Result<()> {
        match &self.store {
            Some(store) => store.log(&self.run_key, message).await,
            None => Ok(()),
        }
    }

    pub async fn get_transactions(&self, hashes: &[String]) -> Result<Vec<Option<String>>> {
        match &self.store {
            Some(store) => store.get_transactions(hashes).await,
            None => Ok(vec![None; hashes.len()]),
        }
    }

    pub async fn store_transactions(&self, txs: &[StoredTransaction]) -> Result<()> {
        match &self.store {
            Some(store) => store.store_transactions(txs).await,
            None => Ok(()),
        }
    }

    pub async fn log_sent_transactions(&self, txs: &[StoredTransaction]) -> Result<()> {
        match &self.store {
            Some(store) => store.log_sent_transactions(&self.run_key, txs).await,
            None => Ok(()),
        }
    }

    pub async fn unconfirmed_hashes(&self) -> Result<Vec<String>> {
        match &self.store {
            Some(store) => store.unconfirmed_hashes(&self.run_key).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn sent_hashes(&self) -> Result<Vec<String>> {
        match &self.store {
            Some(store) => store.sent_hashes(&self.run_key).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn sent_count(&self) -> Result<u64> {
        match &self.store {
            Some(store) => store.sent_count(&self.run_key).await,
            None => Ok(0),
        }
    }

    pub async fn remove_confirmed_transactions(&self, hashes: &[String]) -> Result<()> {
        match &self.store {
            Some(store) => {
                store
                    .remove_confirmed_transactions(&self.run_key, hashes)
                    .await
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(hash: &str) -> StoredTransaction {
        StoredTransaction {
            hash: hash.to_string(),
            trytes: format!("{}BODY", hash),
        }
    }

    #[tokio::test]
    async fn test_disabled_ledger_is_inert() {
        let ledger = RunLedger::disabled();
        assert!(!ledger.is_enabled());
        ledger.open().await.unwrap();
        ledger.log("hello").await.unwrap();
        ledger
            .log_sent_transactions(&[stored("AAA")])
            .await
            .unwrap();

        let cached = ledger
            .get_transactions(&["AAA".to_string(), "BBB".to_string()])
            .await
            .unwrap();
        assert_eq!(cached, vec![None, None]);
        assert!(ledger.unconfirmed_hashes().await.unwrap().is_empty());
        assert_eq!(ledger.sent_count().await.unwrap(), 0);
        ledger
            .remove_confirmed_transactions(&["AAA".to_string()])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cache_hit_and_miss() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spam.db");
        let store = TxStore::new(path.to_str().unwrap()).await.unwrap();

        store
            .store_transactions(&[stored("AAA"), stored("AAA")])
            .await
            .unwrap();
        let found = store
            .get_transactions(&["BBB".to_string(), "AAA".to_string()])
            .await
            .unwrap();
        assert_eq!(found, vec![None, Some("AAABODY".to_string())]);
    }
}
