use anyhow::{Context, Result};
use rusqlite::Connection;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Cloneable handle to the SQLite store.
///
/// The connection lock is only ever taken inside synchronous closures, never
/// across an `.await`.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(db_path: &str) -> Result<Self> {
        let db_path = db_path.strip_prefix("sqlite:").unwrap_or(db_path);
        let conn = Connection::open(db_path).context("Failed to open database")?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        create_tables(&conn)?;
        Ok(Database {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        f(&conn)
    }

    /// Runs `f` inside a single transaction, committing only on success.
    pub fn transaction<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }
}

fn create_tables(conn: &Connection) -> Result<()> {
    conn.busy_timeout(Duration::from_secs(5))?;

    // Token ids are stored zero-padded so lexical order matches numeric order
    conn.execute(
        "CREATE TABLE IF NOT EXISTS tokens (
            contract_address TEXT NOT NULL,
            token_id TEXT NOT NULL,
            owner_address TEXT,
            token_uri TEXT,
            last_transfer_block INTEGER,
            last_transfer_tx_hash TEXT,
            last_transfer_log_index INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            last_synced_block INTEGER NOT NULL,
            last_synced_at INTEGER NOT NULL,
            UNIQUE (contract_address, token_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS transfers (
            transaction_hash TEXT NOT NULL,
            log_index INTEGER NOT NULL,
            contract_address TEXT NOT NULL,
            token_id TEXT NOT NULL,
            from_address TEXT NOT NULL,
            to_address TEXT NOT NULL,
            block_number INTEGER NOT NULL,
            block_hash TEXT NOT NULL,
            block_timestamp INTEGER,
            transaction_index INTEGER NOT NULL,
            processed_at INTEGER NOT NULL,
            PRIMARY KEY (transaction_hash, log_index)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sync_state (
            contract_address TEXT PRIMARY KEY,
            sync_type TEXT NOT NULL,
            start_block INTEGER NOT NULL,
            current_block INTEGER NOT NULL,
            finalized_to_block INTEGER NOT NULL,
            head_block INTEGER NOT NULL,
            tokens_discovered INTEGER NOT NULL DEFAULT 0,
            tokens_enriched INTEGER NOT NULL DEFAULT 0,
            transfers_count INTEGER NOT NULL DEFAULT 0,
            started_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            completed_at INTEGER,
            confirmations INTEGER NOT NULL,
            batch_size INTEGER NOT NULL,
            error_count INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tokens_owner
         ON tokens(contract_address, owner_address)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_transfers_block_number
         ON transfers(contract_address, block_number)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_transfers_token
         ON transfers(contract_address, token_id, block_number)",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_creation_is_idempotent() -> Result<()> {
        let db = Database::in_memory()?;
        db.with_conn(create_tables)?;

        let tables: i64 = db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master
                 WHERE type = 'table' AND name IN ('tokens', 'transfers', 'sync_state')",
                [],
                |row| row.get(0),
            )?)
        })?;
        assert_eq!(tables, 3);
        Ok(())
    }

    #[test]
    fn failed_transaction_rolls_back() -> Result<()> {
        let db = Database::in_memory()?;
        let result: Result<()> = db.transaction(|conn| {
            conn.execute(
                "INSERT INTO sync_state (contract_address, sync_type, start_block, current_block,
                    finalized_to_block, head_block, started_at, updated_at, confirmations, batch_size)
                 VALUES ('0xabc', 'full', 0, 0, 0, 0, 0, 0, 20, 1000)",
                [],
            )?;
            anyhow::bail!("abort")
        });
        assert!(result.is_err());

        let rows: i64 = db.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM sync_state", [], |row| row.get(0))?)
        })?;
        assert_eq!(rows, 0);
        Ok(())
    }
}
