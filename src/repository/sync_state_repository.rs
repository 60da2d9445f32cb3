use super::models::{SyncState, column_address, format_address, from_timestamp, to_timestamp};
use alloy_primitives::Address;
use anyhow::Result;
use rusqlite::{OptionalExtension, Row, params};

pub struct SyncStateRepository<'a> {
    conn: &'a rusqlite::Connection,
}

impl<'a> SyncStateRepository<'a> {
    const UPSERT_STATE: &'static str = "INSERT INTO sync_state (
            contract_address, sync_type, start_block, current_block, finalized_to_block,
            head_block, tokens_discovered, tokens_enriched, transfers_count, started_at,
            updated_at, completed_at, confirmations, batch_size, error_count
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
        ON CONFLICT (contract_address) DO UPDATE SET
            sync_type = excluded.sync_type,
            start_block = excluded.start_block,
            current_block = excluded.current_block,
            finalized_to_block = excluded.finalized_to_block,
            head_block = excluded.head_block,
            tokens_discovered = excluded.tokens_discovered,
            tokens_enriched = excluded.tokens_enriched,
            transfers_count = excluded.transfers_count,
            started_at = excluded.started_at,
            updated_at = excluded.updated_at,
            completed_at = excluded.completed_at,
            confirmations = excluded.confirmations,
            batch_size = excluded.batch_size,
            error_count = excluded.error_count";

    const GET_STATE: &'static str = "SELECT contract_address, sync_type, start_block,
            current_block, finalized_to_block, head_block, tokens_discovered, tokens_enriched,
            transfers_count, started_at, updated_at, completed_at, confirmations, batch_size,
            error_count
         FROM sync_state WHERE contract_address = ?1";

    pub fn new(conn: &'a rusqlite::Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self, contract: &Address) -> Result<Option<SyncState>> {
        let state = self
            .conn
            .query_row(
                Self::GET_STATE,
                params![format_address(contract)],
                Self::row_to_state,
            )
            .optional()?;
        Ok(state)
    }

    pub fn save(&self, state: &SyncState) -> Result<()> {
        self.conn.execute(
            Self::UPSERT_STATE,
            params![
                format_address(&state.contract_address),
                state.sync_type.as_str(),
                state.start_block,
                state.current_block,
                state.finalized_to_block,
                state.head_block,
                state.tokens_discovered,
                state.tokens_enriched,
                state.transfers_count,
                to_timestamp(&state.started_at),
                to_timestamp(&state.updated_at),
                state.completed_at.as_ref().map(to_timestamp),
                state.confirmations,
                state.batch_size,
                state.error_count,
            ],
        )?;
        Ok(())
    }

    fn row_to_state(row: &Row) -> rusqlite::Result<SyncState> {
        let sync_type = row
            .get::<_, String>(1)?
            .parse()
            .map_err(|e: anyhow::Error| {
                rusqlite::Error::FromSqlConversionFailure(
                    1,
                    rusqlite::types::Type::Text,
                    e.into(),
                )
            })?;

        Ok(SyncState {
            contract_address: column_address(row, 0)?,
            sync_type,
            start_block: row.get(2)?,
            current_block: row.get(3)?,
            finalized_to_block: row.get(4)?,
            head_block: row.get(5)?,
            tokens_discovered: row.get(6)?,
            tokens_enriched: row.get(7)?,
            transfers_count: row.get(8)?,
            started_at: from_timestamp(row.get(9)?),
            updated_at: from_timestamp(row.get(10)?),
            completed_at: row.get::<_, Option<i64>>(11)?.map(from_timestamp),
            confirmations: row.get(12)?,
            batch_size: row.get(13)?,
            error_count: row.get(14)?,
        })
    }
}
