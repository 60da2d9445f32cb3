use super::models::{
    TransferEvent, column_address, column_hash, column_token_id, format_address, format_hash,
    from_timestamp, pad_token_id, to_timestamp,
};
use alloy_primitives::{Address, B256, U256};
use anyhow::Result;
use rusqlite::{OptionalExtension, Row, ToSql, params, params_from_iter};

pub struct TransferRepository<'a> {
    conn: &'a rusqlite::Connection,
}

impl<'a> TransferRepository<'a> {
    // The (transaction_hash, log_index) key makes replays a no-op
    const INSERT_TRANSFER: &'static str = "INSERT OR IGNORE INTO transfers (
            transaction_hash, log_index, contract_address, token_id, from_address,
            to_address, block_number, block_hash, block_timestamp, transaction_index,
            processed_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)";

    const SELECT_TRANSFER: &'static str = "SELECT transaction_hash, log_index, contract_address,
            token_id, from_address, to_address, block_number, block_hash, block_timestamp,
            transaction_index, processed_at
         FROM transfers";

    const ORDER_BY_POSITION: &'static str = " ORDER BY block_number, log_index";

    pub fn new(conn: &'a rusqlite::Connection) -> Self {
        Self { conn }
    }

    pub fn insert_batch(&self, transfers: &[TransferEvent]) -> Result<usize> {
        let mut stmt = self.conn.prepare_cached(Self::INSERT_TRANSFER)?;
        let mut count = 0;

        for transfer in transfers {
            count += stmt.execute(params![
                format_hash(&transfer.transaction_hash),
                transfer.log_index,
                format_address(&transfer.contract_address),
                pad_token_id(&transfer.token_id),
                format_address(&transfer.from_address),
                format_address(&transfer.to_address),
                transfer.block_number,
                format_hash(&transfer.block_hash),
                transfer.block_timestamp,
                transfer.transaction_index,
                to_timestamp(&transfer.processed_at),
            ])?;
        }

        Ok(count)
    }

    /// Distinct (block number, block hash) pairs recorded in `[from, to]`.
    pub fn block_hashes_in_range(
        &self,
        contract: &Address,
        from: u64,
        to: u64,
    ) -> Result<Vec<(u64, B256)>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT block_number, block_hash FROM transfers
             WHERE contract_address = ?1 AND block_number BETWEEN ?2 AND ?3
             ORDER BY block_number",
        )?;
        let blocks = stmt
            .query_map(params![format_address(contract), from, to], |row| {
                Ok((row.get::<_, u64>(0)?, column_hash(row, 1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(blocks)
    }

    pub fn token_ids_from_block(&self, contract: &Address, from_block: u64) -> Result<Vec<U256>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT token_id FROM transfers
             WHERE contract_address = ?1 AND block_number >= ?2
             ORDER BY token_id",
        )?;
        let ids = stmt
            .query_map(params![format_address(contract), from_block], |row| {
                column_token_id(row, 0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn delete_from_block(&self, contract: &Address, from_block: u64) -> Result<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM transfers WHERE contract_address = ?1 AND block_number >= ?2",
            params![format_address(contract), from_block],
        )?;
        Ok(deleted)
    }

    /// Most recent transfer of `token_id` strictly before `block`.
    pub fn latest_before(
        &self,
        contract: &Address,
        token_id: &U256,
        block: u64,
    ) -> Result<Option<TransferEvent>> {
        let query = format!(
            "{} WHERE contract_address = ?1 AND token_id = ?2 AND block_number < ?3
             ORDER BY block_number DESC, log_index DESC LIMIT 1",
            Self::SELECT_TRANSFER
        );
        let transfer = self
            .conn
            .query_row(
                &query,
                params![format_address(contract), pad_token_id(token_id), block],
                Self::row_to_transfer,
            )
            .optional()?;
        Ok(transfer)
    }

    pub fn count(&self, contract: &Address) -> Result<u64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM transfers WHERE contract_address = ?1",
            params![format_address(contract)],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn query_transfers(
        &self,
        contract: &Address,
        token_id: Option<&U256>,
        address: Option<&Address>,
        block_range: Option<(u64, u64)>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TransferEvent>> {
        let mut conditions = vec!["contract_address = ?"];
        let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(format_address(contract))];

        if let Some(token_id) = token_id {
            conditions.push("token_id = ?");
            params.push(Box::new(pad_token_id(token_id)));
        }

        if let Some(address) = address {
            let address_str = format_address(address);
            conditions.push("(from_address = ? OR to_address = ?)");
            params.push(Box::new(address_str.clone()));
            params.push(Box::new(address_str));
        }

        if let Some((start, end)) = block_range {
            conditions.push("block_number >= ?");
            params.push(Box::new(start));
            conditions.push("block_number <= ?");
            params.push(Box::new(end));
        }

        self.execute_paginated_query(conditions, params, limit, offset)
    }

    pub fn get_statistics(&self, contract: &Address) -> Result<TransferStats> {
        let contract = format_address(contract);

        let (total_transfers, unique_tokens, earliest_block, latest_block) = self.conn.query_row(
            "SELECT COUNT(*), COUNT(DISTINCT token_id), MIN(block_number), MAX(block_number)
             FROM transfers WHERE contract_address = ?1",
            params![contract],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

        let unique_addresses: u64 = self.conn.query_row(
            "SELECT COUNT(DISTINCT address) FROM (
                SELECT from_address AS address FROM transfers WHERE contract_address = ?1
                UNION
                SELECT to_address AS address FROM transfers WHERE contract_address = ?1
            )",
            params![contract],
            |row| row.get(0),
        )?;

        Ok(TransferStats {
            total_transfers,
            unique_tokens,
            unique_addresses,
            earliest_block,
            latest_block,
        })
    }

    fn execute_paginated_query(
        &self,
        conditions: Vec<&str>,
        params: Vec<Box<dyn ToSql>>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TransferEvent>> {
        let mut query = Self::SELECT_TRANSFER.to_string();

        if !conditions.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&conditions.join(" AND "));
        }

        query.push_str(Self::ORDER_BY_POSITION);
        query.push_str(&format!(" LIMIT {limit} OFFSET {offset}"));

        let mut stmt = self.conn.prepare(&query)?;
        let transfers = stmt
            .query_map(params_from_iter(params), Self::row_to_transfer)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(transfers)
    }

    fn row_to_transfer(row: &Row) -> rusqlite::Result<TransferEvent> {
        Ok(TransferEvent {
            transaction_hash: column_hash(row, 0)?,
            log_index: row.get(1)?,
            contract_address: column_address(row, 2)?,
            token_id: column_token_id(row, 3)?,
            from_address: column_address(row, 4)?,
            to_address: column_address(row, 5)?,
            block_number: row.get(6)?,
            block_hash: column_hash(row, 7)?,
            block_timestamp: row.get(8)?,
            transaction_index: row.get(9)?,
            processed_at: from_timestamp(row.get(10)?),
        })
    }
}

#[derive(Debug, serde::Serialize)]
pub struct TransferStats {
    pub total_transfers: u64,
    pub unique_tokens: u64,
    pub unique_addresses: u64,
    pub earliest_block: Option<u64>,
    pub latest_block: Option<u64>,
}
