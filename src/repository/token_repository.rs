use super::models::{
    Token, TransferEvent, column_address, column_hash, column_token_id, format_address,
    format_hash, from_timestamp, pad_token_id, to_timestamp,
};
use alloy_primitives::{Address, U256};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, ToSql, params, params_from_iter};

/// Predicates accepted by token listing queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenFilter {
    Owner(Address),
    NotOwner(Address),
    /// Tokens whose transfers were all rolled back and await replay.
    Unsynced,
    /// Tokens backed by at least one accepted transfer.
    Synced,
    /// Tokens whose metadata URI has been fetched.
    Enriched,
}

impl TokenFilter {
    fn clause(&self) -> (&'static str, Option<Box<dyn ToSql>>) {
        match self {
            TokenFilter::Owner(owner) => ("owner_address = ?", Some(Self::param(owner))),
            TokenFilter::NotOwner(owner) => (
                "(owner_address IS NULL OR owner_address != ?)",
                Some(Self::param(owner)),
            ),
            TokenFilter::Unsynced => ("owner_address IS NULL", None),
            TokenFilter::Synced => ("owner_address IS NOT NULL", None),
            TokenFilter::Enriched => ("token_uri IS NOT NULL", None),
        }
    }

    fn param(address: &Address) -> Box<dyn ToSql> {
        Box::new(format_address(address))
    }
}

pub struct TokenRepository<'a> {
    conn: &'a rusqlite::Connection,
}

impl<'a> TokenRepository<'a> {
    const SELECT_TOKEN: &'static str = "SELECT contract_address, token_id, owner_address, token_uri,
            last_transfer_block, last_transfer_tx_hash, last_transfer_log_index,
            created_at, updated_at, last_synced_block, last_synced_at
         FROM tokens";

    // Only move ownership forward: an older transfer never overwrites a newer one
    const UPSERT_FROM_TRANSFER: &'static str = "INSERT INTO tokens (
            contract_address, token_id, owner_address, last_transfer_block,
            last_transfer_tx_hash, last_transfer_log_index, created_at, updated_at,
            last_synced_block, last_synced_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, ?4, ?7)
        ON CONFLICT (contract_address, token_id) DO UPDATE SET
            owner_address = excluded.owner_address,
            last_transfer_block = excluded.last_transfer_block,
            last_transfer_tx_hash = excluded.last_transfer_tx_hash,
            last_transfer_log_index = excluded.last_transfer_log_index,
            updated_at = excluded.updated_at,
            last_synced_block = excluded.last_synced_block,
            last_synced_at = excluded.last_synced_at
        WHERE tokens.last_transfer_block IS NULL
            OR (excluded.last_transfer_block, excluded.last_transfer_log_index)
                >= (tokens.last_transfer_block, tokens.last_transfer_log_index)";

    const EXISTS: &'static str =
        "SELECT 1 FROM tokens WHERE contract_address = ?1 AND token_id = ?2";

    const SET_TOKEN_URI: &'static str = "UPDATE tokens SET token_uri = ?1, updated_at = ?2
         WHERE contract_address = ?3 AND token_id = ?4";

    const RESTORE_FROM_TRANSFER: &'static str = "UPDATE tokens SET
            owner_address = ?1, last_transfer_block = ?2, last_transfer_tx_hash = ?3,
            last_transfer_log_index = ?4, last_synced_block = ?2, updated_at = ?5,
            last_synced_at = ?5
         WHERE contract_address = ?6 AND token_id = ?7";

    const MARK_UNSYNCED: &'static str = "UPDATE tokens SET
            owner_address = NULL, last_transfer_block = NULL, last_transfer_tx_hash = NULL,
            last_transfer_log_index = NULL, last_synced_block = ?1, updated_at = ?2
         WHERE contract_address = ?3 AND token_id = ?4";

    const UPDATE_OWNER: &'static str = "UPDATE tokens SET
            owner_address = ?1, last_synced_block = MAX(last_synced_block, ?2),
            updated_at = ?3, last_synced_at = ?3
         WHERE contract_address = ?4 AND token_id = ?5";

    pub fn new(conn: &'a rusqlite::Connection) -> Self {
        Self { conn }
    }

    /// Applies a transfer to its token. Returns true when the token row was
    /// created by this call.
    pub fn upsert_from_transfer(
        &self,
        transfer: &TransferEvent,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let contract = format_address(&transfer.contract_address);
        let token_id = pad_token_id(&transfer.token_id);

        let existed = self
            .conn
            .query_row(Self::EXISTS, params![contract, token_id], |_| Ok(()))
            .optional()?
            .is_some();

        self.conn.execute(
            Self::UPSERT_FROM_TRANSFER,
            params![
                contract,
                token_id,
                format_address(&transfer.to_address),
                transfer.block_number,
                format_hash(&transfer.transaction_hash),
                transfer.log_index,
                to_timestamp(&now),
            ],
        )?;

        Ok(!existed)
    }

    pub fn set_token_uri(&self, contract: &Address, token_id: &U256, uri: &str) -> Result<()> {
        self.conn.execute(
            Self::SET_TOKEN_URI,
            params![
                uri,
                to_timestamp(&Utc::now()),
                format_address(contract),
                pad_token_id(token_id)
            ],
        )?;
        Ok(())
    }

    /// Points the token back at a surviving transfer after a rollback.
    pub fn restore_from_transfer(&self, transfer: &TransferEvent) -> Result<()> {
        self.conn.execute(
            Self::RESTORE_FROM_TRANSFER,
            params![
                format_address(&transfer.to_address),
                transfer.block_number,
                format_hash(&transfer.transaction_hash),
                transfer.log_index,
                to_timestamp(&Utc::now()),
                format_address(&transfer.contract_address),
                pad_token_id(&transfer.token_id),
            ],
        )?;
        Ok(())
    }

    pub fn mark_unsynced(
        &self,
        contract: &Address,
        token_id: &U256,
        synced_block: u64,
    ) -> Result<()> {
        self.conn.execute(
            Self::MARK_UNSYNCED,
            params![
                synced_block,
                to_timestamp(&Utc::now()),
                format_address(contract),
                pad_token_id(token_id)
            ],
        )?;
        Ok(())
    }

    /// Drops unsynced tokens whose replay already passed `before_block`
    /// without any transfer reappearing.
    pub fn delete_unsynced_before(&self, contract: &Address, before_block: u64) -> Result<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM tokens
             WHERE contract_address = ?1 AND owner_address IS NULL AND last_synced_block < ?2",
            params![format_address(contract), before_block],
        )?;
        Ok(deleted)
    }

    pub fn update_owner(
        &self,
        contract: &Address,
        token_id: &U256,
        owner: &Address,
        synced_block: u64,
    ) -> Result<()> {
        self.conn.execute(
            Self::UPDATE_OWNER,
            params![
                format_address(owner),
                synced_block,
                to_timestamp(&Utc::now()),
                format_address(contract),
                pad_token_id(token_id)
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, contract: &Address, token_id: &U256) -> Result<Option<Token>> {
        let query = format!(
            "{} WHERE contract_address = ?1 AND token_id = ?2",
            Self::SELECT_TOKEN
        );
        let token = self
            .conn
            .query_row(
                &query,
                params![format_address(contract), pad_token_id(token_id)],
                Self::row_to_token,
            )
            .optional()?;
        Ok(token)
    }

    /// Store-side owner lookup for many tokens at once; unknown ids are absent.
    pub fn owners_of(
        &self,
        contract: &Address,
        token_ids: &[U256],
    ) -> Result<Vec<(U256, Option<Address>)>> {
        let mut stmt = self.conn.prepare(
            "SELECT token_id, owner_address FROM tokens
             WHERE contract_address = ?1 AND token_id = ?2",
        )?;
        let contract = format_address(contract);

        let mut owners = Vec::with_capacity(token_ids.len());
        for token_id in token_ids {
            let owner = stmt
                .query_row(params![contract, pad_token_id(token_id)], |row| {
                    row.get::<_, Option<String>>(1)
                })
                .optional()?;
            if let Some(owner) = owner {
                let owner = owner.map(|o| o.parse::<Address>()).transpose()?;
                owners.push((*token_id, owner));
            }
        }
        Ok(owners)
    }

    pub fn find(
        &self,
        contract: &Address,
        filters: &[TokenFilter],
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Token>> {
        let (where_clause, params) = Self::build_where(contract, filters);
        let query = format!(
            "{} {} ORDER BY token_id LIMIT {limit} OFFSET {offset}",
            Self::SELECT_TOKEN,
            where_clause
        );

        let mut stmt = self.conn.prepare(&query)?;
        let tokens = stmt
            .query_map(params_from_iter(params), Self::row_to_token)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tokens)
    }

    pub fn count(&self, contract: &Address, filters: &[TokenFilter]) -> Result<u64> {
        let (where_clause, params) = Self::build_where(contract, filters);
        let query = format!("SELECT COUNT(*) FROM tokens {where_clause}");
        let count = self
            .conn
            .query_row(&query, params_from_iter(params), |row| row.get(0))?;
        Ok(count)
    }

    /// Random sample of live (owned, not burned) tokens, used by verification.
    pub fn sample(&self, contract: &Address, size: usize) -> Result<Vec<Token>> {
        let query = format!(
            "{} WHERE contract_address = ?1 AND owner_address IS NOT NULL
                AND owner_address != ?2
             ORDER BY RANDOM() LIMIT ?3",
            Self::SELECT_TOKEN
        );
        let mut stmt = self.conn.prepare(&query)?;
        let tokens = stmt
            .query_map(
                params![format_address(contract), format_address(&Address::ZERO), size],
                Self::row_to_token,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tokens)
    }

    fn build_where(contract: &Address, filters: &[TokenFilter]) -> (String, Vec<Box<dyn ToSql>>) {
        let mut conditions = vec!["contract_address = ?"];
        let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(format_address(contract))];

        for filter in filters {
            let (clause, param) = filter.clause();
            conditions.push(clause);
            params.extend(param);
        }

        (format!("WHERE {}", conditions.join(" AND ")), params)
    }

    fn row_to_token(row: &Row) -> rusqlite::Result<Token> {
        let owner_address = row
            .get::<_, Option<String>>(2)?
            .map(|_| column_address(row, 2))
            .transpose()?;
        let last_transfer_tx_hash = row
            .get::<_, Option<String>>(5)?
            .map(|_| column_hash(row, 5))
            .transpose()?;

        Ok(Token {
            contract_address: column_address(row, 0)?,
            token_id: column_token_id(row, 1)?,
            owner_address,
            token_uri: row.get(3)?,
            last_transfer_block: row.get(4)?,
            last_transfer_tx_hash,
            last_transfer_log_index: row.get(6)?,
            created_at: from_timestamp(row.get(7)?),
            updated_at: from_timestamp(row.get(8)?),
            last_synced_block: row.get(9)?,
            last_synced_at: from_timestamp(row.get(10)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::Database;
    use alloy_primitives::{B256, address};

    const CONTRACT: Address = address!("0x00000000000000000000000000000000000000c1");
    const ALICE: Address = address!("0x000000000000000000000000000000000000000a");
    const BOB: Address = address!("0x000000000000000000000000000000000000000b");

    fn transfer(token_id: u64, to: Address, block: u64, log_index: u64) -> TransferEvent {
        TransferEvent {
            transaction_hash: B256::with_last_byte(block as u8),
            log_index,
            contract_address: CONTRACT,
            token_id: U256::from(token_id),
            from_address: Address::ZERO,
            to_address: to,
            block_number: block,
            block_hash: B256::repeat_byte(block as u8),
            block_timestamp: None,
            transaction_index: 0,
            processed_at: Utc::now(),
        }
    }

    #[test]
    fn upsert_reports_creation_once_and_never_regresses_owner() -> Result<()> {
        let db = Database::in_memory()?;
        db.with_conn(|conn| {
            let repo = TokenRepository::new(conn);
            assert!(repo.upsert_from_transfer(&transfer(1, ALICE, 100, 0), Utc::now())?);
            assert!(!repo.upsert_from_transfer(&transfer(1, BOB, 105, 2), Utc::now())?);
            // replaying the older mint must not move ownership back
            assert!(!repo.upsert_from_transfer(&transfer(1, ALICE, 100, 0), Utc::now())?);

            let token = repo.get(&CONTRACT, &U256::from(1))?.unwrap();
            assert_eq!(token.owner_address, Some(BOB));
            assert_eq!(token.last_transfer_block, Some(105));
            assert_eq!(repo.count(&CONTRACT, &[])?, 1);
            Ok(())
        })
    }

    #[test]
    fn filters_and_pagination() -> Result<()> {
        let db = Database::in_memory()?;
        db.with_conn(|conn| {
            let repo = TokenRepository::new(conn);
            for id in 1..=12u64 {
                let owner = if id % 3 == 0 { BOB } else { ALICE };
                repo.upsert_from_transfer(&transfer(id, owner, 100 + id, 0), Utc::now())?;
            }
            repo.mark_unsynced(&CONTRACT, &U256::from(12), 90)?;

            assert_eq!(repo.count(&CONTRACT, &[TokenFilter::Owner(BOB)])?, 3);
            assert_eq!(repo.count(&CONTRACT, &[TokenFilter::NotOwner(BOB)])?, 9);
            assert_eq!(repo.count(&CONTRACT, &[TokenFilter::Unsynced])?, 1);

            repo.set_token_uri(&CONTRACT, &U256::from(4), "ipfs://4")?;
            assert_eq!(repo.count(&CONTRACT, &[TokenFilter::Enriched])?, 1);

            let page = repo.find(&CONTRACT, &[TokenFilter::Owner(ALICE)], 3, 3)?;
            let ids: Vec<U256> = page.iter().map(|t| t.token_id).collect();
            assert_eq!(ids, vec![U256::from(5), U256::from(7), U256::from(8)]);

            let unsynced = repo.get(&CONTRACT, &U256::from(12))?.unwrap();
            assert_eq!(unsynced.owner_address, None);
            assert_eq!(unsynced.last_synced_block, 90);
            assert_eq!(repo.count(&CONTRACT, &[TokenFilter::Synced])?, 11);

            assert_eq!(repo.delete_unsynced_before(&CONTRACT, 90)?, 0);
            assert_eq!(repo.delete_unsynced_before(&CONTRACT, 91)?, 1);
            assert!(repo.get(&CONTRACT, &U256::from(12))?.is_none());
            assert_eq!(repo.count(&CONTRACT, &[])?, 11);
            Ok(())
        })
    }

    #[test]
    fn owners_of_skips_unknown_tokens() -> Result<()> {
        let db = Database::in_memory()?;
        db.with_conn(|conn| {
            let repo = TokenRepository::new(conn);
            repo.upsert_from_transfer(&transfer(1, ALICE, 100, 0), Utc::now())?;
            let owners = repo.owners_of(&CONTRACT, &[U256::from(1), U256::from(2)])?;
            assert_eq!(owners, vec![(U256::from(1), Some(ALICE))]);
            Ok(())
        })
    }
}
