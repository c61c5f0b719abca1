//! Cached token prices in the local store.
//!
//! Entries are append-only: a newer price for the same `(token, block)` is a new row with a
//! later `inserted_at`, and reads pick the latest one.

use crate::address::{normalize, NormalizedAddress};
use crate::database::{LocalStore, SqlValue};
use crate::errors::CoreError;
use crate::result_count::ResultCountLogger;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::str::FromStr;

pub const PRICE_SCHEMA: [&str; 2] = [
    "CREATE TABLE IF NOT EXISTS price (
        chain_id INTEGER NOT NULL,
        token TEXT NOT NULL,
        block INTEGER NOT NULL,
        price TEXT NOT NULL,
        inserted_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS price_token_block ON price (chain_id, token, block)",
];

/// One cached price.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub token: NormalizedAddress,
    pub block: u64,
    pub price: Decimal,
    pub inserted_at: DateTime<Utc>,
}

impl CacheEntry {
    fn from_row(row: &SqliteRow, operation: &str) -> Result<Self, CoreError> {
        let rejected = |reason: String| CoreError::StoreRejected {
            operation: operation.to_string(),
            reason,
        };
        let decode = |e: sqlx::Error| crate::database::classify(operation, e);

        let token: String = row.try_get("token").map_err(decode)?;
        let block: i64 = row.try_get("block").map_err(decode)?;
        let price: String = row.try_get("price").map_err(decode)?;
        let inserted_at: i64 = row.try_get("inserted_at").map_err(decode)?;

        Ok(Self {
            token: normalize(token.as_str())
                .map_err(|e| rejected(format!("stored token: {}", e)))?,
            block: u64::try_from(block).map_err(|_| rejected(format!("negative block {}", block)))?,
            price: Decimal::from_str(&price)
                .map_err(|e| rejected(format!("stored price {:?}: {}", price, e)))?,
            inserted_at: Utc
                .timestamp_micros(inserted_at)
                .single()
                .ok_or_else(|| rejected(format!("bad timestamp {}", inserted_at)))?,
        })
    }
}

fn integer_value(operation: &str, column: &str, value: u64) -> Result<SqlValue, CoreError> {
    i64::try_from(value)
        .map(SqlValue::Integer)
        .map_err(|_| CoreError::StoreRejected {
            operation: operation.to_string(),
            reason: format!("{} {} out of range", column, value),
        })
}

#[derive(Clone)]
pub struct PriceCache {
    store: LocalStore,
    chain_id: u64,
    logger: ResultCountLogger,
}

impl PriceCache {
    pub fn new(store: LocalStore, chain_id: u64) -> Self {
        Self {
            store: store.with_schema(PRICE_SCHEMA),
            chain_id,
            logger: ResultCountLogger::new(chain_id),
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Latest entry for `token` at `block`, if any.
    pub async fn get_entry(
        &self,
        token: NormalizedAddress,
        block: u64,
    ) -> Result<Option<CacheEntry>, CoreError> {
        let args = vec![
            integer_value("get_price", "chain_id", self.chain_id)?,
            SqlValue::Text(token.to_lower_hex()),
            integer_value("get_price", "block", block)?,
        ];
        let read = self.store.with_cursor(move |cursor| {
            Box::pin(async move {
                let row = cursor
                    .fetchone(
                        "SELECT token, block, price, inserted_at FROM price
                         WHERE chain_id = ? AND token = ? AND block = ?
                         ORDER BY inserted_at DESC, rowid DESC LIMIT 1",
                        &args,
                    )
                    .await?;
                row.as_ref()
                    .map(|r| CacheEntry::from_row(r, "get_price"))
                    .transpose()
            })
        });

        self.logger
            .wrap("get_price", || format!("token={} block={}", token, block), read)
            .await
    }

    pub async fn get_price(
        &self,
        token: NormalizedAddress,
        block: u64,
    ) -> Result<Option<Decimal>, CoreError> {
        Ok(self.get_entry(token, block).await?.map(|e| e.price))
    }

    /// Appends a new entry, superseding any earlier one for the same token and block.
    pub async fn set_price(
        &self,
        token: NormalizedAddress,
        block: u64,
        price: Decimal,
    ) -> Result<CacheEntry, CoreError> {
        let inserted_at = Utc::now();
        let values = vec![
            ("chain_id", integer_value("set_price", "chain_id", self.chain_id)?),
            ("token", SqlValue::Text(token.to_lower_hex())),
            ("block", integer_value("set_price", "block", block)?),
            ("price", SqlValue::Text(price.to_string())),
            ("inserted_at", SqlValue::Integer(inserted_at.timestamp_micros())),
        ];
        self.store
            .with_cursor(move |cursor| {
                Box::pin(async move { cursor.insert("price", &values).await })
            })
            .await?;

        Ok(CacheEntry {
            token,
            block,
            price,
            inserted_at,
        })
    }

    /// Every cached entry for `token`, oldest block first.
    pub async fn history(&self, token: NormalizedAddress) -> Result<Vec<CacheEntry>, CoreError> {
        let args = vec![
            integer_value("history", "chain_id", self.chain_id)?,
            SqlValue::Text(token.to_lower_hex()),
        ];
        let read = self.store.with_cursor(move |cursor| {
            Box::pin(async move {
                let rows = cursor
                    .fetchall(
                        "SELECT token, block, price, inserted_at FROM price
                         WHERE chain_id = ? AND token = ?
                         ORDER BY block ASC, inserted_at ASC, rowid ASC",
                        &args,
                    )
                    .await?;
                rows.iter()
                    .map(|r| CacheEntry::from_row(r, "history"))
                    .collect::<Result<Vec<_>, _>>()
            })
        });

        self.logger
            .wrap("history", || format!("token={}", token), read)
            .await
    }
}
