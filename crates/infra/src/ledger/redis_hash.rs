//! Redis-backed stock ledger (feature `redis`).
//!
//! Stock lives in a single hash (`field = sku`, `value = quantity`). The conditional
//! decrement runs as a Lua script, which Redis executes without interleaving any other
//! command, so check-and-write is atomic across every client.
//!
//! Script return codes: `>= 0` new quantity, `-1` insufficient (or unknown SKU),
//! `-2` stored value is not a non-negative integer.

use std::sync::Arc;

use tracing::instrument;

use stockflow_core::Sku;
use stockflow_inventory::{DecrementError, LedgerError, StockLedger, validate_decrement};

/// Default hash key holding stock levels.
pub const DEFAULT_STOCK_KEY: &str = crate::config::DEFAULT_STOCK_HASH_KEY;

const DECREMENT_SCRIPT: &str = r#"
local raw = redis.call('HGET', KEYS[1], ARGV[1])
if not raw then
    return -1
end
local current = tonumber(raw)
if not current or current < 0 or current % 1 ~= 0 then
    return -2
end
local requested = tonumber(ARGV[2])
if current < requested then
    return -1
end
return redis.call('HINCRBY', KEYS[1], ARGV[1], -requested)
"#;

const INSUFFICIENT: i64 = -1;
const CORRUPT: i64 = -2;

#[derive(Debug, Clone)]
pub struct RedisStockLedger {
    client: Arc<redis::Client>,
    stock_key: String,
    script: Arc<redis::Script>,
}

impl RedisStockLedger {
    pub fn new(redis_url: impl AsRef<str>, stock_key: Option<String>) -> Result<Self, LedgerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| LedgerError::InvalidRequest(format!("invalid redis url: {e}")))?;

        Ok(Self {
            client: Arc::new(client),
            stock_key: stock_key.unwrap_or_else(|| DEFAULT_STOCK_KEY.to_string()),
            script: Arc::new(redis::Script::new(DECREMENT_SCRIPT)),
        })
    }

    pub fn stock_key(&self) -> &str {
        &self.stock_key
    }

    fn connection(&self) -> Result<redis::Connection, LedgerError> {
        self.client.get_connection().map_err(map_redis_error)
    }

    /// Provision stock for a SKU. Not used by settlement.
    pub fn set_quantity(&self, sku: &Sku, quantity: u64) -> Result<(), LedgerError> {
        let mut conn = self.connection()?;
        let _: i64 = redis::cmd("HSET")
            .arg(&self.stock_key)
            .arg(sku.as_str())
            .arg(quantity)
            .query(&mut conn)
            .map_err(map_redis_error)?;
        Ok(())
    }
}

impl StockLedger for RedisStockLedger {
    #[instrument(skip(self), fields(sku = %sku, stock_key = %self.stock_key))]
    fn decrement(&self, sku: &Sku, quantity: u32) -> Result<u64, DecrementError> {
        validate_decrement(quantity)?;
        let mut conn = self.connection()?;

        let result: i64 = self
            .script
            .key(&self.stock_key)
            .arg(sku.as_str())
            .arg(quantity)
            .invoke(&mut conn)
            .map_err(map_redis_error)?;

        match result {
            INSUFFICIENT => Err(DecrementError::InsufficientStock {
                sku: sku.clone(),
                requested: quantity,
            }),
            CORRUPT => Err(LedgerError::Corrupt {
                sku: sku.clone(),
                detail: "stored quantity is not a non-negative integer".to_string(),
            }
            .into()),
            remaining => u64::try_from(remaining).map_err(|_| {
                DecrementError::from(LedgerError::Corrupt {
                    sku: sku.clone(),
                    detail: format!("script returned {remaining}"),
                })
            }),
        }
    }

    #[instrument(skip(self), fields(sku = %sku))]
    fn quantity(&self, sku: &Sku) -> Result<Option<u64>, LedgerError> {
        let mut conn = self.connection()?;
        let raw: Option<String> = redis::cmd("HGET")
            .arg(&self.stock_key)
            .arg(sku.as_str())
            .query(&mut conn)
            .map_err(map_redis_error)?;

        raw.map(|v| {
            v.parse::<u64>().map_err(|_| LedgerError::Corrupt {
                sku: sku.clone(),
                detail: format!("stored quantity {v:?}"),
            })
        })
        .transpose()
    }
}

fn map_redis_error(err: redis::RedisError) -> LedgerError {
    if err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_timeout()
    {
        LedgerError::Unavailable(err.to_string())
    } else {
        LedgerError::Backend(err.to_string())
    }
}
