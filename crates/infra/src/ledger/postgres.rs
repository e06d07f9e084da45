//! Postgres-backed stock ledger.
//!
//! The conditional decrement is a single statement:
//!
//! ```sql
//! UPDATE inventory_stock
//!    SET quantity = quantity - $2, version = version + 1, updated_at = now()
//!  WHERE sku = $1 AND quantity >= $2
//! RETURNING quantity
//! ```
//!
//! Postgres row locking makes the check and the write one step. No returned row means
//! the precondition failed (or the SKU does not exist), which is reported as
//! insufficient stock. The `CHECK (quantity >= 0)` constraint backs the invariant at
//! the storage level.
//!
//! ## Error Mapping
//!
//! | SQLx Error | LedgerError |
//! |------------|-------------|
//! | `PoolTimedOut`, `PoolClosed`, `Io`, `Tls`, `WorkerCrashed` | `Unavailable` (systemic) |
//! | `Database` (any code) | `Backend` |
//! | anything else | `Backend` |
//!
//! ## Sync bridge
//!
//! [`StockLedger`] is synchronous and the settlement loop runs on its own OS thread.
//! The ledger keeps a handle to the tokio runtime that owns the pool and blocks on it
//! for each call. Calling it from inside an async task would panic, so keep it on the
//! loop thread.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::{debug, instrument};

use stockflow_core::Sku;
use stockflow_inventory::{DecrementError, LedgerError, StockLedger, validate_decrement};

/// Schema for the stock table (idempotent).
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS inventory_stock (
    sku        TEXT PRIMARY KEY,
    quantity   BIGINT NOT NULL CHECK (quantity >= 0),
    version    BIGINT NOT NULL DEFAULT 0,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

/// Connect a pool with a bounded acquire timeout, so an unreachable database surfaces
/// as `LedgerError::Unavailable` instead of hanging the loop.
pub async fn connect(database_url: &str, acquire_timeout: Duration) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(4)
        .acquire_timeout(acquire_timeout)
        .connect(database_url)
        .await
}

#[derive(Debug, Clone)]
pub struct PostgresStockLedger {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresStockLedger {
    /// `runtime` must be the runtime the pool was created on.
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the stock table if it does not exist.
    pub async fn ensure_schema(&self) -> Result<(), LedgerError> {
        sqlx::query(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    /// Provision stock for a SKU (insert or overwrite). Not used by settlement.
    #[instrument(skip(self), fields(sku = %sku), err)]
    pub async fn set_quantity(&self, sku: &Sku, quantity: u64) -> Result<(), LedgerError> {
        let quantity = i64::try_from(quantity).map_err(|_| {
            LedgerError::InvalidRequest(format!("quantity {quantity} does not fit BIGINT"))
        })?;

        sqlx::query(
            r#"
            INSERT INTO inventory_stock (sku, quantity)
            VALUES ($1, $2)
            ON CONFLICT (sku) DO UPDATE
                SET quantity = EXCLUDED.quantity,
                    version = inventory_stock.version + 1,
                    updated_at = now()
            "#,
        )
        .bind(sku.as_str())
        .bind(quantity)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_quantity", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(sku = %sku, quantity = quantity))]
    pub async fn decrement_async(&self, sku: &Sku, quantity: u32) -> Result<u64, DecrementError> {
        validate_decrement(quantity)?;

        let row = sqlx::query(
            r#"
            UPDATE inventory_stock
               SET quantity = quantity - $2,
                   version = version + 1,
                   updated_at = now()
             WHERE sku = $1 AND quantity >= $2
            RETURNING quantity
            "#,
        )
        .bind(sku.as_str())
        .bind(i64::from(quantity))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("decrement", e))?;

        let Some(row) = row else {
            debug!("conditional update matched no row");
            return Err(DecrementError::InsufficientStock {
                sku: sku.clone(),
                requested: quantity,
            });
        };

        let remaining: i64 = row
            .try_get("quantity")
            .map_err(|e| map_sqlx_error("decrement", e))?;
        Ok(to_quantity(sku, remaining)?)
    }

    #[instrument(skip(self), fields(sku = %sku))]
    pub async fn quantity_async(&self, sku: &Sku) -> Result<Option<u64>, LedgerError> {
        let row = sqlx::query("SELECT quantity FROM inventory_stock WHERE sku = $1")
            .bind(sku.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("quantity", e))?;

        match row {
            Some(row) => {
                let raw: i64 = row
                    .try_get("quantity")
                    .map_err(|e| map_sqlx_error("quantity", e))?;
                to_quantity(sku, raw).map(Some)
            }
            None => Ok(None),
        }
    }
}

impl StockLedger for PostgresStockLedger {
    fn decrement(&self, sku: &Sku, quantity: u32) -> Result<u64, DecrementError> {
        self.runtime.block_on(self.decrement_async(sku, quantity))
    }

    fn quantity(&self, sku: &Sku) -> Result<Option<u64>, LedgerError> {
        self.runtime.block_on(self.quantity_async(sku))
    }
}

fn to_quantity(sku: &Sku, raw: i64) -> Result<u64, LedgerError> {
    u64::try_from(raw).map_err(|_| LedgerError::Corrupt {
        sku: sku.clone(),
        detail: format!("negative quantity {raw}"),
    })
}

/// Map SQLx errors to `LedgerError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    match err {
        e @ (sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)) => LedgerError::Unavailable(format!("{operation}: {e}")),
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            LedgerError::Backend(format!(
                "database error in {operation} ({code}): {}",
                db_err.message()
            ))
        }
        other => LedgerError::Backend(format!("sqlx error in {operation}: {other}")),
    }
}
