//! Environment-driven configuration.
//!
//! Every variable is optional. Values are read once at startup; nothing here is
//! re-read while the loop is running.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `STOCKFLOW_BACKEND` | `memory` (`memory` or `persistent`) |
//! | `LEDGER_BACKEND` | `postgres` (`postgres` or `redis`; persistent backend only) |
//! | `DATABASE_URL` | required when persistent with the `postgres` ledger |
//! | `STOCK_HASH_KEY` | `stockflow:stock` (`redis` ledger) |
//! | `REDIS_URL` | `redis://localhost:6379` |
//! | `ORDER_STREAM_KEY` | `stockflow:orders` |
//! | `ORDER_CONSUMER_GROUP` | `inventory.settlement` |
//! | `ORDER_CONSUMER_NAME` | `consumer-<uuid v7>` |
//! | `ORDER_DLQ_KEY` | `stockflow:orders:dlq` |
//! | `PRICE_UPDATE_STREAM_KEY` | `stockflow:price-updates` |
//! | `POLL_BATCH_SIZE` | `10` (clamped to `1..=10`) |
//! | `POLL_WAIT_SECS` | `20` |
//! | `VISIBILITY_TIMEOUT_SECS` | `30` |
//! | `MAX_RECEIVE_COUNT` | `5` (`0` disables dead-lettering) |
//! | `BACKOFF_SECS` | `5` |
//! | `ALLOW_DEFAULT_QUANTITY` | `false` |
//! | `SEED_STOCK` | empty, `SKU=QTY,SKU=QTY` (memory backend only, required to start it) |

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use stockflow_core::Sku;
use stockflow_events::{MAX_BATCH_SIZE, clamp_batch_size};
use stockflow_inventory::PayloadPolicy;

use crate::workers::SettlementLoopConfig;

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
pub const DEFAULT_ORDER_STREAM_KEY: &str = "stockflow:orders";
pub const DEFAULT_ORDER_CONSUMER_GROUP: &str = "inventory.settlement";
pub const DEFAULT_ORDER_DLQ_KEY: &str = "stockflow:orders:dlq";
pub const DEFAULT_PRICE_UPDATE_STREAM_KEY: &str = "stockflow:price-updates";
pub const DEFAULT_STOCK_HASH_KEY: &str = "stockflow:stock";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be set for the persistent backend")]
    Missing(&'static str),
}

impl ConfigError {
    fn invalid(name: &'static str, value: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            name,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Which ledger/queue/bus implementations to wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// In-process ledger, queue and bus. Nothing survives a restart.
    #[default]
    Memory,
    /// Postgres ledger, Redis Streams queue and outbound stream.
    Persistent,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "in-memory" => Ok(Backend::Memory),
            "persistent" => Ok(Backend::Persistent),
            other => Err(format!("unknown backend `{other}`")),
        }
    }
}

/// Stock ledger used by the persistent backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LedgerBackend {
    /// `inventory_stock` table, conditional `UPDATE`.
    #[default]
    Postgres,
    /// One Redis hash, Lua conditional decrement.
    Redis,
}

impl FromStr for LedgerBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(LedgerBackend::Postgres),
            "redis" => Ok(LedgerBackend::Redis),
            other => Err(format!("unknown ledger backend `{other}`")),
        }
    }
}

/// Settlement service configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementConfig {
    pub backend: Backend,
    pub ledger: LedgerBackend,
    pub database_url: Option<String>,
    pub stock_hash_key: String,
    pub redis_url: String,
    pub order_stream_key: String,
    pub consumer_group: String,
    pub consumer_name: String,
    pub dlq_key: String,
    pub price_update_stream_key: String,
    pub batch_size: usize,
    pub poll_wait: Duration,
    pub visibility_timeout: Duration,
    /// `None` disables dead-lettering.
    pub max_receive_count: Option<u32>,
    pub backoff: Duration,
    pub payload_policy: PayloadPolicy,
    pub seed_stock: Vec<(Sku, u64)>,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            ledger: LedgerBackend::Postgres,
            database_url: None,
            stock_hash_key: DEFAULT_STOCK_HASH_KEY.to_string(),
            redis_url: DEFAULT_REDIS_URL.to_string(),
            order_stream_key: DEFAULT_ORDER_STREAM_KEY.to_string(),
            consumer_group: DEFAULT_ORDER_CONSUMER_GROUP.to_string(),
            consumer_name: format!("consumer-{}", uuid::Uuid::now_v7()),
            dlq_key: DEFAULT_ORDER_DLQ_KEY.to_string(),
            price_update_stream_key: DEFAULT_PRICE_UPDATE_STREAM_KEY.to_string(),
            batch_size: MAX_BATCH_SIZE,
            poll_wait: Duration::from_secs(20),
            visibility_timeout: Duration::from_secs(30),
            max_receive_count: Some(5),
            backoff: Duration::from_secs(5),
            payload_policy: PayloadPolicy::strict(),
            seed_stock: Vec::new(),
        }
    }
}

impl SettlementConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read configuration through `lookup` (an environment stand-in).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut cfg = Self::default();

        if let Some(raw) = get("STOCKFLOW_BACKEND") {
            cfg.backend = raw
                .parse()
                .map_err(|reason: String| ConfigError::invalid("STOCKFLOW_BACKEND", &raw, reason))?;
        }
        if let Some(raw) = get("LEDGER_BACKEND") {
            cfg.ledger = raw
                .parse()
                .map_err(|reason: String| ConfigError::invalid("LEDGER_BACKEND", &raw, reason))?;
        }
        cfg.database_url = get("DATABASE_URL");
        if let Some(v) = get("STOCK_HASH_KEY") {
            cfg.stock_hash_key = v;
        }
        if let Some(v) = get("REDIS_URL") {
            cfg.redis_url = v;
        }
        if let Some(v) = get("ORDER_STREAM_KEY") {
            cfg.order_stream_key = v;
        }
        if let Some(v) = get("ORDER_CONSUMER_GROUP") {
            cfg.consumer_group = v;
        }
        if let Some(v) = get("ORDER_CONSUMER_NAME") {
            cfg.consumer_name = v;
        }
        if let Some(v) = get("ORDER_DLQ_KEY") {
            cfg.dlq_key = v;
        }
        if let Some(v) = get("PRICE_UPDATE_STREAM_KEY") {
            cfg.price_update_stream_key = v;
        }

        if let Some(raw) = get("POLL_BATCH_SIZE") {
            cfg.batch_size = clamp_batch_size(parse_number("POLL_BATCH_SIZE", &raw)?);
        }
        if let Some(raw) = get("POLL_WAIT_SECS") {
            cfg.poll_wait = Duration::from_secs(parse_number("POLL_WAIT_SECS", &raw)?);
        }
        if let Some(raw) = get("VISIBILITY_TIMEOUT_SECS") {
            let secs: u64 = parse_number("VISIBILITY_TIMEOUT_SECS", &raw)?;
            if secs == 0 {
                return Err(ConfigError::invalid(
                    "VISIBILITY_TIMEOUT_SECS",
                    &raw,
                    "must be positive",
                ));
            }
            cfg.visibility_timeout = Duration::from_secs(secs);
        }
        if let Some(raw) = get("MAX_RECEIVE_COUNT") {
            let limit: u32 = parse_number("MAX_RECEIVE_COUNT", &raw)?;
            cfg.max_receive_count = (limit > 0).then_some(limit);
        }
        if let Some(raw) = get("BACKOFF_SECS") {
            cfg.backoff = Duration::from_secs(parse_number("BACKOFF_SECS", &raw)?);
        }
        if let Some(raw) = get("ALLOW_DEFAULT_QUANTITY") {
            let allow = parse_flag(&raw).ok_or_else(|| {
                ConfigError::invalid("ALLOW_DEFAULT_QUANTITY", &raw, "expected true or false")
            })?;
            cfg.payload_policy = PayloadPolicy {
                allow_default_quantity: allow,
            };
        }
        if let Some(raw) = get("SEED_STOCK") {
            cfg.seed_stock = parse_seed_stock(&raw)?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Check cross-field requirements.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend == Backend::Persistent
            && self.ledger == LedgerBackend::Postgres
            && self.database_url.is_none()
        {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }
        Ok(())
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_ledger(mut self, ledger: LedgerBackend) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = clamp_batch_size(batch_size);
        self
    }

    pub fn with_poll_wait(mut self, poll_wait: Duration) -> Self {
        self.poll_wait = poll_wait;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_payload_policy(mut self, policy: PayloadPolicy) -> Self {
        self.payload_policy = policy;
        self
    }

    pub fn with_seed_stock(mut self, seed: Vec<(Sku, u64)>) -> Self {
        self.seed_stock = seed;
        self
    }

    /// Loop settings derived from this configuration.
    pub fn loop_config(&self) -> SettlementLoopConfig {
        SettlementLoopConfig::default()
            .with_name(format!("settlement-{}", self.consumer_name))
            .with_batch_size(self.batch_size)
            .with_poll_wait(self.poll_wait)
            .with_backoff(self.backoff)
    }
}

fn parse_number<T>(name: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::invalid(name, raw, e.to_string()))
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse `SKU=QTY,SKU=QTY`.
pub fn parse_seed_stock(raw: &str) -> Result<Vec<(Sku, u64)>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (sku, qty) = entry
                .split_once('=')
                .ok_or_else(|| ConfigError::invalid("SEED_STOCK", entry, "expected SKU=QTY"))?;
            let sku = Sku::parse(sku)
                .map_err(|e| ConfigError::invalid("SEED_STOCK", entry, e.to_string()))?;
            let qty = parse_number("SEED_STOCK", qty)?;
            Ok((sku, qty))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let cfg = SettlementConfig::from_lookup(lookup(&[])).unwrap();

        assert_eq!(cfg.backend, Backend::Memory);
        assert_eq!(cfg.ledger, LedgerBackend::Postgres);
        assert_eq!(cfg.stock_hash_key, DEFAULT_STOCK_HASH_KEY);
        assert_eq!(cfg.batch_size, 10);
        assert_eq!(cfg.poll_wait, Duration::from_secs(20));
        assert_eq!(cfg.max_receive_count, Some(5));
        assert!(!cfg.payload_policy.allow_default_quantity);
        assert!(cfg.consumer_name.starts_with("consumer-"));
    }

    #[test]
    fn reads_overrides() {
        let cfg = SettlementConfig::from_lookup(lookup(&[
            ("STOCKFLOW_BACKEND", "persistent"),
            ("DATABASE_URL", "postgres://localhost/stock"),
            ("POLL_BATCH_SIZE", "50"),
            ("POLL_WAIT_SECS", "1"),
            ("MAX_RECEIVE_COUNT", "0"),
            ("ALLOW_DEFAULT_QUANTITY", "true"),
            ("ORDER_CONSUMER_NAME", "worker-1"),
        ]))
        .unwrap();

        assert_eq!(cfg.backend, Backend::Persistent);
        assert_eq!(cfg.batch_size, MAX_BATCH_SIZE);
        assert_eq!(cfg.poll_wait, Duration::from_secs(1));
        assert_eq!(cfg.max_receive_count, None);
        assert!(cfg.payload_policy.allow_default_quantity);
        assert_eq!(cfg.loop_config().name, "settlement-worker-1");
    }

    #[test]
    fn persistent_backend_requires_database_url() {
        let err = SettlementConfig::from_lookup(lookup(&[("STOCKFLOW_BACKEND", "persistent")]))
            .unwrap_err();
        assert_eq!(err, ConfigError::Missing("DATABASE_URL"));
    }

    #[test]
    fn redis_ledger_does_not_need_database_url() {
        let cfg = SettlementConfig::from_lookup(lookup(&[
            ("STOCKFLOW_BACKEND", "persistent"),
            ("LEDGER_BACKEND", "redis"),
            ("STOCK_HASH_KEY", "shop:stock"),
        ]))
        .unwrap();

        assert_eq!(cfg.ledger, LedgerBackend::Redis);
        assert_eq!(cfg.stock_hash_key, "shop:stock");
        assert!(cfg.database_url.is_none());
        assert!(SettlementConfig::from_lookup(lookup(&[("LEDGER_BACKEND", "mongo")])).is_err());
    }

    #[test]
    fn rejects_garbage_values() {
        let rejects = |name: &str, value: &str| {
            SettlementConfig::from_lookup(lookup(&[(name, value)])).is_err()
        };
        assert!(rejects("POLL_WAIT_SECS", "soon"));
        assert!(rejects("STOCKFLOW_BACKEND", "sqlite"));
        assert!(rejects("ALLOW_DEFAULT_QUANTITY", "maybe"));
        assert!(rejects("VISIBILITY_TIMEOUT_SECS", "0"));
    }

    #[test]
    fn parses_seed_stock() {
        let seed = parse_seed_stock("ABC=10, XYZ=0,").unwrap();
        assert_eq!(
            seed,
            vec![(Sku::parse("ABC").unwrap(), 10), (Sku::parse("XYZ").unwrap(), 0)]
        );

        assert!(parse_seed_stock("ABC").is_err());
        assert!(parse_seed_stock("ABC=-1").is_err());
        assert!(parse_seed_stock("=3").is_err());
    }
}
