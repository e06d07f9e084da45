use std::sync::Arc;
#[cfg(feature = "redis")]
use std::time::Duration;

#[cfg(feature = "redis")]
use anyhow::Context;
use anyhow::{Result, bail};
use tracing::{info, warn};

use stockflow_events::{InMemoryEventBus, InMemoryOrderQueue};
use stockflow_infra::{
    Backend, OutcomePublisher, SettlementConfig, SettlementLoop, SettlementLoopHandle,
    SettlementWorker,
};
#[cfg(feature = "redis")]
use stockflow_infra::{
    LedgerBackend, PostgresStockLedger, event_bus::RedisStreamsEventBus, ledger::RedisStockLedger,
    ledger::postgres, queue::RedisStreamsOrderQueue,
};
use stockflow_inventory::{InMemoryStockLedger, StockUpdated};
#[cfg(feature = "redis")]
use stockflow_inventory::StockLedger;

/// In-process pipeline (dev/test): the queue and bus are exposed so a caller can feed
/// orders and observe stock updates.
pub struct InMemoryPipeline {
    pub queue: Arc<InMemoryOrderQueue>,
    pub ledger: Arc<InMemoryStockLedger>,
    pub bus: Arc<InMemoryEventBus<StockUpdated>>,
    pub settlement: SettlementLoop<
        Arc<InMemoryOrderQueue>,
        Arc<InMemoryStockLedger>,
        Arc<InMemoryEventBus<StockUpdated>>,
    >,
}

pub fn build_in_memory_pipeline(config: &SettlementConfig) -> InMemoryPipeline {
    // In-memory infra wiring: seeded ledger + queue + bus.
    let ledger = Arc::new(InMemoryStockLedger::with_stock(config.seed_stock.iter().cloned()));
    let mut queue = InMemoryOrderQueue::new(config.visibility_timeout);
    if let Some(limit) = config.max_receive_count {
        queue = queue.with_max_receive_count(limit);
    }
    let queue = Arc::new(queue);
    let bus: Arc<InMemoryEventBus<StockUpdated>> = Arc::new(InMemoryEventBus::new());

    let settlement = SettlementLoop::new(
        queue.clone(),
        SettlementWorker::new(ledger.clone(), config.payload_policy),
        OutcomePublisher::new(bus.clone()),
        config.loop_config(),
    );

    InMemoryPipeline {
        queue,
        ledger,
        bus,
        settlement,
    }
}

/// Wire the configured backends and start the settlement loop thread.
///
/// Must be called from within a multi-threaded tokio runtime when the persistent
/// backend is selected; the Postgres ledger blocks on that runtime from the loop thread.
///
/// The memory backend is a local dev run: no producer outside this process can reach its
/// queue, so it only starts when `SEED_STOCK` is set explicitly.
pub async fn start(config: &SettlementConfig) -> Result<SettlementLoopHandle> {
    match config.backend {
        Backend::Memory => start_in_memory(config),
        Backend::Persistent => {
            #[cfg(feature = "redis")]
            {
                start_persistent(config).await
            }
            #[cfg(not(feature = "redis"))]
            {
                bail!("STOCKFLOW_BACKEND=persistent requires a build with the `redis` feature")
            }
        }
    }
}

fn start_in_memory(config: &SettlementConfig) -> Result<SettlementLoopHandle> {
    if config.seed_stock.is_empty() {
        bail!(
            "the memory backend is for local dev runs only; set SEED_STOCK to start it \
             or STOCKFLOW_BACKEND=persistent for a deployment"
        );
    }
    let pipeline = build_in_memory_pipeline(config);
    warn!(
        backend = "memory",
        seeded_skus = config.seed_stock.len(),
        "starting dev settlement loop; orders can only be fed from inside this process"
    );
    Ok(pipeline.settlement.spawn())
}

#[cfg(feature = "redis")]
async fn start_persistent(config: &SettlementConfig) -> Result<SettlementLoopHandle> {
    match config.ledger {
        LedgerBackend::Postgres => {
            let database_url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set for the postgres ledger")?;

            let pool = postgres::connect(database_url, Duration::from_secs(5))
                .await
                .context("failed to connect to Postgres")?;
            let ledger = PostgresStockLedger::new(pool, tokio::runtime::Handle::current());
            ledger
                .ensure_schema()
                .await
                .context("failed to prepare inventory_stock table")?;
            spawn_persistent(config, ledger, "postgres")
        }
        LedgerBackend::Redis => {
            let stock_key = Some(config.stock_hash_key.clone());
            let ledger = RedisStockLedger::new(&config.redis_url, stock_key)
                .context("failed to create Redis stock ledger")?;
            spawn_persistent(config, ledger, "redis")
        }
    }
}

#[cfg(feature = "redis")]
fn spawn_persistent<L>(
    config: &SettlementConfig,
    ledger: L,
    ledger_name: &'static str,
) -> Result<SettlementLoopHandle>
where
    L: StockLedger + 'static,
{
    let queue = RedisStreamsOrderQueue::new(
        &config.redis_url,
        config.order_stream_key.clone(),
        config.consumer_group.clone(),
        config.consumer_name.clone(),
        config.dlq_key.clone(),
    )
    .context("failed to create Redis Streams order queue")?
    .with_visibility_timeout(config.visibility_timeout)
    .with_max_receive_count(config.max_receive_count);

    // The queue retries group creation on every poll until it succeeds.
    if let Err(e) = queue.ensure_consumer_group() {
        warn!(error = %e, "consumer group not ready yet");
    }

    let price_stream = Some(config.price_update_stream_key.clone());
    let bus = RedisStreamsEventBus::new(&config.redis_url, price_stream)
        .context("failed to create Redis Streams event bus")?;

    info!(
        backend = "persistent",
        ledger = ledger_name,
        order_stream = %config.order_stream_key,
        consumer_group = %config.consumer_group,
        consumer = %config.consumer_name,
        price_update_stream = %config.price_update_stream_key,
        "starting settlement loop"
    );

    let settlement = SettlementLoop::new(
        queue,
        SettlementWorker::new(ledger, config.payload_policy),
        OutcomePublisher::new(bus),
        config.loop_config(),
    );
    Ok(settlement.spawn())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use stockflow_core::Sku;
    use stockflow_events::EventBus;
    use stockflow_infra::CycleOutcome;
    use stockflow_inventory::StockLedger;

    use super::*;

    fn sku(raw: &str) -> Sku {
        Sku::parse(raw).unwrap()
    }

    #[test]
    fn in_memory_pipeline_uses_seed_stock_and_policy() {
        let config = SettlementConfig::default()
            .with_poll_wait(Duration::from_millis(10))
            .with_seed_stock(vec![(sku("ABC"), 10)])
            .with_payload_policy(stockflow_inventory::PayloadPolicy::lenient());
        let pipeline = build_in_memory_pipeline(&config);
        let sub = pipeline.bus.subscribe();

        pipeline.queue.send(r#"{"sku":"ABC"}"#).unwrap();
        assert_eq!(
            pipeline.settlement.run_once(),
            CycleOutcome::Processed { messages: 1 }
        );

        assert_eq!(pipeline.ledger.quantity(&sku("ABC")).unwrap(), Some(9));
        assert_eq!(sub.recv_timeout(Duration::from_secs(1)).unwrap().stock, 9);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_and_shutdown_in_memory() {
        let config = SettlementConfig::default()
            .with_poll_wait(Duration::from_millis(10))
            .with_seed_stock(vec![(sku("ABC"), 1)]);
        let handle = start(&config).await.unwrap();

        let stats = tokio::task::spawn_blocking(move || handle.shutdown()).await.unwrap();
        assert_eq!(stats.messages_received, 0);
    }

    #[tokio::test]
    async fn memory_backend_without_seed_stock_refuses_to_start() {
        let config = SettlementConfig::default().with_poll_wait(Duration::from_millis(10));

        let err = start(&config).await.unwrap_err();
        assert!(err.to_string().contains("SEED_STOCK"), "{err}");
    }

    #[cfg(not(feature = "redis"))]
    #[tokio::test]
    async fn persistent_backend_without_redis_feature_is_an_error() {
        let config = SettlementConfig::default()
            .with_backend(Backend::Persistent)
            .with_database_url("postgres://localhost/stock")
            .with_seed_stock(vec![(sku("ABC"), 1)]);
        config.validate().unwrap();

        let err = start(&config).await.unwrap_err();
        assert!(err.to_string().contains("`redis` feature"), "{err}");
    }
}
