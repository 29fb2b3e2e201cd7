use std::sync::Arc;

use anyhow::Context;

use lymbo_infra::{ExpirySweeper, InstrumentedTicketStore, PostgresTicketStore, Stats, StoreConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    lymbo_observability::init();

    let config = StoreConfig::from_env().context("failed to load configuration")?;

    let pool = config
        .pool_options()
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")?;

    let store = PostgresTicketStore::connect(pool, config.table.clone())
        .await
        .context("failed to prepare ticket table")?;

    let stats = Arc::new(Stats::new());
    let store = InstrumentedTicketStore::new(store, stats.clone());

    tracing::info!(table = %config.table, "starting expiry sweeper");
    let handle = ExpirySweeper::new(store, config.expire_batch, config.expire_interval).spawn();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("shutdown requested");
    handle.shutdown().await;

    let snapshot = stats.snapshot();
    tracing::info!(expired = snapshot.expired, "expiry sweeper exited");
    Ok(())
}
