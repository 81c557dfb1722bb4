//! Background process that re-drives due webhook retries.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use cmis_infra::settings::required;
use cmis_infra::{
    Clock, DeliverySettings, DispatchOptions, Dispatcher, PostgresWebhookStore, ReqwestTransport,
    RetryScheduler, RetryWorkerConfig, SystemClock,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cmis_observability::init();

    let settings = DeliverySettings::from_env().context("invalid webhook settings")?;
    let database_url = required("DATABASE_URL")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to postgres")?;
    let store = PostgresWebhookStore::new(pool);
    store
        .ensure_schema()
        .await
        .context("failed to apply webhook schema")?;

    let transport =
        ReqwestTransport::new(&settings.user_agent).context("failed to build http client")?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let dispatcher = Dispatcher::new(store, transport, clock, settings.retry_policy()?)
        .with_options(DispatchOptions::from(&settings));

    let worker = RetryScheduler::new(dispatcher)
        .with_stale_after(settings.stale_pending_after())
        .spawn(RetryWorkerConfig::from_settings(&settings));
    tracing::info!(
        max_attempts = settings.max_attempts,
        base_delay_secs = settings.base_delay_secs,
        interval_secs = settings.retry_interval_secs,
        stale_pending_secs = settings.stale_pending_secs,
        "webhook retry worker running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    let stats = worker.stats();
    worker.shutdown().await;
    tracing::info!(
        passes = stats.passes,
        requeued = stats.requeued,
        retried = stats.retried,
        abandoned = stats.abandoned,
        "webhook retry worker stopped"
    );
    Ok(())
}
