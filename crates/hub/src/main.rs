use anyhow::{Context, Result};
use std::{env, sync::Arc};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use power_relay_hub::config;
use power_relay_hub::db::Db;
use power_relay_hub::factory::{DeviceContext, DeviceFactory};
use power_relay_hub::lease::SqliteLeaseProvider;
use power_relay_hub::scheduler::Scheduler;
use power_relay_hub::source::InfluxDb2Source;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,power_relay_hub=info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;

    // ── Database ────────────────────────────────────────────────────
    let db_url = env::var("DB_URL").unwrap_or_else(|_| cfg.store.db_url.clone());
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // Seed sensors; the devices table is the source of truth from here on.
    config::apply(&cfg, &db).await?;

    // ── Sample source ───────────────────────────────────────────────
    let token = env::var("INFLUXDB2_TOKEN").unwrap_or_else(|_| cfg.influxdb2.token.clone());
    if token.is_empty() {
        warn!("no influxdb2 token configured; queries will be unauthenticated");
    }
    let source = InfluxDb2Source::new(&cfg.influxdb2.url, &cfg.influxdb2.organization, &token)
        .context("failed to build influxdb2 client")?;

    // ── Scheduler + factory ─────────────────────────────────────────
    let scheduler = Scheduler::new(
        Arc::new(SqliteLeaseProvider::new(db.clone())),
        cfg.scheduler.settings(),
    );
    let settings = scheduler.settings();
    info!(
        pool_size = settings.pool_size,
        lease_min_hold_sec = settings.lease_min_hold.as_secs(),
        lease_max_hold_sec = settings.lease_max_hold.as_secs(),
        "scheduler configured"
    );
    let factory = DeviceFactory::new(
        DeviceContext {
            source: Arc::new(source),
            store: Arc::new(db.clone()),
        },
        Arc::clone(&scheduler),
    );

    let devices = factory.create_devices(&db).await?;

    // Reconciliation: persisted devices of each supported type are scheduled
    // once more; the ones created above are ignored by the scheduler.
    factory.schedule_persisted(&db).await?;

    info!(
        sensors = scheduler.registered_count().await,
        types = ?factory.supported_device_types(),
        "power relay hub started"
    );
    if devices.is_empty() {
        warn!("no sensors configured");
    }

    // ── Run until interrupted ───────────────────────────────────────
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    scheduler.shutdown().await;

    Ok(())
}
