//! Classbook background worker
//!
//! Runs the billing reconciliation pass on a fixed interval. Pass `--once`
//! to run a single pass and print the report.

mod reconcile;

use std::{env, sync::Arc, time::Duration as StdDuration};

use anyhow::Context;
use classbook_api::telemetry::init_tracing;
use classbook_billing::{BillingService, OrderIdAllocator};
use classbook_shared::{create_pool, run_migrations, PgDocumentStore};
use tracing::{error, info};

struct WorkerConfig {
    database_url: String,
    database_max_connections: u32,
    interval: StdDuration,
    stale_after: time::Duration,
    tz_offset_hours: i32,
    log_json: bool,
}

impl WorkerConfig {
    fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            interval: StdDuration::from_secs(
                env::var("RECONCILE_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(3600)
                    .max(1),
            ),
            stale_after: time::Duration::hours(
                env::var("STALE_PAYMENT_HOURS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(24),
            ),
            tz_offset_hours: env::var("BILLING_TZ_OFFSET_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(9),
            log_json: env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = WorkerConfig::from_env()?;
    init_tracing(config.log_json);

    let once = env::args().any(|arg| arg == "--once");

    let pool = create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to connect to database")?;
    run_migrations(&pool).await.context("Failed to run migrations")?;
    let store = Arc::new(PgDocumentStore::new(pool));
    let billing = BillingService::new(store, None, OrderIdAllocator::default(), config.tz_offset_hours);

    if once {
        let report = reconcile::run_once(&billing, config.stale_after).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    info!(
        interval_secs = config.interval.as_secs(),
        stale_hours = config.stale_after.whole_hours(),
        "Starting reconciliation worker"
    );
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = reconcile::run_once(&billing, config.stale_after).await {
                    error!(error = %e, "Reconciliation pass failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }
    Ok(())
}
