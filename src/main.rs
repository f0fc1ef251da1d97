use std::fs::OpenOptions;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use consignment_migrator::config::{self, redact_url, Config};
use consignment_migrator::pipeline::Pipeline;
use consignment_migrator::store::sql::SqlConnector;

/// Main entry point of the migration job.
///
/// Exit codes: 0 migrated and verified, 1 setup failure, 2 incomplete
/// (stopped or a worker failed, checkpoint kept), 3 verification below
/// threshold, 4 verification could not run (checkpoint kept).
#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();

    // Console plus an append-only run log without ANSI colors
    let run_log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(config::run_log_path())?;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "consignment_migrator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(run_log)),
        )
        .init();

    let config = Config::from_env()?;
    tracing::info!(
        "Migrating {} -> {}",
        redact_url(&config.source_database_url),
        redact_url(&config.destination_database_url)
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Stop requested, finishing in-flight windows");
            let _ = stop_tx.send(true);
        }
    });

    let connector = SqlConnector {
        source_url: config.source_database_url.clone(),
        destination_url: config.destination_database_url.clone(),
        acquire_timeout: config.pipeline.retry.timeout,
    };
    let pipeline = Pipeline::new(connector, config.pipeline, stop_rx);

    let report = match pipeline.run().await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!("Migration aborted: {}", e);
            return Ok(ExitCode::from(1));
        }
    };

    println!("{}", report.summary());
    tracing::info!(
        "Run {} ended with status {:?}",
        report.run_id,
        report.status
    );
    Ok(ExitCode::from(report.status.exit_code()))
}
