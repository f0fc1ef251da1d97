//! Utility to preview how a migration run would be partitioned.
//!
//! Reads table bounds from the legacy store, prints the per-worker ranges for
//! each phase and, if a checkpoint exists, where each worker would resume.
//! Nothing is written.

use consignment_migrator::checkpoint::{layout_fingerprint, read_checkpoint};
use consignment_migrator::config::Config;
use consignment_migrator::models::Phase;
use consignment_migrator::partition::partition;
use consignment_migrator::store::sql::SqlConnector;
use consignment_migrator::store::{SourceStore, StoreConnector};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let connector = SqlConnector {
        source_url: config.source_database_url.clone(),
        destination_url: config.destination_database_url.clone(),
        acquire_timeout: config.pipeline.retry.timeout,
    };
    let source = connector.connect_source().await?;
    let checkpoint = read_checkpoint(&config.pipeline.checkpoint_path).await?;

    match &checkpoint {
        Some(cp) => println!(
            "Checkpoint {}: run {} started {}",
            config.pipeline.checkpoint_path.display(),
            cp.run_id,
            cp.started_at
        ),
        None => println!("No checkpoint, a run would start from scratch"),
    }

    for phase in Phase::ALL {
        let bounds = source.bounds(phase).await?;
        let ranges = partition(&bounds, config.pipeline.workers);
        println!();
        println!(
            "{} ({}): {} rows, ids {}..={}",
            phase,
            phase.source_table(),
            bounds.row_count,
            bounds.min_id,
            bounds.max_id
        );
        if ranges.is_empty() {
            println!("  nothing to migrate");
            continue;
        }
        if bounds.end_exclusive().is_none() {
            println!("  max id is i64::MAX, a run would refuse this table");
            continue;
        }

        let recorded = checkpoint.as_ref().and_then(|cp| cp.phase(phase));
        let fingerprint = layout_fingerprint(phase, &ranges);
        let resumable = recorded.filter(|p| p.fingerprint == fingerprint);
        if recorded.is_some() && resumable.is_none() {
            println!("  checkpoint layout differs, phase would restart");
        }
        if resumable.map(|p| p.completed).unwrap_or(false) {
            println!("  already completed");
        }

        for (id, range) in ranges.iter().enumerate() {
            let worker = resumable.and_then(|p| p.workers.iter().find(|w| w.worker_id == id));
            match worker {
                Some(w) => println!(
                    "  worker {:>3}: {} resume at {}{} ({} scanned, {} poisoned spans)",
                    id,
                    range,
                    w.cursor,
                    if w.done { " (done)" } else { "" },
                    w.stats.scanned,
                    w.poisoned.len()
                ),
                None => println!("  worker {:>3}: {} ({} ids)", id, range, range.len()),
            }
        }
    }

    Ok(())
}
