/// End-to-end runs of the pipeline against the in-memory stores
/// Covers idempotence, conservation, resume, unresolved references and verification
use std::collections::HashMap;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

use consignment_migrator::checkpoint::read_checkpoint;
use consignment_migrator::config::{PipelineOptions, RetryPolicy};
use consignment_migrator::errors::MigrationError;
use consignment_migrator::models::{LegacyInstallment, LegacySale, Phase};
use consignment_migrator::pipeline::{PhaseReport, Pipeline, RunReport, RunStatus};
use consignment_migrator::store::memory::MemoryStores;

const MEMBERS: [&str; 3] = ["1001", "01002", "555"];

fn sale(id: i64, member: &str, sequence: i32) -> LegacySale {
    LegacySale {
        id,
        member_number: Some(member.to_string()),
        sequence_number: Some(sequence),
        agreement_code: Some("BNK".to_string()),
        sale_type: None,
        amount: None,
        installment_count: Some(2),
        sale_date: None,
        status: Some("active".to_string()),
    }
}

fn installment(id: i64, member: &str, sequence: i32, number: i32) -> LegacyInstallment {
    LegacyInstallment {
        id,
        member_number: Some(member.to_string()),
        sequence_number: Some(sequence),
        installment_number: Some(number),
        amount: None,
        due_date: None,
        paid_date: None,
        status: None,
    }
}

/// Three members (one only reachable through renumbering), one agreement,
/// `sales` legacy sales with two installments each.
fn fixture(sales: i64) -> MemoryStores {
    let stores = MemoryStores::new();
    stores.add_member(1, "1001");
    stores.add_member(2, "1002");
    stores.add_member(3, "1003");
    stores.add_renumbering("555", "1003");
    stores.add_agreement(10, "BNK");

    for id in 1..=sales {
        let member = MEMBERS[(id % 3) as usize];
        stores.add_legacy_sale(sale(id, member, id as i32));
        for number in 1..=2 {
            stores.add_legacy_installment(installment(
                (id - 1) * 2 + number as i64,
                member,
                id as i32,
                number,
            ));
        }
    }
    stores
}

fn options(dir: &TempDir, workers: usize) -> PipelineOptions {
    PipelineOptions {
        workers,
        window_size: 5,
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
            timeout: Duration::from_secs(5),
        },
        verify_threshold: 0.95,
        progress_interval: Duration::from_secs(3600),
        checkpoint_path: dir.path().join("checkpoint.json"),
        sale_type_agreements: HashMap::new(),
    }
}

async fn run(stores: &MemoryStores, options: PipelineOptions) -> RunReport {
    let (_stop_tx, stop_rx) = watch::channel(false);
    Pipeline::new(stores.clone(), options, stop_rx)
        .run()
        .await
        .unwrap()
}

fn phase(report: &RunReport, phase: Phase) -> &PhaseReport {
    report.phases.iter().find(|p| p.phase == phase).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_full_run_migrates_everything() {
    let dir = TempDir::new().unwrap();
    let stores = fixture(30);

    let report = run(&stores, options(&dir, 4)).await;

    assert_eq!(report.status, RunStatus::Verified);
    assert_eq!(stores.destination_sales(), 30);
    assert_eq!(stores.destination_installments(), 60);

    let sales = phase(&report, Phase::Sales);
    assert_eq!(sales.stats.scanned, 30);
    assert_eq!(sales.stats.inserted, 30);
    let installments = phase(&report, Phase::Installments);
    assert_eq!(installments.stats.inserted, 60);
    assert!(report.phases.iter().all(|p| p.stats.is_conserved()));

    // completed runs leave no checkpoint behind
    assert!(!dir.path().join("checkpoint.json").exists());
    assert!(report.summary().contains("verification PASSED"));
}

#[tokio::test(start_paused = true)]
async fn test_second_run_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let stores = fixture(20);

    let first = run(&stores, options(&dir, 3)).await;
    let second = run(&stores, options(&dir, 3)).await;

    assert_eq!(first.status, RunStatus::Verified);
    assert_eq!(second.status, RunStatus::Verified);
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(stores.destination_sales(), 20);
    assert_eq!(stores.destination_installments(), 40);

    for p in &second.phases {
        assert_eq!(p.stats.inserted, 0, "phase {}", p.phase);
        assert_eq!(p.stats.skipped_duplicate, p.stats.scanned, "phase {}", p.phase);
        assert!(p.stats.is_conserved());
    }
}

#[tokio::test(start_paused = true)]
async fn test_resume_after_stop() {
    let dir = TempDir::new().unwrap();
    let stores = fixture(40);
    let checkpoint_path = dir.path().join("checkpoint.json");

    let (stop_tx, stop_rx) = watch::channel(false);
    stores.cancel_after_reads(2, stop_tx);
    let first = Pipeline::new(stores.clone(), options(&dir, 2), stop_rx)
        .run()
        .await
        .unwrap();

    assert_eq!(first.status, RunStatus::Incomplete);
    assert_eq!(first.status.exit_code(), 2);
    assert!(first.verification.is_none());
    assert!(stores.destination_sales() < 40);

    let recorded = read_checkpoint(&checkpoint_path).await.unwrap().unwrap();
    assert_eq!(recorded.run_id, first.run_id);
    let cursors: Vec<_> = recorded
        .phase(Phase::Sales)
        .unwrap()
        .workers
        .iter()
        .map(|w| (w.range, w.cursor))
        .collect();

    stores.clear_read_log();
    let second = run(&stores, options(&dir, 2)).await;

    assert_eq!(second.status, RunStatus::Verified);
    assert!(second.resumed);
    assert_eq!(second.run_id, first.run_id);
    assert_eq!(stores.destination_sales(), 40);
    assert_eq!(stores.destination_installments(), 80);

    // no sale window below a recorded cursor is read again
    for (read_phase, start) in stores.read_log() {
        if read_phase != Phase::Sales {
            continue;
        }
        let (_, cursor) = cursors
            .iter()
            .find(|(range, _)| range.contains(start))
            .unwrap();
        assert!(start >= *cursor, "re-read {} below cursor {}", start, cursor);
    }

    let sales = phase(&second, Phase::Sales);
    assert_eq!(sales.stats.scanned, 40);
    assert_eq!(sales.stats.inserted + sales.stats.skipped_duplicate, 40);
    assert!(sales.stats.is_conserved());
}

#[tokio::test(start_paused = true)]
async fn test_unknown_member_is_unresolved_not_retried() {
    let dir = TempDir::new().unwrap();
    let stores = fixture(10);
    stores.add_legacy_installment(installment(1000, "9999999", 1, 1));

    let report = run(&stores, options(&dir, 2)).await;

    let installments = phase(&report, Phase::Installments);
    assert_eq!(installments.stats.scanned, 21);
    assert_eq!(installments.stats.skipped_unresolved, 1);
    assert_eq!(installments.stats.errored, 0);
    assert_eq!(stores.destination_installments(), 20);

    // the second worker owns [501, 1001), where the orphan lives
    let reads_of_window = stores
        .read_log()
        .into_iter()
        .filter(|(p, start)| *p == Phase::Installments && *start > 500)
        .count();
    assert_eq!(reads_of_window, 1);
}

#[tokio::test(start_paused = true)]
async fn test_verifier_threshold() {
    // 24 of 25 resolvable: 96%
    let dir = TempDir::new().unwrap();
    let stores = fixture(0);
    for id in 1..=25 {
        let member = if id == 25 { "9999999" } else { "1001" };
        stores.add_legacy_sale(sale(id, member, id as i32));
    }
    let report = run(&stores, options(&dir, 2)).await;
    assert_eq!(report.status, RunStatus::Verified);

    // 20 of 25 resolvable: 80%
    let dir = TempDir::new().unwrap();
    let stores = fixture(0);
    for id in 1..=25 {
        let member = if id > 20 { "9999999" } else { "1001" };
        stores.add_legacy_sale(sale(id, member, id as i32));
    }
    let report = run(&stores, options(&dir, 2)).await;
    assert_eq!(report.status, RunStatus::VerificationFailed);
    assert_eq!(report.status.exit_code(), 3);

    let sales = phase(&report, Phase::Sales);
    assert_eq!(sales.stats.errored, 0);
    assert_eq!(sales.stats.skipped_unresolved, 5);
    assert!(report.summary().contains("verification FAILED"));
}

#[tokio::test(start_paused = true)]
async fn test_transient_read_failures_are_retried() {
    let dir = TempDir::new().unwrap();
    let stores = fixture(10);
    stores.fail_next_reads(2);

    let report = run(&stores, options(&dir, 1)).await;

    assert_eq!(report.status, RunStatus::Verified);
    assert!(report.phases.iter().all(|p| p.stats.errored == 0));
    assert_eq!(stores.destination_sales(), 10);
}

#[tokio::test(start_paused = true)]
async fn test_bulk_write_failures_fall_back_to_single_rows() {
    let dir = TempDir::new().unwrap();
    let stores = fixture(12);
    stores.fail_bulk_writes(true);

    let report = run(&stores, options(&dir, 3)).await;

    assert_eq!(report.status, RunStatus::Verified);
    assert_eq!(stores.destination_sales(), 12);
    assert_eq!(stores.destination_installments(), 24);
}

#[tokio::test(start_paused = true)]
async fn test_sale_type_fallback_from_configuration() {
    let dir = TempDir::new().unwrap();
    let stores = fixture(0);
    stores.add_agreement(42, "PREF");
    let mut typed = sale(1, "1001", 1);
    typed.agreement_code = None;
    typed.sale_type = Some("1".to_string());
    stores.add_legacy_sale(typed);

    let mut opts = options(&dir, 1);
    let unmapped = run(&stores, opts.clone()).await;
    assert_eq!(phase(&unmapped, Phase::Sales).stats.skipped_unresolved, 1);

    opts.sale_type_agreements.insert("1".to_string(), 42);
    let mapped = run(&stores, opts).await;
    assert_eq!(phase(&mapped, Phase::Sales).stats.inserted, 1);
    assert_eq!(stores.destination_sales(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_missing_reference_data_aborts() {
    let dir = TempDir::new().unwrap();
    let stores = MemoryStores::new();
    stores.add_legacy_sale(sale(1, "1001", 1));

    let (_stop_tx, stop_rx) = watch::channel(false);
    let result = Pipeline::new(stores.clone(), options(&dir, 1), stop_rx)
        .run()
        .await;

    assert!(matches!(result, Err(MigrationError::Setup(_))));
    assert!(!dir.path().join("checkpoint.json").exists());
}

#[tokio::test(start_paused = true)]
async fn test_installments_of_preexisting_sales_resolve() {
    let dir = TempDir::new().unwrap();
    let stores = fixture(0);
    let existing = stores.seed_destination_sale(1, 7);
    stores.add_legacy_sale(sale(1, "1001", 7));
    stores.add_legacy_installment(installment(1, "1001", 7, 1));

    let report = run(&stores, options(&dir, 1)).await;

    assert_eq!(phase(&report, Phase::Sales).stats.skipped_duplicate, 1);
    assert_eq!(phase(&report, Phase::Installments).stats.inserted, 1);
    assert_eq!(stores.destination_sale_id(1, 7), Some(existing));
}

#[tokio::test(start_paused = true)]
async fn test_unreadable_counts_keep_checkpoint_and_report() {
    let dir = TempDir::new().unwrap();
    let stores = fixture(5);
    let checkpoint_path = dir.path().join("checkpoint.json");
    stores.fail_counts(true);

    let report = run(&stores, options(&dir, 2)).await;

    assert_eq!(report.status, RunStatus::VerificationUnavailable);
    assert_eq!(report.status.exit_code(), 4);
    assert!(report.verification.is_none());
    assert_eq!(phase(&report, Phase::Sales).stats.inserted, 5);
    let summary = report.summary();
    assert!(summary.contains("sales"));
    assert!(summary.contains("verification could not run"));

    let recorded = read_checkpoint(&checkpoint_path).await.unwrap().unwrap();
    assert!(recorded.phase(Phase::Sales).unwrap().completed);
    assert!(recorded.phase(Phase::Installments).unwrap().completed);

    stores.fail_counts(false);
    let again = run(&stores, options(&dir, 2)).await;

    assert_eq!(again.status, RunStatus::Verified);
    assert!(again.resumed);
    assert_eq!(again.run_id, report.run_id);
    assert_eq!(phase(&again, Phase::Sales).stats.inserted, 5);
    assert_eq!(stores.destination_sales(), 5);
    assert!(!checkpoint_path.exists());
}

#[tokio::test(start_paused = true)]
async fn test_resume_with_more_workers_restarts_the_phase() {
    let dir = TempDir::new().unwrap();
    let stores = fixture(40);

    let (stop_tx, stop_rx) = watch::channel(false);
    stores.cancel_after_reads(2, stop_tx);
    let first = Pipeline::new(stores.clone(), options(&dir, 2), stop_rx)
        .run()
        .await
        .unwrap();
    assert_eq!(first.status, RunStatus::Incomplete);
    let partial = stores.destination_sales();
    assert!(partial > 0 && partial < 40);

    // three workers change the layout, so the sale phase starts over
    stores.clear_read_log();
    let second = run(&stores, options(&dir, 3)).await;

    let sale_reads: Vec<i64> = stores
        .read_log()
        .into_iter()
        .filter(|(p, _)| *p == Phase::Sales)
        .map(|(_, start)| start)
        .collect();
    for range_start in [1, 14, 27] {
        assert!(
            sale_reads.contains(&range_start),
            "no sale read from {}",
            range_start
        );
    }

    let sales = phase(&second, Phase::Sales);
    assert_eq!(sales.workers, 3);
    assert_eq!(sales.stats.scanned, 40);
    assert_eq!(sales.stats.inserted + sales.stats.skipped_duplicate, 40);
    assert_eq!(sales.stats.skipped_duplicate, partial as u64);
    assert!(sales.stats.is_conserved());
    assert_eq!(second.status, RunStatus::Verified);

    // same end state as an uninterrupted run
    let single_dir = TempDir::new().unwrap();
    let single = fixture(40);
    let reference = run(&single, options(&single_dir, 3)).await;
    assert_eq!(reference.status, RunStatus::Verified);
    assert_eq!(stores.destination_sales(), single.destination_sales());
    assert_eq!(
        stores.destination_installments(),
        single.destination_installments()
    );
}

#[tokio::test(start_paused = true)]
async fn test_skipped_window_of_unknown_size_is_counted_after_the_phase() {
    let dir = TempDir::new().unwrap();
    let stores = fixture(10);
    // every attempt at the first window fails, then so does its first count
    stores.fail_next_reads(3);
    stores.fail_next_range_counts(1);

    let report = run(&stores, options(&dir, 1)).await;

    let sales = phase(&report, Phase::Sales);
    assert_eq!(sales.stats.scanned, 10);
    assert_eq!(sales.stats.inserted, 5);
    assert_eq!(sales.stats.errored, 5);
    assert!(sales.stats.is_conserved());
    assert!(sales.poisoned.iter().any(|span| span.start == 1 && span.end == 6));
    assert!(sales.uncounted.is_empty());
    assert!(!report.summary().contains("unknown size"));
}

#[tokio::test(start_paused = true)]
async fn test_largest_id_is_refused() {
    let dir = TempDir::new().unwrap();
    let stores = fixture(0);
    stores.add_legacy_sale(sale(i64::MAX, "1001", 1));

    let (_stop_tx, stop_rx) = watch::channel(false);
    let result = Pipeline::new(stores.clone(), options(&dir, 1), stop_rx)
        .run()
        .await;

    assert!(matches!(result, Err(MigrationError::Setup(_))));
    assert_eq!(stores.destination_sales(), 0);
}
