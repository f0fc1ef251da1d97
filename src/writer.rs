//! Batch Writer.
//!
//! One bulk insert-or-skip per window. If the bulk operation itself fails
//! the window is replayed row by row, so one bad record only costs itself.

use crate::config::RetryPolicy;
use crate::models::{NewInstallment, NewSale, SaleKey};
use crate::reference::SaleKeyIndex;
use crate::retry::{with_retry, with_timeout};
use crate::store::DestinationStore;

/// Per-window write results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    pub inserted: u64,
    pub skipped_duplicate: u64,
    pub errored: u64,
    /// Whether the bulk insert failed and rows were written one by one.
    pub fell_back: bool,
}

impl WriteOutcome {
    pub fn total(&self) -> u64 {
        self.inserted + self.skipped_duplicate + self.errored
    }
}

pub struct BatchWriter<'a, D> {
    destination: &'a D,
    policy: &'a RetryPolicy,
    sale_index: &'a SaleKeyIndex,
}

impl<'a, D: DestinationStore> BatchWriter<'a, D> {
    pub fn new(destination: &'a D, policy: &'a RetryPolicy, sale_index: &'a SaleKeyIndex) -> Self {
        Self {
            destination,
            policy,
            sale_index,
        }
    }

    /// Writes staged sales and records every inserted sale in the SaleKeyIndex.
    ///
    /// One bulk insert-or-skip is tried first; if it fails the window is
    /// written row by row so a single bad row only costs itself.
    ///
    /// # Arguments
    ///
    /// * `rows` - The resolved sales of one window.
    ///
    /// # Returns
    ///
    /// * `WriteOutcome` - Inserted, duplicate and errored counts that add up
    ///   to `rows.len()`, and whether the per-row fallback ran.
    pub async fn write_sales(&self, rows: &[NewSale]) -> WriteOutcome {
        if rows.is_empty() {
            return WriteOutcome::default();
        }
        let destination = self.destination;

        match with_timeout(self.policy, "bulk insert sales", destination.insert_sales(rows)).await {
            Ok(inserted) => {
                let inserted_count = inserted.len() as u64;
                self.sale_index.extend(inserted);
                self.index_skipped_sales(rows).await;
                WriteOutcome {
                    inserted: inserted_count,
                    skipped_duplicate: rows.len() as u64 - inserted_count,
                    errored: 0,
                    fell_back: false,
                }
            }
            Err(e) => {
                tracing::warn!(
                    "Bulk insert of {} sales failed, writing row by row: {}",
                    rows.len(),
                    e
                );
                let outcome = self.sales_row_by_row(rows).await;
                self.index_skipped_sales(rows).await;
                outcome
            }
        }
    }

    async fn sales_row_by_row(&self, rows: &[NewSale]) -> WriteOutcome {
        let destination = self.destination;
        let mut outcome = WriteOutcome {
            fell_back: true,
            ..Default::default()
        };

        for row in rows {
            match with_retry(self.policy, "insert sale", || destination.insert_sale(row)).await {
                Ok(Some(sale)) => {
                    outcome.inserted += 1;
                    self.sale_index.extend([sale]);
                }
                Ok(None) => outcome.skipped_duplicate += 1,
                Err(e) if e.is_unique_violation() => outcome.skipped_duplicate += 1,
                Err(e) => {
                    outcome.errored += 1;
                    tracing::warn!("Sale with legacy id {} rejected: {}", row.legacy_id, e);
                }
            }
        }
        outcome
    }

    /// Sales skipped as duplicates may have been created outside this run;
    /// fetch their ids so their installments still resolve.
    async fn index_skipped_sales(&self, rows: &[NewSale]) {
        let mut missing: Vec<SaleKey> = rows
            .iter()
            .map(NewSale::key)
            .filter(|key| !self.sale_index.contains(key))
            .collect();
        missing.sort_unstable();
        missing.dedup();
        if missing.is_empty() {
            return;
        }

        let destination = self.destination;
        let missing = &missing;
        match with_retry(self.policy, "look up skipped sales", || {
            destination.find_sales(missing)
        })
        .await
        {
            Ok(found) => self.sale_index.extend(found),
            Err(e) => tracing::warn!(
                "Could not index {} skipped sales, their installments may stay unresolved: {}",
                missing.len(),
                e
            ),
        }
    }

    /// Writes staged installments, falling back to single rows like
    /// [`BatchWriter::write_sales`].
    ///
    /// # Arguments
    ///
    /// * `rows` - The resolved installments of one window.
    ///
    /// # Returns
    ///
    /// * `WriteOutcome` - Counts that add up to `rows.len()`.
    pub async fn write_installments(&self, rows: &[NewInstallment]) -> WriteOutcome {
        if rows.is_empty() {
            return WriteOutcome::default();
        }
        let destination = self.destination;

        match with_timeout(
            self.policy,
            "bulk insert installments",
            destination.insert_installments(rows),
        )
        .await
        {
            Ok(inserted) => {
                let inserted_count = inserted.len() as u64;
                WriteOutcome {
                    inserted: inserted_count,
                    skipped_duplicate: rows.len() as u64 - inserted_count,
                    errored: 0,
                    fell_back: false,
                }
            }
            Err(e) => {
                tracing::warn!(
                    "Bulk insert of {} installments failed, writing row by row: {}",
                    rows.len(),
                    e
                );
                self.installments_row_by_row(rows).await
            }
        }
    }

    async fn installments_row_by_row(&self, rows: &[NewInstallment]) -> WriteOutcome {
        let destination = self.destination;
        let mut outcome = WriteOutcome {
            fell_back: true,
            ..Default::default()
        };

        for row in rows {
            match with_retry(self.policy, "insert installment", || {
                destination.insert_installment(row)
            })
            .await
            {
                Ok(true) => outcome.inserted += 1,
                Ok(false) => outcome.skipped_duplicate += 1,
                Err(e) if e.is_unique_violation() => outcome.skipped_duplicate += 1,
                Err(e) => {
                    outcome.errored += 1;
                    tracing::warn!(
                        "Installment with legacy id {} rejected: {}",
                        row.legacy_id,
                        e
                    );
                }
            }
        }
        outcome
    }
}
