//! In-process stores.
//!
//! Both stores live behind shared handles so every "connection" a worker
//! opens sees the same data. The destination enforces the constraints the
//! real schema has: natural-key uniqueness (skipped, like `ON CONFLICT DO
//! NOTHING`), foreign keys, non-negative amounts and positive installment
//! numbers. A bulk insert containing one violating row fails as a whole,
//! the way a single SQL statement would.
//!
//! Fault injection covers transient read failures, failing bulk writes,
//! failing row counts and raising the stop signal after a number of reads.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

use super::{DestinationStore, SourceStore, StoreConnector};
use crate::errors::MigrationError;
use crate::models::{
    AgreementRef, ExistingSale, InstallmentKey, LegacyInstallment, LegacySale, MemberRef,
    MemberRenumbering, NewInstallment, NewSale, Phase, SaleKey, TableBounds,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct LegacyData {
    sales: BTreeMap<i64, LegacySale>,
    installments: BTreeMap<i64, LegacyInstallment>,
    renumbering: Vec<MemberRenumbering>,
}

#[derive(Debug, Default)]
struct DestinationData {
    members: Vec<MemberRef>,
    agreements: Vec<AgreementRef>,
    sales: HashMap<SaleKey, ExistingSale>,
    installments: HashSet<InstallmentKey>,
    next_sale_id: i64,
}

impl DestinationData {
    fn check_sale(&self, row: &NewSale) -> Result<(), MigrationError> {
        if !self.members.iter().any(|m| m.id == row.member_id) {
            return Err(MigrationError::Store(format!(
                "sale (legacy id {}) violates foreign key sale_member_id_fkey",
                row.legacy_id
            )));
        }
        if !self.agreements.iter().any(|a| a.id == row.agreement_id) {
            return Err(MigrationError::Store(format!(
                "sale (legacy id {}) violates foreign key sale_agreement_id_fkey",
                row.legacy_id
            )));
        }
        if row.amount < BigDecimal::from(0) {
            return Err(MigrationError::Store(format!(
                "sale (legacy id {}) violates check constraint sale_amount_check",
                row.legacy_id
            )));
        }
        Ok(())
    }

    fn check_installment(&self, row: &NewInstallment) -> Result<(), MigrationError> {
        if !self.sales.values().any(|s| s.id == row.sale_id) {
            return Err(MigrationError::Store(format!(
                "installment (legacy id {}) violates foreign key installment_sale_id_fkey",
                row.legacy_id
            )));
        }
        if row.number <= 0 || row.amount < BigDecimal::from(0) {
            return Err(MigrationError::Store(format!(
                "installment (legacy id {}) violates check constraint installment_check",
                row.legacy_id
            )));
        }
        Ok(())
    }

    fn put_sale(&mut self, row: &NewSale) -> Option<ExistingSale> {
        let key = row.key();
        if self.sales.contains_key(&key) {
            return None;
        }
        self.next_sale_id += 1;
        let sale = ExistingSale {
            id: self.next_sale_id,
            member_id: row.member_id,
            sequence_number: row.sequence_number,
        };
        self.sales.insert(key, sale);
        Some(sale)
    }
}

#[derive(Debug, Default)]
struct Faults {
    failing_reads: AtomicU32,
    fail_bulk_writes: AtomicBool,
    fail_counts: AtomicBool,
    failing_range_counts: AtomicU32,
    reads: AtomicUsize,
    cancel_after_reads: Mutex<Option<(usize, watch::Sender<bool>)>>,
    read_log: Mutex<Vec<(Phase, i64)>>,
}

impl Faults {
    fn on_read(&self, phase: Phase, start: i64) -> Result<(), MigrationError> {
        let failing = self.failing_reads.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_reads.store(failing - 1, Ordering::SeqCst);
            return Err(MigrationError::Transient(
                "connection reset by peer".to_string(),
            ));
        }

        lock(&self.read_log).push((phase, start));
        let served = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, tx)) = lock(&self.cancel_after_reads).as_ref() {
            if served >= *after {
                let _ = tx.send(true);
            }
        }
        Ok(())
    }

    fn on_range_count(&self) -> Result<(), MigrationError> {
        let failing = self.failing_range_counts.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_range_counts.store(failing - 1, Ordering::SeqCst);
            return Err(MigrationError::Transient("connection reset by peer".to_string()));
        }
        Ok(())
    }

    fn on_table_count(&self) -> Result<(), MigrationError> {
        if self.fail_counts.load(Ordering::SeqCst) {
            return Err(MigrationError::Transient(
                "statement timeout while counting".to_string(),
            ));
        }
        Ok(())
    }
}

/// Shared handle to an in-memory legacy store and destination store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStores {
    legacy: Arc<Mutex<LegacyData>>,
    destination: Arc<Mutex<DestinationData>>,
    faults: Arc<Faults>,
}

impl MemoryStores {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_member(&self, id: i64, registration: &str) {
        lock(&self.destination).members.push(MemberRef {
            id,
            registration: registration.to_string(),
        });
    }

    pub fn add_agreement(&self, id: i64, legacy_code: &str) {
        lock(&self.destination).agreements.push(AgreementRef {
            id,
            legacy_code: legacy_code.to_string(),
        });
    }

    pub fn add_renumbering(&self, old_number: &str, new_number: &str) {
        lock(&self.legacy).renumbering.push(MemberRenumbering {
            old_number: old_number.to_string(),
            new_number: new_number.to_string(),
        });
    }

    pub fn add_legacy_sale(&self, sale: LegacySale) {
        lock(&self.legacy).sales.insert(sale.id, sale);
    }

    pub fn add_legacy_installment(&self, installment: LegacyInstallment) {
        lock(&self.legacy)
            .installments
            .insert(installment.id, installment);
    }

    /// Inserts a sale directly into the destination, as if created by hand.
    pub fn seed_destination_sale(&self, member_id: i64, sequence_number: i32) -> i64 {
        let mut dest = lock(&self.destination);
        dest.next_sale_id += 1;
        let sale = ExistingSale {
            id: dest.next_sale_id,
            member_id,
            sequence_number,
        };
        dest.sales.insert(sale.key(), sale);
        sale.id
    }

    pub fn destination_sales(&self) -> usize {
        lock(&self.destination).sales.len()
    }

    pub fn destination_installments(&self) -> usize {
        lock(&self.destination).installments.len()
    }

    pub fn destination_sale_id(&self, member_id: i64, sequence_number: i32) -> Option<i64> {
        lock(&self.destination)
            .sales
            .get(&SaleKey {
                member_id,
                sequence_number,
            })
            .map(|s| s.id)
    }

    /// Makes the next `count` reads fail with a transient error.
    pub fn fail_next_reads(&self, count: u32) {
        self.faults.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Makes every bulk insert fail at the operation level.
    pub fn fail_bulk_writes(&self, fail: bool) {
        self.faults.fail_bulk_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes every whole-table count fail with a transient error.
    pub fn fail_counts(&self, fail: bool) {
        self.faults.fail_counts.store(fail, Ordering::SeqCst);
    }

    /// Makes the next `count` id-range counts fail with a transient error.
    pub fn fail_next_range_counts(&self, count: u32) {
        self.faults.failing_range_counts.store(count, Ordering::SeqCst);
    }

    /// Raises `stop` once `reads` windows have been served.
    pub fn cancel_after_reads(&self, reads: usize, stop: watch::Sender<bool>) {
        *lock(&self.faults.cancel_after_reads) = Some((reads, stop));
    }

    /// Every successful window read as `(phase, start id)`, in order served.
    pub fn read_log(&self) -> Vec<(Phase, i64)> {
        lock(&self.faults.read_log).clone()
    }

    pub fn clear_read_log(&self) {
        lock(&self.faults.read_log).clear();
        self.faults.reads.store(0, Ordering::SeqCst);
        *lock(&self.faults.cancel_after_reads) = None;
    }
}

#[async_trait]
impl StoreConnector for MemoryStores {
    type Source = MemoryStores;
    type Destination = MemoryStores;

    async fn connect_source(&self) -> Result<MemoryStores, MigrationError> {
        Ok(self.clone())
    }

    async fn connect_destination(&self) -> Result<MemoryStores, MigrationError> {
        Ok(self.clone())
    }
}

#[async_trait]
impl SourceStore for MemoryStores {
    async fn bounds(&self, phase: Phase) -> Result<TableBounds, MigrationError> {
        let legacy = lock(&self.legacy);
        let ids: Vec<i64> = match phase {
            Phase::Sales => legacy.sales.keys().copied().collect(),
            Phase::Installments => legacy.installments.keys().copied().collect(),
        };
        Ok(TableBounds {
            min_id: ids.first().copied().unwrap_or(0),
            max_id: ids.last().copied().unwrap_or(0),
            row_count: ids.len() as i64,
        })
    }

    async fn read_sales(
        &self,
        start: i64,
        end: i64,
        limit: usize,
    ) -> Result<Vec<LegacySale>, MigrationError> {
        self.faults.on_read(Phase::Sales, start)?;
        let legacy = lock(&self.legacy);
        Ok(legacy
            .sales
            .range(start..end)
            .take(limit)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn read_installments(
        &self,
        start: i64,
        end: i64,
        limit: usize,
    ) -> Result<Vec<LegacyInstallment>, MigrationError> {
        self.faults.on_read(Phase::Installments, start)?;
        let legacy = lock(&self.legacy);
        Ok(legacy
            .installments
            .range(start..end)
            .take(limit)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn count_range(
        &self,
        phase: Phase,
        start: i64,
        end: i64,
    ) -> Result<i64, MigrationError> {
        self.faults.on_range_count()?;
        let legacy = lock(&self.legacy);
        let count = match phase {
            Phase::Sales => legacy.sales.range(start..end).count(),
            Phase::Installments => legacy.installments.range(start..end).count(),
        };
        Ok(count as i64)
    }

    async fn count_rows(&self, phase: Phase) -> Result<i64, MigrationError> {
        self.faults.on_table_count()?;
        let legacy = lock(&self.legacy);
        let count = match phase {
            Phase::Sales => legacy.sales.len(),
            Phase::Installments => legacy.installments.len(),
        };
        Ok(count as i64)
    }

    async fn load_renumbering(&self) -> Result<Vec<MemberRenumbering>, MigrationError> {
        Ok(lock(&self.legacy).renumbering.clone())
    }
}

#[async_trait]
impl DestinationStore for MemoryStores {
    async fn load_members(&self) -> Result<Vec<MemberRef>, MigrationError> {
        Ok(lock(&self.destination).members.clone())
    }

    async fn load_agreements(&self) -> Result<Vec<AgreementRef>, MigrationError> {
        Ok(lock(&self.destination).agreements.clone())
    }

    async fn load_sales(&self) -> Result<Vec<ExistingSale>, MigrationError> {
        Ok(lock(&self.destination).sales.values().copied().collect())
    }

    async fn load_installment_keys(&self) -> Result<Vec<InstallmentKey>, MigrationError> {
        Ok(lock(&self.destination)
            .installments
            .iter()
            .copied()
            .collect())
    }

    async fn insert_sales(&self, rows: &[NewSale]) -> Result<Vec<ExistingSale>, MigrationError> {
        if self.faults.fail_bulk_writes.load(Ordering::SeqCst) {
            return Err(MigrationError::Transient(
                "bulk insert rejected: payload too large".to_string(),
            ));
        }
        let mut dest = lock(&self.destination);
        for row in rows {
            dest.check_sale(row)?;
        }
        Ok(rows.iter().filter_map(|row| dest.put_sale(row)).collect())
    }

    async fn insert_sale(&self, row: &NewSale) -> Result<Option<ExistingSale>, MigrationError> {
        let mut dest = lock(&self.destination);
        dest.check_sale(row)?;
        Ok(dest.put_sale(row))
    }

    async fn find_sales(&self, keys: &[SaleKey]) -> Result<Vec<ExistingSale>, MigrationError> {
        let dest = lock(&self.destination);
        Ok(keys
            .iter()
            .filter_map(|key| dest.sales.get(key).copied())
            .collect())
    }

    async fn insert_installments(
        &self,
        rows: &[NewInstallment],
    ) -> Result<Vec<InstallmentKey>, MigrationError> {
        if self.faults.fail_bulk_writes.load(Ordering::SeqCst) {
            return Err(MigrationError::Transient(
                "bulk insert rejected: payload too large".to_string(),
            ));
        }
        let mut dest = lock(&self.destination);
        for row in rows {
            dest.check_installment(row)?;
        }
        Ok(rows
            .iter()
            .map(NewInstallment::key)
            .filter(|key| dest.installments.insert(*key))
            .collect())
    }

    async fn insert_installment(&self, row: &NewInstallment) -> Result<bool, MigrationError> {
        let mut dest = lock(&self.destination);
        dest.check_installment(row)?;
        Ok(dest.installments.insert(row.key()))
    }

    async fn count_rows(&self, phase: Phase) -> Result<i64, MigrationError> {
        self.faults.on_table_count()?;
        let dest = lock(&self.destination);
        let count = match phase {
            Phase::Sales => dest.sales.len(),
            Phase::Installments => dest.installments.len(),
        };
        Ok(count as i64)
    }
}
