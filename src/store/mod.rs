//! Store seams.
//!
//! The pipeline only ever talks to the two stores through these traits. The
//! `sql` module implements them over sqlx (MySQL legacy, PostgreSQL
//! destination); `memory` implements them in-process with the same
//! uniqueness rules, for tests and rehearsals.

pub mod memory;
pub mod sql;

use async_trait::async_trait;

use crate::errors::MigrationError;
use crate::models::{
    AgreementRef, ExistingSale, InstallmentKey, LegacyInstallment, LegacySale, MemberRef,
    MemberRenumbering, NewInstallment, NewSale, Phase, SaleKey, TableBounds,
};

/// Read interface of the legacy store.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// `MIN(id)`, `MAX(id)`, `COUNT(*)` of the table read in `phase`.
    async fn bounds(&self, phase: Phase) -> Result<TableBounds, MigrationError>;

    /// Sales with `start <= id < end`, ascending by id, at most `limit` rows.
    async fn read_sales(
        &self,
        start: i64,
        end: i64,
        limit: usize,
    ) -> Result<Vec<LegacySale>, MigrationError>;

    /// Installments with `start <= id < end`, ascending by id, at most `limit` rows.
    async fn read_installments(
        &self,
        start: i64,
        end: i64,
        limit: usize,
    ) -> Result<Vec<LegacyInstallment>, MigrationError>;

    /// Number of rows with `start <= id < end`.
    async fn count_range(&self, phase: Phase, start: i64, end: i64)
        -> Result<i64, MigrationError>;

    /// Total rows of the table read in `phase`.
    async fn count_rows(&self, phase: Phase) -> Result<i64, MigrationError>;

    async fn load_renumbering(&self) -> Result<Vec<MemberRenumbering>, MigrationError>;
}

/// Write interface of the destination store.
#[async_trait]
pub trait DestinationStore: Send + Sync {
    async fn load_members(&self) -> Result<Vec<MemberRef>, MigrationError>;

    async fn load_agreements(&self) -> Result<Vec<AgreementRef>, MigrationError>;

    async fn load_sales(&self) -> Result<Vec<ExistingSale>, MigrationError>;

    async fn load_installment_keys(&self) -> Result<Vec<InstallmentKey>, MigrationError>;

    /// Bulk insert, skipping rows whose natural key already exists.
    /// Returns only the rows that were actually inserted.
    async fn insert_sales(&self, rows: &[NewSale]) -> Result<Vec<ExistingSale>, MigrationError>;

    /// Single-row insert. `Ok(None)` means the natural key already existed.
    async fn insert_sale(&self, row: &NewSale) -> Result<Option<ExistingSale>, MigrationError>;

    /// Looks up destination sales by natural key.
    async fn find_sales(&self, keys: &[SaleKey]) -> Result<Vec<ExistingSale>, MigrationError>;

    /// Bulk insert, skipping rows whose natural key already exists.
    /// Returns the keys that were actually inserted.
    async fn insert_installments(
        &self,
        rows: &[NewInstallment],
    ) -> Result<Vec<InstallmentKey>, MigrationError>;

    /// Single-row insert. `Ok(false)` means the natural key already existed.
    async fn insert_installment(&self, row: &NewInstallment) -> Result<bool, MigrationError>;

    /// Total rows of the table written in `phase`.
    async fn count_rows(&self, phase: Phase) -> Result<i64, MigrationError>;
}

/// Opens connections. Called once for setup and once per worker, so each
/// worker owns its pair of connections for its whole lifetime.
#[async_trait]
pub trait StoreConnector: Send + Sync + 'static {
    type Source: SourceStore + 'static;
    type Destination: DestinationStore + 'static;

    async fn connect_source(&self) -> Result<Self::Source, MigrationError>;

    async fn connect_destination(&self) -> Result<Self::Destination, MigrationError>;
}
