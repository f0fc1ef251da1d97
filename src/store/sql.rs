//! sqlx-backed stores: MySQL legacy source, PostgreSQL destination.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use sqlx::{MySqlPool, PgPool};
use std::time::Duration;

use super::{DestinationStore, SourceStore, StoreConnector};
use crate::db::{Database, LegacyDatabase};
use crate::errors::{MigrationError, ResultExt};
use crate::models::{
    AgreementRef, ExistingSale, InstallmentKey, LegacyInstallment, LegacySale, MemberRef,
    MemberRenumbering, NewInstallment, NewSale, Phase, SaleKey, TableBounds,
};

/// Opens one single-connection pool per store for each caller.
#[derive(Debug, Clone)]
pub struct SqlConnector {
    pub source_url: String,
    pub destination_url: String,
    pub acquire_timeout: Duration,
}

#[async_trait]
impl StoreConnector for SqlConnector {
    type Source = LegacySource;
    type Destination = PgDestination;

    async fn connect_source(&self) -> Result<LegacySource, MigrationError> {
        let db = LegacyDatabase::connect(&self.source_url, 1, self.acquire_timeout).await?;
        Ok(LegacySource { pool: db.pool })
    }

    async fn connect_destination(&self) -> Result<PgDestination, MigrationError> {
        let db = Database::connect(&self.destination_url, 1, self.acquire_timeout).await?;
        Ok(PgDestination { pool: db.pool })
    }
}

pub struct LegacySource {
    pool: MySqlPool,
}

#[async_trait]
impl SourceStore for LegacySource {
    async fn bounds(&self, phase: Phase) -> Result<TableBounds, MigrationError> {
        let sql = format!(
            "SELECT MIN(id), MAX(id), COUNT(*) FROM {}",
            phase.source_table()
        );
        let (min_id, max_id, row_count): (Option<i64>, Option<i64>, i64) =
            sqlx::query_as(&sql)
                .fetch_one(&self.pool)
                .await
                .with_context(|| format!("reading bounds of {}", phase.source_table()))?;

        Ok(TableBounds {
            min_id: min_id.unwrap_or(0),
            max_id: max_id.unwrap_or(0),
            row_count,
        })
    }

    async fn read_sales(
        &self,
        start: i64,
        end: i64,
        limit: usize,
    ) -> Result<Vec<LegacySale>, MigrationError> {
        let rows = sqlx::query_as::<_, LegacySale>(
            r#"
            SELECT id, member_number, sequence_number, agreement_code, sale_type,
                   amount, installment_count, sale_date, status
            FROM sales
            WHERE id >= ? AND id < ?
            ORDER BY id
            LIMIT ?
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn read_installments(
        &self,
        start: i64,
        end: i64,
        limit: usize,
    ) -> Result<Vec<LegacyInstallment>, MigrationError> {
        let rows = sqlx::query_as::<_, LegacyInstallment>(
            r#"
            SELECT id, member_number, sequence_number, installment_number,
                   amount, due_date, paid_date, status
            FROM installments
            WHERE id >= ? AND id < ?
            ORDER BY id
            LIMIT ?
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn count_range(
        &self,
        phase: Phase,
        start: i64,
        end: i64,
    ) -> Result<i64, MigrationError> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE id >= ? AND id < ?",
            phase.source_table()
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(start)
            .bind(end)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn count_rows(&self, phase: Phase) -> Result<i64, MigrationError> {
        let sql = format!("SELECT COUNT(*) FROM {}", phase.source_table());
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count)
    }

    async fn load_renumbering(&self) -> Result<Vec<MemberRenumbering>, MigrationError> {
        let rows = sqlx::query_as::<_, MemberRenumbering>(
            "SELECT old_number, new_number FROM member_renumbering",
        )
        .fetch_all(&self.pool)
        .await
        .context("loading member renumbering table")?;
        Ok(rows)
    }
}

pub struct PgDestination {
    pool: PgPool,
}

impl PgDestination {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DestinationStore for PgDestination {
    async fn load_members(&self) -> Result<Vec<MemberRef>, MigrationError> {
        let rows = sqlx::query_as::<_, MemberRef>(
            "SELECT id, registration FROM member WHERE registration IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await
        .context("loading members")?;
        Ok(rows)
    }

    async fn load_agreements(&self) -> Result<Vec<AgreementRef>, MigrationError> {
        let rows = sqlx::query_as::<_, AgreementRef>(
            "SELECT id, legacy_code FROM agreement WHERE legacy_code IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await
        .context("loading agreements")?;
        Ok(rows)
    }

    async fn load_sales(&self) -> Result<Vec<ExistingSale>, MigrationError> {
        let rows =
            sqlx::query_as::<_, ExistingSale>("SELECT id, member_id, sequence_number FROM sale")
                .fetch_all(&self.pool)
                .await
                .context("loading existing sales")?;
        Ok(rows)
    }

    async fn load_installment_keys(&self) -> Result<Vec<InstallmentKey>, MigrationError> {
        let rows = sqlx::query_as::<_, InstallmentKey>("SELECT sale_id, number FROM installment")
            .fetch_all(&self.pool)
            .await
            .context("loading existing installments")?;
        Ok(rows)
    }

    async fn insert_sales(&self, rows: &[NewSale]) -> Result<Vec<ExistingSale>, MigrationError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let member_ids: Vec<i64> = rows.iter().map(|r| r.member_id).collect();
        let agreement_ids: Vec<i64> = rows.iter().map(|r| r.agreement_id).collect();
        let sequences: Vec<i32> = rows.iter().map(|r| r.sequence_number).collect();
        let amounts: Vec<BigDecimal> = rows.iter().map(|r| r.amount.clone()).collect();
        let counts: Vec<i32> = rows.iter().map(|r| r.installment_count).collect();
        let dates: Vec<Option<NaiveDate>> = rows.iter().map(|r| r.sale_date).collect();
        let statuses: Vec<String> = rows.iter().map(|r| r.status.clone()).collect();

        let inserted = sqlx::query_as::<_, ExistingSale>(
            r#"
            INSERT INTO sale (
                member_id, agreement_id, sequence_number, amount,
                installment_count, sale_date, status, created_at
            )
            SELECT m, a, s, am, ic, sd, st, now()
            FROM UNNEST(
                $1::int8[], $2::int8[], $3::int4[], $4::numeric[],
                $5::int4[], $6::date[], $7::text[]
            ) AS t(m, a, s, am, ic, sd, st)
            ON CONFLICT (member_id, sequence_number) DO NOTHING
            RETURNING id, member_id, sequence_number
            "#,
        )
        .bind(&member_ids)
        .bind(&agreement_ids)
        .bind(&sequences)
        .bind(&amounts)
        .bind(&counts)
        .bind(&dates)
        .bind(&statuses)
        .fetch_all(&self.pool)
        .await?;

        Ok(inserted)
    }

    async fn insert_sale(&self, row: &NewSale) -> Result<Option<ExistingSale>, MigrationError> {
        let inserted = sqlx::query_as::<_, ExistingSale>(
            r#"
            INSERT INTO sale (
                member_id, agreement_id, sequence_number, amount,
                installment_count, sale_date, status, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, now())
            ON CONFLICT (member_id, sequence_number) DO NOTHING
            RETURNING id, member_id, sequence_number
            "#,
        )
        .bind(row.member_id)
        .bind(row.agreement_id)
        .bind(row.sequence_number)
        .bind(&row.amount)
        .bind(row.installment_count)
        .bind(row.sale_date)
        .bind(&row.status)
        .fetch_optional(&self.pool)
        .await?;

        Ok(inserted)
    }

    async fn find_sales(&self, keys: &[SaleKey]) -> Result<Vec<ExistingSale>, MigrationError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let member_ids: Vec<i64> = keys.iter().map(|k| k.member_id).collect();
        let sequences: Vec<i32> = keys.iter().map(|k| k.sequence_number).collect();

        let rows = sqlx::query_as::<_, ExistingSale>(
            r#"
            SELECT s.id, s.member_id, s.sequence_number
            FROM sale s
            JOIN UNNEST($1::int8[], $2::int4[]) AS k(member_id, sequence_number)
              ON s.member_id = k.member_id AND s.sequence_number = k.sequence_number
            "#,
        )
        .bind(&member_ids)
        .bind(&sequences)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn insert_installments(
        &self,
        rows: &[NewInstallment],
    ) -> Result<Vec<InstallmentKey>, MigrationError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let sale_ids: Vec<i64> = rows.iter().map(|r| r.sale_id).collect();
        let numbers: Vec<i32> = rows.iter().map(|r| r.number).collect();
        let amounts: Vec<BigDecimal> = rows.iter().map(|r| r.amount.clone()).collect();
        let due_dates: Vec<Option<NaiveDate>> = rows.iter().map(|r| r.due_date).collect();
        let paid_dates: Vec<Option<NaiveDate>> = rows.iter().map(|r| r.paid_date).collect();
        let statuses: Vec<String> = rows.iter().map(|r| r.status.clone()).collect();

        let inserted = sqlx::query_as::<_, InstallmentKey>(
            r#"
            INSERT INTO installment (
                sale_id, number, amount, due_date, paid_at, status, created_at
            )
            SELECT s, n, am, dd, pd, st, now()
            FROM UNNEST(
                $1::int8[], $2::int4[], $3::numeric[], $4::date[], $5::date[], $6::text[]
            ) AS t(s, n, am, dd, pd, st)
            ON CONFLICT (sale_id, number) DO NOTHING
            RETURNING sale_id, number
            "#,
        )
        .bind(&sale_ids)
        .bind(&numbers)
        .bind(&amounts)
        .bind(&due_dates)
        .bind(&paid_dates)
        .bind(&statuses)
        .fetch_all(&self.pool)
        .await?;

        Ok(inserted)
    }

    async fn insert_installment(&self, row: &NewInstallment) -> Result<bool, MigrationError> {
        let result = sqlx::query(
            r#"
            INSERT INTO installment (
                sale_id, number, amount, due_date, paid_at, status, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, now())
            ON CONFLICT (sale_id, number) DO NOTHING
            "#,
        )
        .bind(row.sale_id)
        .bind(row.number)
        .bind(&row.amount)
        .bind(row.due_date)
        .bind(row.paid_date)
        .bind(&row.status)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn count_rows(&self, phase: Phase) -> Result<i64, MigrationError> {
        let sql = format!("SELECT COUNT(*) FROM {}", phase.destination_table());
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count)
    }
}
