use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::ops::AddAssign;

// ============ Legacy (source) rows ============

/// A row of the legacy `sales` table.
///
/// Immutable input; the pipeline never writes to the legacy store.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct LegacySale {
    /// Monotonically increasing row id, used for windowing.
    pub id: i64,
    /// Member number as typed into the legacy system (may be pre-renumbering).
    pub member_number: Option<String>,
    /// Sequence number of the sale for that member.
    pub sequence_number: Option<i32>,
    /// Merchant/bank code the sale was made through.
    pub agreement_code: Option<String>,
    /// Legacy "tipo" business code, used when no agreement code is present.
    pub sale_type: Option<String>,
    /// Total amount.
    pub amount: Option<BigDecimal>,
    /// Number of installments the sale was split into.
    pub installment_count: Option<i32>,
    /// Date of the sale.
    pub sale_date: Option<NaiveDate>,
    /// Free-form legacy status.
    pub status: Option<String>,
}

/// A row of the legacy `installments` table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct LegacyInstallment {
    pub id: i64,
    pub member_number: Option<String>,
    pub sequence_number: Option<i32>,
    pub installment_number: Option<i32>,
    pub amount: Option<BigDecimal>,
    pub due_date: Option<NaiveDate>,
    pub paid_date: Option<NaiveDate>,
    pub status: Option<String>,
}

/// A row of the legacy `member_renumbering` table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct MemberRenumbering {
    pub old_number: String,
    pub new_number: String,
}

// ============ Destination rows ============

/// A member as registered in the destination store.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct MemberRef {
    pub id: i64,
    pub registration: String,
}

/// An agreement as registered in the destination store.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AgreementRef {
    pub id: i64,
    pub legacy_code: String,
}

/// A sale already present in the destination store, with its natural key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct ExistingSale {
    pub id: i64,
    pub member_id: i64,
    pub sequence_number: i32,
}

impl ExistingSale {
    pub fn key(&self) -> SaleKey {
        SaleKey {
            member_id: self.member_id,
            sequence_number: self.sequence_number,
        }
    }
}

/// A sale ready to be written to the destination `sale` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSale {
    /// Legacy row id, kept for logging only.
    pub legacy_id: i64,
    pub member_id: i64,
    pub agreement_id: i64,
    pub sequence_number: i32,
    pub amount: BigDecimal,
    pub installment_count: i32,
    pub sale_date: Option<NaiveDate>,
    pub status: String,
}

impl NewSale {
    pub fn key(&self) -> SaleKey {
        SaleKey {
            member_id: self.member_id,
            sequence_number: self.sequence_number,
        }
    }
}

/// An installment ready to be written to the destination `installment` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewInstallment {
    pub legacy_id: i64,
    pub sale_id: i64,
    pub number: i32,
    pub amount: BigDecimal,
    pub due_date: Option<NaiveDate>,
    pub paid_date: Option<NaiveDate>,
    pub status: String,
}

impl NewInstallment {
    pub fn key(&self) -> InstallmentKey {
        InstallmentKey {
            sale_id: self.sale_id,
            number: self.number,
        }
    }
}

// ============ Natural keys ============

/// Natural key of a sale: (resolved member id, sequence number).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SaleKey {
    pub member_id: i64,
    pub sequence_number: i32,
}

/// Natural key of an installment: (destination sale id, installment number).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, FromRow, Serialize, Deserialize)]
pub struct InstallmentKey {
    pub sale_id: i64,
    pub number: i32,
}

// ============ Run bookkeeping ============

/// A migration phase. Installments depend on the sale phase having finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Sales,
    Installments,
}

impl Phase {
    /// Phases in execution order.
    pub const ALL: [Phase; 2] = [Phase::Sales, Phase::Installments];

    /// Legacy table read during this phase.
    pub fn source_table(&self) -> &'static str {
        match self {
            Phase::Sales => "sales",
            Phase::Installments => "installments",
        }
    }

    /// Destination table written during this phase.
    pub fn destination_table(&self) -> &'static str {
        match self {
            Phase::Sales => "sale",
            Phase::Installments => "installment",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Sales => write!(f, "sales"),
            Phase::Installments => write!(f, "installments"),
        }
    }
}

/// `MIN(id)`, `MAX(id)` and `COUNT(*)` of a legacy table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableBounds {
    pub min_id: i64,
    pub max_id: i64,
    pub row_count: i64,
}

impl TableBounds {
    /// `max_id + 1`, the end of the half-open id range; `None` when
    /// `max_id` is `i64::MAX`.
    pub fn end_exclusive(&self) -> Option<i64> {
        self.max_id.checked_add(1)
    }
}

/// Per-phase counters.
///
/// `inserted + skipped_duplicate + skipped_unresolved + errored == scanned`
/// holds after every window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub scanned: u64,
    pub inserted: u64,
    pub skipped_duplicate: u64,
    pub skipped_unresolved: u64,
    pub errored: u64,
}

impl RunStats {
    /// Rows accounted for by one of the four outcome buckets.
    pub fn classified(&self) -> u64 {
        self.inserted + self.skipped_duplicate + self.skipped_unresolved + self.errored
    }

    pub fn is_conserved(&self) -> bool {
        self.classified() == self.scanned
    }
}

impl AddAssign for RunStats {
    fn add_assign(&mut self, other: Self) {
        self.scanned += other.scanned;
        self.inserted += other.inserted;
        self.skipped_duplicate += other.skipped_duplicate;
        self.skipped_unresolved += other.skipped_unresolved;
        self.errored += other.errored;
    }
}

/// Normalizes a member number for joining legacy and destination data:
/// surrounding whitespace and leading zeros are dropped.
pub fn normalize_member_number(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let stripped = trimmed.trim_start_matches('0');
    if stripped.is_empty() {
        // "000" is a real (if odd) number
        Some("0".to_string())
    } else {
        Some(stripped.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_member_number() {
        assert_eq!(normalize_member_number(" 00123 "), Some("123".to_string()));
        assert_eq!(normalize_member_number("123"), Some("123".to_string()));
        assert_eq!(normalize_member_number("000"), Some("0".to_string()));
        assert_eq!(normalize_member_number("   "), None);
    }

    #[test]
    fn test_run_stats_conservation() {
        let mut stats = RunStats {
            scanned: 10,
            inserted: 6,
            skipped_duplicate: 2,
            skipped_unresolved: 1,
            errored: 1,
        };
        assert!(stats.is_conserved());
        stats += RunStats {
            scanned: 1,
            ..Default::default()
        };
        assert!(!stats.is_conserved());
    }

    #[test]
    fn test_bounds_end_exclusive() {
        let bounds = TableBounds {
            min_id: 1,
            max_id: 10,
            row_count: 10,
        };
        assert_eq!(bounds.end_exclusive(), Some(11));
        let top = TableBounds {
            max_id: i64::MAX,
            ..bounds
        };
        assert_eq!(top.end_exclusive(), None);
    }

    #[test]
    fn test_phase_tables() {
        assert_eq!(Phase::Sales.source_table(), "sales");
        assert_eq!(Phase::Installments.destination_table(), "installment");
        assert_eq!(
            serde_json::to_string(&Phase::Installments).unwrap(),
            "\"installments\""
        );
    }
}
