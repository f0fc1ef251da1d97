//! Batch Transformer: legacy window -> destination rows.
//!
//! Applies the field renames, coercions and null defaults, resolves keys and
//! sorts every row into exactly one of: staged, duplicate, unresolved.

use bigdecimal::BigDecimal;

use crate::models::{LegacyInstallment, LegacySale, NewInstallment, NewSale, RunStats};
use crate::resolver::{KeyResolver, Resolution};

pub const DEFAULT_SALE_STATUS: &str = "ACTIVE";
pub const PAID_INSTALLMENT_STATUS: &str = "PAID";
pub const OPEN_INSTALLMENT_STATUS: &str = "OPEN";

/// One window after transformation.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformedWindow<T> {
    /// Rows to hand to the Batch Writer.
    pub staged: Vec<T>,
    /// Scanned / duplicate / unresolved counts; insert outcomes are added by the writer.
    pub stats: RunStats,
    /// Highest legacy id in the window.
    pub last_id: Option<i64>,
}

impl<T> Default for TransformedWindow<T> {
    fn default() -> Self {
        Self {
            staged: Vec::new(),
            stats: RunStats::default(),
            last_id: None,
        }
    }
}

pub struct BatchTransformer<'a> {
    resolver: &'a KeyResolver,
}

impl<'a> BatchTransformer<'a> {
    pub fn new(resolver: &'a KeyResolver) -> Self {
        Self { resolver }
    }

    pub fn sales(&self, rows: &[LegacySale]) -> TransformedWindow<NewSale> {
        let mut window = TransformedWindow::default();
        for row in rows {
            window.stats.scanned += 1;
            window.last_id = Some(row.id);

            let target = match self.resolver.resolve_sale(row) {
                Resolution::Resolved(target) => target,
                Resolution::Unresolved(reason) => {
                    tracing::debug!("Sale {} unresolved: {:?}", row.id, reason);
                    window.stats.skipped_unresolved += 1;
                    continue;
                }
            };

            if self.resolver.sale_exists(&target.key) {
                window.stats.skipped_duplicate += 1;
                continue;
            }

            window.staged.push(NewSale {
                legacy_id: row.id,
                member_id: target.key.member_id,
                agreement_id: target.agreement_id,
                sequence_number: target.key.sequence_number,
                amount: row.amount.clone().unwrap_or_else(|| BigDecimal::from(0)),
                installment_count: row.installment_count.filter(|n| *n > 0).unwrap_or(1),
                sale_date: row.sale_date,
                status: normalize_status(row.status.as_deref())
                    .unwrap_or_else(|| DEFAULT_SALE_STATUS.to_string()),
            });
        }
        window
    }

    pub fn installments(&self, rows: &[LegacyInstallment]) -> TransformedWindow<NewInstallment> {
        let mut window = TransformedWindow::default();
        for row in rows {
            window.stats.scanned += 1;
            window.last_id = Some(row.id);

            let key = match self.resolver.resolve_installment(row) {
                Resolution::Resolved(key) => key,
                Resolution::Unresolved(reason) => {
                    tracing::debug!("Installment {} unresolved: {:?}", row.id, reason);
                    window.stats.skipped_unresolved += 1;
                    continue;
                }
            };

            if self.resolver.installment_exists(&key) {
                window.stats.skipped_duplicate += 1;
                continue;
            }

            let status = normalize_status(row.status.as_deref()).unwrap_or_else(|| {
                if row.paid_date.is_some() {
                    PAID_INSTALLMENT_STATUS.to_string()
                } else {
                    OPEN_INSTALLMENT_STATUS.to_string()
                }
            });

            window.staged.push(NewInstallment {
                legacy_id: row.id,
                sale_id: key.sale_id,
                number: key.number,
                amount: row.amount.clone().unwrap_or_else(|| BigDecimal::from(0)),
                due_date: row.due_date,
                paid_date: row.paid_date,
                status,
            });
        }
        window
    }
}

fn normalize_status(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_uppercase)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgreementRef, ExistingSale, InstallmentKey, MemberRef};
    use crate::reference::{
        AgreementKeyMap, ExistingKeySet, MemberKeyMap, ReferenceData, SaleKeyIndex,
    };
    use chrono::NaiveDate;
    use std::collections::HashMap;
    use std::str::FromStr;
    use std::sync::Arc;

    fn resolver() -> KeyResolver {
        let existing_sale = ExistingSale {
            id: 70,
            member_id: 1,
            sequence_number: 1,
        };
        let sale_index = SaleKeyIndex::default();
        sale_index.extend([existing_sale]);
        KeyResolver::new(Arc::new(ReferenceData {
            members: MemberKeyMap::new(
                vec![MemberRef {
                    id: 1,
                    registration: "100".to_string(),
                }],
                Vec::new(),
            ),
            agreements: AgreementKeyMap::new(
                vec![AgreementRef {
                    id: 5,
                    legacy_code: "A".to_string(),
                }],
                &HashMap::new(),
            ),
            existing: ExistingKeySet::new(
                &[existing_sale],
                vec![InstallmentKey {
                    sale_id: 70,
                    number: 1,
                }],
            ),
            sale_index,
        }))
    }

    fn sale(id: i64, member: &str, sequence: i32) -> LegacySale {
        LegacySale {
            id,
            member_number: Some(member.to_string()),
            sequence_number: Some(sequence),
            agreement_code: Some("A".to_string()),
            sale_type: None,
            amount: None,
            installment_count: None,
            sale_date: None,
            status: None,
        }
    }

    #[test]
    fn test_sales_window_classifies_every_row() {
        let r = resolver();
        let window = BatchTransformer::new(&r).sales(&[
            sale(1, "100", 1), // already migrated
            sale(2, "100", 2),
            sale(3, "9999999", 1),
        ]);

        assert_eq!(window.stats.scanned, 3);
        assert_eq!(window.stats.skipped_duplicate, 1);
        assert_eq!(window.stats.skipped_unresolved, 1);
        assert_eq!(window.staged.len(), 1);
        assert_eq!(window.last_id, Some(3));
    }

    #[test]
    fn test_sale_null_defaults() {
        let r = resolver();
        let window = BatchTransformer::new(&r).sales(&[sale(2, "100", 2)]);
        let staged = &window.staged[0];

        assert_eq!(staged.amount, BigDecimal::from(0));
        assert_eq!(staged.installment_count, 1);
        assert_eq!(staged.status, DEFAULT_SALE_STATUS);
        assert_eq!(staged.agreement_id, 5);
    }

    #[test]
    fn test_installment_status_defaults() {
        let r = resolver();
        let paid = LegacyInstallment {
            id: 10,
            member_number: Some("100".to_string()),
            sequence_number: Some(1),
            installment_number: Some(2),
            amount: Some(BigDecimal::from_str("12.50").unwrap()),
            due_date: NaiveDate::from_ymd_opt(2020, 1, 10),
            paid_date: NaiveDate::from_ymd_opt(2020, 1, 9),
            status: Some("  ".to_string()),
        };
        let open = LegacyInstallment {
            id: 11,
            installment_number: Some(3),
            paid_date: None,
            status: Some(" late ".to_string()),
            ..paid.clone()
        };
        let duplicate = LegacyInstallment {
            id: 12,
            installment_number: Some(1),
            ..paid.clone()
        };

        let window = BatchTransformer::new(&r).installments(&[paid, open, duplicate]);
        assert_eq!(window.staged.len(), 2);
        assert_eq!(window.staged[0].status, PAID_INSTALLMENT_STATUS);
        assert_eq!(window.staged[0].sale_id, 70);
        assert_eq!(window.staged[1].status, "LATE");
        assert_eq!(window.stats.skipped_duplicate, 1);
        assert!(window.stats.scanned == 3 && window.last_id == Some(12));
    }
}
