//! Key Resolver: legacy natural keys -> destination surrogate keys.
//!
//! Pure lookups over the reference maps. "Not found" is an expected outcome
//! for legacy rows whose parent was never migrated and is reported as
//! [`Resolution::Unresolved`], never as an error.

use std::sync::Arc;

use crate::models::{InstallmentKey, LegacyInstallment, LegacySale, SaleKey};
use crate::reference::ReferenceData;

/// Why a legacy row could not be tied to destination entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnresolvedReason {
    MissingMemberNumber,
    UnknownMember,
    MissingSequence,
    UnknownAgreement,
    UnknownSale,
    MissingInstallmentNumber,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution<T> {
    Resolved(T),
    Unresolved(UnresolvedReason),
}

/// Destination references of a legacy sale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaleTarget {
    pub key: SaleKey,
    pub agreement_id: i64,
}

#[derive(Debug, Clone)]
pub struct KeyResolver {
    reference: Arc<ReferenceData>,
}

impl KeyResolver {
    pub fn new(reference: Arc<ReferenceData>) -> Self {
        Self { reference }
    }

    pub fn reference(&self) -> &ReferenceData {
        &self.reference
    }

    /// (member number, sequence) -> sale natural key.
    pub fn sale_key(
        &self,
        member_number: Option<&str>,
        sequence_number: Option<i32>,
    ) -> Resolution<SaleKey> {
        let Some(member_number) = member_number else {
            return Resolution::Unresolved(UnresolvedReason::MissingMemberNumber);
        };
        let Some(member_id) = self.reference.members.resolve(member_number) else {
            return Resolution::Unresolved(UnresolvedReason::UnknownMember);
        };
        let Some(sequence_number) = sequence_number else {
            return Resolution::Unresolved(UnresolvedReason::MissingSequence);
        };
        Resolution::Resolved(SaleKey {
            member_id,
            sequence_number,
        })
    }

    pub fn resolve_sale(&self, sale: &LegacySale) -> Resolution<SaleTarget> {
        let key = match self.sale_key(sale.member_number.as_deref(), sale.sequence_number) {
            Resolution::Resolved(key) => key,
            Resolution::Unresolved(reason) => return Resolution::Unresolved(reason),
        };
        match self
            .reference
            .agreements
            .resolve(sale.agreement_code.as_deref(), sale.sale_type.as_deref())
        {
            Some(agreement_id) => Resolution::Resolved(SaleTarget { key, agreement_id }),
            None => Resolution::Unresolved(UnresolvedReason::UnknownAgreement),
        }
    }

    /// Whether the sale was already migrated, at run start or by any worker since.
    pub fn sale_exists(&self, key: &SaleKey) -> bool {
        self.reference.existing.contains_sale(key) || self.reference.sale_index.contains(key)
    }

    /// Resolves the parent sale through the SaleKeyIndex and pairs it with
    /// the installment number.
    pub fn resolve_installment(&self, installment: &LegacyInstallment) -> Resolution<InstallmentKey> {
        let sale_key = match self.sale_key(
            installment.member_number.as_deref(),
            installment.sequence_number,
        ) {
            Resolution::Resolved(key) => key,
            Resolution::Unresolved(reason) => return Resolution::Unresolved(reason),
        };
        let Some(sale_id) = self.reference.sale_index.get(&sale_key) else {
            return Resolution::Unresolved(UnresolvedReason::UnknownSale);
        };
        let Some(number) = installment.installment_number else {
            return Resolution::Unresolved(UnresolvedReason::MissingInstallmentNumber);
        };
        Resolution::Resolved(InstallmentKey { sale_id, number })
    }

    pub fn installment_exists(&self, key: &InstallmentKey) -> bool {
        self.reference.existing.contains_installment(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgreementRef, ExistingSale, MemberRef};
    use crate::reference::{AgreementKeyMap, ExistingKeySet, MemberKeyMap, SaleKeyIndex};
    use std::collections::HashMap;

    fn resolver() -> KeyResolver {
        let sale = ExistingSale {
            id: 500,
            member_id: 1,
            sequence_number: 3,
        };
        let sale_index = SaleKeyIndex::default();
        sale_index.extend([sale]);
        KeyResolver::new(Arc::new(ReferenceData {
            members: MemberKeyMap::new(
                vec![MemberRef {
                    id: 1,
                    registration: "4242".to_string(),
                }],
                Vec::new(),
            ),
            agreements: AgreementKeyMap::new(
                vec![AgreementRef {
                    id: 9,
                    legacy_code: "B1".to_string(),
                }],
                &HashMap::new(),
            ),
            existing: ExistingKeySet::new(&[sale], Vec::new()),
            sale_index,
        }))
    }

    fn installment(member: &str, sequence: i32, number: Option<i32>) -> LegacyInstallment {
        LegacyInstallment {
            id: 1,
            member_number: Some(member.to_string()),
            sequence_number: Some(sequence),
            installment_number: number,
            amount: None,
            due_date: None,
            paid_date: None,
            status: None,
        }
    }

    #[test]
    fn test_unknown_member_is_unresolved() {
        let r = resolver();
        assert_eq!(
            r.resolve_installment(&installment("9999999", 3, Some(1))),
            Resolution::Unresolved(UnresolvedReason::UnknownMember)
        );
    }

    #[test]
    fn test_installment_resolves_parent_sale() {
        let r = resolver();
        assert_eq!(
            r.resolve_installment(&installment("04242", 3, Some(2))),
            Resolution::Resolved(InstallmentKey {
                sale_id: 500,
                number: 2
            })
        );
        assert_eq!(
            r.resolve_installment(&installment("4242", 4, Some(2))),
            Resolution::Unresolved(UnresolvedReason::UnknownSale)
        );
        assert_eq!(
            r.resolve_installment(&installment("4242", 3, None)),
            Resolution::Unresolved(UnresolvedReason::MissingInstallmentNumber)
        );
    }

    #[test]
    fn test_sale_needs_agreement() {
        let r = resolver();
        let mut sale = LegacySale {
            id: 1,
            member_number: Some("4242".to_string()),
            sequence_number: Some(8),
            agreement_code: Some("B1".to_string()),
            sale_type: None,
            amount: None,
            installment_count: None,
            sale_date: None,
            status: None,
        };
        assert!(matches!(r.resolve_sale(&sale), Resolution::Resolved(_)));

        sale.agreement_code = Some("ZZ".to_string());
        assert_eq!(
            r.resolve_sale(&sale),
            Resolution::Unresolved(UnresolvedReason::UnknownAgreement)
        );
    }
}
