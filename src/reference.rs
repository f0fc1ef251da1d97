//! Reference data shared read-only by every worker.
//!
//! Loaded once at run start. Any failure here aborts the run: no worker can
//! classify a single row without these maps.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use crate::config::RetryPolicy;
use crate::errors::MigrationError;
use crate::models::{
    normalize_member_number, AgreementRef, ExistingSale, InstallmentKey, MemberRef,
    MemberRenumbering, SaleKey,
};
use crate::retry::with_timeout;
use crate::store::{DestinationStore, SourceStore};

/// Legacy member number -> destination member id.
///
/// Members were renumbered once before the migration; old numbers are
/// translated through the renumbering table unless they are already a
/// current registration.
#[derive(Debug, Default)]
pub struct MemberKeyMap {
    renumbered: HashMap<String, String>,
    members: HashMap<String, i64>,
}

impl MemberKeyMap {
    pub fn new(members: Vec<MemberRef>, renumbering: Vec<MemberRenumbering>) -> Self {
        let members = members
            .into_iter()
            .filter_map(|m| normalize_member_number(&m.registration).map(|reg| (reg, m.id)))
            .collect();
        let renumbered = renumbering
            .into_iter()
            .filter_map(|r| {
                let old = normalize_member_number(&r.old_number)?;
                let new = normalize_member_number(&r.new_number)?;
                Some((old, new))
            })
            .collect();
        Self {
            renumbered,
            members,
        }
    }

    pub fn resolve(&self, legacy_number: &str) -> Option<i64> {
        let number = normalize_member_number(legacy_number)?;
        if let Some(id) = self.members.get(&number) {
            return Some(*id);
        }
        let current = self.renumbered.get(&number)?;
        self.members.get(current).copied()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Legacy agreement code (or configured sale type) -> destination agreement id.
#[derive(Debug, Default)]
pub struct AgreementKeyMap {
    by_code: HashMap<String, i64>,
    by_sale_type: HashMap<String, i64>,
}

impl AgreementKeyMap {
    pub fn new(agreements: Vec<AgreementRef>, sale_type_agreements: &HashMap<String, i64>) -> Self {
        let by_code: HashMap<String, i64> = agreements
            .into_iter()
            .filter_map(|a| normalize_code(&a.legacy_code).map(|code| (code, a.id)))
            .collect();

        let known: HashSet<i64> = by_code.values().copied().collect();
        let mut by_sale_type = HashMap::new();
        for (sale_type, agreement_id) in sale_type_agreements {
            if !known.contains(agreement_id) {
                tracing::warn!(
                    "Sale type '{}' maps to agreement {} which has no legacy code in the destination",
                    sale_type,
                    agreement_id
                );
            }
            if let Some(code) = normalize_code(sale_type) {
                by_sale_type.insert(code, *agreement_id);
            }
        }

        Self {
            by_code,
            by_sale_type,
        }
    }

    /// Resolves by agreement code first, then by the configured sale type rule.
    pub fn resolve(&self, agreement_code: Option<&str>, sale_type: Option<&str>) -> Option<i64> {
        if let Some(id) = agreement_code
            .and_then(normalize_code)
            .and_then(|code| self.by_code.get(&code))
        {
            return Some(*id);
        }
        sale_type
            .and_then(normalize_code)
            .and_then(|code| self.by_sale_type.get(&code))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }
}

fn normalize_code(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_uppercase())
    }
}

/// Natural keys present in the destination when the run started.
#[derive(Debug, Default)]
pub struct ExistingKeySet {
    sales: HashSet<SaleKey>,
    installments: HashSet<InstallmentKey>,
}

impl ExistingKeySet {
    pub fn new(sales: &[ExistingSale], installments: Vec<InstallmentKey>) -> Self {
        Self {
            sales: sales.iter().map(ExistingSale::key).collect(),
            installments: installments.into_iter().collect(),
        }
    }

    pub fn contains_sale(&self, key: &SaleKey) -> bool {
        self.sales.contains(key)
    }

    pub fn contains_installment(&self, key: &InstallmentKey) -> bool {
        self.installments.contains(key)
    }

    pub fn sale_count(&self) -> usize {
        self.sales.len()
    }

    pub fn installment_count(&self) -> usize {
        self.installments.len()
    }
}

/// Sale natural key -> destination sale id.
///
/// Seeded from the destination at start, appended by sale-phase workers as
/// they insert, read by installment-phase workers. Entries are never removed.
#[derive(Debug, Default)]
pub struct SaleKeyIndex {
    inner: RwLock<HashMap<SaleKey, i64>>,
}

impl SaleKeyIndex {
    pub fn get(&self, key: &SaleKey) -> Option<i64> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
    }

    pub fn contains(&self, key: &SaleKey) -> bool {
        self.get(key).is_some()
    }

    pub fn extend<I>(&self, sales: I)
    where
        I: IntoIterator<Item = ExistingSale>,
    {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        for sale in sales {
            guard.entry(sale.key()).or_insert(sale.id);
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything the Reference Loader produces.
#[derive(Debug, Default)]
pub struct ReferenceData {
    pub members: MemberKeyMap,
    pub agreements: AgreementKeyMap,
    pub existing: ExistingKeySet,
    pub sale_index: SaleKeyIndex,
}

/// Loads lookup tables and the already-migrated index in one bulk read per
/// table, joining them in memory.
pub async fn load_reference_data<S, D>(
    source: &S,
    destination: &D,
    sale_type_agreements: &HashMap<String, i64>,
    policy: &RetryPolicy,
) -> Result<ReferenceData, MigrationError>
where
    S: SourceStore,
    D: DestinationStore,
{
    let setup = |what: &str, e: MigrationError| MigrationError::Setup(format!("{}: {}", what, e));

    let renumbering = with_timeout(policy, "load member renumbering", source.load_renumbering())
        .await
        .map_err(|e| setup("loading member renumbering", e))?;
    let members = with_timeout(policy, "load members", destination.load_members())
        .await
        .map_err(|e| setup("loading members", e))?;
    let agreements = with_timeout(policy, "load agreements", destination.load_agreements())
        .await
        .map_err(|e| setup("loading agreements", e))?;

    if members.is_empty() {
        return Err(MigrationError::Setup(
            "destination has no members; nothing can be resolved".to_string(),
        ));
    }
    if agreements.is_empty() {
        return Err(MigrationError::Setup(
            "destination has no agreements with a legacy code".to_string(),
        ));
    }

    let members = MemberKeyMap::new(members, renumbering);
    let agreements = AgreementKeyMap::new(agreements, sale_type_agreements);
    tracing::info!(
        "Reference data loaded: {} members, {} agreements",
        members.len(),
        agreements.len()
    );

    let sales = with_timeout(policy, "load existing sales", destination.load_sales())
        .await
        .map_err(|e| setup("loading existing sales", e))?;
    let installments = with_timeout(
        policy,
        "load existing installments",
        destination.load_installment_keys(),
    )
    .await
    .map_err(|e| setup("loading existing installments", e))?;

    let existing = ExistingKeySet::new(&sales, installments);
    let sale_index = SaleKeyIndex::default();
    sale_index.extend(sales);
    tracing::info!(
        "Already migrated: {} sales, {} installments",
        existing.sale_count(),
        existing.installment_count()
    );

    Ok(ReferenceData {
        members,
        agreements,
        existing,
        sale_index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: i64, registration: &str) -> MemberRef {
        MemberRef {
            id,
            registration: registration.to_string(),
        }
    }

    #[test]
    fn test_member_map_applies_renumbering() {
        let map = MemberKeyMap::new(
            vec![member(1, "1001"), member(2, "002002")],
            vec![MemberRenumbering {
                old_number: "555".to_string(),
                new_number: "2002".to_string(),
            }],
        );

        assert_eq!(map.resolve("1001"), Some(1));
        assert_eq!(map.resolve("0555"), Some(2));
        assert_eq!(map.resolve(" 2002 "), Some(2));
        assert_eq!(map.resolve("9999999"), None);
        assert_eq!(map.resolve(""), None);
    }

    #[test]
    fn test_current_number_wins_over_renumbering() {
        let map = MemberKeyMap::new(
            vec![member(1, "10"), member(2, "20")],
            vec![MemberRenumbering {
                old_number: "10".to_string(),
                new_number: "20".to_string(),
            }],
        );
        assert_eq!(map.resolve("10"), Some(1));
    }

    #[test]
    fn test_agreement_map_falls_back_to_sale_type() {
        let mut rules = HashMap::new();
        rules.insert("1".to_string(), 7);
        let map = AgreementKeyMap::new(
            vec![AgreementRef {
                id: 3,
                legacy_code: "bnk".to_string(),
            }],
            &rules,
        );

        assert_eq!(map.resolve(Some(" BNK "), None), Some(3));
        assert_eq!(map.resolve(None, Some("1")), Some(7));
        assert_eq!(map.resolve(Some("unknown"), Some("1")), Some(7));
        assert_eq!(map.resolve(Some("unknown"), Some("2")), None);
        assert_eq!(map.resolve(None, None), None);
    }

    #[test]
    fn test_sale_key_index_never_overwrites() {
        let index = SaleKeyIndex::default();
        let first = ExistingSale {
            id: 10,
            member_id: 1,
            sequence_number: 1,
        };
        index.extend([first]);
        index.extend([ExistingSale { id: 99, ..first }]);

        assert_eq!(index.get(&first.key()), Some(10));
        assert_eq!(index.len(), 1);
    }
}
