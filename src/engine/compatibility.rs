// ==========================================
// 血液履约编排核心 - 血型相容与献血资格
// ==========================================
// 红细胞/全血/血小板: 供者抗原 ⊆ 受者抗原，Rh- 受者只接受 Rh- 供者
// 血浆/冷沉淀: 供者抗原 ⊇ 受者抗原（AB 为万能血浆供者），不限 Rh
// ==========================================

use crate::domain::donor::DonorCandidate;
use crate::domain::types::{Availability, BloodComponent, BloodGroup, EligibilityStatus};
use chrono::{Duration, NaiveDate};

fn antigens(group: BloodGroup) -> (bool, bool) {
    match group {
        BloodGroup::APos | BloodGroup::ANeg => (true, false),
        BloodGroup::BPos | BloodGroup::BNeg => (false, true),
        BloodGroup::AbPos | BloodGroup::AbNeg => (true, true),
        BloodGroup::OPos | BloodGroup::ONeg => (false, false),
    }
}

fn rh_positive(group: BloodGroup) -> bool {
    !group.is_rare()
}

fn uses_plasma_rules(component: BloodComponent) -> bool {
    matches!(component, BloodComponent::Plasma | BloodComponent::Cryoprecipitate)
}

/// 供者血型能否供给受者
pub fn is_compatible(donor: BloodGroup, recipient: BloodGroup, component: BloodComponent) -> bool {
    let (da, db) = antigens(donor);
    let (ra, rb) = antigens(recipient);

    if uses_plasma_rules(component) {
        return (!ra || da) && (!rb || db);
    }

    let abo_ok = (!da || ra) && (!db || rb);
    let rh_ok = rh_positive(recipient) || !rh_positive(donor);
    abo_ok && rh_ok
}

/// 受者可接受的全部供者血型
pub fn compatible_donor_groups(recipient: BloodGroup, component: BloodComponent) -> Vec<BloodGroup> {
    BloodGroup::ALL
        .iter()
        .copied()
        .filter(|donor| is_compatible(*donor, recipient, component))
        .collect()
}

/// 冷却期是否已过（从未献血视为已过）
pub fn cooldown_elapsed(last_donation: Option<NaiveDate>, today: NaiveDate, cooldown_days: i64) -> bool {
    match last_donation {
        None => true,
        Some(last) => today >= last + Duration::days(cooldown_days),
    }
}

/// 献血资格: eligible + available + 冷却期已过
pub fn is_donor_eligible(donor: &DonorCandidate, today: NaiveDate, cooldown_days: i64) -> bool {
    donor.eligibility == EligibilityStatus::Eligible
        && donor.availability == Availability::Available
        && cooldown_elapsed(donor.last_donation_date, today, cooldown_days)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::request::GeoPoint;

    #[test]
    fn test_red_cell_compatibility() {
        let for_o_neg = compatible_donor_groups(BloodGroup::ONeg, BloodComponent::RedCells);
        assert_eq!(for_o_neg, vec![BloodGroup::ONeg]);

        let for_ab_pos = compatible_donor_groups(BloodGroup::AbPos, BloodComponent::WholeBlood);
        assert_eq!(for_ab_pos.len(), 8);

        let for_a_pos = compatible_donor_groups(BloodGroup::APos, BloodComponent::RedCells);
        assert_eq!(
            for_a_pos,
            vec![BloodGroup::APos, BloodGroup::ANeg, BloodGroup::OPos, BloodGroup::ONeg]
        );
        assert!(!is_compatible(BloodGroup::APos, BloodGroup::ANeg, BloodComponent::RedCells));
    }

    #[test]
    fn test_plasma_compatibility_is_reversed() {
        let for_o = compatible_donor_groups(BloodGroup::OPos, BloodComponent::Plasma);
        assert_eq!(for_o.len(), 8);

        let for_ab = compatible_donor_groups(BloodGroup::AbNeg, BloodComponent::Plasma);
        assert_eq!(for_ab, vec![BloodGroup::AbPos, BloodGroup::AbNeg]);
    }

    #[test]
    fn test_cooldown_and_eligibility() {
        let today = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap();
        assert!(cooldown_elapsed(None, today, 90));
        assert!(cooldown_elapsed(Some(today - Duration::days(90)), today, 90));
        assert!(!cooldown_elapsed(Some(today - Duration::days(89)), today, 90));

        let mut donor = DonorCandidate {
            donor_id: "D1".to_string(),
            name: "d".to_string(),
            blood_group: BloodGroup::OPos,
            eligibility: EligibilityStatus::Eligible,
            availability: Availability::Available,
            last_donation_date: None,
            location: GeoPoint::new(0.0, 0.0),
            college_id: None,
        };
        assert!(is_donor_eligible(&donor, today, 90));
        donor.availability = Availability::Unavailable;
        assert!(!is_donor_eligible(&donor, today, 90));
        donor.availability = Availability::Available;
        donor.eligibility = EligibilityStatus::TemporarilyDeferred;
        assert!(!is_donor_eligible(&donor, today, 90));
    }
}
