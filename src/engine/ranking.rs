// ==========================================
// 血液履约编排核心 - 血站候选排序
// ==========================================
// 可行: eta_minutes ≤ 紧急度上限
// 排序: (可行 desc, eta asc, 可用量 desc)，同分按 facility_id 保证确定性
// ==========================================

use crate::config::FulfillmentConfig;
use crate::domain::types::UrgencyTier;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankCandidate {
    pub facility_id: String,
    pub distance_km: f64,
    pub eta_minutes: u32,
    pub available_units: u32,
    pub feasible: bool,
}

impl BankCandidate {
    pub fn new(
        facility_id: impl Into<String>,
        distance_km: f64,
        eta_minutes: u32,
        available_units: u32,
        eta_ceiling: u32,
    ) -> Self {
        Self {
            facility_id: facility_id.into(),
            distance_km,
            eta_minutes,
            available_units,
            feasible: eta_minutes <= eta_ceiling,
        }
    }
}

fn compare(a: &BankCandidate, b: &BankCandidate) -> Ordering {
    b.feasible
        .cmp(&a.feasible)
        .then(a.eta_minutes.cmp(&b.eta_minutes))
        .then(b.available_units.cmp(&a.available_units))
        .then_with(|| a.facility_id.cmp(&b.facility_id))
}

pub fn rank_candidates(mut candidates: Vec<BankCandidate>) -> Vec<BankCandidate> {
    candidates.sort_by(compare);
    candidates
}

/// 紧急度 ETA 上限
pub fn eta_ceiling(config: &FulfillmentConfig, urgency: UrgencyTier) -> u32 {
    config.eta_ceiling(urgency)
}
