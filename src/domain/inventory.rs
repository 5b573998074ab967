// ==========================================
// 血液履约编排核心 - 库存单元领域模型
// ==========================================
// 红线: 一个单元同一时间最多为一个需求预留
// 红线: 过期/出库单元逻辑销毁但保留审计
// ==========================================

use crate::domain::types::{BloodComponent, BloodGroup, UnitStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ==========================================
// InventoryUnit - 库存单元
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryUnit {
    pub unit_id: String,
    pub facility_id: String,
    pub batch_id: String, // 批次谱系（拆分后两条记录共享）
    pub blood_group: BloodGroup,
    pub component: BloodComponent,
    pub quantity: u32,
    pub expiry_date: DateTime<Utc>,
    pub status: UnitStatus,
    pub reserved_for: Option<ReservationHold>,
    pub issued_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl InventoryUnit {
    /// 入库新单元（available）
    pub fn intake(
        facility_id: impl Into<String>,
        blood_group: BloodGroup,
        component: BloodComponent,
        quantity: u32,
        expiry_date: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        let unit_id = uuid::Uuid::new_v4().to_string();
        Self {
            batch_id: unit_id.clone(),
            unit_id,
            facility_id: facility_id.into(),
            blood_group,
            component,
            quantity,
            expiry_date,
            status: UnitStatus::Available,
            reserved_for: None,
            issued_at: None,
            created_at: now,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry_date < now
    }

    /// 预留是否已超时
    pub fn reservation_lapsed_at(&self, now: DateTime<Utc>) -> bool {
        self.status == UnitStatus::Reserved
            && self
                .reserved_for
                .as_ref()
                .map(|hold| hold.expires_at < now)
                .unwrap_or(false)
    }
}

// ==========================================
// ReservationHold - 预留锁
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationHold {
    pub request_id: String,
    pub reserved_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub lock_id: String,
}

// ==========================================
// Reservation - 一次 reserve 调用的结果
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub lock_id: String,
    pub request_id: String,
    pub facility_id: String,
    pub unit_ids: Vec<String>,
    pub units: u32,
    pub expires_at: DateTime<Utc>,
}

// ==========================================
// StockLevel - 按机构/血型/成分聚合的库存
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockLevel {
    pub facility_id: String,
    pub blood_group: BloodGroup,
    pub component: BloodComponent,
    pub available_units: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_intake_starts_its_own_batch() {
        let now = Utc::now();
        let unit = InventoryUnit::intake(
            "BB1",
            BloodGroup::APos,
            BloodComponent::Plasma,
            4,
            now + Duration::days(10),
            now,
        );
        assert_eq!(unit.batch_id, unit.unit_id);
        assert_eq!(unit.status, UnitStatus::Available);
        assert!(!unit.is_expired_at(now));
        assert!(unit.is_expired_at(now + Duration::days(11)));
    }

    #[test]
    fn test_reservation_lapsed() {
        let now = Utc::now();
        let mut unit = InventoryUnit::intake(
            "BB1",
            BloodGroup::APos,
            BloodComponent::Plasma,
            1,
            now + Duration::days(10),
            now,
        );
        assert!(!unit.reservation_lapsed_at(now));

        unit.status = UnitStatus::Reserved;
        unit.reserved_for = Some(ReservationHold {
            request_id: "R1".to_string(),
            reserved_at: now,
            expires_at: now + Duration::minutes(30),
            lock_id: "L1".to_string(),
        });
        assert!(!unit.reservation_lapsed_at(now + Duration::minutes(29)));
        assert!(unit.reservation_lapsed_at(now + Duration::minutes(31)));
    }
}
