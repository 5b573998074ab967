// ==========================================
// 血液履约编排核心 - 用血需求领域模型
// ==========================================
// 职责: 用血需求实体 + fulfillment_details 决策记录
// 红线: fulfillment_details 是"为何如此决策"的持久记录，只追加不删改
// ==========================================

use crate::domain::types::{
    AssignmentStatus, BloodComponent, BloodGroup, EscalationLevel, FulfillmentMethod,
    RequestStatus, UrgencyTier,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ==========================================
// GeoPoint - 地理坐标
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// 大圆距离（公里，haversine）
    pub fn distance_km(&self, other: &GeoPoint) -> f64 {
        const EARTH_RADIUS_KM: f64 = 6371.0;

        let d_lat = (other.lat - self.lat).to_radians();
        let d_lon = (other.lon - self.lon).to_radians();
        let a = (d_lat / 2.0).sin().powi(2)
            + self.lat.to_radians().cos() * other.lat.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
    }
}

// ==========================================
// BloodRequest - 用血需求
// ==========================================
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloodRequest {
    // ===== 主键 =====
    pub request_id: String,
    pub hospital_id: String, // 发起医院
    pub location: GeoPoint,  // 送达位置（医院坐标）

    // ===== 需求内容 =====
    pub blood_group: BloodGroup,
    pub component: BloodComponent,
    pub units: u32,
    pub urgency: UrgencyTier,
    pub deadline: DateTime<Utc>,

    // ===== 状态 =====
    pub status: RequestStatus,
    pub reserved_units: u32, // 已锁定未送达
    pub issued_units: u32,   // 已出库送达

    // ===== 决策记录 =====
    pub fulfillment_details: FulfillmentDetails,
    pub outcome_reason: Option<String>,

    // ===== 时间戳 =====
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BloodRequest {
    /// 创建新的用血需求（pending）
    pub fn new(
        hospital_id: impl Into<String>,
        location: GeoPoint,
        blood_group: BloodGroup,
        component: BloodComponent,
        units: u32,
        urgency: UrgencyTier,
        deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            hospital_id: hospital_id.into(),
            location,
            blood_group,
            component,
            units,
            urgency,
            deadline,
            status: RequestStatus::Pending,
            reserved_units: 0,
            issued_units: 0,
            fulfillment_details: FulfillmentDetails::default(),
            outcome_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 缺口 = units - (issued + reserved)，不小于 0
    pub fn deficit(&self) -> u32 {
        self.units
            .saturating_sub(self.issued_units.saturating_add(self.reserved_units))
    }

    /// 未出库数量 = units - issued
    pub fn remaining_to_issue(&self) -> u32 {
        self.units.saturating_sub(self.issued_units)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// ==========================================
// FulfillmentDetails - 履约决策记录
// ==========================================
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FulfillmentDetails {
    pub method: Option<FulfillmentMethod>,
    pub bank_assignments: Vec<BankAssignment>,
    pub donor_mobilization: DonorMobilizationRecord,
    pub college_escalation: CollegeEscalationRecord,
    pub escalation_level: Option<EscalationLevel>,
}

impl FulfillmentDetails {
    pub fn current_level(&self) -> EscalationLevel {
        self.escalation_level.unwrap_or(EscalationLevel::None)
    }

    /// 升级层级只升不降
    pub fn raise_level(&mut self, level: EscalationLevel) {
        if level > self.current_level() {
            self.escalation_level = Some(level);
        }
    }

    /// 记录履约方式；多种方式并存时标记为 Mixed
    pub fn record_method(&mut self, method: FulfillmentMethod) {
        self.method = match self.method {
            None => Some(method),
            Some(existing) if existing == method => Some(existing),
            Some(_) => Some(FulfillmentMethod::Mixed),
        };
    }
}

// ==========================================
// BankAssignment - 血站分配
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankAssignment {
    pub facility_id: String,
    pub units_offered: u32,
    pub status: AssignmentStatus,
    pub eta_minutes: u32,
    pub distance_km: f64,
    pub radius_km: f64,
    pub lock_id: String,
    pub unit_ids: Vec<String>,
    pub delivery_id: Option<String>,
    pub assigned_at: DateTime<Utc>,
}

// ==========================================
// DonorMobilizationRecord - 献血者动员子记录
// ==========================================
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DonorMobilizationRecord {
    pub initiated: bool,
    pub initiated_at: Option<DateTime<Utc>>,
    pub target_units: u32,
    pub donors_notified: u32,
    pub appointments_created: u32,
    pub donations_completed: u32,
    pub failed_donors: u32,
    pub completed: bool,
    pub stall_handled: bool, // 超时升级已处理（每个需求只处理一次）
}

// ==========================================
// CollegeEscalationRecord - 高校升级子记录
// ==========================================
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollegeEscalationRecord {
    pub initiated: bool,
    pub colleges: Vec<CollegeNotice>,
}

impl CollegeEscalationRecord {
    pub fn contains(&self, college_id: &str) -> bool {
        self.colleges.iter().any(|c| c.college_id == college_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollegeNotice {
    pub college_id: String,
    pub notified_at: DateTime<Utc>,
    pub donors_mobilized: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_request(units: u32) -> BloodRequest {
        let now = Utc::now();
        BloodRequest::new(
            "H1",
            GeoPoint::new(12.97, 77.59),
            BloodGroup::OPos,
            BloodComponent::RedCells,
            units,
            UrgencyTier::Critical,
            now + Duration::hours(6),
            now,
        )
    }

    #[test]
    fn test_deficit_never_negative() {
        let mut req = sample_request(5);
        assert_eq!(req.deficit(), 5);

        req.reserved_units = 3;
        assert_eq!(req.deficit(), 2);

        req.issued_units = 4;
        assert_eq!(req.deficit(), 0);
    }

    #[test]
    fn test_escalation_level_only_rises() {
        let mut details = FulfillmentDetails::default();
        details.raise_level(EscalationLevel::Donors);
        details.raise_level(EscalationLevel::BloodBank);
        assert_eq!(details.current_level(), EscalationLevel::Donors);
    }

    #[test]
    fn test_record_method_mixed() {
        let mut details = FulfillmentDetails::default();
        details.record_method(FulfillmentMethod::BloodBank);
        details.record_method(FulfillmentMethod::BloodBank);
        assert_eq!(details.method, Some(FulfillmentMethod::BloodBank));

        details.record_method(FulfillmentMethod::DonorMobilization);
        assert_eq!(details.method, Some(FulfillmentMethod::Mixed));
    }

    #[test]
    fn test_haversine_distance() {
        let a = GeoPoint::new(0.0, 0.0);
        let b = GeoPoint::new(0.0, 1.0);
        let d = a.distance_km(&b);
        assert!((d - 111.19).abs() < 0.5, "d={}", d);
        assert_eq!(a.distance_km(&a), 0.0);
    }

    #[test]
    fn test_details_json_roundtrip_keeps_history() {
        let mut details = FulfillmentDetails::default();
        details.college_escalation.initiated = true;
        details.college_escalation.colleges.push(CollegeNotice {
            college_id: "C1".to_string(),
            notified_at: Utc::now(),
            donors_mobilized: 0,
        });

        let json = serde_json::to_string(&details).unwrap();
        let back: FulfillmentDetails = serde_json::from_str(&json).unwrap();
        assert_eq!(back, details);
        assert!(back.college_escalation.contains("C1"));
    }
}
