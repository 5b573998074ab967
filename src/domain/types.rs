// ==========================================
// 血液履约编排核心 - 领域类型定义
// ==========================================
// 血型 / 成分 / 紧急等级 / 状态机枚举
// 序列化格式: snake_case (与数据库一致)
// ==========================================

use serde::{Deserialize, Serialize};
use std::fmt;

// ==========================================
// 血型 (ABO + Rh)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BloodGroup {
    #[serde(rename = "A+")]
    APos,
    #[serde(rename = "A-")]
    ANeg,
    #[serde(rename = "B+")]
    BPos,
    #[serde(rename = "B-")]
    BNeg,
    #[serde(rename = "AB+")]
    AbPos,
    #[serde(rename = "AB-")]
    AbNeg,
    #[serde(rename = "O+")]
    OPos,
    #[serde(rename = "O-")]
    ONeg,
}

impl BloodGroup {
    pub const ALL: [BloodGroup; 8] = [
        BloodGroup::APos,
        BloodGroup::ANeg,
        BloodGroup::BPos,
        BloodGroup::BNeg,
        BloodGroup::AbPos,
        BloodGroup::AbNeg,
        BloodGroup::OPos,
        BloodGroup::ONeg,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BloodGroup::APos => "A+",
            BloodGroup::ANeg => "A-",
            BloodGroup::BPos => "B+",
            BloodGroup::BNeg => "B-",
            BloodGroup::AbPos => "AB+",
            BloodGroup::AbNeg => "AB-",
            BloodGroup::OPos => "O+",
            BloodGroup::ONeg => "O-",
        }
    }

    /// 从字符串解析血型（大小写不敏感）
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "A+" => Some(BloodGroup::APos),
            "A-" => Some(BloodGroup::ANeg),
            "B+" => Some(BloodGroup::BPos),
            "B-" => Some(BloodGroup::BNeg),
            "AB+" => Some(BloodGroup::AbPos),
            "AB-" => Some(BloodGroup::AbNeg),
            "O+" => Some(BloodGroup::OPos),
            "O-" => Some(BloodGroup::ONeg),
            _ => None,
        }
    }

    /// Rh 阴性即稀有血型
    pub fn is_rare(&self) -> bool {
        matches!(
            self,
            BloodGroup::ANeg | BloodGroup::BNeg | BloodGroup::AbNeg | BloodGroup::ONeg
        )
    }
}

impl fmt::Display for BloodGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ==========================================
// 血液成分
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BloodComponent {
    WholeBlood,
    RedCells,
    Plasma,
    Platelets,
    Cryoprecipitate,
}

impl BloodComponent {
    pub fn as_str(&self) -> &'static str {
        match self {
            BloodComponent::WholeBlood => "whole_blood",
            BloodComponent::RedCells => "red_cells",
            BloodComponent::Plasma => "plasma",
            BloodComponent::Platelets => "platelets",
            BloodComponent::Cryoprecipitate => "cryoprecipitate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "whole_blood" => Some(BloodComponent::WholeBlood),
            "red_cells" => Some(BloodComponent::RedCells),
            "plasma" => Some(BloodComponent::Plasma),
            "platelets" => Some(BloodComponent::Platelets),
            "cryoprecipitate" => Some(BloodComponent::Cryoprecipitate),
            _ => None,
        }
    }
}

impl fmt::Display for BloodComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ==========================================
// 紧急等级 (Urgency Tier)
// ==========================================
// 顺序: Low < Medium < High < Critical
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrgencyTier {
    Low,
    Medium,
    High,
    Critical,
}

impl UrgencyTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            UrgencyTier::Low => "low",
            UrgencyTier::Medium => "medium",
            UrgencyTier::High => "high",
            UrgencyTier::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "low" => Some(UrgencyTier::Low),
            "medium" => Some(UrgencyTier::Medium),
            "high" => Some(UrgencyTier::High),
            "critical" => Some(UrgencyTier::Critical),
            _ => None,
        }
    }

    /// 高/危急等级可触发高校升级
    pub fn is_high_or_critical(&self) -> bool {
        matches!(self, UrgencyTier::High | UrgencyTier::Critical)
    }
}

impl fmt::Display for UrgencyTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ==========================================
// 需求状态 (Request Status)
// ==========================================
// pending → processing → {partially_fulfilled, fulfilled}
// pending|processing|partially_fulfilled → cancelled|expired|unfulfilled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Processing,
    PartiallyFulfilled,
    Fulfilled,
    Cancelled,
    Expired,
    Unfulfilled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Processing => "processing",
            RequestStatus::PartiallyFulfilled => "partially_fulfilled",
            RequestStatus::Fulfilled => "fulfilled",
            RequestStatus::Cancelled => "cancelled",
            RequestStatus::Expired => "expired",
            RequestStatus::Unfulfilled => "unfulfilled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RequestStatus::Pending),
            "processing" => Some(RequestStatus::Processing),
            "partially_fulfilled" => Some(RequestStatus::PartiallyFulfilled),
            "fulfilled" => Some(RequestStatus::Fulfilled),
            "cancelled" => Some(RequestStatus::Cancelled),
            "expired" => Some(RequestStatus::Expired),
            "unfulfilled" => Some(RequestStatus::Unfulfilled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Fulfilled
                | RequestStatus::Cancelled
                | RequestStatus::Expired
                | RequestStatus::Unfulfilled
        )
    }

    /// 终态且需要清理（释放预留 + 取消预约）
    pub fn requires_cleanup(&self) -> bool {
        matches!(
            self,
            RequestStatus::Cancelled | RequestStatus::Expired | RequestStatus::Unfulfilled
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ==========================================
// 库存单元状态
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Available,
    Reserved,
    Issued,
    Expired,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Available => "available",
            UnitStatus::Reserved => "reserved",
            UnitStatus::Issued => "issued",
            UnitStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "available" => Some(UnitStatus::Available),
            "reserved" => Some(UnitStatus::Reserved),
            "issued" => Some(UnitStatus::Issued),
            "expired" => Some(UnitStatus::Expired),
            _ => None,
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ==========================================
// 履约方式
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FulfillmentMethod {
    BloodBank,
    DonorMobilization,
    CollegeEscalation,
    Mixed,
}

impl fmt::Display for FulfillmentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FulfillmentMethod::BloodBank => write!(f, "blood_bank"),
            FulfillmentMethod::DonorMobilization => write!(f, "donor_mobilization"),
            FulfillmentMethod::CollegeEscalation => write!(f, "college_escalation"),
            FulfillmentMethod::Mixed => write!(f, "mixed"),
        }
    }
}

// ==========================================
// 升级层级
// ==========================================
// 顺序: None < BloodBank < Donors < Colleges
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationLevel {
    None,
    BloodBank,
    Donors,
    Colleges,
}

impl EscalationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationLevel::None => "none",
            EscalationLevel::BloodBank => "blood_bank",
            EscalationLevel::Donors => "donors",
            EscalationLevel::Colleges => "colleges",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "none" => Some(EscalationLevel::None),
            "blood_bank" => Some(EscalationLevel::BloodBank),
            "donors" => Some(EscalationLevel::Donors),
            "colleges" => Some(EscalationLevel::Colleges),
            _ => None,
        }
    }
}

impl fmt::Display for EscalationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ==========================================
// 血站分配状态
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Reserved,
    Dispatched,
    Delivered,
    Released,
}

// ==========================================
// 献血者属性
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EligibilityStatus {
    Eligible,
    TemporarilyDeferred,
    PermanentlyDeferred,
}

impl EligibilityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EligibilityStatus::Eligible => "eligible",
            EligibilityStatus::TemporarilyDeferred => "temporarily_deferred",
            EligibilityStatus::PermanentlyDeferred => "permanently_deferred",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "eligible" => Some(EligibilityStatus::Eligible),
            "temporarily_deferred" => Some(EligibilityStatus::TemporarilyDeferred),
            "permanently_deferred" => Some(EligibilityStatus::PermanentlyDeferred),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Available,
    Unavailable,
}

impl Availability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Availability::Available => "available",
            Availability::Unavailable => "unavailable",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "available" => Some(Availability::Available),
            "unavailable" => Some(Availability::Unavailable),
            _ => None,
        }
    }
}

// ==========================================
// 献血预约状态
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
    NoShow,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::NoShow => "no_show",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(AppointmentStatus::Pending),
            "confirmed" => Some(AppointmentStatus::Confirmed),
            "completed" => Some(AppointmentStatus::Completed),
            "cancelled" => Some(AppointmentStatus::Cancelled),
            "no_show" => Some(AppointmentStatus::NoShow),
            _ => None,
        }
    }
}

// ==========================================
// 献血者响应
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DonorResponseKind {
    Accept,
    Decline,
}

impl DonorResponseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DonorResponseKind::Accept => "accept",
            DonorResponseKind::Decline => "decline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "accept" => Some(DonorResponseKind::Accept),
            "decline" => Some(DonorResponseKind::Decline),
            _ => None,
        }
    }
}

// ==========================================
// 机构类型 (用于 find_nearby 查询)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacilityKind {
    Hospital,
    BloodBank,
    College,
}

impl FacilityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FacilityKind::Hospital => "hospital",
            FacilityKind::BloodBank => "blood_bank",
            FacilityKind::College => "college",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hospital" => Some(FacilityKind::Hospital),
            "blood_bank" => Some(FacilityKind::BloodBank),
            "college" => Some(FacilityKind::College),
            _ => None,
        }
    }
}

impl fmt::Display for FacilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blood_group_parse_roundtrip() {
        for group in BloodGroup::ALL {
            assert_eq!(BloodGroup::parse(group.as_str()), Some(group));
        }
        assert_eq!(BloodGroup::parse("ab-"), Some(BloodGroup::AbNeg));
        assert_eq!(BloodGroup::parse("C+"), None);
    }

    #[test]
    fn test_rare_groups_are_rh_negative() {
        assert!(BloodGroup::ONeg.is_rare());
        assert!(BloodGroup::AbNeg.is_rare());
        assert!(!BloodGroup::OPos.is_rare());
        assert!(!BloodGroup::AbPos.is_rare());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!RequestStatus::Pending.is_terminal());
        assert!(!RequestStatus::PartiallyFulfilled.is_terminal());
        assert!(RequestStatus::Fulfilled.is_terminal());
        assert!(RequestStatus::Unfulfilled.requires_cleanup());
        assert!(!RequestStatus::Fulfilled.requires_cleanup());
    }

    #[test]
    fn test_urgency_order() {
        assert!(UrgencyTier::Critical > UrgencyTier::High);
        assert!(UrgencyTier::Medium > UrgencyTier::Low);
        assert!(UrgencyTier::High.is_high_or_critical());
        assert!(!UrgencyTier::Medium.is_high_or_critical());
    }

    #[test]
    fn test_serde_uses_db_spelling() {
        let json = serde_json::to_string(&BloodGroup::ONeg).unwrap();
        assert_eq!(json, "\"O-\"");
        let json = serde_json::to_string(&RequestStatus::PartiallyFulfilled).unwrap();
        assert_eq!(json, "\"partially_fulfilled\"");
    }
}
