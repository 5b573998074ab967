// ==========================================
// 血液履约编排核心 - 献血者领域模型
// ==========================================
// DonorCandidate 为只读投影，核心只读取和排序
// ==========================================

use crate::domain::request::GeoPoint;
use crate::domain::types::{
    AppointmentStatus, Availability, BloodGroup, DonorResponseKind, EligibilityStatus,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ==========================================
// DonorCandidate - 献血者投影
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonorCandidate {
    pub donor_id: String,
    pub name: String,
    pub blood_group: BloodGroup,
    pub eligibility: EligibilityStatus,
    pub availability: Availability,
    pub last_donation_date: Option<NaiveDate>,
    pub location: GeoPoint,
    pub college_id: Option<String>,
}

/// 排序后的候选（附距离）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedDonor {
    pub donor: DonorCandidate,
    pub distance_km: f64,
}

// ==========================================
// DonorAppointment - 献血预约
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonorAppointment {
    pub appointment_id: String,
    pub request_id: String,
    pub donor_id: String,
    pub facility_id: String,
    pub scheduled_at: DateTime<Utc>,
    pub status: AppointmentStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DonorAppointment {
    /// 仍在进行中（待确认/已确认）
    pub fn is_open(&self) -> bool {
        matches!(
            self.status,
            AppointmentStatus::Pending | AppointmentStatus::Confirmed
        )
    }
}

// ==========================================
// DonorResponse - 献血者响应（每个 request/donor 仅一次）
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonorResponse {
    pub request_id: String,
    pub donor_id: String,
    pub response: DonorResponseKind,
    pub reason: Option<String>,
    pub responded_at: DateTime<Utc>,
}

// ==========================================
// InvitationChannel - 邀请渠道
// ==========================================
// 同一渠道内每个 (request, donor) 只邀请一次
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "channel", content = "college_id", rename_all = "snake_case")]
pub enum InvitationChannel {
    /// 级联/强制升级触发的主动员
    Primary,
    /// 高校协调员发起的动员
    College(String),
}

impl InvitationChannel {
    pub fn key(&self) -> String {
        match self {
            InvitationChannel::Primary => "primary".to_string(),
            InvitationChannel::College(college_id) => format!("college:{}", college_id),
        }
    }
}
