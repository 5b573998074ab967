// ==========================================
// 血液履约编排核心 - 操作日志领域模型
// ==========================================
// 红线: 所有履约决策必须记录
// 用途: 审计追踪，从历史重建 fulfillment_details 的决策原因
// ==========================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

// ==========================================
// ActionLog - 操作日志
// ==========================================
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionLog {
    pub action_id: String,
    pub action_type: String,     // ActionType 字符串
    pub action_ts: DateTime<Utc>,
    pub actor: String,           // "system:cascade" / "system:monitor" / 用户ID
    pub entity_type: String,     // "request" / "inventory_unit" / ...
    pub entity_id: String,
    pub payload_json: Option<JsonValue>,
    pub detail: Option<String>,
}

impl ActionLog {
    pub fn new(
        actor: impl Into<String>,
        action_type: ActionType,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        payload: Option<JsonValue>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            action_id: uuid::Uuid::new_v4().to_string(),
            action_type: action_type.as_str().to_string(),
            action_ts: now,
            actor: actor.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            payload_json: payload,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

// ==========================================
// ActionType - 操作类型
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionType {
    SubmitRequest,
    CascadeRun,
    ReserveStock,
    ReleaseStock,
    IssueStock,
    ScheduleDelivery,
    RecordDelivery,
    MobilizeDonors,
    DonorResponse,
    StopMobilization,
    CompleteAppointment,
    EscalateColleges,
    MobilizeCollegeDonors,
    StatusTransition,
    CancelRequest,
    ForceEscalate,
    ReservationExpired,
    UnitExpired,
    RedistributionSuggested,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::SubmitRequest => "SubmitRequest",
            ActionType::CascadeRun => "CascadeRun",
            ActionType::ReserveStock => "ReserveStock",
            ActionType::ReleaseStock => "ReleaseStock",
            ActionType::IssueStock => "IssueStock",
            ActionType::ScheduleDelivery => "ScheduleDelivery",
            ActionType::RecordDelivery => "RecordDelivery",
            ActionType::MobilizeDonors => "MobilizeDonors",
            ActionType::DonorResponse => "DonorResponse",
            ActionType::StopMobilization => "StopMobilization",
            ActionType::CompleteAppointment => "CompleteAppointment",
            ActionType::EscalateColleges => "EscalateColleges",
            ActionType::MobilizeCollegeDonors => "MobilizeCollegeDonors",
            ActionType::StatusTransition => "StatusTransition",
            ActionType::CancelRequest => "CancelRequest",
            ActionType::ForceEscalate => "ForceEscalate",
            ActionType::ReservationExpired => "ReservationExpired",
            ActionType::UnitExpired => "UnitExpired",
            ActionType::RedistributionSuggested => "RedistributionSuggested",
        }
    }
}
