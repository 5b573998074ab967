// ==========================================
// 血液履约编排核心 - 领域模型层
// ==========================================
// 职责: 定义领域实体、类型
// 红线: 不含数据访问逻辑，不含引擎逻辑
// ==========================================

pub mod action_log;
pub mod donor;
pub mod facility;
pub mod inventory;
pub mod request;
pub mod types;

// 重导出核心类型
pub use action_log::{ActionLog, ActionType};
pub use donor::{DonorAppointment, DonorCandidate, DonorResponse, InvitationChannel, RankedDonor};
pub use facility::{College, Facility, Recipient};
pub use inventory::{InventoryUnit, Reservation, ReservationHold, StockLevel};
pub use request::{
    BankAssignment, BloodRequest, CollegeEscalationRecord, CollegeNotice,
    DonorMobilizationRecord, FulfillmentDetails, GeoPoint,
};
pub use types::{
    AppointmentStatus, AssignmentStatus, Availability, BloodComponent, BloodGroup,
    DonorResponseKind, EligibilityStatus, EscalationLevel, FacilityKind, FulfillmentMethod,
    RequestStatus, UnitStatus, UrgencyTier,
};
