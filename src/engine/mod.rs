// ==========================================
// 血液履约编排核心 - 引擎层
// ==========================================
// 组成: 库存预留 → 献血者动员 → 高校升级（级联）
//       履约监控 / 防浪费清道夫（定时扫描）
// 红线: 引擎不拼 SQL，所有决策写入 fulfillment_details 并审计
// 红线: 同一需求的入口操作经 RequestLocks 串行
// ==========================================

pub mod cascade;
pub mod compatibility;
pub mod error;
pub mod escalation;
pub mod lifecycle;
pub mod mobilization;
pub mod monitor;
pub mod ranking;
pub mod reaper;
pub mod request_guard;
pub mod reservation;
pub mod scheduler;

// 重导出核心引擎
pub use cascade::{CascadeEngine, CascadeOutcome};
pub use error::{FulfillmentError, FulfillmentResult};
pub use escalation::{
    should_escalate, CollegeEscalator, DeclineReason, EscalationOutcome, EscalationService,
};
pub use lifecycle::{can_transition, RequestLifecycle, TransitionOutcome};
pub use mobilization::{DonorMobilizer, DonorResponseOutcome, MobilizationOutcome, MobilizationService};
pub use monitor::{FulfillmentMonitor, MonitorAction, MonitorReport};
pub use ranking::{rank_candidates, BankCandidate};
pub use reaper::{AntiWastageReaper, ReaperReport, RedistributionSuggestion};
pub use request_guard::RequestLocks;
pub use reservation::{ReservationManager, ReservationService, ReserveCommand, StockIntake};
pub use scheduler::{BackgroundService, Schedule, SweepJob};
