// ==========================================
// 血液履约编排核心 - API 层
// ==========================================
// 职责: 提供业务 API 接口，供宿主进程 / 运输回调调用
// ==========================================

pub mod error;
pub mod fulfillment_api;

// 重导出核心类型
pub use error::{ApiError, ApiResult};
pub use fulfillment_api::{
    DeliveryReceipt, ForceEscalateOutcome, FulfillmentApi, FulfillmentStatusView,
    SubmitOutcome, SubmitRequestInput,
};
