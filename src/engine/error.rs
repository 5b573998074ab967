// ==========================================
// 血液履约编排核心 - 引擎层错误类型
// ==========================================
// 分类:
// - InsufficientInventory: 非致命，级联继续下一半径
// - ExternalService: 已降级后仍失败
// - AlreadyResponded / DuplicateEscalation: 幂等守卫
// - StaleIssuance: 仅对本次出库调用致命
// ==========================================

use crate::domain::types::RequestStatus;
use crate::integration::IntegrationError;
use crate::repository::RepositoryError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FulfillmentError {
    #[error("库存不足: facility={facility_id}, 需要={requested}, 可用={available}")]
    InsufficientInventory {
        facility_id: String,
        requested: u32,
        available: u32,
    },

    #[error(transparent)]
    ExternalService(#[from] IntegrationError),

    #[error("预留已过期: unit={unit_id}, request={request_id}")]
    ReservationExpired { unit_id: String, request_id: String },

    #[error("献血者已响应: request={request_id}, donor={donor_id}")]
    AlreadyResponded { request_id: String, donor_id: String },

    #[error("需求已升级到高校: request={request_id}")]
    DuplicateEscalation { request_id: String },

    #[error("出库单元未为该需求预留: request={request_id}, unit={unit_id}")]
    StaleIssuance { request_id: String, unit_id: String },

    #[error("需求不存在: {0}")]
    RequestNotFound(String),

    #[error("需求已结束: request={request_id}, status={status}")]
    RequestClosed {
        request_id: String,
        status: RequestStatus,
    },

    #[error("预留数量超过缺口: request={request_id}, 请求={requested}, 缺口={deficit}")]
    ExceedsDeficit {
        request_id: String,
        requested: u32,
        deficit: u32,
    },

    #[error("库存并发冲突: unit={unit_id}")]
    ReservationConflict { unit_id: String },

    #[error("非法状态转换: request={request_id}, {from} → {to}")]
    InvalidTransition {
        request_id: String,
        from: RequestStatus,
        to: RequestStatus,
    },

    #[error("记录不存在: {entity} id={id}")]
    NotFound { entity: String, id: String },

    #[error("参数错误: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

pub type FulfillmentResult<T> = Result<T, FulfillmentError>;

impl FulfillmentError {
    /// 可预期的业务拒绝（非系统故障）
    pub fn is_declined(&self) -> bool {
        matches!(
            self,
            FulfillmentError::InsufficientInventory { .. }
                | FulfillmentError::AlreadyResponded { .. }
                | FulfillmentError::DuplicateEscalation { .. }
                | FulfillmentError::RequestClosed { .. }
                | FulfillmentError::ExceedsDeficit { .. }
        )
    }
}

/// 需求查询时把仓储 NotFound 映射为 RequestNotFound
pub(crate) fn request_lookup(request_id: &str) -> impl FnOnce(RepositoryError) -> FulfillmentError + '_ {
    move |e| match e {
        RepositoryError::NotFound { .. } => FulfillmentError::RequestNotFound(request_id.to_string()),
        other => FulfillmentError::Repository(other),
    }
}
