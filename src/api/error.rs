// ==========================================
// 血液履约编排核心 - API层错误类型
// ==========================================
// 职责: 把引擎/仓储错误转换为调用方可读的错误
// 所有错误信息包含显式原因
// ==========================================

use crate::engine::FulfillmentError;
use crate::repository::error::RepositoryError;
use thiserror::Error;

/// API层错误类型
#[derive(Error, Debug)]
pub enum ApiError {
    // ==========================================
    // 业务规则错误
    // ==========================================
    #[error("无效输入: {0}")]
    InvalidInput(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("业务规则违反: {0}")]
    BusinessRuleViolation(String),

    #[error("无效的状态转换: from={from} to={to}")]
    InvalidStateTransition { from: String, to: String },

    /// 幂等守卫拒绝（重复响应 / 重复升级）
    #[error("重复操作: {0}")]
    Duplicate(String),

    #[error("库存不足: {0}")]
    InsufficientInventory(String),

    #[error("出库被拒绝: {0}")]
    IssuanceRejected(String),

    // ==========================================
    // 并发控制错误
    // ==========================================
    #[error("并发冲突: {0}")]
    Conflict(String),

    // ==========================================
    // 外部服务 / 数据访问错误
    // ==========================================
    #[error("外部服务失败: {0}")]
    ExternalService(String),

    #[error("数据库错误: {0}")]
    DatabaseError(String),

    #[error("数据库连接失败: {0}")]
    DatabaseConnectionError(String),

    // ==========================================
    // 通用错误
    // ==========================================
    #[error("内部错误: {0}")]
    InternalError(String),
}

// ==========================================
// 从 RepositoryError 转换
// ==========================================
impl From<RepositoryError> for ApiError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::CompareAndSetFailed { entity, id, expected } => ApiError::Conflict(
                format!("{}(id={})状态已变化，期望{}", entity, id, expected),
            ),
            RepositoryError::NotFound { entity, id } => {
                ApiError::NotFound(format!("{}(id={})不存在", entity, id))
            }
            RepositoryError::DatabaseConnectionError(msg) => ApiError::DatabaseConnectionError(msg),
            RepositoryError::LockError(msg) => {
                ApiError::DatabaseConnectionError(format!("数据库锁获取失败: {}", msg))
            }
            RepositoryError::DatabaseQueryError(msg) => ApiError::DatabaseError(msg),
            RepositoryError::UniqueConstraintViolation(msg) => {
                ApiError::BusinessRuleViolation(format!("唯一约束违反: {}", msg))
            }
            RepositoryError::ForeignKeyViolation(msg) => {
                ApiError::BusinessRuleViolation(format!("外键约束违反: {}", msg))
            }
            RepositoryError::FieldValueError { field, message } => {
                ApiError::InvalidInput(format!("字段{}错误: {}", field, message))
            }
            RepositoryError::SerializationError(msg) => ApiError::InternalError(msg),
        }
    }
}

// ==========================================
// 从 FulfillmentError 转换
// ==========================================
impl From<FulfillmentError> for ApiError {
    fn from(err: FulfillmentError) -> Self {
        let message = err.to_string();
        match err {
            FulfillmentError::Repository(inner) => ApiError::from(inner),
            FulfillmentError::ExternalService(_) => ApiError::ExternalService(message),
            FulfillmentError::InsufficientInventory { .. } => ApiError::InsufficientInventory(message),
            FulfillmentError::AlreadyResponded { .. } | FulfillmentError::DuplicateEscalation { .. } => {
                ApiError::Duplicate(message)
            }
            FulfillmentError::StaleIssuance { .. } | FulfillmentError::ReservationExpired { .. } => {
                ApiError::IssuanceRejected(message)
            }
            FulfillmentError::RequestNotFound(_) | FulfillmentError::NotFound { .. } => {
                ApiError::NotFound(message)
            }
            FulfillmentError::InvalidTransition { from, to, .. } => ApiError::InvalidStateTransition {
                from: from.to_string(),
                to: to.to_string(),
            },
            FulfillmentError::RequestClosed { .. } | FulfillmentError::ExceedsDeficit { .. } => {
                ApiError::BusinessRuleViolation(message)
            }
            FulfillmentError::ReservationConflict { .. } => ApiError::Conflict(message),
            FulfillmentError::InvalidInput(msg) => ApiError::InvalidInput(msg),
        }
    }
}

/// Result 类型别名
pub type ApiResult<T> = Result<T, ApiError>;
