// ==========================================
// 血液履约编排核心 - 外部服务错误
// ==========================================

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum IntegrationError {
    #[error("外部服务超时: {service} ({timeout_ms}ms)")]
    Timeout { service: String, timeout_ms: u64 },

    #[error("外部服务不可用: {service}: {message}")]
    Unavailable { service: String, message: String },

    #[error("外部服务返回无效数据: {service}: {message}")]
    InvalidResponse { service: String, message: String },
}

pub type IntegrationResult<T> = Result<T, IntegrationError>;
