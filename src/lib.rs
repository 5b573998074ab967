// ==========================================
// 血液履约编排核心 - 核心库
// ==========================================
// 技术栈: Rust + SQLite + tokio
// 系统定位: 紧急用血需求的级联履约编排
//   血站库存预留 → 献血者动员 → 高校升级
//   履约监控 / 防浪费清道夫 定时扫描
// ==========================================

// ==========================================
// 模块声明
// ==========================================

// 领域层 - 实体与类型
pub mod domain;

// 数据仓储层 - 数据访问
pub mod repository;

// 引擎层 - 业务规则
pub mod engine;

// 外部协作方接口 - 地理/通知/运输/审计
pub mod integration;

// 配置层 - 履约阈值
pub mod config;

// 数据库基础设施（连接初始化/PRAGMA 统一）
pub mod db;

// 时钟抽象
pub mod clock;

// 日志系统
pub mod logging;

// API 层 - 业务接口
pub mod api;

// 应用层 - 依赖组装与后台任务
pub mod app;

// ==========================================
// 重导出核心类型
// ==========================================

// 领域类型
pub use domain::types::{
    BloodComponent, BloodGroup, EscalationLevel, RequestStatus, UnitStatus, UrgencyTier,
};

// 领域实体
pub use domain::{ActionLog, ActionType, BloodRequest, DonorCandidate, InventoryUnit};

// 引擎
pub use engine::{
    AntiWastageReaper, CascadeEngine, CollegeEscalator, DonorMobilizer, FulfillmentError,
    FulfillmentMonitor, RequestLifecycle, ReservationManager,
};

// API
pub use api::{ApiError, ApiResult, FulfillmentApi};
pub use app::{AppState, Collaborators};

// ==========================================
// 常量定义
// ==========================================

// 系统版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// 系统名称
pub const APP_NAME: &str = "血液履约编排核心";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
