// ==========================================
// 血液履约编排核心 - 配置层
// ==========================================
// 职责: 履约阈值管理（半径、时限、扫描间隔等）
// 存储: config_kv 表
// ==========================================

pub mod config_manager;
pub mod fulfillment_config;

// 重导出核心配置管理器
pub use config_manager::{config_keys, ConfigManager};
pub use fulfillment_config::FulfillmentConfig;
