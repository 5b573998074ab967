// ==========================================
// 血液履约编排核心 - 操作日志数据仓储
// ==========================================
// 红线: 所有履约决策必须记录
// ==========================================

mod core;
mod queries;


pub use core::ActionLogRepository;
