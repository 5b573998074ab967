// ==========================================
// 血液履约编排核心 - 应用层
// ==========================================
// 职责: 组装依赖，管理后台任务生命周期
// ==========================================

pub mod state;

// 重导出
pub use state::{get_default_db_path, AppState, Collaborators};
