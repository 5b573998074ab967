// ==========================================
// 血液履约编排核心 - 审计接收端
// ==========================================
// 红线: 审计写入失败不得中断履约流程（仅告警）
// ==========================================

use crate::domain::action_log::ActionLog;
use crate::repository::ActionLogRepository;

/// 审计接收端
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: ActionLog);
}

impl AuditSink for ActionLogRepository {
    fn record(&self, entry: ActionLog) {
        if let Err(e) = self.insert(&entry) {
            tracing::warn!(
                action_type = %entry.action_type,
                entity_id = %entry.entity_id,
                error = %e,
                "审计日志写入失败"
            );
        }
    }
}

/// 空操作审计（单元测试用）
#[derive(Debug, Clone, Default)]
pub struct NoOpAuditSink;

impl AuditSink for NoOpAuditSink {
    fn record(&self, entry: ActionLog) {
        tracing::debug!(action_type = %entry.action_type, "NoOpAuditSink: 跳过审计");
    }
}
