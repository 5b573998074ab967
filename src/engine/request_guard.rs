// ==========================================
// 血液履约编排核心 - 需求级互斥
// ==========================================
// 同一 request_id 的级联/监控/取消/升级/送达回调串行执行
// 约束: 只在入口处获取，内部调用不再重复获取（不可重入）
// ==========================================

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

/// 注册表超过该规模时回收空闲锁
const PRUNE_THRESHOLD: usize = 256;

#[derive(Debug, Default)]
pub struct RequestLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RequestLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, request_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if locks.len() > PRUNE_THRESHOLD {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        locks
            .entry(request_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// 获取需求级锁（持有期间同一需求的其他入口等待）
    pub async fn acquire(&self, request_id: &str) -> OwnedMutexGuard<()> {
        self.slot(request_id).lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
