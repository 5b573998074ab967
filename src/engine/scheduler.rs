// ==========================================
// 血液履约编排核心 - 周期任务调度
// ==========================================
// 监控/清道夫为纯定时器: 首次延迟后立即执行一次，之后按间隔执行
// 停止: CancellationToken 取消 + 等待任务退出
// ==========================================

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// 周期扫描任务
#[async_trait]
pub trait SweepJob: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn run_once(&self);
}

#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    pub initial_delay: Duration,
    pub interval: Duration,
}

/// 已启动的后台任务
pub struct BackgroundService {
    name: &'static str,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl BackgroundService {
    pub fn spawn(job: Arc<dyn SweepJob>, schedule: Schedule, parent: &CancellationToken) -> Self {
        let token = parent.child_token();
        let name = job.name();
        let handle = tokio::spawn(run_loop(job, schedule, token.clone()));
        tracing::info!(
            service = name,
            initial_delay_secs = schedule.initial_delay.as_secs(),
            interval_secs = schedule.interval.as_secs(),
            "后台任务已启动"
        );
        Self { name, token, handle }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// 取消并等待退出
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!(service = self.name, error = %e, "后台任务退出异常");
        }
        tracing::info!(service = self.name, "后台任务已停止");
    }
}

async fn run_loop(job: Arc<dyn SweepJob>, schedule: Schedule, token: CancellationToken) {
    if !schedule.initial_delay.is_zero() {
        tokio::select! {
            _ = tokio::time::sleep(schedule.initial_delay) => {}
            _ = token.cancelled() => { return; }
        }
    }

    let mut ticker = tokio::time::interval(schedule.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = token.cancelled() => { break; }
        }

        // 单轮扫描不被取消打断
        job.run_once().await;

        if token.is_cancelled() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingJob {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl SweepJob for CountingJob {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn run_once(&self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_runs_immediately_then_stops() {
        let job = Arc::new(CountingJob {
            runs: AtomicUsize::new(0),
        });
        let root = CancellationToken::new();
        let service = BackgroundService::spawn(
            job.clone(),
            Schedule {
                initial_delay: Duration::ZERO,
                interval: Duration::from_secs(3600),
            },
            &root,
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);
        assert!(service.is_running());

        service.stop().await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_initial_delay() {
        let job = Arc::new(CountingJob {
            runs: AtomicUsize::new(0),
        });
        let root = CancellationToken::new();
        let service = BackgroundService::spawn(
            job.clone(),
            Schedule {
                initial_delay: Duration::from_secs(30),
                interval: Duration::from_secs(3600),
            },
            &root,
        );
        root.cancel();
        service.stop().await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 0);
    }
}
