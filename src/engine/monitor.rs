// ==========================================
// 血液履约编排核心 - 履约监控
// ==========================================
// 扫描范围: status ∈ {processing, partially_fulfilled}
//   且 (窗口内创建 / 已过截止时间 / 已超过最终超时)
// 分支前先以库存实况校准 reserved_units
// 分支（首个命中即止）:
// 1. issued ≥ units → fulfilled
// 2. 动员已发起、未完成、超过献血超时:
//    标记爽约 → 高校升级（每个需求一次）
//    只有产生效果时命中: 新爽约 / 已升级 / 永久性拒绝
//    暂时性拒绝或升级失败不命中，继续判断超时，下轮重试升级
// 3. 超过最终超时 → unfulfilled
// 4. 已过截止时间 → expired
// 单个需求失败记录日志，扫描继续
// ==========================================

use crate::clock::Clock;
use crate::config::FulfillmentConfig;
use crate::domain::request::BloodRequest;
use crate::domain::types::RequestStatus;
use crate::engine::error::{request_lookup, FulfillmentError, FulfillmentResult};
use crate::engine::escalation::{EscalationOutcome, EscalationService};
use crate::engine::lifecycle::RequestLifecycle;
use crate::engine::mobilization::MobilizationService;
use crate::engine::request_guard::RequestLocks;
use crate::engine::reservation::ReservationService;
use crate::engine::scheduler::SweepJob;
use crate::repository::RequestRepository;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;

/// 单个需求的处理结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MonitorAction {
    None,
    Fulfilled,
    DonorStall { no_shows: u32, escalated: bool },
    Unfulfilled,
    Expired,
}

/// 一轮扫描汇总
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorReport {
    pub scanned: usize,
    pub fulfilled: usize,
    pub stalls_handled: usize,
    pub escalations: usize,
    pub no_shows: u32,
    pub unfulfilled: usize,
    pub expired: usize,
    pub reconciled: usize,
    pub failures: usize,
}

impl MonitorReport {
    fn absorb(&mut self, action: &MonitorAction) {
        match action {
            MonitorAction::None => {}
            MonitorAction::Fulfilled => self.fulfilled += 1,
            MonitorAction::DonorStall { no_shows, escalated } => {
                self.stalls_handled += 1;
                self.no_shows += no_shows;
                if *escalated {
                    self.escalations += 1;
                }
            }
            MonitorAction::Unfulfilled => self.unfulfilled += 1,
            MonitorAction::Expired => self.expired += 1,
        }
    }
}

// ==========================================
// FulfillmentMonitor
// ==========================================
pub struct FulfillmentMonitor {
    request_repo: Arc<RequestRepository>,
    reservations: Arc<dyn ReservationService>,
    mobilizer: Arc<dyn MobilizationService>,
    escalator: Arc<dyn EscalationService>,
    lifecycle: Arc<RequestLifecycle>,
    locks: Arc<RequestLocks>,
    clock: Arc<dyn Clock>,
    config: FulfillmentConfig,
}

impl FulfillmentMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        request_repo: Arc<RequestRepository>,
        reservations: Arc<dyn ReservationService>,
        mobilizer: Arc<dyn MobilizationService>,
        escalator: Arc<dyn EscalationService>,
        lifecycle: Arc<RequestLifecycle>,
        locks: Arc<RequestLocks>,
        clock: Arc<dyn Clock>,
        config: FulfillmentConfig,
    ) -> Self {
        Self {
            request_repo,
            reservations,
            mobilizer,
            escalator,
            lifecycle,
            locks,
            clock,
            config,
        }
    }

    /// 扫描一轮
    pub async fn sweep(&self) -> MonitorReport {
        let now = self.clock.now();
        let candidates = match self.request_repo.find_for_monitor(
            now - self.config.monitor_window(),
            now - self.config.final_timeout(),
            now,
        ) {
            Ok(list) => list,
            Err(e) => {
                tracing::error!(error = %e, "监控扫描查询失败");
                return MonitorReport {
                    failures: 1,
                    ..MonitorReport::default()
                };
            }
        };

        let mut report = MonitorReport {
            scanned: candidates.len(),
            ..MonitorReport::default()
        };
        for request in candidates {
            match self.evaluate(&request.request_id).await {
                Ok((action, reconciled)) => {
                    if reconciled {
                        report.reconciled += 1;
                    }
                    report.absorb(&action);
                }
                Err(e) => {
                    report.failures += 1;
                    tracing::warn!(request_id = %request.request_id, error = %e, "需求监控失败，继续扫描");
                }
            }
        }
        report
    }

    /// 评估单个需求，返回 (动作, 是否校准了计数器)
    #[instrument(skip(self), fields(request_id = %request_id))]
    pub async fn evaluate(&self, request_id: &str) -> FulfillmentResult<(MonitorAction, bool)> {
        let _guard = self.locks.acquire(request_id).await;

        let request = self
            .request_repo
            .get(request_id)
            .map_err(request_lookup(request_id))?;
        if request.is_terminal() {
            return Ok((MonitorAction::None, false));
        }
        let (request, reconciled) = self.reconcile(request)?;
        let now = self.clock.now();

        // 1. 已全部出库
        if request.issued_units >= request.units {
            self.lifecycle
                .transition(request_id, RequestStatus::Fulfilled, Some("全部单元已送达"))
                .await?;
            return Ok((MonitorAction::Fulfilled, reconciled));
        }

        // 2. 献血者动员停滞
        if let Some(action) = self.handle_donor_stall(&request).await? {
            return Ok((action, reconciled));
        }

        // 3. 最终超时
        if now - request.created_at > self.config.final_timeout() {
            self.lifecycle
                .transition(
                    request_id,
                    RequestStatus::Unfulfilled,
                    Some("超过最终超时仍未满足"),
                )
                .await?;
            return Ok((MonitorAction::Unfulfilled, reconciled));
        }

        // 4. 截止时间
        if now > request.deadline {
            self.lifecycle
                .transition(request_id, RequestStatus::Expired, Some("已过截止时间"))
                .await?;
            return Ok((MonitorAction::Expired, reconciled));
        }

        Ok((MonitorAction::None, reconciled))
    }

    /// 清道夫释放预留后，计数器与库存对齐
    fn reconcile(&self, request: BloodRequest) -> FulfillmentResult<(BloodRequest, bool)> {
        let live = self.reservations.reserved_quantity(&request.request_id)?;
        if live == request.reserved_units {
            return Ok((request, false));
        }
        tracing::info!(
            recorded = request.reserved_units,
            live,
            "reserved_units 与库存不一致，已校准"
        );
        self.request_repo
            .set_reserved_units(&request.request_id, live, self.clock.now())?;
        Ok((self.request_repo.get(&request.request_id)?, true))
    }

    async fn handle_donor_stall(&self, request: &BloodRequest) -> FulfillmentResult<Option<MonitorAction>> {
        let record = &request.fulfillment_details.donor_mobilization;
        let Some(initiated_at) = record.initiated_at else {
            return Ok(None);
        };
        if !record.initiated || record.completed {
            return Ok(None);
        }
        let now = self.clock.now();
        if now - initiated_at <= self.config.donor_failure_timeout() {
            return Ok(None);
        }

        let no_shows = self.mobilizer.mark_no_shows(&request.request_id).await?;
        if no_shows == 0 && record.stall_handled {
            return Ok(None);
        }

        // 停滞已了结时只记录新增爽约
        let (escalated, settled) = if record.stall_handled {
            (false, true)
        } else {
            self.try_escalate(&request.request_id).await
        };
        if no_shows == 0 && !escalated && !settled {
            tracing::debug!("高校升级暂未完成，下轮扫描重试");
            return Ok(None);
        }

        let mut current = self.request_repo.get(&request.request_id)?;
        {
            let record = &mut current.fulfillment_details.donor_mobilization;
            record.failed_donors += no_shows;
            record.stall_handled = record.stall_handled || settled;
        }
        current.updated_at = now;
        self.request_repo.save_progress(&current)?;

        tracing::info!(no_shows, escalated, settled, "献血者动员超时已处理");
        Ok(Some(MonitorAction::DonorStall { no_shows, escalated }))
    }

    /// 尝试高校升级，返回 (是否已升级, 停滞是否了结)
    ///
    /// 暂时性拒绝（无高校、缺口暂时为 0）和外部失败不了结，下轮扫描重试
    async fn try_escalate(&self, request_id: &str) -> (bool, bool) {
        match self
            .escalator
            .escalate_to_colleges(request_id, self.config.max_colleges)
            .await
        {
            Ok(EscalationOutcome::Escalated { .. }) => (true, true),
            Ok(EscalationOutcome::Declined { reason }) => {
                tracing::info!(reason = reason.as_str(), "高校升级未执行");
                (false, reason.is_permanent())
            }
            Err(FulfillmentError::DuplicateEscalation { .. }) => (false, true),
            Err(e) if e.is_declined() => {
                tracing::debug!(reason = %e, "高校升级已跳过");
                (false, false)
            }
            Err(e) => {
                tracing::warn!(error = %e, "高校升级失败，下轮扫描重试");
                (false, false)
            }
        }
    }
}

#[async_trait]
impl SweepJob for FulfillmentMonitor {
    fn name(&self) -> &'static str {
        "fulfillment_monitor"
    }

    async fn run_once(&self) {
        let report = self.sweep().await;
        tracing::info!(
            scanned = report.scanned,
            fulfilled = report.fulfilled,
            escalations = report.escalations,
            no_shows = report.no_shows,
            unfulfilled = report.unfulfilled,
            expired = report.expired,
            reconciled = report.reconciled,
            failures = report.failures,
            "履约监控扫描完成"
        );
    }
}
