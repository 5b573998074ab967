// ==========================================
// 血液履约编排核心 - 需求状态机
// ==========================================
// pending → processing → {partially_fulfilled, fulfilled}
// pending|processing|partially_fulfilled → cancelled|expired|unfulfilled
// ==========================================
// 守卫:
// - fulfilled 要求 issued ≥ units
// - partially_fulfilled 要求 0 < issued < units
// - cancelled/expired/unfulfilled 写入前先释放预留、取消预约
// - 已终态的需求再转换为 no-op
// ==========================================

use crate::clock::Clock;
use crate::domain::action_log::{ActionLog, ActionType};
use crate::domain::facility::Recipient;
use crate::domain::request::BloodRequest;
use crate::domain::types::{AssignmentStatus, RequestStatus};
use crate::engine::error::{request_lookup, FulfillmentError, FulfillmentResult};
use crate::engine::mobilization::MobilizationService;
use crate::engine::reservation::ReservationService;
use crate::integration::{AuditSink, Notification, NotificationPriority, NotificationType, Notifier};
use crate::repository::RequestRepository;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::instrument;

/// 状态图上是否存在 from → to 的边（同一非终态视为可重入）
pub fn can_transition(from: RequestStatus, to: RequestStatus) -> bool {
    use RequestStatus::*;

    if from.is_terminal() {
        return false;
    }
    if from == to || to.requires_cleanup() {
        return true;
    }
    matches!(
        (from, to),
        (Pending, Processing)
            | (Processing, PartiallyFulfilled)
            | (Processing, Fulfilled)
            | (PartiallyFulfilled, Fulfilled)
    )
}

/// issued 计数对目标状态的守卫
fn counters_allow(request: &BloodRequest, to: RequestStatus) -> bool {
    match to {
        RequestStatus::Fulfilled => request.issued_units >= request.units,
        RequestStatus::PartiallyFulfilled => {
            request.issued_units > 0 && request.issued_units < request.units
        }
        _ => true,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TransitionOutcome {
    Applied {
        from: RequestStatus,
        to: RequestStatus,
        released_units: u32,
        cancelled_appointments: u32,
    },
    /// 已是目标状态或已终态
    Unchanged { status: RequestStatus },
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied { .. })
    }
}

fn terminal_notice(to: RequestStatus) -> Option<(NotificationType, &'static str)> {
    match to {
        RequestStatus::Fulfilled => Some((NotificationType::RequestFulfilled, "用血需求已满足")),
        RequestStatus::Unfulfilled => Some((NotificationType::RequestUnfulfilled, "用血需求未能满足")),
        RequestStatus::Expired => Some((NotificationType::RequestExpired, "用血需求已过截止时间")),
        RequestStatus::Cancelled => Some((NotificationType::RequestCancelled, "用血需求已取消")),
        _ => None,
    }
}

// ==========================================
// RequestLifecycle
// ==========================================
pub struct RequestLifecycle {
    request_repo: Arc<RequestRepository>,
    reservations: Arc<dyn ReservationService>,
    mobilizer: Arc<dyn MobilizationService>,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl RequestLifecycle {
    pub fn new(
        request_repo: Arc<RequestRepository>,
        reservations: Arc<dyn ReservationService>,
        mobilizer: Arc<dyn MobilizationService>,
        notifier: Arc<dyn Notifier>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            request_repo,
            reservations,
            mobilizer,
            notifier,
            audit,
            clock,
        }
    }

    /// 调用方需持有该需求的 RequestLocks 守卫
    #[instrument(skip(self, reason), fields(request_id = %request_id, to = %to))]
    pub async fn transition(
        &self,
        request_id: &str,
        to: RequestStatus,
        reason: Option<&str>,
    ) -> FulfillmentResult<TransitionOutcome> {
        let request = self
            .request_repo
            .get(request_id)
            .map_err(request_lookup(request_id))?;
        let from = request.status;

        if from.is_terminal() {
            tracing::debug!(status = %from, "需求已终态，忽略状态转换");
            return Ok(TransitionOutcome::Unchanged { status: from });
        }
        if from == to {
            return Ok(TransitionOutcome::Unchanged { status: from });
        }
        if !can_transition(from, to) || !counters_allow(&request, to) {
            return Err(FulfillmentError::InvalidTransition {
                request_id: request_id.to_string(),
                from,
                to,
            });
        }

        // 终态先清理，再写状态
        let (released_units, cancelled_appointments) = if to.is_terminal() {
            let released = self.reservations.release(request_id)?;
            let cancelled = self.mobilizer.stop_mobilization(request_id).await?;
            if to.requires_cleanup() {
                self.release_assignments(request_id)?;
            }
            (released, cancelled)
        } else {
            (0, 0)
        };

        let now = self.clock.now();
        if !self
            .request_repo
            .compare_and_set_status(request_id, from, to, reason, now)?
        {
            tracing::warn!(from = %from, "状态已被并发修改");
            return Err(FulfillmentError::InvalidTransition {
                request_id: request_id.to_string(),
                from,
                to,
            });
        }

        if let Some((notification_type, title)) = terminal_notice(to) {
            let priority = if to == RequestStatus::Fulfilled {
                NotificationPriority::Normal
            } else {
                NotificationPriority::High
            };
            self.notifier
                .notify(
                    Notification::new(
                        Recipient::Hospital(request.hospital_id.clone()),
                        notification_type,
                        title,
                        format!(
                            "{} {} 需求 {} 单位，已送达 {} 单位。{}",
                            request.blood_group,
                            request.component,
                            request.units,
                            request.issued_units,
                            reason.unwrap_or("")
                        ),
                    )
                    .related_to(request_id)
                    .with_priority(priority),
                )
                .await;
        }

        self.audit.record(ActionLog::new(
            "system:lifecycle",
            ActionType::StatusTransition,
            "request",
            request_id,
            Some(json!({
                "from": from.as_str(),
                "to": to.as_str(),
                "reason": reason,
                "released_units": released_units,
                "cancelled_appointments": cancelled_appointments,
            })),
            now,
        ));
        tracing::info!(from = %from, released_units, cancelled_appointments, "需求状态已转换");

        Ok(TransitionOutcome::Applied {
            from,
            to,
            released_units,
            cancelled_appointments,
        })
    }

    /// 出库后按 issued 计数推进状态
    pub async fn sync_issue_status(&self, request_id: &str) -> FulfillmentResult<Option<TransitionOutcome>> {
        let request = self
            .request_repo
            .get(request_id)
            .map_err(request_lookup(request_id))?;
        if request.is_terminal() {
            return Ok(None);
        }

        let target = if request.issued_units >= request.units {
            RequestStatus::Fulfilled
        } else if request.issued_units > 0 && request.status == RequestStatus::Processing {
            RequestStatus::PartiallyFulfilled
        } else {
            return Ok(None);
        };
        if !can_transition(request.status, target) {
            return Ok(None);
        }

        let reason = if target == RequestStatus::Fulfilled {
            Some("全部单元已送达")
        } else {
            None
        };
        self.transition(request_id, target, reason).await.map(Some)
    }

    /// 未送达的血站分配标记为已释放
    fn release_assignments(&self, request_id: &str) -> FulfillmentResult<()> {
        let mut request = self.request_repo.get(request_id)?;
        let mut changed = false;
        for assignment in request.fulfillment_details.bank_assignments.iter_mut() {
            if matches!(
                assignment.status,
                AssignmentStatus::Reserved | AssignmentStatus::Dispatched
            ) {
                assignment.status = AssignmentStatus::Released;
                changed = true;
            }
        }
        if changed {
            request.updated_at = self.clock.now();
            self.request_repo.save_progress(&request)?;
        }
        Ok(())
    }
}
