// ==========================================
// 血液履约编排核心 - 履约 API
// ==========================================
// 职责: 对外暴露需求提交/取消/强制升级/状态查询/献血者响应/送达回调
// 红线: 同一需求的入口操作经 RequestLocks 串行
// 红线: 所有操作写审计
// ==========================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::instrument;

use crate::api::error::{ApiError, ApiResult};
use crate::clock::Clock;
use crate::config::FulfillmentConfig;
use crate::domain::action_log::{ActionLog, ActionType};
use crate::domain::donor::DonorAppointment;
use crate::domain::facility::Recipient;
use crate::domain::inventory::InventoryUnit;
use crate::domain::request::{BloodRequest, FulfillmentDetails, GeoPoint};
use crate::domain::types::{
    AssignmentStatus, BloodComponent, BloodGroup, DonorResponseKind, EscalationLevel,
    RequestStatus, UnitStatus, UrgencyTier,
};
use crate::engine::{
    CascadeEngine, CascadeOutcome, DonorResponseOutcome, EscalationOutcome, EscalationService,
    FulfillmentError, MobilizationOutcome, MobilizationService, RequestLifecycle, RequestLocks,
    ReservationService, StockIntake, TransitionOutcome,
};
use crate::integration::{AuditSink, Notification, NotificationType, Notifier};
use crate::repository::{DonorRepository, InventoryRepository, RequestRepository};

const ACTOR: &str = "api";

// ==========================================
// 输入 / 输出 DTO
// ==========================================

/// 提交用血需求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequestInput {
    pub hospital_id: String,
    pub location: GeoPoint,
    pub blood_group: BloodGroup,
    pub component: BloodComponent,
    pub units: u32,
    pub urgency: UrgencyTier,
    pub deadline: DateTime<Utc>,
}

/// 提交结果（级联失败不回滚需求，交由监控继续处理）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitOutcome {
    pub request_id: String,
    pub status: RequestStatus,
    pub cascade: Option<CascadeOutcome>,
    pub cascade_error: Option<String>,
}

/// 强制升级结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "level", content = "outcome", rename_all = "snake_case")]
pub enum ForceEscalateOutcome {
    BloodBank(CascadeOutcome),
    Donors(MobilizationOutcome),
    Colleges(EscalationOutcome),
}

/// 履约状态视图
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FulfillmentStatusView {
    pub request_id: String,
    pub hospital_id: String,
    pub status: RequestStatus,
    pub units: u32,
    pub issued_units: u32,
    pub reserved_units: u32,
    pub deficit: u32,
    pub deadline: DateTime<Utc>,
    pub escalation_level: EscalationLevel,
    pub fulfillment_details: FulfillmentDetails,
    pub appointments: Vec<DonorAppointment>,
    pub outcome_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// 送达回执
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub delivery_id: String,
    pub request_id: String,
    pub issued_units: u32,
    pub already_recorded: bool,
    pub status: RequestStatus,
}

// ==========================================
// FulfillmentApi
// ==========================================
pub struct FulfillmentApi {
    engine: Arc<CascadeEngine>,
    lifecycle: Arc<RequestLifecycle>,
    mobilizer: Arc<dyn MobilizationService>,
    escalator: Arc<dyn EscalationService>,
    reservations: Arc<dyn ReservationService>,
    request_repo: Arc<RequestRepository>,
    donor_repo: Arc<DonorRepository>,
    inventory_repo: Arc<InventoryRepository>,
    locks: Arc<RequestLocks>,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    config: FulfillmentConfig,
}

impl FulfillmentApi {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<CascadeEngine>,
        lifecycle: Arc<RequestLifecycle>,
        mobilizer: Arc<dyn MobilizationService>,
        escalator: Arc<dyn EscalationService>,
        reservations: Arc<dyn ReservationService>,
        request_repo: Arc<RequestRepository>,
        donor_repo: Arc<DonorRepository>,
        inventory_repo: Arc<InventoryRepository>,
        locks: Arc<RequestLocks>,
        notifier: Arc<dyn Notifier>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        config: FulfillmentConfig,
    ) -> Self {
        Self {
            engine,
            lifecycle,
            mobilizer,
            escalator,
            reservations,
            request_repo,
            donor_repo,
            inventory_repo,
            locks,
            notifier,
            audit,
            clock,
            config,
        }
    }

    fn load_request(&self, request_id: &str) -> ApiResult<BloodRequest> {
        self.request_repo
            .find_by_id(request_id)?
            .ok_or_else(|| ApiError::NotFound(format!("需求(id={})不存在", request_id)))
    }

    fn ensure_open(request: &BloodRequest) -> ApiResult<()> {
        if request.is_terminal() {
            return Err(FulfillmentError::RequestClosed {
                request_id: request.request_id.clone(),
                status: request.status,
            }
            .into());
        }
        Ok(())
    }

    // ==========================================
    // 需求提交 / 取消
    // ==========================================

    /// 提交用血需求并立即执行级联
    #[instrument(skip(self, input), fields(hospital_id = %input.hospital_id, units = input.units))]
    pub async fn submit_request(&self, input: SubmitRequestInput) -> ApiResult<SubmitOutcome> {
        let now = self.clock.now();

        // 参数验证
        if input.hospital_id.trim().is_empty() {
            return Err(ApiError::InvalidInput("医院ID不能为空".to_string()));
        }
        if input.units == 0 {
            return Err(ApiError::InvalidInput("需求数量必须大于 0".to_string()));
        }
        if input.deadline <= now {
            return Err(ApiError::InvalidInput(format!(
                "截止时间必须晚于当前时间: deadline={}",
                input.deadline
            )));
        }
        if !(-90.0..=90.0).contains(&input.location.lat) || !(-180.0..=180.0).contains(&input.location.lon) {
            return Err(ApiError::InvalidInput(format!(
                "坐标越界: lat={}, lon={}",
                input.location.lat, input.location.lon
            )));
        }

        let request = BloodRequest::new(
            input.hospital_id,
            input.location,
            input.blood_group,
            input.component,
            input.units,
            input.urgency,
            input.deadline,
            now,
        );
        self.request_repo.insert(&request)?;
        self.audit.record(ActionLog::new(
            ACTOR,
            ActionType::SubmitRequest,
            "request",
            &request.request_id,
            Some(json!({
                "hospital_id": request.hospital_id,
                "blood_group": request.blood_group,
                "component": request.component,
                "units": request.units,
                "urgency": request.urgency,
                "deadline": request.deadline,
            })),
            now,
        ));
        tracing::info!(request_id = %request.request_id, "用血需求已提交");

        let (cascade, cascade_error) = match self.engine.process_request(&request.request_id).await {
            Ok(outcome) => (Some(outcome), None),
            Err(e) => {
                tracing::warn!(request_id = %request.request_id, error = %e, "级联执行失败，等待监控继续处理");
                (None, Some(e.to_string()))
            }
        };

        let status = self.load_request(&request.request_id)?.status;
        Ok(SubmitOutcome {
            request_id: request.request_id,
            status,
            cascade,
            cascade_error,
        })
    }

    /// 取消需求（终态需求为无操作）
    #[instrument(skip(self, reason))]
    pub async fn cancel_request(
        &self,
        request_id: &str,
        reason: Option<String>,
    ) -> ApiResult<TransitionOutcome> {
        let _guard = self.locks.acquire(request_id).await;
        self.load_request(request_id)?;

        let reason = reason.unwrap_or_else(|| "cancelled_by_requester".to_string());
        let outcome = self
            .lifecycle
            .transition(request_id, RequestStatus::Cancelled, Some(&reason))
            .await?;

        self.audit.record(ActionLog::new(
            ACTOR,
            ActionType::CancelRequest,
            "request",
            request_id,
            Some(json!({ "reason": reason, "applied": outcome.is_applied() })),
            self.clock.now(),
        ));
        Ok(outcome)
    }

    // ==========================================
    // 强制升级
    // ==========================================

    /// 人工触发指定层级（沿用各层级的守卫）
    #[instrument(skip(self), fields(level = %level))]
    pub async fn force_escalate(
        &self,
        request_id: &str,
        level: EscalationLevel,
    ) -> ApiResult<ForceEscalateOutcome> {
        let request = self.load_request(request_id)?;
        Self::ensure_open(&request)?;

        let outcome = match level {
            EscalationLevel::None => {
                return Err(ApiError::InvalidInput("升级层级不能为 none".to_string()));
            }
            EscalationLevel::BloodBank => {
                ForceEscalateOutcome::BloodBank(self.engine.process_request(request_id).await?)
            }
            EscalationLevel::Donors => {
                let _guard = self.locks.acquire(request_id).await;
                ForceEscalateOutcome::Donors(
                    self.mobilizer
                        .mobilize_donors(request_id, self.config.max_donor_notifications)
                        .await?,
                )
            }
            EscalationLevel::Colleges => {
                let _guard = self.locks.acquire(request_id).await;
                ForceEscalateOutcome::Colleges(
                    self.escalator
                        .escalate_to_colleges(request_id, self.config.max_colleges)
                        .await?,
                )
            }
        };

        self.audit.record(ActionLog::new(
            ACTOR,
            ActionType::ForceEscalate,
            "request",
            request_id,
            Some(json!({ "level": level, "outcome": outcome })),
            self.clock.now(),
        ));
        tracing::info!(request_id = %request_id, "强制升级完成");
        Ok(outcome)
    }

    // ==========================================
    // 查询
    // ==========================================

    pub fn get_fulfillment_status(&self, request_id: &str) -> ApiResult<FulfillmentStatusView> {
        let request = self.load_request(request_id)?;
        let appointments = self.donor_repo.find_appointments_by_request(request_id)?;

        Ok(FulfillmentStatusView {
            deficit: request.deficit(),
            escalation_level: request.fulfillment_details.current_level(),
            request_id: request.request_id,
            hospital_id: request.hospital_id,
            status: request.status,
            units: request.units,
            issued_units: request.issued_units,
            reserved_units: request.reserved_units,
            deadline: request.deadline,
            fulfillment_details: request.fulfillment_details,
            appointments,
            outcome_reason: request.outcome_reason,
            updated_at: request.updated_at,
        })
    }

    // ==========================================
    // 献血者
    // ==========================================

    /// 献血者响应（每个需求仅一次）
    #[instrument(skip(self, reason))]
    pub async fn donor_respond(
        &self,
        request_id: &str,
        donor_id: &str,
        response: DonorResponseKind,
        reason: Option<String>,
    ) -> ApiResult<DonorResponseOutcome> {
        let _guard = self.locks.acquire(request_id).await;
        Ok(self.mobilizer.respond(request_id, donor_id, response, reason).await?)
    }

    /// 献血完成
    #[instrument(skip(self))]
    pub async fn complete_appointment(&self, appointment_id: &str) -> ApiResult<DonorAppointment> {
        let appointment = self
            .donor_repo
            .find_appointment(appointment_id)?
            .ok_or_else(|| ApiError::NotFound(format!("预约(id={})不存在", appointment_id)))?;

        let _guard = self.locks.acquire(&appointment.request_id).await;
        Ok(self.mobilizer.complete_appointment(appointment_id).await?)
    }

    /// 以高校为中心动员献血者
    #[instrument(skip(self))]
    pub async fn mobilize_college_donors(&self, college_id: &str, request_id: &str) -> ApiResult<u32> {
        let _guard = self.locks.acquire(request_id).await;
        Ok(self
            .escalator
            .mobilize_college_donors(college_id, request_id)
            .await?)
    }

    // ==========================================
    // 配送回调
    // ==========================================

    /// 运输系统送达回调：出库 → 更新分配 → 同步需求状态
    #[instrument(skip(self))]
    pub async fn record_delivery(&self, delivery_id: &str) -> ApiResult<DeliveryReceipt> {
        let delivery = self
            .request_repo
            .find_delivery(delivery_id)?
            .ok_or_else(|| ApiError::NotFound(format!("配送(id={})不存在", delivery_id)))?;
        let request_id = delivery.request_id.clone();

        let _guard = self.locks.acquire(&request_id).await;

        if delivery.status == "delivered" {
            tracing::info!(delivery_id = %delivery_id, "重复送达回调，忽略");
            return Ok(DeliveryReceipt {
                delivery_id: delivery_id.to_string(),
                status: self.load_request(&request_id)?.status,
                request_id,
                issued_units: 0,
                already_recorded: true,
            });
        }

        let issued = match self.reservations.issue(&delivery.unit_ids, &request_id) {
            Ok(issued) => issued,
            Err(FulfillmentError::StaleIssuance { unit_id, request_id: rid }) => {
                // 预留已被清道夫回收时给出更明确的原因
                let released = self
                    .inventory_repo
                    .find_by_id(&unit_id)?
                    .map(|unit| unit.status == UnitStatus::Available)
                    .unwrap_or(false);
                let err = if released {
                    FulfillmentError::ReservationExpired {
                        unit_id,
                        request_id: rid,
                    }
                } else {
                    FulfillmentError::StaleIssuance {
                        unit_id,
                        request_id: rid,
                    }
                };
                tracing::warn!(delivery_id = %delivery_id, error = %err, "送达出库被拒绝");
                return Err(err.into());
            }
            Err(e) => return Err(e.into()),
        };

        let now = self.clock.now();
        self.request_repo.mark_delivery_delivered(delivery_id, now)?;

        let mut request = self.load_request(&request_id)?;
        for assignment in request
            .fulfillment_details
            .bank_assignments
            .iter_mut()
            .filter(|a| a.delivery_id.as_deref() == Some(delivery_id))
        {
            assignment.status = AssignmentStatus::Delivered;
        }
        request.updated_at = now;
        self.request_repo.save_progress(&request)?;

        self.notifier
            .notify(
                Notification::new(
                    Recipient::Hospital(request.hospital_id.clone()),
                    NotificationType::DeliveryCompleted,
                    "血液已送达",
                    format!(
                        "配送 {} 已送达 {} 单位 {} {}",
                        delivery_id, issued, request.blood_group, request.component
                    ),
                )
                .related_to(&request_id),
            )
            .await;

        self.audit.record(ActionLog::new(
            ACTOR,
            ActionType::RecordDelivery,
            "request",
            &request_id,
            Some(json!({
                "delivery_id": delivery_id,
                "facility_id": delivery.facility_id,
                "issued_units": issued,
            })),
            now,
        ));

        self.lifecycle.sync_issue_status(&request_id).await?;
        let status = self.load_request(&request_id)?.status;
        tracing::info!(delivery_id = %delivery_id, issued_units = issued, status = %status, "送达已记录");

        Ok(DeliveryReceipt {
            delivery_id: delivery_id.to_string(),
            request_id,
            issued_units: issued,
            already_recorded: false,
            status,
        })
    }

    // ==========================================
    // 库存
    // ==========================================

    pub fn add_stock(&self, intake: StockIntake) -> ApiResult<InventoryUnit> {
        Ok(self.reservations.add_stock(intake)?)
    }
}
