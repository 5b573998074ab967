// ==========================================
// 血液履约编排核心 - 级联履约引擎
// ==========================================
// 流程:
// 1. 半径扩展 [5, 10, 25, 50] km 检索血站
//    过滤: 有检测能力 + 有对应血型/成分库存
// 2. 行程矩阵 → ETA；ETA ≤ 紧急度上限才可行
//    排序: 可行优先 → ETA 升序 → 库存降序，取第一名
// 3. 第一名覆盖缺口 → 预留 + 调度配送，结束
//    部分覆盖 → 预留可用量，缩小缺口，进入下一半径
//    不可行候选不预留
// 4. 全部半径后仍有缺口 → 献血者动员
// 单个候选失败记录日志并跳过
// ==========================================

use crate::clock::Clock;
use crate::config::FulfillmentConfig;
use crate::domain::action_log::{ActionLog, ActionType};
use crate::domain::facility::Recipient;
use crate::domain::request::{BankAssignment, BloodRequest};
use crate::domain::types::{AssignmentStatus, EscalationLevel, FacilityKind, FulfillmentMethod, RequestStatus};
use crate::engine::error::{request_lookup, FulfillmentError, FulfillmentResult};
use crate::engine::lifecycle::RequestLifecycle;
use crate::engine::mobilization::{priority_for, MobilizationOutcome, MobilizationService};
use crate::engine::ranking::{eta_ceiling, rank_candidates, BankCandidate};
use crate::engine::request_guard::RequestLocks;
use crate::engine::reservation::{ReservationService, ReserveCommand};
use crate::integration::{
    AuditSink, DeliveryOrder, GeoProvider, IntegrationError, Notification, NotificationType,
    Notifier, TransportScheduler, TravelEstimate,
};
use crate::repository::{DeliveryRecord, FacilityRepository, RequestRepository};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::instrument;

const ACTOR: &str = "system:cascade";

/// 一次级联的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeOutcome {
    pub request_id: String,
    pub assignments: Vec<BankAssignment>,
    pub reserved_units: u32,
    pub remaining_deficit: u32,
    pub mobilization: Option<MobilizationOutcome>,
}

// ==========================================
// CascadeEngine
// ==========================================
pub struct CascadeEngine {
    request_repo: Arc<RequestRepository>,
    facility_repo: Arc<FacilityRepository>,
    geo: Arc<dyn GeoProvider>,
    transport: Arc<dyn TransportScheduler>,
    reservations: Arc<dyn ReservationService>,
    mobilizer: Arc<dyn MobilizationService>,
    lifecycle: Arc<RequestLifecycle>,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    locks: Arc<RequestLocks>,
    config: FulfillmentConfig,
}

impl CascadeEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        request_repo: Arc<RequestRepository>,
        facility_repo: Arc<FacilityRepository>,
        geo: Arc<dyn GeoProvider>,
        transport: Arc<dyn TransportScheduler>,
        reservations: Arc<dyn ReservationService>,
        mobilizer: Arc<dyn MobilizationService>,
        lifecycle: Arc<RequestLifecycle>,
        notifier: Arc<dyn Notifier>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        locks: Arc<RequestLocks>,
        config: FulfillmentConfig,
    ) -> Self {
        Self {
            request_repo,
            facility_repo,
            geo,
            transport,
            reservations,
            mobilizer,
            lifecycle,
            notifier,
            audit,
            clock,
            locks,
            config,
        }
    }

    /// 处理一个需求（持有需求级锁）
    #[instrument(skip(self), fields(request_id = %request_id))]
    pub async fn process_request(&self, request_id: &str) -> FulfillmentResult<CascadeOutcome> {
        let _guard = self.locks.acquire(request_id).await;
        self.run_cascade(request_id).await
    }

    async fn run_cascade(&self, request_id: &str) -> FulfillmentResult<CascadeOutcome> {
        let request = self
            .request_repo
            .get(request_id)
            .map_err(request_lookup(request_id))?;
        if request.is_terminal() {
            return Err(FulfillmentError::RequestClosed {
                request_id: request.request_id,
                status: request.status,
            });
        }
        if request.status == RequestStatus::Pending {
            self.lifecycle
                .transition(request_id, RequestStatus::Processing, None)
                .await?;
        }

        let mut request = self.request_repo.get(request_id)?;
        request.fulfillment_details.raise_level(EscalationLevel::BloodBank);
        request.updated_at = self.clock.now();
        self.request_repo.save_progress(&request)?;

        let ceiling = eta_ceiling(&self.config, request.urgency);
        let mut deficit = request.deficit();
        let mut assignments: Vec<BankAssignment> = Vec::new();
        let mut used: HashSet<String> = HashSet::new();

        tracing::info!(
            deficit,
            urgency = %request.urgency,
            eta_ceiling = ceiling,
            "开始级联履约"
        );

        for &radius_km in &self.config.search_radii_km {
            if deficit == 0 {
                break;
            }

            let candidate = match self.best_candidate(&request, radius_km, ceiling, &used).await {
                Ok(Some(candidate)) => candidate,
                Ok(None) => {
                    tracing::debug!(radius_km, "该半径内无可用血站");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(radius_km, error = %e, "血站检索失败，扩大半径");
                    continue;
                }
            };
            if !candidate.feasible {
                tracing::info!(
                    radius_km,
                    facility_id = %candidate.facility_id,
                    eta_minutes = candidate.eta_minutes,
                    "最优候选超出 ETA 上限，不预留"
                );
                continue;
            }

            let units = candidate.available_units.min(deficit);
            match self.assign(&request, &candidate, units, radius_km).await {
                Ok(assignment) => {
                    deficit = deficit.saturating_sub(assignment.units_offered);
                    used.insert(candidate.facility_id.clone());
                    assignments.push(assignment);
                }
                Err(e) => {
                    tracing::warn!(
                        facility_id = %candidate.facility_id,
                        error = %e,
                        "血站预留失败，跳过"
                    );
                    used.insert(candidate.facility_id.clone());
                }
            }
        }

        let mobilization = if deficit > 0 {
            Some(
                self.mobilizer
                    .mobilize_donors(request_id, self.config.max_donor_notifications)
                    .await?,
            )
        } else {
            None
        };

        let reserved_units: u32 = assignments.iter().map(|a| a.units_offered).sum();
        self.audit.record(ActionLog::new(
            ACTOR,
            ActionType::CascadeRun,
            "request",
            request_id,
            Some(json!({
                "radii_km": self.config.search_radii_km,
                "eta_ceiling": ceiling,
                "facilities": assignments.iter().map(|a| a.facility_id.clone()).collect::<Vec<_>>(),
                "reserved_units": reserved_units,
                "remaining_deficit": deficit,
                "donor_mobilization": mobilization.is_some(),
            })),
            self.clock.now(),
        ));
        tracing::info!(reserved_units, remaining_deficit = deficit, "级联履约完成");

        Ok(CascadeOutcome {
            request_id: request_id.to_string(),
            assignments,
            reserved_units,
            remaining_deficit: deficit,
            mobilization,
        })
    }

    /// 某半径内的最优血站（已使用的血站排除）
    async fn best_candidate(
        &self,
        request: &BloodRequest,
        radius_km: f64,
        ceiling: u32,
        used: &HashSet<String>,
    ) -> FulfillmentResult<Option<BankCandidate>> {
        let nearby = self
            .geo
            .find_nearby(request.location, FacilityKind::BloodBank, radius_km)
            .await?;

        let mut stocked = Vec::new();
        let mut available_units = Vec::new();
        for place in nearby.into_iter().filter(|p| !used.contains(&p.id)) {
            match self.stock_for(request, &place.id) {
                Ok(0) => {}
                Ok(units) => {
                    available_units.push(units);
                    stocked.push(place);
                }
                Err(e) => {
                    tracing::warn!(facility_id = %place.id, error = %e, "血站库存查询失败，跳过");
                }
            }
        }
        if stocked.is_empty() {
            return Ok(None);
        }

        let estimates = self.geo.travel_time(request.location, &stocked).await?;
        // 按目的地匹配行程，不依赖返回顺序
        let by_destination: HashMap<&str, &TravelEstimate> = estimates
            .iter()
            .map(|e| (e.destination_id.as_str(), e))
            .collect();
        let mut candidates = Vec::with_capacity(stocked.len());
        for (place, units) in stocked.iter().zip(available_units) {
            match by_destination.get(place.id.as_str()) {
                Some(estimate) => candidates.push(BankCandidate::new(
                    &place.id,
                    place.distance_km,
                    estimate.eta_minutes(),
                    units,
                    ceiling,
                )),
                None => {
                    tracing::warn!(facility_id = %place.id, "行程结果缺少该血站，跳过");
                }
            }
        }

        Ok(rank_candidates(candidates).into_iter().next())
    }

    /// 有检测能力的血站可用库存量（无能力/未登记视为 0）
    fn stock_for(&self, request: &BloodRequest, facility_id: &str) -> FulfillmentResult<u32> {
        let facility = match self.facility_repo.find_facility(facility_id)? {
            Some(f) if f.active && f.has_testing_capability => f,
            _ => return Ok(0),
        };
        let units = self
            .reservations
            .get_available(&facility.facility_id, request.blood_group, request.component)?;
        Ok(units.iter().map(|u| u.quantity).sum())
    }

    /// 预留 → 调度配送 → 写入分配记录
    async fn assign(
        &self,
        request: &BloodRequest,
        candidate: &BankCandidate,
        units: u32,
        radius_km: f64,
    ) -> FulfillmentResult<BankAssignment> {
        let reservation = self.reservations.reserve(ReserveCommand {
            facility_id: candidate.facility_id.clone(),
            blood_group: request.blood_group,
            component: request.component,
            units,
            request_id: request.request_id.clone(),
            ttl_minutes: Some(self.config.reservation_ttl_minutes),
            lock_id: None,
        })?;

        let order = DeliveryOrder {
            request_id: request.request_id.clone(),
            facility_id: candidate.facility_id.clone(),
            destination_id: request.hospital_id.clone(),
            unit_ids: reservation.unit_ids.clone(),
            eta_minutes: candidate.eta_minutes,
        };
        let delivery_id = match self.schedule_delivery(&order).await {
            Ok(delivery_id) => Some(delivery_id),
            Err(e) => {
                tracing::warn!(
                    facility_id = %candidate.facility_id,
                    error = %e,
                    "配送调度失败，预留保留待人工处理"
                );
                None
            }
        };

        let now = self.clock.now();
        if let Some(delivery_id) = &delivery_id {
            self.request_repo.insert_delivery(&DeliveryRecord {
                delivery_id: delivery_id.clone(),
                request_id: request.request_id.clone(),
                facility_id: candidate.facility_id.clone(),
                destination_id: request.hospital_id.clone(),
                unit_ids: reservation.unit_ids.clone(),
                eta_minutes: candidate.eta_minutes,
                status: "scheduled".to_string(),
                created_at: now,
                delivered_at: None,
            })?;
        }

        let assignment = BankAssignment {
            facility_id: candidate.facility_id.clone(),
            units_offered: reservation.units,
            status: if delivery_id.is_some() {
                AssignmentStatus::Dispatched
            } else {
                AssignmentStatus::Reserved
            },
            eta_minutes: candidate.eta_minutes,
            distance_km: candidate.distance_km,
            radius_km,
            lock_id: reservation.lock_id.clone(),
            unit_ids: reservation.unit_ids.clone(),
            delivery_id: delivery_id.clone(),
            assigned_at: now,
        };

        let mut current = self.request_repo.get(&request.request_id)?;
        current.fulfillment_details.bank_assignments.push(assignment.clone());
        current.fulfillment_details.record_method(FulfillmentMethod::BloodBank);
        current.updated_at = now;
        self.request_repo.save_progress(&current)?;

        let priority = priority_for(request.urgency);
        self.notifier
            .notify(
                Notification::new(
                    Recipient::BloodBank(candidate.facility_id.clone()),
                    NotificationType::DeliveryScheduled,
                    "血液出库预留",
                    format!(
                        "已为需求预留 {} 单位 {} {}，请准备出库",
                        reservation.units, request.blood_group, request.component
                    ),
                )
                .related_to(&request.request_id)
                .with_priority(priority),
            )
            .await;
        if delivery_id.is_some() {
            self.notifier
                .notify(
                    Notification::new(
                        Recipient::Hospital(request.hospital_id.clone()),
                        NotificationType::DeliveryScheduled,
                        "血液配送已安排",
                        format!(
                            "{} 单位 {} 预计 {} 分钟后送达",
                            reservation.units, request.blood_group, candidate.eta_minutes
                        ),
                    )
                    .related_to(&request.request_id)
                    .with_priority(priority),
                )
                .await;
        }

        self.audit.record(ActionLog::new(
            ACTOR,
            ActionType::ScheduleDelivery,
            "request",
            &request.request_id,
            Some(json!({
                "facility_id": candidate.facility_id,
                "units": reservation.units,
                "eta_minutes": candidate.eta_minutes,
                "eta_ceiling_met": candidate.feasible,
                "radius_km": radius_km,
                "lock_id": reservation.lock_id,
                "delivery_id": delivery_id,
            })),
            now,
        ));

        Ok(assignment)
    }

    async fn schedule_delivery(&self, order: &DeliveryOrder) -> FulfillmentResult<String> {
        let timeout = self.config.external_timeout();
        match tokio::time::timeout(timeout, self.transport.schedule_delivery(order)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(FulfillmentError::ExternalService(IntegrationError::Timeout {
                service: "transport.schedule_delivery".to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })),
        }
    }
}
