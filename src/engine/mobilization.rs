// ==========================================
// 血液履约编排核心 - 献血者动员
// ==========================================
// 职责:
// - 筛选: ABO/Rh 相容 + 资格 + 可用 + 冷却期
// - 排序: 距需求医院由近到远
// - 通知上限: min(max_notifications, 缺口 × 2)
// - 邀请: 同一渠道内每个献血者只邀请一次，重复动员只邀请新候选
// - 响应: 每个 (request, donor) 仅一次；接受即生成已确认预约
// ==========================================

use crate::clock::Clock;
use crate::config::FulfillmentConfig;
use crate::domain::action_log::{ActionLog, ActionType};
use crate::domain::donor::{DonorAppointment, DonorResponse, InvitationChannel, RankedDonor};
use crate::domain::facility::Recipient;
use crate::domain::request::{BloodRequest, GeoPoint};
use crate::domain::types::{
    AppointmentStatus, DonorResponseKind, EscalationLevel, FulfillmentMethod, UrgencyTier,
};
use crate::engine::compatibility::{compatible_donor_groups, is_donor_eligible};
use crate::engine::error::{request_lookup, FulfillmentError, FulfillmentResult};
use crate::integration::{AuditSink, Notification, NotificationPriority, NotificationType, Notifier};
use crate::repository::{DonorRepository, RequestRepository};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::instrument;

const ACTOR: &str = "system:mobilization";

/// 动员结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MobilizationOutcome {
    pub request_id: String,
    pub remaining_deficit: u32,
    pub notification_cap: u32,
    pub donors_notified: u32,
    /// 缺口为 0 时不做任何事
    pub skipped: bool,
}

/// 献血者响应结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonorResponseOutcome {
    pub response: DonorResponse,
    pub appointment: Option<DonorAppointment>,
}

pub(crate) fn priority_for(urgency: UrgencyTier) -> NotificationPriority {
    match urgency {
        UrgencyTier::Critical => NotificationPriority::Urgent,
        UrgencyTier::High => NotificationPriority::High,
        UrgencyTier::Medium => NotificationPriority::Normal,
        UrgencyTier::Low => NotificationPriority::Low,
    }
}

/// 献血者动员服务
#[async_trait]
pub trait MobilizationService: Send + Sync {
    /// 以需求医院为中心的合格献血者（最近的 limit 个）
    async fn find_eligible_donors(
        &self,
        request: &BloodRequest,
        limit: usize,
    ) -> FulfillmentResult<Vec<RankedDonor>>;

    /// 以任意中心点/半径筛选合格献血者（高校动员使用）
    async fn find_eligible_donors_near(
        &self,
        request: &BloodRequest,
        channel: &InvitationChannel,
        center: GeoPoint,
        radius_km: f64,
        limit: usize,
    ) -> FulfillmentResult<Vec<RankedDonor>>;

    /// 登记并发送献血邀请，返回本次新发送数（该渠道已邀请过的跳过）
    async fn invite_donors(
        &self,
        request: &BloodRequest,
        channel: &InvitationChannel,
        donors: &[RankedDonor],
    ) -> FulfillmentResult<u32>;

    async fn mobilize_donors(
        &self,
        request_id: &str,
        max_notifications: usize,
    ) -> FulfillmentResult<MobilizationOutcome>;

    async fn respond(
        &self,
        request_id: &str,
        donor_id: &str,
        response: DonorResponseKind,
        reason: Option<String>,
    ) -> FulfillmentResult<DonorResponseOutcome>;

    /// 取消进行中的预约并通知献血者，返回取消数
    async fn stop_mobilization(&self, request_id: &str) -> FulfillmentResult<u32>;

    async fn complete_appointment(&self, appointment_id: &str) -> FulfillmentResult<DonorAppointment>;

    /// 已确认且超过宽限期未完成的预约标记为爽约，返回新增爽约数
    async fn mark_no_shows(&self, request_id: &str) -> FulfillmentResult<u32>;
}

// ==========================================
// DonorMobilizer
// ==========================================
pub struct DonorMobilizer {
    donor_repo: Arc<DonorRepository>,
    request_repo: Arc<RequestRepository>,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    config: FulfillmentConfig,
}

impl DonorMobilizer {
    pub fn new(
        donor_repo: Arc<DonorRepository>,
        request_repo: Arc<RequestRepository>,
        notifier: Arc<dyn Notifier>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        config: FulfillmentConfig,
    ) -> Self {
        Self {
            donor_repo,
            request_repo,
            notifier,
            audit,
            clock,
            config,
        }
    }

    fn load_open_request(&self, request_id: &str) -> FulfillmentResult<BloodRequest> {
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
        Ok(request)
    }

    fn rank_eligible(
        &self,
        request: &BloodRequest,
        channel: &InvitationChannel,
        center: GeoPoint,
        radius_km: Option<f64>,
        limit: usize,
    ) -> FulfillmentResult<Vec<RankedDonor>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let groups = compatible_donor_groups(request.blood_group, request.component);
        let today = self.clock.now().date_naive();
        let invited = self.donor_repo.find_invited(&request.request_id, channel)?;

        // 已响应过本需求、或在该渠道已邀请过的献血者不再邀请
        let mut ranked: Vec<RankedDonor> = Vec::new();
        for donor in self.donor_repo.find_by_groups(&groups)? {
            if invited.contains(&donor.donor_id) {
                continue;
            }
            if !is_donor_eligible(&donor, today, self.config.donor_cooldown_days) {
                continue;
            }
            let distance_km = center.distance_km(&donor.location);
            if radius_km.map(|r| distance_km > r).unwrap_or(false) {
                continue;
            }
            if self
                .donor_repo
                .find_response(&request.request_id, &donor.donor_id)?
                .is_some()
            {
                continue;
            }
            ranked.push(RankedDonor { donor, distance_km });
        }

        ranked.sort_by(|a, b| {
            a.distance_km
                .total_cmp(&b.distance_km)
                .then_with(|| a.donor.donor_id.cmp(&b.donor.donor_id))
        });
        ranked.truncate(limit);
        Ok(ranked)
    }
}

#[async_trait]
impl MobilizationService for DonorMobilizer {
    async fn find_eligible_donors(
        &self,
        request: &BloodRequest,
        limit: usize,
    ) -> FulfillmentResult<Vec<RankedDonor>> {
        self.rank_eligible(request, &InvitationChannel::Primary, request.location, None, limit)
    }

    async fn find_eligible_donors_near(
        &self,
        request: &BloodRequest,
        channel: &InvitationChannel,
        center: GeoPoint,
        radius_km: f64,
        limit: usize,
    ) -> FulfillmentResult<Vec<RankedDonor>> {
        self.rank_eligible(request, channel, center, Some(radius_km), limit)
    }

    async fn invite_donors(
        &self,
        request: &BloodRequest,
        channel: &InvitationChannel,
        donors: &[RankedDonor],
    ) -> FulfillmentResult<u32> {
        let now = self.clock.now();
        let mut fresh: Vec<&RankedDonor> = Vec::with_capacity(donors.len());
        for ranked in donors {
            if self.donor_repo.record_invitation(
                &request.request_id,
                &ranked.donor.donor_id,
                channel,
                now,
            )? {
                fresh.push(ranked);
            }
        }

        let priority = priority_for(request.urgency);
        let sends = fresh.iter().map(|ranked| {
            self.notifier.notify(
                Notification::new(
                    Recipient::Donor(ranked.donor.donor_id.clone()),
                    NotificationType::DonorRequest,
                    "紧急献血邀请",
                    format!(
                        "{} {} 紧急需求 {} 单位，距您约 {:.1} 公里，截止 {}",
                        request.blood_group,
                        request.component,
                        request.units,
                        ranked.distance_km,
                        request.deadline.format("%Y-%m-%d %H:%M")
                    ),
                )
                .related_to(&request.request_id)
                .with_priority(priority),
            )
        });
        Ok(join_all(sends).await.len() as u32)
    }

    #[instrument(skip(self), fields(request_id = %request_id))]
    async fn mobilize_donors(
        &self,
        request_id: &str,
        max_notifications: usize,
    ) -> FulfillmentResult<MobilizationOutcome> {
        let request = self.load_open_request(request_id)?;
        let deficit = request.deficit();
        if deficit == 0 {
            tracing::debug!("缺口为 0，跳过献血者动员");
            return Ok(MobilizationOutcome {
                request_id: request_id.to_string(),
                remaining_deficit: 0,
                notification_cap: 0,
                donors_notified: 0,
                skipped: true,
            });
        }

        let cap = max_notifications.min(deficit as usize * 2);
        let donors = self.find_eligible_donors(&request, cap).await?;
        let notified = self
            .invite_donors(&request, &InvitationChannel::Primary, &donors)
            .await?;

        let now = self.clock.now();
        let mut request = self.request_repo.get(request_id)?;
        {
            let details = &mut request.fulfillment_details;
            let record = &mut details.donor_mobilization;
            if !record.initiated {
                record.initiated = true;
                record.initiated_at = Some(now);
            }
            record.target_units = record.target_units.max(deficit);
            record.donors_notified += notified;
            details.record_method(FulfillmentMethod::DonorMobilization);
            details.raise_level(EscalationLevel::Donors);
        }
        request.updated_at = now;
        self.request_repo.save_progress(&request)?;

        self.audit.record(ActionLog::new(
            ACTOR,
            ActionType::MobilizeDonors,
            "request",
            request_id,
            Some(json!({
                "deficit": deficit,
                "cap": cap,
                "donor_ids": donors.iter().map(|d| d.donor.donor_id.clone()).collect::<Vec<_>>(),
                "donors_notified": notified,
            })),
            now,
        ));
        tracing::info!(deficit, cap, notified, "献血者动员已发起");

        Ok(MobilizationOutcome {
            request_id: request_id.to_string(),
            remaining_deficit: deficit,
            notification_cap: cap as u32,
            donors_notified: notified,
            skipped: false,
        })
    }

    #[instrument(skip(self, reason), fields(request_id = %request_id, donor_id = %donor_id))]
    async fn respond(
        &self,
        request_id: &str,
        donor_id: &str,
        response: DonorResponseKind,
        reason: Option<String>,
    ) -> FulfillmentResult<DonorResponseOutcome> {
        let request = self.load_open_request(request_id)?;
        let now = self.clock.now();

        let record = DonorResponse {
            request_id: request_id.to_string(),
            donor_id: donor_id.to_string(),
            response,
            reason,
            responded_at: now,
        };
        // 主键 (request_id, donor_id) 保证只记录一次
        if let Err(e) = self.donor_repo.insert_response(&record) {
            if e.is_unique_violation() {
                tracing::info!("重复响应被拒绝");
                return Err(FulfillmentError::AlreadyResponded {
                    request_id: request_id.to_string(),
                    donor_id: donor_id.to_string(),
                });
            }
            return Err(e.into());
        }

        let appointment = match response {
            DonorResponseKind::Decline => None,
            DonorResponseKind::Accept => {
                let appointment = DonorAppointment {
                    appointment_id: uuid::Uuid::new_v4().to_string(),
                    request_id: request_id.to_string(),
                    donor_id: donor_id.to_string(),
                    facility_id: request.hospital_id.clone(),
                    scheduled_at: now + self.config.appointment_lead(),
                    status: AppointmentStatus::Confirmed,
                    created_at: now,
                    completed_at: None,
                };
                self.donor_repo.insert_appointment(&appointment)?;

                let mut request = request.clone();
                request.fulfillment_details.donor_mobilization.appointments_created += 1;
                request.updated_at = now;
                self.request_repo.save_progress(&request)?;

                self.notifier
                    .notify(
                        Notification::new(
                            Recipient::Donor(donor_id.to_string()),
                            NotificationType::AppointmentConfirmed,
                            "献血预约已确认",
                            format!(
                                "请于 {} 前往 {} 献血",
                                appointment.scheduled_at.format("%Y-%m-%d %H:%M"),
                                appointment.facility_id
                            ),
                        )
                        .related_to(request_id)
                        .with_priority(priority_for(request.urgency)),
                    )
                    .await;
                Some(appointment)
            }
        };

        self.audit.record(ActionLog::new(
            format!("donor:{}", donor_id),
            ActionType::DonorResponse,
            "request",
            request_id,
            Some(json!({
                "response": response.as_str(),
                "appointment_id": appointment.as_ref().map(|a| a.appointment_id.clone()),
            })),
            now,
        ));

        Ok(DonorResponseOutcome {
            response: record,
            appointment,
        })
    }

    #[instrument(skip(self))]
    async fn stop_mobilization(&self, request_id: &str) -> FulfillmentResult<u32> {
        let now = self.clock.now();
        let appointments = self.donor_repo.find_appointments_by_request(request_id)?;

        let mut cancelled = 0u32;
        let mut notified: HashSet<String> = HashSet::new();
        for appointment in appointments.into_iter().filter(|a| a.is_open()) {
            let changed = self.donor_repo.transition_appointment(
                &appointment.appointment_id,
                &[AppointmentStatus::Pending, AppointmentStatus::Confirmed],
                AppointmentStatus::Cancelled,
                None,
            )?;
            if !changed {
                continue;
            }
            cancelled += 1;
            if notified.insert(appointment.donor_id.clone()) {
                self.notifier
                    .notify(
                        Notification::new(
                            Recipient::Donor(appointment.donor_id.clone()),
                            NotificationType::DonorMobilizationCancelled,
                            "献血预约已取消",
                            "该需求已结束，感谢您的响应",
                        )
                        .related_to(request_id),
                    )
                    .await;
            }
        }

        if cancelled > 0 {
            self.audit.record(ActionLog::new(
                ACTOR,
                ActionType::StopMobilization,
                "request",
                request_id,
                Some(json!({ "cancelled_appointments": cancelled })),
                now,
            ));
            tracing::info!(cancelled, "献血者动员已停止");
        }
        Ok(cancelled)
    }

    #[instrument(skip(self))]
    async fn complete_appointment(&self, appointment_id: &str) -> FulfillmentResult<DonorAppointment> {
        let appointment = self
            .donor_repo
            .find_appointment(appointment_id)?
            .ok_or_else(|| FulfillmentError::NotFound {
                entity: "donor_appointment".to_string(),
                id: appointment_id.to_string(),
            })?;

        let now = self.clock.now();
        let changed = self.donor_repo.transition_appointment(
            appointment_id,
            &[AppointmentStatus::Pending, AppointmentStatus::Confirmed],
            AppointmentStatus::Completed,
            Some(now),
        )?;
        if !changed {
            return Err(FulfillmentError::InvalidInput(format!(
                "预约状态为 {}，无法标记完成",
                appointment.status.as_str()
            )));
        }

        let mut request = self.request_repo.get(&appointment.request_id)?;
        {
            let record = &mut request.fulfillment_details.donor_mobilization;
            record.donations_completed += 1;
            if record.target_units > 0 && record.donations_completed >= record.target_units {
                record.completed = true;
            }
        }
        request.updated_at = now;
        self.request_repo.save_progress(&request)?;

        self.audit.record(ActionLog::new(
            ACTOR,
            ActionType::CompleteAppointment,
            "request",
            &appointment.request_id,
            Some(json!({
                "appointment_id": appointment_id,
                "donor_id": appointment.donor_id,
                "donations_completed": request.fulfillment_details.donor_mobilization.donations_completed,
            })),
            now,
        ));

        self.donor_repo
            .find_appointment(appointment_id)?
            .ok_or_else(|| FulfillmentError::NotFound {
                entity: "donor_appointment".to_string(),
                id: appointment_id.to_string(),
            })
    }

    async fn mark_no_shows(&self, request_id: &str) -> FulfillmentResult<u32> {
        let now = self.clock.now();
        let overdue = self
            .donor_repo
            .find_overdue_confirmed(request_id, now - self.config.no_show_grace())?;

        let mut marked = 0u32;
        for appointment in overdue {
            if self.donor_repo.transition_appointment(
                &appointment.appointment_id,
                &[AppointmentStatus::Confirmed],
                AppointmentStatus::NoShow,
                None,
            )? {
                marked += 1;
                tracing::info!(
                    request_id,
                    donor_id = %appointment.donor_id,
                    scheduled_at = %appointment.scheduled_at,
                    "献血者爽约"
                );
            }
        }
        Ok(marked)
    }
}
