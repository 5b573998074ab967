// ==========================================
// 血液履约编排核心 - 高校升级
// ==========================================
// 触发条件（全部满足）:
// 1. 仍有缺口
// 2. 已尝试血站分配或献血者动员
// 3. 稀有血型（Rh 阴性）或紧急等级 high/critical
// 每个需求只升级一次，重复升级为无副作用的拒绝
// ==========================================

use crate::clock::Clock;
use crate::config::FulfillmentConfig;
use crate::domain::action_log::{ActionLog, ActionType};
use crate::domain::donor::InvitationChannel;
use crate::domain::facility::Recipient;
use crate::domain::request::{BloodRequest, CollegeNotice};
use crate::domain::types::{EscalationLevel, FacilityKind, FulfillmentMethod};
use crate::engine::error::{request_lookup, FulfillmentError, FulfillmentResult};
use crate::engine::mobilization::{priority_for, MobilizationService};
use crate::integration::{AuditSink, GeoProvider, Notification, NotificationType, Notifier};
use crate::repository::{FacilityRepository, RequestRepository};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::instrument;

const ACTOR: &str = "system:escalation";

/// 升级被拒绝的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclineReason {
    NoDeficit,
    NotAttempted,
    NotRareOrUrgent,
    RequestClosed,
    NoCollegesInRange,
}

impl DeclineReason {
    /// 不会随时间消失的拒绝原因（紧急度/血型不变、需求已结束）
    pub fn is_permanent(&self) -> bool {
        matches!(self, DeclineReason::NotRareOrUrgent | DeclineReason::RequestClosed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeclineReason::NoDeficit => "no_deficit",
            DeclineReason::NotAttempted => "not_attempted",
            DeclineReason::NotRareOrUrgent => "not_rare_or_urgent",
            DeclineReason::RequestClosed => "request_closed",
            DeclineReason::NoCollegesInRange => "no_colleges_in_range",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EscalationOutcome {
    Escalated { colleges: Vec<String> },
    Declined { reason: DeclineReason },
}

impl EscalationOutcome {
    pub fn is_escalated(&self) -> bool {
        matches!(self, EscalationOutcome::Escalated { .. })
    }
}

/// 升级判定；不满足时返回拒绝原因
pub fn escalation_block(request: &BloodRequest) -> Option<DeclineReason> {
    if request.is_terminal() {
        return Some(DeclineReason::RequestClosed);
    }
    if request.deficit() == 0 {
        return Some(DeclineReason::NoDeficit);
    }
    let details = &request.fulfillment_details;
    let attempted = details.current_level() >= EscalationLevel::BloodBank
        || details.donor_mobilization.initiated;
    if !attempted {
        return Some(DeclineReason::NotAttempted);
    }
    if !(request.blood_group.is_rare() || request.urgency.is_high_or_critical()) {
        return Some(DeclineReason::NotRareOrUrgent);
    }
    None
}

pub fn should_escalate(request: &BloodRequest) -> bool {
    escalation_block(request).is_none()
}

#[async_trait]
pub trait EscalationService: Send + Sync {
    fn should_escalate(&self, request: &BloodRequest) -> bool {
        should_escalate(request)
    }

    /// 已升级过返回 DuplicateEscalation
    async fn escalate_to_colleges(
        &self,
        request_id: &str,
        max_colleges: usize,
    ) -> FulfillmentResult<EscalationOutcome>;

    /// 以高校为中心动员附近献血者，返回通知数
    async fn mobilize_college_donors(&self, college_id: &str, request_id: &str) -> FulfillmentResult<u32>;
}

// ==========================================
// CollegeEscalator
// ==========================================
pub struct CollegeEscalator {
    request_repo: Arc<RequestRepository>,
    facility_repo: Arc<FacilityRepository>,
    geo: Arc<dyn GeoProvider>,
    mobilizer: Arc<dyn MobilizationService>,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    config: FulfillmentConfig,
}

impl CollegeEscalator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        request_repo: Arc<RequestRepository>,
        facility_repo: Arc<FacilityRepository>,
        geo: Arc<dyn GeoProvider>,
        mobilizer: Arc<dyn MobilizationService>,
        notifier: Arc<dyn Notifier>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        config: FulfillmentConfig,
    ) -> Self {
        Self {
            request_repo,
            facility_repo,
            geo,
            mobilizer,
            notifier,
            audit,
            clock,
            config,
        }
    }

    fn college_search_radius(&self) -> f64 {
        self.config
            .search_radii_km
            .iter()
            .copied()
            .fold(0.0_f64, f64::max)
    }
}

#[async_trait]
impl EscalationService for CollegeEscalator {
    #[instrument(skip(self), fields(request_id = %request_id))]
    async fn escalate_to_colleges(
        &self,
        request_id: &str,
        max_colleges: usize,
    ) -> FulfillmentResult<EscalationOutcome> {
        let request = self
            .request_repo
            .get(request_id)
            .map_err(request_lookup(request_id))?;

        if request.fulfillment_details.college_escalation.initiated {
            tracing::info!("需求已升级到高校，忽略重复升级");
            return Err(FulfillmentError::DuplicateEscalation {
                request_id: request_id.to_string(),
            });
        }
        if let Some(reason) = escalation_block(&request) {
            tracing::info!(reason = reason.as_str(), "不满足高校升级条件");
            return Ok(EscalationOutcome::Declined { reason });
        }

        let nearby = self
            .geo
            .find_nearby(request.location, FacilityKind::College, self.college_search_radius())
            .await?;
        let targets: Vec<_> = nearby.into_iter().take(max_colleges).collect();
        if targets.is_empty() {
            tracing::warn!("搜索范围内无可用高校");
            return Ok(EscalationOutcome::Declined {
                reason: DeclineReason::NoCollegesInRange,
            });
        }

        let now = self.clock.now();
        let priority = priority_for(request.urgency);
        for place in &targets {
            self.notifier
                .notify(
                    Notification::new(
                        Recipient::College(place.id.clone()),
                        NotificationType::CollegeEscalation,
                        "紧急献血动员请求",
                        format!(
                            "{} {} 缺口 {} 单位，请协助动员校内献血者（距离 {:.1} 公里）",
                            request.blood_group,
                            request.component,
                            request.deficit(),
                            place.distance_km
                        ),
                    )
                    .related_to(request_id)
                    .with_priority(priority),
                )
                .await;
        }

        let mut request = request;
        {
            let details = &mut request.fulfillment_details;
            details.college_escalation.initiated = true;
            for place in &targets {
                details.college_escalation.colleges.push(CollegeNotice {
                    college_id: place.id.clone(),
                    notified_at: now,
                    donors_mobilized: 0,
                });
            }
            details.raise_level(EscalationLevel::Colleges);
            details.record_method(FulfillmentMethod::CollegeEscalation);
        }
        request.updated_at = now;
        self.request_repo.save_progress(&request)?;

        let colleges: Vec<String> = targets.into_iter().map(|p| p.id).collect();
        self.audit.record(ActionLog::new(
            ACTOR,
            ActionType::EscalateColleges,
            "request",
            request_id,
            Some(json!({
                "colleges": colleges,
                "deficit": request.deficit(),
                "rare_group": request.blood_group.is_rare(),
                "urgency": request.urgency.as_str(),
            })),
            now,
        ));
        tracing::info!(colleges = colleges.len(), "已升级到高校");

        Ok(EscalationOutcome::Escalated { colleges })
    }

    #[instrument(skip(self), fields(request_id = %request_id, college_id = %college_id))]
    async fn mobilize_college_donors(&self, college_id: &str, request_id: &str) -> FulfillmentResult<u32> {
        let college = self
            .facility_repo
            .find_college(college_id)?
            .ok_or_else(|| FulfillmentError::NotFound {
                entity: "college".to_string(),
                id: college_id.to_string(),
            })?;
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

        let deficit = request.deficit();
        if deficit == 0 {
            return Ok(0);
        }
        let cap = self.config.max_donor_notifications.min(deficit as usize * 2);
        let channel = InvitationChannel::College(college_id.to_string());
        let donors = self
            .mobilizer
            .find_eligible_donors_near(
                &request,
                &channel,
                college.location,
                self.config.college_radius_km,
                cap,
            )
            .await?;
        let notified = self.mobilizer.invite_donors(&request, &channel, &donors).await?;

        // 只更新高校通知记录，不动主动员计数器
        let now = self.clock.now();
        let mut request = self.request_repo.get(request_id)?;
        let escalation = &mut request.fulfillment_details.college_escalation;
        match escalation.colleges.iter_mut().find(|c| c.college_id == college_id) {
            Some(notice) => notice.donors_mobilized += notified,
            None => escalation.colleges.push(CollegeNotice {
                college_id: college_id.to_string(),
                notified_at: now,
                donors_mobilized: notified,
            }),
        }
        request.updated_at = now;
        self.request_repo.save_progress(&request)?;

        self.audit.record(ActionLog::new(
            ACTOR,
            ActionType::MobilizeCollegeDonors,
            "request",
            request_id,
            Some(json!({ "college_id": college_id, "donors_notified": notified })),
            now,
        ));
        tracing::info!(notified, "高校献血者动员完成");
        Ok(notified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::donor::DonorCandidate;
    use crate::domain::facility::College;
    use crate::domain::request::GeoPoint;
    use crate::domain::types::{
        Availability, BloodComponent, BloodGroup, EligibilityStatus, UrgencyTier,
    };
    use crate::engine::mobilization::DonorMobilizer;
    use crate::integration::{LocalGeoProvider, NoOpAuditSink, RecordingNotifier};
    use crate::repository::DonorRepository;
    use chrono::{Duration, TimeZone, Utc};
    use rusqlite::Connection;
    use std::sync::Mutex;

    struct Fixture {
        escalator: CollegeEscalator,
        request_repo: Arc<RequestRepository>,
        facility_repo: Arc<FacilityRepository>,
        donor_repo: Arc<DonorRepository>,
        notifier: Arc<RecordingNotifier>,
        clock: Arc<ManualClock>,
    }

    fn setup() -> Fixture {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::configure_sqlite_connection(&conn).unwrap();
        crate::db::init_schema(&conn).unwrap();
        let conn = Arc::new(Mutex::new(conn));
        let request_repo = Arc::new(RequestRepository::new(conn.clone()));
        let facility_repo = Arc::new(FacilityRepository::new(conn.clone()));
        let donor_repo = Arc::new(DonorRepository::new(conn));
        let notifier = Arc::new(RecordingNotifier::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).unwrap()));
        let config = FulfillmentConfig::default();
        let mobilizer = Arc::new(DonorMobilizer::new(
            donor_repo.clone(),
            request_repo.clone(),
            notifier.clone(),
            Arc::new(NoOpAuditSink),
            clock.clone(),
            config.clone(),
        ));
        let escalator = CollegeEscalator::new(
            request_repo.clone(),
            facility_repo.clone(),
            Arc::new(LocalGeoProvider::new(facility_repo.clone(), 40.0)),
            mobilizer,
            notifier.clone(),
            Arc::new(NoOpAuditSink),
            clock.clone(),
            config,
        );
        Fixture {
            escalator,
            request_repo,
            facility_repo,
            donor_repo,
            notifier,
            clock,
        }
    }

    fn college(f: &Fixture, id: &str, lon: f64) {
        f.facility_repo
            .upsert_college(&College {
                college_id: id.to_string(),
                name: id.to_string(),
                coordinator_id: format!("coord-{}", id),
                location: GeoPoint::new(0.0, lon),
                active: true,
            })
            .unwrap();
    }

    fn attempted_request(f: &Fixture, group: BloodGroup, urgency: UrgencyTier) -> BloodRequest {
        let now = f.clock.now();
        let mut request = BloodRequest::new(
            "H1",
            GeoPoint::new(0.0, 0.0),
            group,
            BloodComponent::RedCells,
            3,
            urgency,
            now + Duration::hours(6),
            now,
        );
        request.status = crate::domain::types::RequestStatus::Processing;
        request.fulfillment_details.raise_level(EscalationLevel::BloodBank);
        request.fulfillment_details.donor_mobilization.initiated = true;
        f.request_repo.insert(&request).unwrap();
        request
    }

    #[test]
    fn test_should_escalate_criteria() {
        let now = Utc::now();
        let mut request = BloodRequest::new(
            "H1",
            GeoPoint::new(0.0, 0.0),
            BloodGroup::OPos,
            BloodComponent::RedCells,
            2,
            UrgencyTier::Medium,
            now + Duration::hours(4),
            now,
        );
        assert_eq!(escalation_block(&request), Some(DeclineReason::NotAttempted));

        request.fulfillment_details.donor_mobilization.initiated = true;
        assert_eq!(escalation_block(&request), Some(DeclineReason::NotRareOrUrgent));

        request.blood_group = BloodGroup::ONeg;
        assert!(should_escalate(&request));

        request.reserved_units = 2;
        assert_eq!(escalation_block(&request), Some(DeclineReason::NoDeficit));
    }

    #[tokio::test]
    async fn test_escalate_notifies_nearest_colleges_once() {
        let f = setup();
        college(&f, "C-near", 0.05);
        college(&f, "C-mid", 0.1);
        college(&f, "C-far", 0.2);
        let request = attempted_request(&f, BloodGroup::OPos, UrgencyTier::Critical);

        let outcome = f.escalator.escalate_to_colleges(&request.request_id, 2).await.unwrap();
        assert_eq!(
            outcome,
            EscalationOutcome::Escalated {
                colleges: vec!["C-near".to_string(), "C-mid".to_string()]
            }
        );
        assert_eq!(f.notifier.count_of(NotificationType::CollegeEscalation), 2);

        let err = f
            .escalator
            .escalate_to_colleges(&request.request_id, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, FulfillmentError::DuplicateEscalation { .. }));
        assert_eq!(f.notifier.count_of(NotificationType::CollegeEscalation), 2);

        let stored = f.request_repo.get(&request.request_id).unwrap();
        assert_eq!(stored.fulfillment_details.current_level(), EscalationLevel::Colleges);
        assert_eq!(stored.fulfillment_details.college_escalation.colleges.len(), 2);
    }

    #[tokio::test]
    async fn test_declined_escalation_has_no_side_effects() {
        let f = setup();
        college(&f, "C1", 0.05);
        let request = attempted_request(&f, BloodGroup::APos, UrgencyTier::Low);

        let outcome = f.escalator.escalate_to_colleges(&request.request_id, 3).await.unwrap();
        assert_eq!(
            outcome,
            EscalationOutcome::Declined {
                reason: DeclineReason::NotRareOrUrgent
            }
        );
        assert!(f.notifier.sent().is_empty());
        let stored = f.request_repo.get(&request.request_id).unwrap();
        assert!(!stored.fulfillment_details.college_escalation.initiated);
    }

    #[tokio::test]
    async fn test_college_donors_within_radius_only() {
        let f = setup();
        college(&f, "C1", 1.0);
        for (id, lon) in [("near-college", 1.02), ("far-from-college", 0.01)] {
            f.donor_repo
                .insert_donor(&DonorCandidate {
                    donor_id: id.to_string(),
                    name: id.to_string(),
                    blood_group: BloodGroup::ONeg,
                    eligibility: EligibilityStatus::Eligible,
                    availability: Availability::Available,
                    last_donation_date: None,
                    location: GeoPoint::new(0.0, lon),
                    college_id: None,
                })
                .unwrap();
        }
        let request = attempted_request(&f, BloodGroup::ONeg, UrgencyTier::High);

        let notified = f
            .escalator
            .mobilize_college_donors("C1", &request.request_id)
            .await
            .unwrap();
        assert_eq!(notified, 1);
        let sent = f.notifier.sent();
        assert_eq!(sent[0].recipient, Recipient::Donor("near-college".to_string()));

        let stored = f.request_repo.get(&request.request_id).unwrap();
        assert_eq!(stored.fulfillment_details.donor_mobilization.donors_notified, 0);
        assert_eq!(stored.fulfillment_details.college_escalation.colleges[0].donors_mobilized, 1);
    }
}
