// ==========================================
// 血液履约编排核心 - 防浪费清道夫
// ==========================================
// 每小时一轮（启动后约 30 秒先跑一次），只处理库存:
// - 预留超时 → 单元回到 available，通知血站与需求医院（需求记录不动）
// - 过期单元 → expired（先释放预留），通知血站
// - 库存调剂建议: 过剩 > 50 / 短缺 < 10，只产出建议不搬动库存
// ==========================================

use crate::clock::Clock;
use crate::config::FulfillmentConfig;
use crate::domain::action_log::{ActionLog, ActionType};
use crate::domain::facility::Recipient;
use crate::domain::inventory::{InventoryUnit, StockLevel};
use crate::domain::types::{BloodComponent, BloodGroup, FacilityKind, UnitStatus};
use crate::engine::error::FulfillmentResult;
use crate::engine::scheduler::SweepJob;
use crate::integration::{AuditSink, Notification, NotificationPriority, NotificationType, Notifier};
use crate::repository::{FacilityRepository, InventoryRepository, RequestRepository};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

const ACTOR: &str = "system:reaper";

/// 调剂建议
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedistributionSuggestion {
    pub blood_group: BloodGroup,
    pub component: BloodComponent,
    pub from_facility: String,
    pub to_facility: String,
    pub units: u32,
    pub from_level: u32,
    pub to_level: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReaperReport {
    pub released_reservations: u32,
    pub discarded_units: u32,
    pub suggestions: Vec<RedistributionSuggestion>,
    pub failures: usize,
}

/// 按 (血型, 成分) 配对过剩与短缺机构
///
/// `blood_banks` 为在册血站；某类型在册血站无库存时视为 0，参与短缺配对
pub fn plan_redistribution(
    levels: &[StockLevel],
    blood_banks: &[String],
    surplus_threshold: u32,
    shortage_threshold: u32,
) -> Vec<RedistributionSuggestion> {
    let mut by_type: BTreeMap<(&str, &str), (BloodGroup, BloodComponent, BTreeMap<&str, u32>)> =
        BTreeMap::new();
    for level in levels {
        by_type
            .entry((level.blood_group.as_str(), level.component.as_str()))
            .or_insert_with(|| (level.blood_group, level.component, BTreeMap::new()))
            .2
            .insert(level.facility_id.as_str(), level.available_units);
    }

    let mut suggestions = Vec::new();
    for (_, (blood_group, component, mut stock)) in by_type {
        for bank in blood_banks {
            stock.entry(bank.as_str()).or_insert(0);
        }

        let mut surplus: Vec<(&str, u32)> = stock
            .iter()
            .filter(|&(_, &units)| units > surplus_threshold)
            .map(|(&id, &units)| (id, units))
            .collect();
        let mut shortage: Vec<(&str, u32)> = stock
            .iter()
            .filter(|&(_, &units)| units < shortage_threshold)
            .map(|(&id, &units)| (id, units))
            .collect();
        // 过剩最多的先给，短缺最严重的先拿
        surplus.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        shortage.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(b.0)));

        let mut donors = surplus.into_iter().map(|(id, units)| (id, units, units - surplus_threshold));
        let mut current = donors.next();
        for (to, to_level) in shortage {
            let mut need = shortage_threshold - to_level;
            while need > 0 {
                let Some((from, from_level, spare)) = current.as_mut() else {
                    break;
                };
                let moved = need.min(*spare);
                suggestions.push(RedistributionSuggestion {
                    blood_group,
                    component,
                    from_facility: from.to_string(),
                    to_facility: to.to_string(),
                    units: moved,
                    from_level: *from_level,
                    to_level,
                });
                need -= moved;
                *spare -= moved;
                if *spare == 0 {
                    current = donors.next();
                }
            }
        }
    }
    suggestions
}

// ==========================================
// AntiWastageReaper
// ==========================================
pub struct AntiWastageReaper {
    inventory_repo: Arc<InventoryRepository>,
    request_repo: Arc<RequestRepository>,
    facility_repo: Arc<FacilityRepository>,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    config: FulfillmentConfig,
}

impl AntiWastageReaper {
    pub fn new(
        inventory_repo: Arc<InventoryRepository>,
        request_repo: Arc<RequestRepository>,
        facility_repo: Arc<FacilityRepository>,
        notifier: Arc<dyn Notifier>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        config: FulfillmentConfig,
    ) -> Self {
        Self {
            inventory_repo,
            request_repo,
            facility_repo,
            notifier,
            audit,
            clock,
            config,
        }
    }

    /// 预留超时的单元回到 available，返回释放单元数
    pub async fn release_expired_reservations(&self) -> FulfillmentResult<u32> {
        let now = self.clock.now();
        let mut released = 0u32;

        for unit in self.inventory_repo.find_lapsed_reservations(now)? {
            let Some(hold) = unit.reserved_for.clone() else {
                continue;
            };
            if !self.inventory_repo.release_unit(&unit.unit_id, &hold.request_id)? {
                // 已被出库或释放
                continue;
            }
            released += 1;

            self.notify_facility(
                &unit,
                NotificationType::ReservationExpired,
                "预留已超时释放",
                format!(
                    "单元 {}（{} {} × {}）预留超时，已回到可用库存",
                    unit.unit_id, unit.blood_group, unit.component, unit.quantity
                ),
            )
            .await;
            match self.request_repo.find_by_id(&hold.request_id) {
                Ok(Some(request)) => {
                    self.notifier
                        .notify(
                            Notification::new(
                                Recipient::Hospital(request.hospital_id),
                                NotificationType::ReservationExpired,
                                "血液预留已超时",
                                format!(
                                    "{} 单位 {} 的预留已超时释放",
                                    unit.quantity, unit.blood_group
                                ),
                            )
                            .related_to(&hold.request_id)
                            .with_priority(NotificationPriority::High),
                        )
                        .await;
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(request_id = %hold.request_id, error = %e, "需求查询失败"),
            }

            self.audit.record(ActionLog::new(
                ACTOR,
                ActionType::ReservationExpired,
                "inventory_unit",
                &unit.unit_id,
                Some(json!({
                    "request_id": hold.request_id,
                    "lock_id": hold.lock_id,
                    "expires_at": hold.expires_at,
                    "quantity": unit.quantity,
                })),
                now,
            ));
            tracing::info!(
                unit_id = %unit.unit_id,
                request_id = %hold.request_id,
                "预留超时已释放"
            );
        }
        Ok(released)
    }

    /// 过期单元标记为 expired，返回处理单元数
    pub async fn discard_expired_units(&self) -> FulfillmentResult<u32> {
        let now = self.clock.now();
        let mut discarded = 0u32;

        for unit in self.inventory_repo.find_expired_stock(now)? {
            if unit.status == UnitStatus::Reserved {
                if let Some(hold) = &unit.reserved_for {
                    self.inventory_repo.release_unit(&unit.unit_id, &hold.request_id)?;
                }
            }
            if !self.inventory_repo.mark_expired(&unit.unit_id)? {
                continue;
            }
            discarded += 1;

            self.notify_facility(
                &unit,
                NotificationType::StockExpired,
                "库存已过期",
                format!(
                    "单元 {}（{} {} × {}）已于 {} 过期，请报废处理",
                    unit.unit_id,
                    unit.blood_group,
                    unit.component,
                    unit.quantity,
                    unit.expiry_date.format("%Y-%m-%d")
                ),
            )
            .await;
            self.audit.record(ActionLog::new(
                ACTOR,
                ActionType::UnitExpired,
                "inventory_unit",
                &unit.unit_id,
                Some(json!({
                    "facility_id": unit.facility_id,
                    "expiry_date": unit.expiry_date,
                    "quantity": unit.quantity,
                    "was_reserved_for": unit.reserved_for.as_ref().map(|h| h.request_id.clone()),
                })),
                now,
            ));
        }
        if discarded > 0 {
            tracing::info!(discarded, "过期库存已处理");
        }
        Ok(discarded)
    }

    /// 生成调剂建议并通知相关血站
    pub async fn optimize_inventory_distribution(&self) -> FulfillmentResult<Vec<RedistributionSuggestion>> {
        let now = self.clock.now();
        let levels = self.inventory_repo.stock_levels(now)?;
        let banks: Vec<String> = self
            .facility_repo
            .list_active_by_kind(FacilityKind::BloodBank)?
            .into_iter()
            .map(|f| f.facility_id)
            .collect();

        let suggestions = plan_redistribution(
            &levels,
            &banks,
            self.config.surplus_threshold,
            self.config.shortage_threshold,
        );

        for s in &suggestions {
            let message = format!(
                "建议从 {} 调拨 {} 单位 {} {} 至 {}（当前 {} / {}）",
                s.from_facility, s.units, s.blood_group, s.component, s.to_facility, s.from_level, s.to_level
            );
            for facility_id in [&s.from_facility, &s.to_facility] {
                self.notifier
                    .notify(
                        Notification::new(
                            Recipient::BloodBank(facility_id.clone()),
                            NotificationType::RedistributionSuggestion,
                            "库存调剂建议",
                            message.clone(),
                        )
                        .with_priority(NotificationPriority::Low),
                    )
                    .await;
            }
            self.audit.record(ActionLog::new(
                ACTOR,
                ActionType::RedistributionSuggested,
                "facility",
                &s.from_facility,
                serde_json::to_value(s).ok(),
                now,
            ));
        }
        Ok(suggestions)
    }

    /// 完整执行一轮；各步骤独立，失败互不影响
    pub async fn run_sweep(&self) -> ReaperReport {
        let mut report = ReaperReport::default();

        match self.release_expired_reservations().await {
            Ok(n) => report.released_reservations = n,
            Err(e) => {
                report.failures += 1;
                tracing::warn!(error = %e, "预留超时释放失败");
            }
        }
        match self.discard_expired_units().await {
            Ok(n) => report.discarded_units = n,
            Err(e) => {
                report.failures += 1;
                tracing::warn!(error = %e, "过期库存处理失败");
            }
        }
        match self.optimize_inventory_distribution().await {
            Ok(suggestions) => report.suggestions = suggestions,
            Err(e) => {
                report.failures += 1;
                tracing::warn!(error = %e, "库存调剂分析失败");
            }
        }
        report
    }

    async fn notify_facility(
        &self,
        unit: &InventoryUnit,
        notification_type: NotificationType,
        title: &str,
        message: String,
    ) {
        let recipient = match self.facility_repo.find_facility(&unit.facility_id) {
            Ok(Some(facility)) => Recipient::for_facility(facility.kind, facility.facility_id),
            _ => Recipient::BloodBank(unit.facility_id.clone()),
        };
        self.notifier
            .notify(Notification::new(recipient, notification_type, title, message))
            .await;
    }
}

#[async_trait]
impl SweepJob for AntiWastageReaper {
    fn name(&self) -> &'static str {
        "anti_wastage_reaper"
    }

    async fn run_once(&self) {
        let report = self.run_sweep().await;
        tracing::info!(
            released_reservations = report.released_reservations,
            discarded_units = report.discarded_units,
            suggestions = report.suggestions.len(),
            failures = report.failures,
            "清道夫扫描完成"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::inventory::ReservationHold;
    use crate::domain::request::{BloodRequest, GeoPoint};
    use crate::domain::types::UrgencyTier;
    use crate::integration::{NoOpAuditSink, RecordingNotifier};
    use chrono::{Duration, TimeZone, Utc};
    use rusqlite::Connection;
    use std::sync::Mutex;

    struct Fixture {
        reaper: AntiWastageReaper,
        inventory_repo: Arc<InventoryRepository>,
        request_repo: Arc<RequestRepository>,
        notifier: Arc<RecordingNotifier>,
        clock: Arc<ManualClock>,
    }

    fn setup() -> Fixture {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::configure_sqlite_connection(&conn).unwrap();
        crate::db::init_schema(&conn).unwrap();
        let conn = Arc::new(Mutex::new(conn));
        let inventory_repo = Arc::new(InventoryRepository::new(conn.clone()));
        let request_repo = Arc::new(RequestRepository::new(conn.clone()));
        let facility_repo = Arc::new(FacilityRepository::new(conn));
        let notifier = Arc::new(RecordingNotifier::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).unwrap()));
        let reaper = AntiWastageReaper::new(
            inventory_repo.clone(),
            request_repo.clone(),
            facility_repo,
            notifier.clone(),
            Arc::new(NoOpAuditSink),
            clock.clone(),
            FulfillmentConfig::default(),
        );
        Fixture {
            reaper,
            inventory_repo,
            request_repo,
            notifier,
            clock,
        }
    }

    fn level(facility: &str, units: u32) -> StockLevel {
        StockLevel {
            facility_id: facility.to_string(),
            blood_group: BloodGroup::OPos,
            component: BloodComponent::RedCells,
            available_units: units,
        }
    }

    #[test]
    fn test_plan_redistribution_pairs_surplus_with_shortage() {
        let levels = vec![level("BIG", 70), level("LOW", 4), level("OK", 30)];
        let banks = vec!["EMPTY".to_string(), "LOW".to_string()];

        let plan = plan_redistribution(&levels, &banks, 50, 10);
        // EMPTY 缺 10，LOW 缺 6，BIG 可调出 20
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].to_facility, "EMPTY");
        assert_eq!(plan[0].units, 10);
        assert_eq!(plan[1].to_facility, "LOW");
        assert_eq!(plan[1].units, 6);
        assert!(plan.iter().all(|s| s.from_facility == "BIG"));
    }

    #[test]
    fn test_plan_redistribution_limited_by_surplus() {
        let levels = vec![level("BIG", 53), level("LOW", 0)];
        let plan = plan_redistribution(&levels, &[], 50, 10);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].units, 3);
    }

    #[tokio::test]
    async fn test_lapsed_reservation_released_request_untouched() {
        let f = setup();
        let now = f.clock.now();
        let request = BloodRequest::new(
            "H1",
            GeoPoint::new(0.0, 0.0),
            BloodGroup::OPos,
            BloodComponent::RedCells,
            2,
            UrgencyTier::High,
            now + Duration::hours(4),
            now,
        );
        f.request_repo.insert(&request).unwrap();
        f.request_repo.adjust_counters(&request.request_id, 1, 0, now).unwrap();

        let mut unit = InventoryUnit::intake(
            "BB1",
            BloodGroup::OPos,
            BloodComponent::RedCells,
            1,
            now + Duration::days(10),
            now,
        );
        unit.status = UnitStatus::Reserved;
        unit.reserved_for = Some(ReservationHold {
            request_id: request.request_id.clone(),
            reserved_at: now,
            expires_at: now + Duration::minutes(30),
            lock_id: "L1".to_string(),
        });
        f.inventory_repo.insert(&unit).unwrap();

        f.clock.advance(Duration::minutes(31));
        assert_eq!(f.reaper.release_expired_reservations().await.unwrap(), 1);
        assert_eq!(f.reaper.release_expired_reservations().await.unwrap(), 0);

        let stored = f.inventory_repo.find_by_id(&unit.unit_id).unwrap().unwrap();
        assert_eq!(stored.status, UnitStatus::Available);
        // 需求记录不动，由监控校准
        assert_eq!(f.request_repo.get(&request.request_id).unwrap().reserved_units, 1);

        let hospital_notices: Vec<_> = f
            .notifier
            .sent()
            .into_iter()
            .filter(|n| n.recipient == Recipient::Hospital("H1".to_string()))
            .collect();
        assert_eq!(hospital_notices.len(), 1);
        assert_eq!(hospital_notices[0].notification_type, NotificationType::ReservationExpired);
    }

    #[tokio::test]
    async fn test_expired_units_discarded() {
        let f = setup();
        let now = f.clock.now();
        let unit = InventoryUnit::intake(
            "BB1",
            BloodGroup::ANeg,
            BloodComponent::Plasma,
            2,
            now + Duration::hours(1),
            now,
        );
        f.inventory_repo.insert(&unit).unwrap();

        f.clock.advance(Duration::hours(2));
        let report = f.reaper.run_sweep().await;
        assert_eq!(report.discarded_units, 1);
        assert_eq!(report.failures, 0);
        assert_eq!(
            f.inventory_repo.find_by_id(&unit.unit_id).unwrap().unwrap().status,
            UnitStatus::Expired
        );
        assert_eq!(f.notifier.count_of(NotificationType::StockExpired), 1);
    }
}
